//! A generic, asynchronous connection pool.
//!
//! Opening a new database connection (or message broker session, or any
//! other expensive stateful resource) every time one is needed is both
//! inefficient and can lead to resource exhaustion under high traffic. A
//! connection pool maintains a set of ready-to-use connections, handing
//! them out for repeated reuse and bounding how many can exist at once.
//!
//! `respool` is agnostic to the connection type it manages. Implementors
//! of the [`ManagedConnectionFactory`] trait supply the create/match/
//! cleanup/destroy/validate logic specific to whatever resource the pool
//! should hold; the pool itself handles bounding concurrency, recycling,
//! idle eviction, and background validation.
//!
//! # Example
//!
//! ```ignore
//! use respool::{Builder, ManagedConnectionFactory};
//!
//! struct MyFactory;
//!
//! #[async_trait::async_trait]
//! impl ManagedConnectionFactory for MyFactory {
//!     type Connection = MyConnection;
//!     type Error = MyError;
//!     type Subject = ();
//!     type RequestInfo = ();
//!
//!     async fn create(&self, _: &(), _: &()) -> Result<MyConnection, MyError> {
//!         MyConnection::open().await
//!     }
//!
//!     async fn destroy(&self, conn: MyConnection) -> Result<(), MyError> {
//!         conn.close().await
//!     }
//! }
//!
//! # async fn run() -> Result<(), MyError> {
//! let pool = Builder::new().max_size(10).build(MyFactory).await;
//! let conn = pool.get().await.unwrap();
//! // `conn` derefs to `MyConnection`; returned to the pool when dropped.
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, missing_debug_implementations)]

mod builder;
mod error;
mod factory;
mod filler;
mod guard;
mod inner;
mod listener;
mod maintenance;
mod pool;

pub use builder::Builder;
pub use error::PoolError;
pub use factory::{ErrorSink, ManagedConnectionFactory, TracingErrorSink};
pub use guard::{BrokenNotifier, PooledConnection};
pub use pool::{Pool, State};
