//! SyndraDB client driver core.
//!
//! A client-side driver for the SyndraDB wire protocol: URL parsing, a
//! framed TCP/TLS connection, a bounded connection pool, a state machine
//! governing when I/O is allowed, a before/after hook pipeline, a
//! health-check-and-reconnect supervisor, and the public `Client` facade
//! tying all of it together.
//!
//! # Example
//!
//! ```ignore
//! use syndra_client::{Client, ConnectionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .options(ConnectionOptions::default())
//!         .build();
//!     client.connect("syndra://localhost:7000:mydb:user:pass;").await?;
//!     let result = client.query("GET foo", 0).await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod options;
pub mod pool;
pub mod state;
pub mod statement;
pub mod supervisor;
pub mod transaction;
pub mod url;

pub use client::{Client, ClientBuilder};
pub use connection::{CommandResponse, Connection};
pub use error::{DriverError, ErrorEnvelope, ErrorKind, Result, TlsFailureReason};
pub use hooks::{CommandKind, Hook, HookContext, HookPipeline, LoggingHook, MetricsHook, MetricsSnapshot, TracingHook};
pub use options::{ConnectionOptions, DebugInfo, LifecycleCallback, LogLevel, PoolOptions, TlsOptions};
pub use pool::{Pool, PoolStats, PooledConnection};
pub use state::{ClientState, StateMachine, TransitionEvent};
pub use statement::Statement;
pub use supervisor::{Backend, Supervised, SupervisorHandle};
pub use transaction::Transaction;
pub use url::{ParsedUrl, UrlParams};
