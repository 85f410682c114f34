//! PostgreSQL logical replication client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     channel      ┌─────────────────┐
//! │                 │◄─────────────────│                 │
//! │  Your App       │ ReplicationEvent │  Session Task   │
//! │                 │─────────────────►│                 │
//! │                 │    StopHandle    │                 │
//! └─────────────────┘                  └────────┬────────┘
//!                                               │
//!                                               │ TCP
//!                                               ▼
//!                                      ┌─────────────────┐
//!                                      │   PostgreSQL    │
//!                                      │ (test_decoding) │
//!                                      └─────────────────┘
//! ```
//!
//! The session walks `Connecting → AwaitingStartupReply →
//! AwaitingReplicationAck → Streaming → Closed`. While streaming it answers
//! every primary keepalive with a standby status update before reading again.
//!
//! # Example
//!
//! ```ignore
//! use pgwire_logical::{ReplicationClient, ReplicationConfig, ReplicationEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ReplicationConfig::new("localhost", "replicator", "mydb", "my_slot");
//!     let mut client = ReplicationClient::start(cfg).await?;
//!
//!     while let Some(event) = client.recv().await? {
//!         if let ReplicationEvent::TableOperation(op) = event {
//!             println!("{op}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod session;
mod tokio_client;

pub use session::{
    CloseReason, ReplicationEvent, ReplicationEventReceiver, Session, SessionState,
};
pub use tokio_client::{ReplicationClient, StopHandle};
