#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod lsn;
pub mod protocol;

pub use client::{CloseReason, ReplicationClient, ReplicationEvent, SessionState, StopHandle};
pub use config::ReplicationConfig;
pub use error::{PgWireError, Result};
pub use extract::{ChangeExtractor, OperationKind, TableOperation, TestDecodingExtractor};
pub use lsn::Lsn;
