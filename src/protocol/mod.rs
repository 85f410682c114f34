//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for:
//! - Decoding backend frames and encoding frontend messages ([`framing`])
//! - Parsing parameter status and error responses ([`messages`])
//! - Handling streaming replication sub-messages ([`replication`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: the startup packet omits the type tag.
//!
//! # Replication Protocol
//!
//! During logical replication, the server sends CopyData messages containing
//! either `XLogData` (WAL changes) or a primary keepalive. The client answers
//! keepalives with `StandbyStatusUpdate` messages wrapped in CopyData.

pub mod framing;
pub mod messages;
pub mod replication;

pub use framing::{
    BackendMessage, FrameBuffer, FrameCursor, decode_frame, decode_frames, encode_copy_data,
    encode_copy_done, encode_simple_query, encode_startup_packet,
};
pub use messages::{ErrorResponse, ParameterStatus};
pub use replication::{
    PG_EPOCH_MICROS, PrimaryKeepalive, ReplicationCopyData, StandbyStatusUpdate, XLogData,
    encode_standby_status_update, parse_copy_data, pg_timestamp_to_datetime, pg_to_unix_timestamp,
};
