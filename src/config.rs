use std::time::Duration;

use crate::lsn::Lsn;

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub database: String,

    /// Existing logical slot (created with the `test_decoding` plugin).
    pub slot: String,
    pub start_lsn: Lsn,

    /// Bytes requested from the transport per read.
    pub read_buffer_size: usize,

    /// If no server bytes arrive within this interval, treat it as an error.
    /// `None` waits forever; the server's keepalives normally keep the stream busy.
    pub idle_timeout: Option<Duration>,

    /// Bounded buffer size (#events) between the session task and the consumer.
    pub buffer_events: usize,
}

impl ReplicationConfig {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            database: database.into(),
            slot: slot.into(),
            ..Self::default()
        }
    }

    pub fn start_replication_sql(&self) -> String {
        format!(
            "START_REPLICATION SLOT {} LOGICAL {}",
            self.slot, self.start_lsn
        )
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            database: "postgres".into(),

            slot: "test".into(),
            start_lsn: Lsn(0),

            read_buffer_size: 4096,
            idle_timeout: None,
            buffer_events: 1024,
        }
    }
}
