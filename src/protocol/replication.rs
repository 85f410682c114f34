use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;

/// One logical-change payload emitted by the output plugin (`'w'`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    /// WAL position where this data starts
    pub wal_start: Lsn,
    /// Current WAL end position on server
    pub wal_end: Lsn,
    /// Server timestamp in microseconds since 2000-01-01
    pub server_clock: i64,
    /// Output plugin payload. Opaque bytes, not necessarily UTF-8.
    pub data: Bytes,
}

impl XLogData {
    /// `server_clock` as a UTC timestamp, `None` when it is out of range.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        pg_timestamp_to_datetime(self.server_clock)
    }
}

/// Server liveness ping (`'k'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    /// Current WAL end position on server
    pub wal_end: Lsn,
    /// Server timestamp in microseconds since 2000-01-01
    pub server_clock: i64,
    /// If true, server expects StandbyStatusUpdate reply
    pub reply_requested: bool,
}

/// Replication protocol CopyData message types.
///
/// During logical replication streaming, PostgreSQL sends data wrapped in CopyData
/// messages. The first payload byte selects the sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationCopyData {
    XLogData(XLogData),
    KeepAlive(PrimaryKeepalive),
}

impl ReplicationCopyData {
    /// Returns true if this is a KeepAlive message
    #[inline]
    pub fn is_keepalive(&self) -> bool {
        matches!(self, ReplicationCopyData::KeepAlive(_))
    }

    /// Returns true if this is a KeepAlive that requests a reply
    #[inline]
    pub fn requires_reply(&self) -> bool {
        matches!(
            self,
            ReplicationCopyData::KeepAlive(PrimaryKeepalive {
                reply_requested: true,
                ..
            })
        )
    }
}

// tag + wal_start(8) + wal_end(8) + server_time(8)
const XLOG_HEADER_LEN: usize = 25;
// tag + wal_end(8) + server_time(8) + reply(1)
const KEEPALIVE_LEN: usize = 18;
// tag + received(8) + flushed(8) + applied(8) + client_time(8) + reply(1)
const STATUS_UPDATE_LEN: usize = 34;

/// Parse a CopyData payload into a replication message.
///
/// The payload should be the CopyData content (after stripping the 'd' tag and length).
/// An unknown leading byte is fatal for the frame: the rest cannot be reinterpreted.
pub fn parse_copy_data(payload: Bytes) -> Result<ReplicationCopyData> {
    let Some(&kind) = payload.first() else {
        return Err(PgWireError::Protocol("empty CopyData payload".into()));
    };

    match kind {
        b'w' => {
            if payload.len() < XLOG_HEADER_LEN {
                return Err(PgWireError::Protocol(format!(
                    "XLogData payload too short: {} bytes (need at least {XLOG_HEADER_LEN})",
                    payload.len()
                )));
            }
            let mut b = payload;
            b.advance(1);
            let wal_start = Lsn(b.get_u64());
            let wal_end = Lsn(b.get_u64());
            let server_clock = b.get_i64();

            Ok(ReplicationCopyData::XLogData(XLogData {
                wal_start,
                wal_end,
                server_clock,
                data: b,
            }))
        }
        b'k' => {
            if payload.len() < KEEPALIVE_LEN {
                return Err(PgWireError::Protocol(format!(
                    "KeepAlive payload too short: {} bytes (need {KEEPALIVE_LEN})",
                    payload.len()
                )));
            }
            let mut b = payload;
            b.advance(1);
            let wal_end = Lsn(b.get_u64());
            let server_clock = b.get_i64();
            let reply_requested = b.get_u8() != 0;

            Ok(ReplicationCopyData::KeepAlive(PrimaryKeepalive {
                wal_end,
                server_clock,
                reply_requested,
            }))
        }
        other => Err(PgWireError::UnknownCopyPayload(other)),
    }
}

/// Client report of received/flushed/applied WAL positions (`'r'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub received: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
    /// Client timestamp in microseconds since 2000-01-01
    pub clock: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Acknowledge a keepalive by echoing its WAL end as every position.
    ///
    /// Local flush/apply progress is not tracked, so this claims durability
    /// up to whatever the server last reported.
    pub fn echo(keepalive: &PrimaryKeepalive) -> Self {
        Self {
            received: keepalive.wal_end,
            flushed: keepalive.wal_end,
            applied: keepalive.wal_end,
            clock: keepalive.server_clock,
            reply_requested: false,
        }
    }

    /// Raw bytes suitable for sending via CopyData. No length prefix.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(STATUS_UPDATE_LEN);
        out.put_u8(b'r');
        out.put_u64(self.received.0);
        out.put_u64(self.flushed.0);
        out.put_u64(self.applied.0);
        out.put_i64(self.clock);
        out.put_u8(u8::from(self.reply_requested));
        out.freeze()
    }

    /// Inverse of [`StandbyStatusUpdate::encode`].
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != STATUS_UPDATE_LEN || payload[0] != b'r' {
            return Err(PgWireError::Protocol(format!(
                "StandbyStatusUpdate must be {STATUS_UPDATE_LEN} bytes starting with 'r', got {} bytes",
                payload.len()
            )));
        }
        let mut b = &payload[1..];
        Ok(Self {
            received: Lsn(b.get_u64()),
            flushed: Lsn(b.get_u64()),
            applied: Lsn(b.get_u64()),
            clock: b.get_i64(),
            reply_requested: b.get_u8() != 0,
        })
    }
}

/// Encode a StandbyStatusUpdate message.
///
/// # Returns
/// Raw bytes suitable for sending via CopyData
pub fn encode_standby_status_update(
    received: Lsn,
    flushed: Lsn,
    applied: Lsn,
    clock: i64,
    reply_requested: bool,
) -> Bytes {
    StandbyStatusUpdate {
        received,
        flushed,
        applied,
        clock,
        reply_requested,
    }
    .encode()
}

/// PostgreSQL epoch (2000-01-01) in microseconds since Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Convert PostgreSQL timestamp to Unix timestamp (micros). `None` on overflow.
#[inline]
pub fn pg_to_unix_timestamp(pg_micros: i64) -> Option<i64> {
    pg_micros.checked_add(PG_EPOCH_MICROS)
}

/// 2000-01-01T00:00:00Z plus `pg_micros`, if chrono can represent it.
pub fn pg_timestamp_to_datetime(pg_micros: i64) -> Option<DateTime<Utc>> {
    let unix_micros = pg_to_unix_timestamp(pg_micros)?;
    DateTime::<Utc>::UNIX_EPOCH.checked_add_signed(TimeDelta::microseconds(unix_micros))
}
