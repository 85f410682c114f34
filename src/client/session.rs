use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::ReplicationConfig;
use crate::error::{PgWireError, Result};
use crate::extract::{ChangeExtractor, TableOperation};
use crate::protocol::framing::{
    BackendMessage, FrameBuffer, encode_copy_data, encode_copy_done, encode_simple_query,
    encode_startup_packet, write_message,
};
use crate::protocol::messages::{ErrorResponse, ParameterStatus};
use crate::protocol::replication::{ReplicationCopyData, StandbyStatusUpdate, parse_copy_data};

/// What the session surfaces to its caller, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    ParameterStatus(ParameterStatus),
    /// Forwarded before the session fails with the matching error.
    ServerError(ErrorResponse),
    TableOperation(TableOperation),
}

pub type ReplicationEventReceiver = mpsc::Receiver<Result<ReplicationEvent>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingStartupReply,
    AwaitingReplicationAck,
    Streaming,
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server closed the connection between frames.
    Clean,
    /// Stop was requested, or the event consumer went away.
    Cancelled,
    Failed(PgWireError),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::AwaitingStartupReply => f.write_str("awaiting-startup-reply"),
            SessionState::AwaitingReplicationAck => f.write_str("awaiting-replication-ack"),
            SessionState::Streaming => f.write_str("streaming"),
            SessionState::Closed(CloseReason::Clean) => f.write_str("closed"),
            SessionState::Closed(CloseReason::Cancelled) => f.write_str("closed(cancelled)"),
            SessionState::Closed(CloseReason::Failed(_)) => f.write_str("closed(failed)"),
        }
    }
}

enum ReadOutcome {
    Data,
    Eof,
    Cancelled,
}

/// One replication session over an established transport.
///
/// The session owns the transport and its read buffer. [`Session::run`] drives
/// startup, `START_REPLICATION` and the streaming loop, then shuts the
/// transport down whichever way it ends.
pub struct Session<S> {
    stream: S,
    cfg: ReplicationConfig,
    extractor: Arc<dyn ChangeExtractor>,
    frames: FrameBuffer,
    state: SessionState,
    out: mpsc::Sender<Result<ReplicationEvent>>,
    stop_rx: watch::Receiver<bool>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        stream: S,
        cfg: ReplicationConfig,
        extractor: Arc<dyn ChangeExtractor>,
        out: mpsc::Sender<Result<ReplicationEvent>>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let frames = FrameBuffer::with_capacity(cfg.read_buffer_size);
        Self {
            stream,
            cfg,
            extractor,
            frames,
            state: SessionState::Connecting,
            out,
            stop_rx,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run until the server closes the stream, stop is requested, or an error occurs.
    ///
    /// A terminal error is also delivered as the last item on the event channel.
    pub async fn run(&mut self) -> Result<CloseReason> {
        let res = self.drive().await;

        if let Err(e) = self.stream.shutdown().await {
            debug!("transport shutdown failed: {e}");
        }

        match res {
            Ok(reason) => {
                self.transition(SessionState::Closed(reason.clone()));
                Ok(reason)
            }
            Err(err) => {
                self.transition(SessionState::Closed(CloseReason::Failed(err.clone())));
                self.deliver(Err(err.clone())).await;
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<CloseReason> {
        let startup = encode_startup_packet(&self.cfg.user, &self.cfg.database);
        self.send(&startup).await?;
        self.transition(SessionState::AwaitingStartupReply);

        if let Some(reason) = self.await_startup_reply().await? {
            return Ok(reason);
        }

        let sql = self.cfg.start_replication_sql();
        debug!("sending {sql}");
        self.send(&encode_simple_query(&sql)).await?;
        self.transition(SessionState::AwaitingReplicationAck);

        if let Some(reason) = self.await_replication_ack().await? {
            return Ok(reason);
        }

        self.transition(SessionState::Streaming);
        info!(
            slot = %self.cfg.slot,
            start_lsn = %self.cfg.start_lsn,
            "logical replication streaming"
        );
        self.stream_changes().await
    }

    /// Consume frames until `ReadyForQuery`.
    async fn await_startup_reply(&mut self) -> Result<Option<CloseReason>> {
        loop {
            while let Some(msg) = self.frames.next_message()? {
                match msg {
                    BackendMessage::ParameterStatus(p) => {
                        debug!("parameter status: {p}");
                        self.emit(ReplicationEvent::ParameterStatus(p)).await;
                    }
                    BackendMessage::ErrorResponse(e) => {
                        warn!("startup rejected: {e}");
                        self.emit(ReplicationEvent::ServerError(e.clone())).await;
                        return Err(PgWireError::StartupRejected(e));
                    }
                    BackendMessage::Authentication(0) => trace!("authentication ok"),
                    BackendMessage::Authentication(code) => {
                        warn!(code, "server requested authentication");
                        return Err(PgWireError::Auth(format!(
                            "server requested authentication method {code}, \
                             only trust authentication is supported"
                        )));
                    }
                    BackendMessage::Ignored(b'Z') => return Ok(None),
                    BackendMessage::Ignored(tag) => trace!("ignoring '{}'", tag as char),
                    BackendMessage::CopyData(_) => {
                        return Err(PgWireError::Protocol(
                            "CopyData received before startup completed".into(),
                        ));
                    }
                }
            }
            match self.read_more().await? {
                ReadOutcome::Data => {}
                ReadOutcome::Eof => {
                    return Err(PgWireError::Io("connection closed during startup".into()));
                }
                ReadOutcome::Cancelled => return Ok(Some(CloseReason::Cancelled)),
            }
        }
    }

    /// Consume frames until `CopyBothResponse`. Later frames stay buffered.
    async fn await_replication_ack(&mut self) -> Result<Option<CloseReason>> {
        loop {
            while let Some(msg) = self.frames.next_message()? {
                match msg {
                    BackendMessage::ParameterStatus(p) => {
                        self.emit(ReplicationEvent::ParameterStatus(p)).await;
                    }
                    BackendMessage::ErrorResponse(e) => {
                        warn!(slot = %self.cfg.slot, "START_REPLICATION rejected: {e}");
                        self.emit(ReplicationEvent::ServerError(e.clone())).await;
                        return Err(PgWireError::ReplicationStartRejected(e));
                    }
                    BackendMessage::Authentication(_) => {
                        return Err(unexpected_authentication());
                    }
                    BackendMessage::Ignored(b'W') => return Ok(None),
                    BackendMessage::Ignored(tag) => trace!("ignoring '{}'", tag as char),
                    BackendMessage::CopyData(_) => {
                        return Err(PgWireError::Protocol(
                            "CopyData received before CopyBothResponse".into(),
                        ));
                    }
                }
            }
            match self.read_more().await? {
                ReadOutcome::Data => {}
                ReadOutcome::Eof => {
                    return Err(PgWireError::Io(
                        "connection closed before replication started".into(),
                    ));
                }
                ReadOutcome::Cancelled => return Ok(Some(CloseReason::Cancelled)),
            }
        }
    }

    async fn stream_changes(&mut self) -> Result<CloseReason> {
        loop {
            while let Some(msg) = self.frames.next_message()? {
                match msg {
                    BackendMessage::CopyData(payload) => self.handle_copy_data(payload).await?,
                    BackendMessage::ParameterStatus(p) => {
                        self.emit(ReplicationEvent::ParameterStatus(p)).await;
                    }
                    BackendMessage::ErrorResponse(e) => {
                        warn!("server error while streaming: {e}");
                        self.emit(ReplicationEvent::ServerError(e.clone())).await;
                        return Err(PgWireError::Server(e));
                    }
                    BackendMessage::Authentication(_) => {
                        return Err(unexpected_authentication());
                    }
                    BackendMessage::Ignored(tag) => trace!("ignoring '{}'", tag as char),
                }
            }

            match self.read_more().await? {
                ReadOutcome::Data => {}
                ReadOutcome::Eof if self.frames.is_empty() => {
                    info!("server closed the replication stream");
                    return Ok(CloseReason::Clean);
                }
                ReadOutcome::Eof => {
                    return Err(PgWireError::Protocol(format!(
                        "connection closed inside a frame ({} bytes buffered)",
                        self.frames.len()
                    )));
                }
                ReadOutcome::Cancelled => {
                    if let Err(e) = self.send(&encode_copy_done()).await {
                        debug!("CopyDone not sent: {e}");
                    }
                    info!("replication stream stopped");
                    return Ok(CloseReason::Cancelled);
                }
            }
        }
    }

    async fn handle_copy_data(&mut self, payload: Bytes) -> Result<()> {
        match parse_copy_data(payload)? {
            ReplicationCopyData::XLogData(xlog) => {
                trace!(
                    wal_start = %xlog.wal_start,
                    bytes = xlog.data.len(),
                    "XLogData"
                );
                if xlog.server_time().is_none() {
                    return Err(PgWireError::Protocol(format!(
                        "XLogData server clock out of range: {}",
                        xlog.server_clock
                    )));
                }
                if let Some(op) = self.extractor.extract(&xlog) {
                    self.emit(ReplicationEvent::TableOperation(op)).await;
                }
            }
            ReplicationCopyData::KeepAlive(keepalive) => {
                // Echo the server position; local flush/apply progress is not tracked.
                let reply = StandbyStatusUpdate::echo(&keepalive);
                debug!(
                    wal_end = %keepalive.wal_end,
                    reply_requested = keepalive.reply_requested,
                    "keepalive, sending standby status update"
                );
                self.send(&encode_copy_data(&reply.encode())).await?;
            }
        }
        Ok(())
    }

    /// Append the next transport read to the frame buffer.
    async fn read_more(&mut self) -> Result<ReadOutcome> {
        let Session {
            stream,
            cfg,
            frames,
            out,
            stop_rx,
            ..
        } = self;

        loop {
            if *stop_rx.borrow_and_update() || out.is_closed() {
                return Ok(ReadOutcome::Cancelled);
            }

            let read = stream.read_buf(frames.read_target(cfg.read_buffer_size));
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        // Stop handle dropped.
                        return Ok(ReadOutcome::Cancelled);
                    }
                }
                n = with_idle_timeout(cfg.idle_timeout, read) => {
                    return Ok(if n? == 0 { ReadOutcome::Eof } else { ReadOutcome::Data });
                }
            }
        }
    }

    async fn send(&mut self, msg: &[u8]) -> Result<()> {
        write_message(&mut self.stream, msg).await
    }

    async fn emit(&mut self, event: ReplicationEvent) {
        self.deliver(Ok(event)).await;
    }

    /// Queue an item for the caller, giving up once stop is requested so a
    /// full channel cannot hold the session open.
    async fn deliver(&mut self, item: Result<ReplicationEvent>) {
        let Session { out, stop_rx, .. } = self;
        if *stop_rx.borrow() {
            if out.try_send(item).is_err() {
                debug!("stop requested, event dropped");
            }
            return;
        }
        tokio::select! {
            biased;
            sent = out.send(item) => {
                if sent.is_err() {
                    debug!("event receiver dropped");
                }
            }
            _ = stop_rx.changed() => debug!("stop requested, event dropped"),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
    }
}

fn unexpected_authentication() -> PgWireError {
    PgWireError::Protocol("authentication request after startup completed".into())
}

async fn with_idle_timeout<F>(idle: Option<Duration>, read: F) -> Result<usize>
where
    F: Future<Output = std::io::Result<usize>>,
{
    match idle {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| PgWireError::Io(format!("no data from server for {limit:?}")))?
            .map_err(PgWireError::from),
        None => read.await.map_err(PgWireError::from),
    }
}
