use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ReplicationConfig;
use crate::error::{PgWireError, Result};
use crate::extract::{ChangeExtractor, TestDecodingExtractor};

use super::session::{CloseReason, ReplicationEvent, ReplicationEventReceiver, Session};

/// Requests shutdown of a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    /// The session stops before its next read, or interrupts a pending one.
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct ReplicationClient {
    rx: ReplicationEventReceiver,
    stop: StopHandle,
    join: JoinHandle<Result<CloseReason>>,
}

impl ReplicationClient {
    /// Connect over TCP and start streaming `test_decoding` table operations.
    pub async fn start(cfg: ReplicationConfig) -> Result<Self> {
        Self::start_with_extractor(cfg, Arc::new(TestDecodingExtractor)).await
    }

    pub async fn start_with_extractor(
        cfg: ReplicationConfig,
        extractor: Arc<dyn ChangeExtractor>,
    ) -> Result<Self> {
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
        tcp.set_nodelay(true)?;
        tracing::debug!(host = %cfg.host, port = cfg.port, "connected");
        Ok(Self::from_stream(tcp, cfg, extractor))
    }

    /// Run a session over an already-connected transport.
    pub fn from_stream<S>(
        stream: S,
        cfg: ReplicationConfig,
        extractor: Arc<dyn ChangeExtractor>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(cfg.buffer_events.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let panic_tx = tx.clone();
        let panic_stop = stop_rx.clone();
        let join = tokio::spawn(async move {
            let mut session = Session::new(stream, cfg, extractor, tx, stop_rx);
            let res = match AssertUnwindSafe(session.run()).catch_unwind().await {
                Ok(res) => res,
                Err(panic) => {
                    let err = PgWireError::Task(format!(
                        "replication session panicked: {}",
                        panic_message(&*panic)
                    ));
                    tokio::select! {
                        _ = panic_tx.send(Err(err.clone())) => {}
                        _ = stop_requested(panic_stop) => {}
                    }
                    Err(err)
                }
            };
            drop(panic_tx);
            if let Err(e) = &res {
                tracing::error!("replication session terminated with error: {e}");
            }
            res
        });

        Self {
            rx,
            stop: StopHandle(Arc::new(stop_tx)),
            join,
        }
    }

    /// Next event, `Ok(None)` once the session has closed without error.
    ///
    /// A failed session yields its error as the final item.
    pub async fn recv(&mut self) -> Result<Option<ReplicationEvent>> {
        self.rx.recv().await.transpose()
    }

    /// Ask the session to stop. Events already queued can still be received.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the session task and return how it ended.
    pub async fn join(self) -> Result<CloseReason> {
        self.join
            .await
            .map_err(|e| PgWireError::Task(format!("join error: {e}")))?
    }
}

async fn stop_requested(mut stop_rx: watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
