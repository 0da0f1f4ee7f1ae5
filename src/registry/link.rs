use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::store::JobId;

/// A job handed to a worker for proving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub job_id: JobId,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub payload: Bytes,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time the worker has to report a result, in milliseconds.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker link closed")]
pub struct LinkClosed;

/// Transport capability for reaching a single worker.
///
/// The registry and scheduler only talk to workers through this trait, so
/// they stay independent of how dispatches actually travel.
pub trait WorkerLink: Send + Sync + std::fmt::Debug {
    /// Hand a job to the worker without blocking.
    fn send(&self, dispatch: Dispatch) -> Result<(), LinkClosed>;

    /// False once the transport knows the worker is gone.
    fn is_alive(&self) -> bool;
}

/// In-process mailbox link. The transport holds the [`Mailbox`] and drains
/// it on behalf of the remote worker, e.g. from a long-poll request.
#[derive(Debug, Clone)]
pub struct MailboxLink {
    tx: mpsc::UnboundedSender<Dispatch>,
}

#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Dispatch>,
}

pub fn mailbox() -> (MailboxLink, Mailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MailboxLink { tx }, Mailbox { rx })
}

impl WorkerLink for MailboxLink {
    fn send(&self, dispatch: Dispatch) -> Result<(), LinkClosed> {
        self.tx.send(dispatch).map_err(|_| LinkClosed)
    }

    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl Mailbox {
    /// Wait up to `wait` for at least one dispatch, then return everything
    /// that is queued. Returns an empty list on timeout.
    pub async fn recv_batch(&mut self, wait: Duration) -> Vec<Dispatch> {
        let mut batch = Vec::new();
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(dispatch)) => batch.push(dispatch),
            Ok(None) | Err(_) => return batch,
        }
        while let Ok(dispatch) = self.rx.try_recv() {
            batch.push(dispatch);
        }
        batch
    }
}
