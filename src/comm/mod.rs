//! Collective communication between ranks
//!
//! Every rank of a stacking job owns one [`Comm`]. The facade offers the
//! handful of rooted collectives the driver needs (`broadcast`,
//! `scatter_job`, `abort`) on top of a point-to-point [`Transport`].
//!
//! # Scatter protocol
//!
//! `scatter_job` is a dynamic work queue driven by the root:
//!
//! ```text
//! worker                     root
//!   | -- Ready{accepts} -->    |
//!   | <-- Work{i, item} ----   |   (or Done when the queue is empty)
//!   | -- Outcome{i, r} ---->   |
//!   | <-- Work{j, item} ----   |
//!   | -- Outcome{j, r} ---->   |
//!   | <------- Done -------    |
//! ```
//!
//! The root stores every outcome at its item index, so the gathered list is
//! in input order regardless of which worker finished first. Every rank
//! leaves the collective only after the root has sent it `Done`, which makes
//! each scatter a barrier even when there are no items.
//!
//! # Abort
//!
//! `abort` tells every rank to stop. A rank blocked in a collective returns
//! [`CommError::Aborted`]; the root relays aborts it receives from a worker
//! so that ranks behind a star topology hear about them too.

pub mod abort;
pub mod local;
pub mod tcp;


pub use abort::{abort_on_error, node_id};
pub use local::{LocalCluster, LocalTransport};
pub use tcp::{TcpTransport, WorldConfig};

use crate::error::{ErrorCode, Result, StackError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Errors raised by transports and the collective protocols
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("job aborted with status {0}")]
    Aborted(i32),

    #[error("rank {0} disconnected")]
    Disconnected(usize),

    #[error("rank {rank} is outside a world of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("message encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not reach root at {addr}: {message}")]
    ConnectFailed { addr: String, message: String },
}

/// Wire-level message exchanged between ranks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame on a fresh TCP link, announcing the sender's rank
    Hello,
    /// Value distributed by `broadcast`
    Broadcast { payload: Value },
    /// A worker joining a scatter; `accepts_work` is false when it has no worker
    Ready { accepts_work: bool },
    /// One item handed to a worker
    Work { index: usize, item: Value },
    /// Result for the item at `index`; `None` means the worker skipped it
    Outcome { index: usize, result: Option<Value> },
    /// No more work in the current scatter
    Done,
    /// Collective abort
    Abort { status: i32 },
}

impl Message {
    fn name(&self) -> &'static str {
        match self {
            Message::Hello => "hello",
            Message::Broadcast { .. } => "broadcast",
            Message::Ready { .. } => "ready",
            Message::Work { .. } => "work",
            Message::Outcome { .. } => "outcome",
            Message::Done => "done",
            Message::Abort { .. } => "abort",
        }
    }
}

/// A message tagged with the rank that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: usize,
    pub message: Message,
}

/// Point-to-point message passing between the ranks of one job
#[async_trait]
pub trait Transport: Send + Sync {
    /// Rank of the calling process
    fn rank(&self) -> usize;

    /// Number of ranks in the job
    fn size(&self) -> usize;

    /// Deliver a message to `dest`
    async fn send(&self, dest: usize, message: Message) -> std::result::Result<(), CommError>;

    /// Wait for the next message from any rank
    async fn recv(&self) -> std::result::Result<Envelope, CommError>;

    /// Tell every reachable rank to stop
    async fn abort(&self, status: i32);
}

/// Work applied by a rank to each item it receives in `scatter_job`
///
/// `Ok(None)` marks an item that was skipped for an expected reason (already
/// logged by the worker). `Err` is unexpected and ends the rank.
#[async_trait]
pub trait ScatterWorker<I, R>: Send {
    async fn call(&mut self, item: I) -> Result<Option<R>>;
}

/// Collective-communication facade for one rank
pub struct Comm {
    transport: Arc<dyn Transport>,
    stash: Mutex<VecDeque<Envelope>>,
}

impl Comm {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            stash: Mutex::new(VecDeque::new()),
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn is_root(&self, root: usize) -> bool {
        self.rank() == root
    }

    /// Distribute the root's value to every rank.
    ///
    /// The root passes `Some(value)` and gets it back unchanged; every other
    /// rank passes `None` and receives the root's value.
    pub async fn broadcast<T>(&self, value: Option<T>, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        self.check_rank(root)?;

        if self.is_root(root) {
            let value = value.ok_or_else(|| {
                StackError::comm_with_code(
                    ErrorCode::COMM_PROTOCOL,
                    "root must supply the value to broadcast",
                    None,
                )
            })?;
            let payload = serde_json::to_value(&value).map_err(CommError::from)?;
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.transport
                    .send(
                        dest,
                        Message::Broadcast {
                            payload: payload.clone(),
                        },
                    )
                    .await?;
            }
            trace!("Broadcast from root {} to {} ranks", root, self.size() - 1);
            return Ok(value);
        }

        match self.recv_from(root).await?.message {
            Message::Broadcast { payload } => {
                Ok(serde_json::from_value(payload).map_err(CommError::from)?)
            }
            other => Err(unexpected(root, &other, "broadcast")),
        }
    }

    /// Partition `items` over the non-root ranks and gather the results.
    ///
    /// On the root the returned vector has one entry per item, in item order.
    /// Non-root ranks return an empty vector once the root releases them.
    /// The root normally passes `None` as `worker`; it only runs items itself
    /// when it is the only rank.
    pub async fn scatter_job<I, R, W>(
        &self,
        worker: Option<&mut W>,
        items: Vec<I>,
        root: usize,
    ) -> Result<Vec<Option<R>>>
    where
        I: Serialize + DeserializeOwned + Send,
        R: Serialize + DeserializeOwned + Send,
        W: ScatterWorker<I, R> + ?Sized,
    {
        self.check_rank(root)?;

        if !self.is_root(root) {
            self.serve_scatter(worker, root).await?;
            return Ok(Vec::new());
        }

        if self.size() == 1 {
            return run_locally(worker, items).await;
        }

        self.dispatch_scatter(items).await
    }

    /// Collective abort of the whole job
    pub async fn abort(&self, status: i32) {
        warn!("Rank {} aborting job with status {}", self.rank(), status);
        self.transport.abort(status).await;
    }

    async fn dispatch_scatter<I, R>(&self, items: Vec<I>) -> Result<Vec<Option<R>>>
    where
        I: Serialize + DeserializeOwned + Send,
        R: Serialize + DeserializeOwned + Send,
    {
        let total = items.len();
        let mut queue = items
            .into_iter()
            .map(|item| serde_json::to_value(&item))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(CommError::from)?
            .into_iter()
            .enumerate();

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut dispatched = 0usize;
        let mut gathered = 0usize;
        let mut released = 0usize;
        let workers = self.size() - 1;

        debug!("Scattering {} items over {} workers", total, workers);

        while released < workers {
            let envelope = self.recv_any().await?;
            let source = envelope.source;
            let accepts_work = match envelope.message {
                Message::Ready { accepts_work } => accepts_work,
                Message::Outcome { index, result } => {
                    if index >= total {
                        return Err(StackError::comm_with_code(
                            ErrorCode::COMM_PROTOCOL,
                            format!("outcome for unknown item {}", index),
                            Some(source),
                        ));
                    }
                    results[index] = match result {
                        Some(value) => {
                            Some(serde_json::from_value(value).map_err(CommError::from)?)
                        }
                        None => None,
                    };
                    gathered += 1;
                    true
                }
                other => return Err(unexpected(source, &other, "scatter")),
            };

            let next = if accepts_work { queue.next() } else { None };
            match next {
                Some((index, item)) => {
                    trace!("Item {} -> rank {}", index, source);
                    self.transport
                        .send(source, Message::Work { index, item })
                        .await?;
                    dispatched += 1;
                }
                None => {
                    self.transport.send(source, Message::Done).await?;
                    released += 1;
                }
            }
        }

        if dispatched < total || gathered < dispatched {
            return Err(StackError::comm_with_code(
                ErrorCode::COMM_PROTOCOL,
                format!(
                    "scatter finished with {} of {} items processed; no rank accepted the rest",
                    gathered, total
                ),
                None,
            ));
        }

        Ok(results)
    }

    async fn serve_scatter<I, R, W>(&self, mut worker: Option<&mut W>, root: usize) -> Result<()>
    where
        I: DeserializeOwned + Send,
        R: Serialize + Send,
        W: ScatterWorker<I, R> + ?Sized,
    {
        self.transport
            .send(
                root,
                Message::Ready {
                    accepts_work: worker.is_some(),
                },
            )
            .await?;

        loop {
            match self.recv_from(root).await?.message {
                Message::Work { index, item } => {
                    let Some(worker) = worker.as_deref_mut() else {
                        return Err(StackError::comm_with_code(
                            ErrorCode::COMM_PROTOCOL,
                            "received work without a worker",
                            Some(root),
                        ));
                    };
                    let item: I = serde_json::from_value(item).map_err(CommError::from)?;
                    let result = match worker.call(item).await? {
                        Some(r) => Some(serde_json::to_value(&r).map_err(CommError::from)?),
                        None => None,
                    };
                    self.transport
                        .send(root, Message::Outcome { index, result })
                        .await?;
                }
                Message::Done => return Ok(()),
                other => return Err(unexpected(root, &other, "scatter")),
            }
        }
    }

    async fn recv_any(&self) -> Result<Envelope> {
        if let Some(envelope) = self.stash.lock().await.pop_front() {
            return Ok(envelope);
        }
        self.next_envelope().await
    }

    async fn recv_from(&self, source: usize) -> Result<Envelope> {
        {
            let mut stash = self.stash.lock().await;
            if let Some(pos) = stash.iter().position(|e| e.source == source) {
                if let Some(envelope) = stash.remove(pos) {
                    return Ok(envelope);
                }
            }
        }

        loop {
            let envelope = self.next_envelope().await?;
            if envelope.source == source {
                return Ok(envelope);
            }
            self.stash.lock().await.push_back(envelope);
        }
    }

    async fn next_envelope(&self) -> Result<Envelope> {
        let envelope = self.transport.recv().await?;
        if let Message::Abort { status } = envelope.message {
            self.relay_abort(envelope.source, status).await;
            return Err(StackError::aborted(status));
        }
        Ok(envelope)
    }

    async fn relay_abort(&self, origin: usize, status: i32) {
        warn!(
            "Rank {} received abort (status {}) from rank {}",
            self.rank(),
            status,
            origin
        );
        let me = self.rank();
        for dest in (0..self.size()).filter(|&r| r != me && r != origin) {
            // Peers that already left cannot be reached and need no notice.
            let _ = self.transport.send(dest, Message::Abort { status }).await;
        }
    }

    fn check_rank(&self, root: usize) -> Result<()> {
        if root >= self.size() {
            return Err(CommError::InvalidRank {
                rank: root,
                size: self.size(),
            }
            .into());
        }
        Ok(())
    }
}

async fn run_locally<I, R, W>(worker: Option<&mut W>, items: Vec<I>) -> Result<Vec<Option<R>>>
where
    I: Send,
    R: Send,
    W: ScatterWorker<I, R> + ?Sized,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let Some(worker) = worker else {
        return Err(StackError::comm_with_code(
            ErrorCode::COMM_PROTOCOL,
            format!("no rank available to process {} items", items.len()),
            None,
        ));
    };

    let mut results = Vec::with_capacity(items.len());
    for item in items {
        results.push(worker.call(item).await?);
    }
    Ok(results)
}

fn unexpected(source: usize, message: &Message, during: &str) -> StackError {
    StackError::comm_with_code(
        ErrorCode::COMM_PROTOCOL,
        format!("unexpected {} message during {}", message.name(), during),
        Some(source),
    )
}
