//! In-process world: every rank is a tokio task
//!
//! Messages still cross rank boundaries as serialized JSON envelopes, so a
//! job behaves the same here as over [`super::TcpTransport`]. An abort wakes
//! every rank immediately; rank futures are dropped, which also kills any
//! engine subprocess they were waiting on.

use super::{Comm, CommError, Envelope, Message, Transport};
use crate::error::{ErrorCode, Result, StackError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error};

pub struct LocalTransport {
    rank: usize,
    size: usize,
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    abort_signal: Arc<watch::Sender<Option<i32>>>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&self, dest: usize, message: Message) -> std::result::Result<(), CommError> {
        let peer = self.peers.get(dest).ok_or(CommError::InvalidRank {
            rank: dest,
            size: self.size,
        })?;
        peer.send(Envelope {
            source: self.rank,
            message,
        })
        .map_err(|_| CommError::Disconnected(dest))
    }

    async fn recv(&self) -> std::result::Result<Envelope, CommError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(CommError::Disconnected(self.rank))
    }

    async fn abort(&self, status: i32) {
        self.abort_signal.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(status);
                true
            } else {
                false
            }
        });
        for (dest, peer) in self.peers.iter().enumerate() {
            if dest != self.rank {
                let _ = peer.send(Envelope {
                    source: self.rank,
                    message: Message::Abort { status },
                });
            }
        }
    }
}

/// A fixed-size world of ranks running on the current tokio runtime
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster {
    size: usize,
}

impl LocalCluster {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(StackError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "a job needs at least one rank",
            ));
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Create the connected transports, one per rank
    pub fn transports(&self) -> Vec<LocalTransport> {
        let (abort_signal, _) = watch::channel(None);
        let abort_signal = Arc::new(abort_signal);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..self.size).map(|_| mpsc::unbounded_channel()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                size: self.size,
                peers: senders.clone(),
                inbox: Mutex::new(inbox),
                abort_signal: Arc::clone(&abort_signal),
            })
            .collect()
    }

    /// Run `job` on every rank and wait for all of them.
    ///
    /// Outcomes are returned in rank order. Once any rank aborts, ranks that
    /// are still running stop with [`StackError::Aborted`].
    pub async fn run<F, Fut, T>(&self, job: F) -> Vec<Result<T>>
    where
        F: Fn(Comm) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let job = Arc::new(job);
        let mut handles = Vec::with_capacity(self.size);

        for transport in self.transports() {
            let job = Arc::clone(&job);
            let mut aborted = transport.abort_signal.subscribe();
            handles.push(tokio::spawn(async move {
                let comm = Comm::new(Arc::new(transport));
                let work = job(comm);
                tokio::select! {
                    biased;
                    result = work => result,
                    status = wait_for_abort(&mut aborted) => Err(StackError::aborted(status)),
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (rank, handle) in handles.into_iter().enumerate() {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!("Rank {} task failed: {}", rank, join_error);
                    Err(StackError::Other {
                        code: ErrorCode::OTHER_PANIC,
                        message: format!("rank {} did not complete", rank),
                        source: Some(Box::new(join_error)),
                    })
                }
            };
            debug!("Rank {} finished (ok = {})", rank, outcome.is_ok());
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Exit status for a finished job: the first non-zero rank status, or 0
    pub fn exit_status<T>(outcomes: &[Result<T>]) -> i32 {
        outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().err())
            .map(StackError::exit_code)
            .find(|&code| code != 0)
            .unwrap_or(0)
    }
}

async fn wait_for_abort(signal: &mut watch::Receiver<Option<i32>>) -> i32 {
    let status = signal
        .wait_for(|status| status.is_some())
        .await
        .map(|status| (*status).unwrap_or(1));
    match status {
        Ok(status) => status,
        Err(_) => std::future::pending().await,
    }
}
