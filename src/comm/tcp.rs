//! Multi-process world over TCP
//!
//! Ranks form a star around rank 0: the root listens, every worker opens one
//! connection to it and introduces itself with a `Hello` frame. All
//! collectives are rooted at rank 0, so the star carries every message the
//! driver sends. Each frame is a length-delimited JSON [`Envelope`].
//!
//! An abort is immediate: the receiving process relays it (root only) and
//! exits with the abort status, whatever it was doing.

use super::{CommError, Envelope, Message, Transport};
use crate::error::{ErrorCode, Result, StackError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info};

/// Rank that owns the listening socket
pub const HUB_RANK: usize = 0;

const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;
const CONNECT_RETRY: Duration = Duration::from_millis(200);

pub const RANK_VAR: &str = "STACK_RANK";
pub const SIZE_VAR: &str = "STACK_WORLD_SIZE";
pub const ROOT_ADDR_VAR: &str = "STACK_ROOT_ADDR";

/// Identity of this process within a TCP world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldConfig {
    pub rank: usize,
    pub size: usize,
    pub root_addr: String,
    pub connect_timeout: Duration,
}

impl WorldConfig {
    /// Read the world from `STACK_RANK`, `STACK_WORLD_SIZE` and
    /// `STACK_ROOT_ADDR`. Returns `None` when no world size is set.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(size) = std::env::var(SIZE_VAR) else {
            return Ok(None);
        };
        let size = parse_env_number(SIZE_VAR, &size)?;
        let rank = match std::env::var(RANK_VAR) {
            Ok(rank) => parse_env_number(RANK_VAR, &rank)?,
            Err(_) => return Err(missing_env(RANK_VAR)),
        };
        let root_addr = std::env::var(ROOT_ADDR_VAR).map_err(|_| missing_env(ROOT_ADDR_VAR))?;

        let config = Self {
            rank,
            size,
            root_addr,
            connect_timeout: Duration::from_secs(30),
        };
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.rank >= self.size {
            return Err(StackError::config_with_code(
                ErrorCode::CONFIG_INVALID_ENV,
                format!(
                    "rank {} is not valid in a world of size {}",
                    self.rank, self.size
                ),
            ));
        }
        Ok(())
    }
}

fn parse_env_number(var: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        StackError::config_with_code(
            ErrorCode::CONFIG_INVALID_ENV,
            format!("{} must be a non-negative integer, got '{}'", var, value),
        )
    })
}

fn missing_env(var: &str) -> StackError {
    StackError::config_with_code(
        ErrorCode::CONFIG_MISSING_REQUIRED,
        format!("{} must be set when {} is set", var, SIZE_VAR),
    )
}

type FrameSink = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;
type FrameStream = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type Link = Arc<Mutex<FrameSink>>;
type Inbox = mpsc::UnboundedReceiver<std::result::Result<Envelope, CommError>>;
type InboxSender = mpsc::UnboundedSender<std::result::Result<Envelope, CommError>>;

pub struct TcpTransport {
    rank: usize,
    size: usize,
    links: Arc<HashMap<usize, Link>>,
    inbox: Mutex<Inbox>,
}

impl TcpTransport {
    /// Join the world described by `config`
    pub async fn join(config: &WorldConfig) -> std::result::Result<Self, CommError> {
        if config.rank == HUB_RANK {
            let listener = TcpListener::bind(&config.root_addr).await?;
            Self::accept_workers(listener, config).await
        } else {
            Self::connect(config).await
        }
    }

    /// Root side: wait until every worker has connected and said hello
    pub async fn accept_workers(
        listener: TcpListener,
        config: &WorldConfig,
    ) -> std::result::Result<Self, CommError> {
        info!(
            "Root listening on {} for {} workers",
            listener.local_addr()?,
            config.size - 1
        );

        let deadline = Instant::now() + config.connect_timeout;
        let mut links = HashMap::new();
        let mut readers = Vec::new();

        while links.len() < config.size - 1 {
            let (stream, peer_addr) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| CommError::ConnectFailed {
                    addr: config.root_addr.clone(),
                    message: format!(
                        "only {} of {} workers connected in time",
                        links.len(),
                        config.size - 1
                    ),
                })??;
            stream.set_nodelay(true)?;
            let (mut reader, writer) = framed(stream);

            let hello = tokio::time::timeout_at(deadline, read_frame(&mut reader, None))
                .await
                .map_err(|_| CommError::ConnectFailed {
                    addr: config.root_addr.clone(),
                    message: format!("{} connected but never said hello", peer_addr),
                })??;
            let peer = hello.source;
            if hello.message != Message::Hello {
                return Err(CommError::Protocol(format!(
                    "expected hello from {}, got {:?}",
                    peer_addr, hello.message
                )));
            }
            if peer == HUB_RANK || peer >= config.size || links.contains_key(&peer) {
                return Err(CommError::Protocol(format!(
                    "{} announced itself as rank {}, which is invalid or taken",
                    peer_addr, peer
                )));
            }

            debug!("Rank {} connected from {}", peer, peer_addr);
            links.insert(peer, Arc::new(Mutex::new(writer)));
            readers.push((peer, reader));
        }

        let links = Arc::new(links);
        let (tx, rx) = mpsc::unbounded_channel();
        for (peer, reader) in readers {
            tokio::spawn(read_loop(
                HUB_RANK,
                peer,
                reader,
                tx.clone(),
                Arc::clone(&links),
            ));
        }

        Ok(Self {
            rank: HUB_RANK,
            size: config.size,
            links,
            inbox: Mutex::new(rx),
        })
    }

    /// Worker side: connect to the root, retrying until the timeout
    pub async fn connect(config: &WorldConfig) -> std::result::Result<Self, CommError> {
        let deadline = Instant::now() + config.connect_timeout;
        let stream = loop {
            match TcpStream::connect(&config.root_addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!("Root at {} not ready yet: {}", config.root_addr, e);
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(e) => {
                    return Err(CommError::ConnectFailed {
                        addr: config.root_addr.clone(),
                        message: e.to_string(),
                    })
                }
            }
        };
        stream.set_nodelay(true)?;
        let (reader, mut writer) = framed(stream);

        write_frame(
            &mut writer,
            &Envelope {
                source: config.rank,
                message: Message::Hello,
            },
        )
        .await?;
        debug!("Rank {} joined root at {}", config.rank, config.root_addr);

        let links = Arc::new(HashMap::from([(HUB_RANK, Arc::new(Mutex::new(writer)))]));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(
            config.rank,
            HUB_RANK,
            reader,
            tx,
            Arc::clone(&links),
        ));

        Ok(Self {
            rank: config.rank,
            size: config.size,
            links,
            inbox: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&self, dest: usize, message: Message) -> std::result::Result<(), CommError> {
        if dest >= self.size {
            return Err(CommError::InvalidRank {
                rank: dest,
                size: self.size,
            });
        }
        let link = self.links.get(&dest).ok_or_else(|| {
            CommError::Protocol(format!(
                "rank {} has no link to rank {}; messages go through rank {}",
                self.rank, dest, HUB_RANK
            ))
        })?;
        let mut writer = link.lock().await;
        write_frame(
            &mut *writer,
            &Envelope {
                source: self.rank,
                message,
            },
        )
        .await
    }

    async fn recv(&self) -> std::result::Result<Envelope, CommError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(CommError::Disconnected(HUB_RANK)))
    }

    async fn abort(&self, status: i32) {
        broadcast_abort(&self.links, self.rank, None, status).await;
        error!("Rank {} aborting the job with status {}", self.rank, status);
        std::process::exit(status);
    }
}

async fn broadcast_abort(
    links: &HashMap<usize, Link>,
    me: usize,
    except: Option<usize>,
    status: i32,
) {
    for (&dest, link) in links.iter() {
        if Some(dest) == except {
            continue;
        }
        let mut writer = link.lock().await;
        let _ = write_frame(
            &mut *writer,
            &Envelope {
                source: me,
                message: Message::Abort { status },
            },
        )
        .await;
    }
}

async fn read_loop(
    me: usize,
    peer: usize,
    mut reader: FrameStream,
    inbox: InboxSender,
    links: Arc<HashMap<usize, Link>>,
) {
    loop {
        match read_frame(&mut reader, Some(peer)).await {
            Ok(Envelope {
                message: Message::Abort { status },
                ..
            }) => {
                broadcast_abort(&links, me, Some(peer), status).await;
                error!(
                    "Rank {} stopping: job aborted by rank {} with status {}",
                    me, peer, status
                );
                std::process::exit(status);
            }
            Ok(envelope) => {
                let envelope = Envelope {
                    source: peer,
                    message: envelope.message,
                };
                if inbox.send(Ok(envelope)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = inbox.send(Err(err));
                return;
            }
        }
    }
}

fn framed(stream: TcpStream) -> (FrameStream, FrameSink) {
    let codec = || {
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec()
    };
    let (reader, writer) = stream.into_split();
    (
        FramedRead::new(reader, codec()),
        FramedWrite::new(writer, codec()),
    )
}

async fn write_frame(
    sink: &mut FrameSink,
    envelope: &Envelope,
) -> std::result::Result<(), CommError> {
    let bytes = serde_json::to_vec(envelope)?;
    sink.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Next envelope on a link. A closed link is reported as `peer` disconnecting.
async fn read_frame(
    stream: &mut FrameStream,
    peer: Option<usize>,
) -> std::result::Result<Envelope, CommError> {
    match stream.next().await {
        Some(Ok(frame)) => Ok(serde_json::from_slice(&frame)?),
        Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            Err(CommError::Protocol(format!("bad frame: {}", e)))
        }
        Some(Err(e)) => Err(CommError::Io(e)),
        None => Err(match peer {
            Some(peer) => CommError::Disconnected(peer),
            None => CommError::Protocol("link closed before hello".to_string()),
        }),
    }
}
