//! Group-wide barriers across the processes of a job.
//!
//! A [`Rendezvous`] is a lazily initialized transport whose only collective
//! operation is [`barrier`](Rendezvous::barrier): nobody returns from it
//! until every participant of the group has entered it.
//!
//! Two transports are provided:
//!
//! - [`TcpRendezvous`]: rank 0 hosts a coordinator socket, every other rank
//!   connects to it. A barrier is one arrive/release round over those
//!   connections.
//! - [`LocalRendezvous`]: participants are tasks of one process sharing a
//!   [`tokio::sync::Barrier`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Barrier, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::World;

/// Default coordinator host when `MASTER_ADDR` is unset.
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";

/// Default coordinator port when `MASTER_PORT` is unset.
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// How long a peer keeps retrying to reach the coordinator.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

const ARRIVE: u8 = 0xA1;
const RELEASE: u8 = 0xE1;

/// Errors from rendezvous transports.
#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("Rendezvous is not initialized")]
    NotInitialized,

    #[error("Rendezvous is already initialized")]
    AlreadyInitialized,

    /// The transport cannot serve this topology.
    #[error("Rendezvous topology mismatch: {0}")]
    Topology(String),

    /// A participant broke the barrier protocol.
    #[error("Rendezvous protocol error: {0}")]
    Protocol(String),

    #[error("Rendezvous I/O error at {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A collective barrier over all ranks of a process group.
pub trait Rendezvous: Send + Sync {
    /// Whether [`init`](Self::init) has run and [`destroy`](Self::destroy)
    /// has not.
    fn is_initialized(&self) -> bool;

    /// Join the group described by `world`. Completes once this participant
    /// is connected; it does not wait for the others.
    fn init(&self, world: World) -> impl Future<Output = Result<(), RendezvousError>> + Send;

    /// Block until every participant has entered this barrier.
    fn barrier(&self) -> impl Future<Output = Result<(), RendezvousError>> + Send;

    /// Leave the group and release the transport.
    fn destroy(&self) -> impl Future<Output = Result<(), RendezvousError>> + Send;
}

enum Session {
    /// A group of one has nothing to synchronize with.
    Solo,
    /// Rank 0: one connection per other rank.
    Host(Vec<TcpStream>),
    /// Any other rank: the connection to rank 0.
    Peer(TcpStream),
}

/// TCP star rendezvous with rank 0 as coordinator.
///
/// # Example
///
/// ```no_run
/// use shardstream::prefix::{Rendezvous, TcpRendezvous, World};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let rendezvous = TcpRendezvous::from_env();
/// rendezvous.init(World::from_env()?).await?;
/// rendezvous.barrier().await?;
/// rendezvous.destroy().await?;
/// # Ok(())
/// # }
/// ```
pub struct TcpRendezvous {
    addr: String,
    connect_timeout: Duration,
    initialized: AtomicBool,
    session: Mutex<Option<Session>>,
}

impl TcpRendezvous {
    /// Coordinator listening at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            initialized: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    /// Coordinator address from `MASTER_ADDR` and `MASTER_PORT`.
    pub fn from_env() -> Self {
        let host =
            std::env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());
        let port = std::env::var("MASTER_PORT")
            .ok()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_MASTER_PORT);
        Self::new(format!("{}:{}", host, port))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn io(&self, source: std::io::Error) -> RendezvousError {
        RendezvousError::Io {
            addr: self.addr.clone(),
            source,
        }
    }

    async fn host(&self, world: World) -> Result<Session, RendezvousError> {
        let listener = TcpListener::bind(&self.addr).await.map_err(|e| self.io(e))?;
        info!(addr = %self.addr, peers = world.num_ranks() - 1, "Hosting rendezvous");

        let mut slots: Vec<Option<TcpStream>> = (0..world.num_ranks()).map(|_| None).collect();
        let mut connected = 0;
        while connected < world.num_ranks() - 1 {
            let (mut stream, remote) = listener.accept().await.map_err(|e| self.io(e))?;
            let rank = stream.read_u32_le().await.map_err(|e| self.io(e))? as usize;
            if rank == 0 || !matches!(slots.get(rank), Some(None)) {
                return Err(RendezvousError::Protocol(format!(
                    "unexpected or duplicate rank {} from {}",
                    rank, remote
                )));
            }
            stream.set_nodelay(true).map_err(|e| self.io(e))?;
            slots[rank] = Some(stream);
            connected += 1;
            trace!(rank, remote = %remote, "Rendezvous peer joined");
        }
        Ok(Session::Host(slots.into_iter().flatten().collect()))
    }

    async fn join(&self, world: World) -> Result<Session, RendezvousError> {
        let rank = u32::try_from(world.rank()).map_err(|_| {
            RendezvousError::Topology(format!("rank {} is too large", world.rank()))
        })?;
        let deadline = Instant::now() + self.connect_timeout;
        let mut stream = loop {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    trace!(addr = %self.addr, error = %e, "Coordinator not reachable yet");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(self.io(e)),
            }
        };
        stream.set_nodelay(true).map_err(|e| self.io(e))?;
        stream.write_u32_le(rank).await.map_err(|e| self.io(e))?;
        debug!(addr = %self.addr, rank, "Joined rendezvous");
        Ok(Session::Peer(stream))
    }

    async fn expect(&self, stream: &mut TcpStream, want: u8) -> Result<(), RendezvousError> {
        let got = stream.read_u8().await.map_err(|e| self.io(e))?;
        if got != want {
            return Err(RendezvousError::Protocol(format!(
                "expected byte {:#04x}, got {:#04x}",
                want, got
            )));
        }
        Ok(())
    }
}

impl Rendezvous for TcpRendezvous {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn init(&self, world: World) -> Result<(), RendezvousError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(RendezvousError::AlreadyInitialized);
        }
        let joined = if world.num_ranks() == 1 {
            Session::Solo
        } else if world.rank() == 0 {
            self.host(world).await?
        } else {
            self.join(world).await?
        };
        *session = Some(joined);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn barrier(&self) -> Result<(), RendezvousError> {
        let mut session = self.session.lock().await;
        match session.as_mut() {
            None => Err(RendezvousError::NotInitialized),
            Some(Session::Solo) => Ok(()),
            Some(Session::Host(peers)) => {
                for peer in peers.iter_mut() {
                    self.expect(peer, ARRIVE).await?;
                }
                for peer in peers.iter_mut() {
                    peer.write_u8(RELEASE).await.map_err(|e| self.io(e))?;
                }
                Ok(())
            }
            Some(Session::Peer(stream)) => {
                stream.write_u8(ARRIVE).await.map_err(|e| self.io(e))?;
                self.expect(stream, RELEASE).await
            }
        }
    }

    async fn destroy(&self) -> Result<(), RendezvousError> {
        let mut session = self.session.lock().await;
        if session.take().is_none() {
            return Err(RendezvousError::NotInitialized);
        }
        self.initialized.store(false, Ordering::Release);
        debug!(addr = %self.addr, "Left rendezvous");
        Ok(())
    }
}

/// In-process rendezvous for tasks standing in for ranks.
///
/// Create one handle per participant with [`group`](Self::group).
#[derive(Debug)]
pub struct LocalRendezvous {
    barrier: Arc<Barrier>,
    size: usize,
    initialized: AtomicBool,
}

impl LocalRendezvous {
    /// `size` handles sharing one barrier.
    pub fn group(size: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|_| Self {
                barrier: barrier.clone(),
                size,
                initialized: AtomicBool::new(false),
            })
            .collect()
    }

    /// Mark this handle as already initialized by its owner.
    pub fn initialized(self) -> Self {
        self.initialized.store(true, Ordering::Release);
        self
    }
}

impl Rendezvous for LocalRendezvous {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn init(&self, world: World) -> Result<(), RendezvousError> {
        if world.num_ranks() != self.size {
            return Err(RendezvousError::Topology(format!(
                "world of {} ranks on a barrier of {}",
                world.num_ranks(),
                self.size
            )));
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(RendezvousError::AlreadyInitialized);
        }
        Ok(())
    }

    async fn barrier(&self) -> Result<(), RendezvousError> {
        if !self.is_initialized() {
            return Err(RendezvousError::NotInitialized);
        }
        self.barrier.wait().await;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), RendezvousError> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(RendezvousError::NotInitialized);
        }
        Ok(())
    }
}
