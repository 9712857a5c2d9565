//! The `guide` module implements the per-broadcast registrar. Arriving
//! leechers announce their own block server and are told which seeder to
//! pull from; the guide grows the swarm into a bounded-degree tree, tracks
//! completions, and tears the whole broadcast down once every known leecher
//! has finished.

use crate::block::BroadcastMeta;
use crate::block_server::ServerRequest;
use crate::broadcast_id::BroadcastId;
use crate::frame;
use crate::result::{BroadcastError, Result};
use crate::service::Service;
use crate::tracker::Registry;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Builder, JoinHandle};
use std::time::Duration;

pub const DEFAULT_MAX_DEGREE: u64 = 4;

/// Describes one seeder. `leechers` is a cumulative fan-out counter: it is
/// incremented each time the source is handed to a new leecher and never
/// decremented, so a subtree slot stays used once rooted. Mutated only by
/// the guide that owns the containing broadcast.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub addr: SocketAddr,
    pub total_blocks: u64,
    pub total_bytes: u64,
    pub block_size: u64,
    pub leechers: u64,
    pub failed: bool,
}

impl SourceInfo {
    pub fn new(addr: SocketAddr) -> Self {
        SourceInfo {
            addr,
            total_blocks: 0,
            total_bytes: 0,
            block_size: 0,
            leechers: 0,
            failed: false,
        }
    }

    pub fn with_meta(addr: SocketAddr, meta: &BroadcastMeta) -> Self {
        SourceInfo {
            addr,
            total_blocks: meta.total_blocks,
            total_bytes: meta.total_bytes,
            block_size: meta.block_size,
            leechers: 0,
            failed: false,
        }
    }

    pub fn meta(&self) -> BroadcastMeta {
        BroadcastMeta {
            total_blocks: self.total_blocks,
            total_bytes: self.total_bytes,
            block_size: self.block_size,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub enum GuideRequest {
    /// A new leecher announcing its own block server; the reply names the
    /// seeder it should pull from, carrying the authoritative metadata.
    Register(SourceInfo),
    /// A leecher that finished its pull and is now a pure seeder.
    Complete { addr: SocketAddr },
    /// A leecher that could not finish pulling from `addr`.
    Failed { addr: SocketAddr },
}

#[derive(Serialize, Deserialize, Debug)]
pub enum GuideResponse {
    Source(SourceInfo),
    Ack,
}

pub(crate) struct GuideState {
    id: BroadcastId,
    meta: BroadcastMeta,
    max_degree: u64,
    producer_addr: SocketAddr,
    sources: HashMap<SocketAddr, SourceInfo>,
    completed: HashSet<SocketAddr>,
}

impl GuideState {
    pub(crate) fn new(
        id: BroadcastId,
        meta: BroadcastMeta,
        max_degree: u64,
        producer: SourceInfo,
    ) -> Self {
        let producer_addr = producer.addr;
        let mut sources = HashMap::new();
        sources.insert(producer_addr, producer);
        GuideState {
            id,
            meta,
            max_degree,
            producer_addr,
            sources,
            completed: HashSet::new(),
        }
    }

    /// Picks a seeder for `requester`: among all other live sources under
    /// the fan-out cap, the one with the most leechers wins (greedy fill,
    /// saturating higher-degree peers before opening new branches), ties
    /// broken by address. When nothing qualifies the producer is returned;
    /// as the tree root it is exempt from the cap.
    fn select_source(&mut self, requester: &SourceInfo) -> SourceInfo {
        let mut selected: Option<&SourceInfo> = None;
        for source in self.sources.values() {
            if source.addr == requester.addr
                || source.failed
                || source.leechers >= self.max_degree
            {
                continue;
            }
            let better = match selected {
                None => true,
                Some(best) => {
                    source.leechers > best.leechers
                        || (source.leechers == best.leechers
                            && source.addr.to_string() < best.addr.to_string())
                }
            };
            if better {
                selected = Some(source);
            }
        }
        let addr = selected.map(|source| source.addr).unwrap_or(self.producer_addr);
        let source = self
            .sources
            .get_mut(&addr)
            .expect("selected source in table");
        source.leechers += 1;
        source.clone()
    }

    /// Serves one registration: selects a seeder, then records the
    /// requester as a source in its own right, stamped with the producer's
    /// metadata. Must stay indivisible per request so two simultaneous
    /// leechers cannot both land on the same nearly-full source.
    pub(crate) fn register(&mut self, requester: &SourceInfo) -> SourceInfo {
        let selected = self.select_source(requester);
        self.sources
            .insert(requester.addr, SourceInfo::with_meta(requester.addr, &self.meta));
        selected
    }

    pub(crate) fn complete(&mut self, addr: SocketAddr) {
        if self.sources.contains_key(&addr) {
            self.completed.insert(addr);
        }
    }

    pub(crate) fn mark_failed(&mut self, addr: SocketAddr) {
        if let Some(source) = self.sources.get_mut(&addr) {
            source.failed = true;
        }
    }

    /// Stop once at least one leecher has registered and everyone known so
    /// far is done. The `- 1` excludes the producer from the accounting.
    pub(crate) fn should_stop(&self) -> bool {
        self.sources.len() > 1 && self.completed.len() == self.sources.len() - 1
    }
}

pub struct Guide {
    addr: SocketAddr,
    exit: Arc<AtomicBool>,
    thread_hdl: JoinHandle<()>,
}

impl Guide {
    pub fn new(
        id: BroadcastId,
        meta: BroadcastMeta,
        max_degree: u64,
        producer: SourceInfo,
        registry: Registry,
        host: IpAddr,
        request_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(host, 0))?;
        let addr = listener.local_addr()?;
        let exit = Arc::new(AtomicBool::new(false));
        let thread_exit = exit.clone();
        let mut state = GuideState::new(id, meta, max_degree, producer);
        let thread_hdl = Builder::new()
            .name("treecast-guide".to_string())
            .spawn(move || Self::run(&listener, &mut state, &registry, &thread_exit, request_timeout))
            .unwrap();
        debug!("guide for {} started at {}", id, addr);
        Ok(Guide {
            addr,
            exit,
            thread_hdl,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests are served strictly one at a time on this loop; that is
    /// what makes selection atomic without any locking of the state.
    fn run(
        listener: &TcpListener,
        state: &mut GuideState,
        registry: &Registry,
        exit: &Arc<AtomicBool>,
        request_timeout: Duration,
    ) {
        for stream in listener.incoming() {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            match stream {
                Ok(mut stream) => Self::handle_connection(&mut stream, state, request_timeout),
                Err(err) => {
                    warn!("guide for {} accept failed: {:?}", state.id, err);
                    continue;
                }
            }
            if state.should_stop() {
                info!(
                    "broadcast {} complete, stopping {} seeders",
                    state.id,
                    state.sources.len()
                );
                Self::notify_stop(state, request_timeout);
                registry.unregister(&state.id);
                break;
            }
        }
        debug!("guide for {} shut down", state.id);
    }

    fn handle_connection(stream: &mut TcpStream, state: &mut GuideState, request_timeout: Duration) {
        let _ = stream.set_read_timeout(Some(request_timeout));
        let _ = stream.set_write_timeout(Some(request_timeout));
        let request: GuideRequest = match frame::read_frame(stream) {
            Ok(request) => request,
            Err(err) => {
                warn!("guide for {} bad request: {:?}", state.id, err);
                return;
            }
        };
        let response = match request {
            GuideRequest::Register(requester) => {
                let selected = state.register(&requester);
                debug!(
                    "assigned seeder {} ({} leechers) to {}",
                    selected.addr, selected.leechers, requester.addr
                );
                GuideResponse::Source(selected)
            }
            GuideRequest::Complete { addr } => {
                debug!("{} completed broadcast {}", addr, state.id);
                state.complete(addr);
                GuideResponse::Ack
            }
            GuideRequest::Failed { addr } => {
                warn!("seeder {} marked failed for {}", addr, state.id);
                state.mark_failed(addr);
                GuideResponse::Ack
            }
        };
        if let Err(err) = frame::write_frame(stream, &response) {
            warn!("guide for {} reply failed: {:?}", state.id, err);
        }
    }

    fn notify_stop(state: &GuideState, request_timeout: Duration) {
        for addr in state.sources.keys() {
            if let Err(err) = frame::send(addr, &ServerRequest::Stop, request_timeout) {
                warn!("failed to stop seeder {}: {:?}", addr, err);
            }
        }
    }

    pub fn close(&self) {
        self.exit.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(self.addr);
    }
}

impl Service for Guide {
    type JoinReturnType = ();

    fn join(self) -> thread::Result<()> {
        self.thread_hdl.join()
    }
}

/// Announces `me` to the guide and returns the seeder to pull from.
pub fn request_source(
    guide_addr: &SocketAddr,
    me: SourceInfo,
    timeout: Duration,
) -> Result<SourceInfo> {
    match frame::request(guide_addr, &GuideRequest::Register(me), timeout)? {
        GuideResponse::Source(source) => Ok(source),
        GuideResponse::Ack => {
            warn!("guide {} replied without a source", guide_addr);
            Err(BroadcastError::TransferFailed.into())
        }
    }
}

pub fn report_complete(guide_addr: &SocketAddr, addr: SocketAddr, timeout: Duration) -> Result<()> {
    let _: GuideResponse = frame::request(guide_addr, &GuideRequest::Complete { addr }, timeout)?;
    Ok(())
}

pub fn report_failed(guide_addr: &SocketAddr, addr: SocketAddr, timeout: Duration) -> Result<()> {
    let _: GuideResponse = frame::request(guide_addr, &GuideRequest::Failed { addr }, timeout)?;
    Ok(())
}
