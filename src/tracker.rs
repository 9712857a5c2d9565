//! The `tracker` module implements the cluster-singleton directory mapping
//! broadcast ids to guide endpoints. It lives on the master, stores only
//! addresses, and never proxies a byte of value data. Registration and
//! unregistration are in-process operations on the shared registry; only
//! lookup goes over the wire.

use crate::broadcast_id::BroadcastId;
use crate::frame;
use crate::result::Result;
use crate::service::Service;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, Builder, JoinHandle};
use std::time::Duration;

/// The id -> guide_addr table, shared between the tracker's serve thread
/// and the guides that register themselves into it.
#[derive(Clone, Default)]
pub struct Registry {
    guides: Arc<RwLock<HashMap<BroadcastId, SocketAddr>>>,
}

impl Registry {
    pub fn register(&self, id: BroadcastId, guide_addr: SocketAddr) {
        self.guides.write().unwrap().insert(id, guide_addr);
        debug!("registered {} -> {}", id, guide_addr);
    }

    pub fn unregister(&self, id: &BroadcastId) {
        let guide_addr = self.guides.write().unwrap().remove(id);
        debug!("unregistered {} (was {:?})", id, guide_addr);
    }

    pub fn lookup(&self, id: &BroadcastId) -> Option<SocketAddr> {
        self.guides.read().unwrap().get(id).copied()
    }
}

pub struct Tracker {
    addr: SocketAddr,
    registry: Registry,
    exit: Arc<AtomicBool>,
    thread_hdl: JoinHandle<()>,
}

impl Tracker {
    pub fn new(host: IpAddr) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(host, 0))?;
        let addr = listener.local_addr()?;
        let registry = Registry::default();
        let exit = Arc::new(AtomicBool::new(false));
        let thread_registry = registry.clone();
        let thread_exit = exit.clone();
        let thread_hdl = Builder::new()
            .name("treecast-tracker".to_string())
            .spawn(move || Self::run(&listener, &thread_registry, &thread_exit))
            .unwrap();
        info!("tracker started at {}", addr);
        Ok(Tracker {
            addr,
            registry,
            exit,
            thread_hdl,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    fn run(listener: &TcpListener, registry: &Registry, exit: &Arc<AtomicBool>) {
        for stream in listener.incoming() {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            match stream {
                Ok(mut stream) => Self::handle_connection(&mut stream, registry),
                Err(err) => warn!("tracker accept failed: {:?}", err),
            }
        }
        debug!("tracker shut down");
    }

    fn handle_connection(stream: &mut TcpStream, registry: &Registry) {
        let id: BroadcastId = match frame::read_frame(stream) {
            Ok(id) => id,
            Err(err) => {
                warn!("tracker bad request: {:?}", err);
                return;
            }
        };
        // the empty string is the wire sentinel for "unknown; fall back"
        let reply = match registry.lookup(&id) {
            Some(guide_addr) => guide_addr.to_string(),
            None => {
                warn!("broadcast {} is not registered", id);
                String::default()
            }
        };
        if let Err(err) = frame::write_frame(stream, &reply) {
            warn!("tracker reply failed: {:?}", err);
        }
    }

    pub fn close(&self) {
        self.exit.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(self.addr);
    }
}

impl Service for Tracker {
    type JoinReturnType = ();

    fn join(self) -> thread::Result<()> {
        self.thread_hdl.join()
    }
}

/// Wire lookup of a broadcast's guide endpoint. `None` means the id is
/// unknown to the tracker: not yet published, or already unregistered.
pub fn lookup(
    tracker_addr: &SocketAddr,
    id: &BroadcastId,
    timeout: Duration,
) -> Result<Option<SocketAddr>> {
    let reply: String = frame::request(tracker_addr, id, timeout)?;
    if reply.is_empty() {
        Ok(None)
    } else {
        Ok(Some(reply.parse()?))
    }
}
