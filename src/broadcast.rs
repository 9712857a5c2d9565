//! The `broadcast` module ties the swarm together behind a handle. On the
//! producer it encodes the value, starts the per-broadcast block server and
//! guide, and registers with the tracker; on a consumer the handle carries
//! only the id and the value is materialized lazily on first dereference:
//! local cache, then tracker -> guide -> seeder, then the shared-filesystem
//! fallback.

use crate::block;
use crate::block_client;
use crate::block_server::{BlockServer, BlockStore};
use crate::broadcast_id::BroadcastId;
use crate::fallback::FallbackStore;
use crate::guide::{self, Guide, SourceInfo, DEFAULT_MAX_DEGREE};
use crate::object_cache::{ObjectCache, DEFAULT_CACHE_BYTES};
use crate::result::{BroadcastError, Result};
use crate::tracker::{self, Tracker};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Environment-registry key under which the master publishes the tracker
/// endpoint for workers to read.
pub const TRACKER_ADDR_ENV_KEY: &str = "TreeBroadcastTrackerAddr";
/// Environment-registry key naming the shared fallback directory.
pub const WORKDIR_ENV_KEY: &str = "WORKDIR";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Address this process advertises to its peers.
    pub host: IpAddr,
    pub block_size: usize,
    pub max_degree: u64,
    pub cache_bytes: usize,
    /// Per-request deadline on every peer connection. A miss routes the
    /// consumer to the fallback path, never back to the guide.
    pub request_timeout: Duration,
    /// Shared directory for fallback copies; `None` disables the fallback.
    pub workdir: Option<PathBuf>,
    /// Write the fallback copy eagerly at publication.
    pub write_fallback: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            block_size: block::DEFAULT_BLOCK_SIZE,
            max_degree: DEFAULT_MAX_DEGREE,
            cache_bytes: DEFAULT_CACHE_BYTES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            workdir: None,
            write_fallback: true,
        }
    }
}

struct BroadcastState {
    // producer side keeps its guide alive here; consumer seeders have none
    _guide: Option<Guide>,
    server: BlockServer,
}

/// Per-process context: configuration, the local object cache, the fallback
/// store, the tracker (master only), and the guides and block servers this
/// process is keeping alive. Tests run several runtimes in one process, so
/// none of this is global.
pub struct Runtime {
    config: BroadcastConfig,
    cache: ObjectCache,
    fallback: Option<FallbackStore>,
    tracker: Option<Tracker>,
    tracker_addr: SocketAddr,
    broadcasts: Mutex<HashMap<BroadcastId, BroadcastState>>,
}

impl Runtime {
    /// Initializes the master process: starts the tracker whose address
    /// must then be published under [`TRACKER_ADDR_ENV_KEY`].
    pub fn new_master(config: BroadcastConfig) -> Result<Self> {
        let tracker = Tracker::new(config.host)?;
        let tracker_addr = tracker.addr();
        Ok(Self::new(config, Some(tracker), tracker_addr))
    }

    /// Initializes a worker process from the tracker endpoint it read out
    /// of the environment registry.
    pub fn new_worker(config: BroadcastConfig, tracker_addr: SocketAddr) -> Self {
        Self::new(config, None, tracker_addr)
    }

    fn new(config: BroadcastConfig, tracker: Option<Tracker>, tracker_addr: SocketAddr) -> Self {
        let cache = ObjectCache::new(config.cache_bytes);
        let fallback = config.workdir.as_ref().map(FallbackStore::new);
        Runtime {
            config,
            cache,
            fallback,
            tracker,
            tracker_addr,
            broadcasts: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker_addr(&self) -> SocketAddr {
        self.tracker_addr
    }

    /// Publishes `value` and returns its handle. With `is_local` the value
    /// only enters this process's cache, for workers that share the
    /// producer's address space; otherwise the full peer machinery starts.
    /// Only the master runtime may publish a networked broadcast.
    pub fn broadcast<T: Serialize>(&self, value: &T, is_local: bool) -> Result<Broadcast<T>> {
        let id = BroadcastId::new_rand();
        let bytes = block::serialize_object(value)?;
        if is_local {
            if !self.cache.put(id, bytes) {
                return Err(BroadcastError::TooLargeForCache.into());
            }
            debug!("published {} locally", id);
            return Ok(Broadcast::new(id));
        }
        self.send_broadcast(id, bytes)?;
        Ok(Broadcast::new(id))
    }

    fn send_broadcast(&self, id: BroadcastId, bytes: Vec<u8>) -> Result<()> {
        let registry = self
            .tracker
            .as_ref()
            .expect("networked broadcasts publish from the master runtime")
            .registry();
        let (blocks, meta) = block::blocks_from_bytes(&bytes, self.config.block_size);
        info!(
            "broadcast {}: {} bytes in {} blocks",
            id, meta.total_bytes, meta.total_blocks
        );
        if self.config.write_fallback {
            if let Some(fallback) = &self.fallback {
                fallback.write(&id, &bytes)?;
            }
        }
        let server = BlockServer::new(self.config.host, Arc::new(BlockStore::with_blocks(blocks)))?;
        let producer = SourceInfo::with_meta(server.addr(), &meta);
        let guide = Guide::new(
            id,
            meta,
            self.config.max_degree,
            producer,
            registry.clone(),
            self.config.host,
            self.config.request_timeout,
        )?;
        registry.register(id, guide.addr());
        // best effort, so dereferencing our own handle skips the network
        self.cache.put(id, bytes);
        self.broadcasts.lock().unwrap().insert(
            id,
            BroadcastState {
                _guide: Some(guide),
                server,
            },
        );
        Ok(())
    }

    /// The consumer fetch path; returns the encoded value bytes.
    fn fetch_value(&self, id: BroadcastId) -> Result<Arc<Vec<u8>>> {
        if let Some(bytes) = self.cache.get(&id) {
            trace!("cache hit for {}", id);
            return Ok(bytes);
        }
        match self.fetch_from_peers(id) {
            Ok(bytes) => {
                let bytes = Arc::new(bytes);
                self.cache.put_shared(id, bytes.clone());
                Ok(bytes)
            }
            Err(err) => {
                warn!(
                    "peer fetch of {} failed ({:?}), trying shared storage",
                    id, err
                );
                let bytes = self.read_fallback(&id).map_err(|fallback_err| {
                    warn!("fallback for {} failed: {:?}", id, fallback_err);
                    BroadcastError::BroadcastUnavailable
                })?;
                let bytes = Arc::new(bytes);
                self.cache.put_shared(id, bytes.clone());
                Ok(bytes)
            }
        }
    }

    fn fetch_from_peers(&self, id: BroadcastId) -> Result<Vec<u8>> {
        let timeout = self.config.request_timeout;
        let guide_addr = match tracker::lookup(&self.tracker_addr, &id, timeout)? {
            Some(guide_addr) => guide_addr,
            None => {
                info!("{} unknown to tracker", id);
                return Err(BroadcastError::TransferFailed.into());
            }
        };
        // we serve whatever we have pulled so far to downstream leechers
        let store = Arc::new(BlockStore::default());
        let server = BlockServer::new(self.config.host, store.clone())?;
        let me = SourceInfo::new(server.addr());
        let source = match guide::request_source(&guide_addr, me, timeout) {
            Ok(source) => source,
            Err(err) => {
                server.close();
                return Err(err);
            }
        };
        debug!(
            "pulling {} blocks of {} from seeder {}",
            source.total_blocks, id, source.addr
        );
        let meta = source.meta();
        let result = block_client::fetch_blocks(&source, &store, timeout)
            .and_then(|()| block::bytes_from_blocks(&store.snapshot(), &meta));
        match result {
            Ok(bytes) => {
                if let Err(err) = guide::report_complete(&guide_addr, server.addr(), timeout) {
                    warn!("completion ping for {} failed: {:?}", id, err);
                }
                // keep seeding until the guide sends stop
                self.broadcasts.lock().unwrap().insert(
                    id,
                    BroadcastState {
                        _guide: None,
                        server,
                    },
                );
                Ok(bytes)
            }
            Err(err) => {
                let _ = guide::report_failed(&guide_addr, source.addr, timeout);
                server.close();
                Err(err)
            }
        }
    }

    fn read_fallback(&self, id: &BroadcastId) -> Result<Vec<u8>> {
        match &self.fallback {
            Some(fallback) => fallback.read(id),
            None => Err(BroadcastError::FallbackUnavailable.into()),
        }
    }

    /// Signals every service this runtime owns to exit. Threads are not
    /// joined; they drain on their own once woken.
    pub fn close(&self) {
        if let Some(tracker) = &self.tracker {
            tracker.close();
        }
        for state in self.broadcasts.lock().unwrap().values() {
            if let Some(guide) = &state._guide {
                guide.close();
            }
            state.server.close();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.close();
    }
}

/// The published object. Only the id survives serialization; everything
/// else lives in the owning process's [`Runtime`].
#[derive(Serialize, Deserialize, Debug)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct Broadcast<T> {
    id: BroadcastId,
    #[serde(skip)]
    _value: PhantomData<fn() -> T>,
}

impl<T> Broadcast<T> {
    fn new(id: BroadcastId) -> Self {
        Broadcast {
            id,
            _value: PhantomData,
        }
    }

    pub fn id(&self) -> BroadcastId {
        self.id
    }
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Broadcast::new(self.id)
    }
}

impl<T: DeserializeOwned> Broadcast<T> {
    /// Materializes the value, fetching it from the swarm on first use.
    /// After a successful return this process keeps seeding the broadcast
    /// until the guide announces the end.
    pub fn value(&self, runtime: &Runtime) -> Result<T> {
        let bytes = runtime.fetch_value(self.id)?;
        block::deserialize_object(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use crate::broadcast::{Broadcast, BroadcastConfig, Runtime};
    use crate::logger;
    use crate::result::{BroadcastError, Error};
    use std::net::{IpAddr, Ipv4Addr};

    fn local_config() -> BroadcastConfig {
        BroadcastConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            cache_bytes: 1024,
            ..BroadcastConfig::default()
        }
    }

    #[test]
    fn test_local_broadcast_round_trip() {
        logger::setup();
        let runtime = Runtime::new_master(local_config()).unwrap();
        let value: Vec<u64> = (0..10).collect();
        let handle = runtime.broadcast(&value, true).unwrap();
        assert_eq!(handle.value(&runtime).unwrap(), value);
    }

    #[test]
    fn test_local_broadcast_too_large() {
        logger::setup();
        let runtime = Runtime::new_master(local_config()).unwrap();
        let value = vec![0u8; 4096];
        assert_matches!(
            runtime.broadcast(&value, true),
            Err(Error::Broadcast(BroadcastError::TooLargeForCache))
        );
    }

    #[test]
    fn test_handle_serializes_to_id_only() {
        logger::setup();
        let runtime = Runtime::new_master(local_config()).unwrap();
        let value: Vec<u64> = (0..10).collect();
        let handle = runtime.broadcast(&value, true).unwrap();
        let shipped = bincode::serialize(&handle).unwrap();
        assert_eq!(shipped.len(), 32);
        let restored: Broadcast<Vec<u64>> = bincode::deserialize(&shipped).unwrap();
        assert_eq!(restored.id(), handle.id());
        assert_eq!(restored.value(&runtime).unwrap(), value);
    }

    #[test]
    fn test_two_publications_get_distinct_ids() {
        logger::setup();
        let runtime = Runtime::new_master(local_config()).unwrap();
        let value: Vec<u64> = (0..10).collect();
        let first = runtime.broadcast(&value, true).unwrap();
        let second = runtime.broadcast(&value, true).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(
            first.value(&runtime).unwrap(),
            second.value(&runtime).unwrap()
        );
    }
}
