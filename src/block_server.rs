//! The `block_server` module implements the per-broadcast peer endpoint that
//! answers block-index requests with the corresponding block bytes. Every
//! participant runs one: the producer over the fully encoded value, and each
//! consumer over the blocks it has pulled so far, which is what turns a
//! finished (or even in-flight) leecher into a seeder.

use crate::block::Block;
use crate::frame;
use crate::result::Result;
use crate::service::Service;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, Builder, JoinHandle};
use std::time::Duration;

/// Block server wire requests. `Stop` is a distinct variant rather than a
/// sentinel index, so it can never be confused with a legitimate request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequest {
    Block(u64),
    Stop,
}

/// The blocks a peer currently holds, in index order. Writers append;
/// readers wait on growth, which is what lets a server accept a request for
/// a block the producer has not finished encoding yet.
#[derive(Default)]
pub struct BlockStore {
    blocks: Mutex<Vec<Block>>,
    block_added: Condvar,
}

impl BlockStore {
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        BlockStore {
            blocks: Mutex::new(blocks),
            block_added: Condvar::new(),
        }
    }

    pub fn push(&self, block: Block) {
        let mut blocks = self.blocks.lock().unwrap();
        debug_assert_eq!(block.index, blocks.len() as u64);
        blocks.push(block);
        self.block_added.notify_all();
    }

    pub fn count(&self) -> u64 {
        self.blocks.lock().unwrap().len() as u64
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.blocks.lock().unwrap().clone()
    }

    /// Blocks until the block at `index` is resident, then returns a copy.
    /// Returns None once `exit` is raised so serving threads can drain on
    /// shutdown instead of waiting forever.
    pub fn wait_for(&self, index: u64, exit: &AtomicBool) -> Option<Block> {
        let mut blocks = self.blocks.lock().unwrap();
        while blocks.len() as u64 <= index {
            if exit.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _) = self
                .block_added
                .wait_timeout(blocks, Duration::from_millis(100))
                .unwrap();
            blocks = guard;
        }
        Some(blocks[index as usize].clone())
    }
}

pub struct BlockServer {
    addr: SocketAddr,
    exit: Arc<AtomicBool>,
    thread_hdl: JoinHandle<()>,
}

impl BlockServer {
    /// Binds an ephemeral port before the serve thread starts, so `addr()`
    /// is valid as soon as the constructor returns.
    pub fn new(host: IpAddr, store: Arc<BlockStore>) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(host, 0))?;
        let addr = listener.local_addr()?;
        let exit = Arc::new(AtomicBool::new(false));
        let thread_exit = exit.clone();
        let thread_hdl = Builder::new()
            .name("treecast-block-server".to_string())
            .spawn(move || Self::run(&listener, addr, &store, &thread_exit))
            .unwrap();
        debug!("block server started at {}", addr);
        Ok(BlockServer {
            addr,
            exit,
            thread_hdl,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn run(listener: &TcpListener, addr: SocketAddr, store: &Arc<BlockStore>, exit: &Arc<AtomicBool>) {
        for stream in listener.incoming() {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let store = store.clone();
                    let exit = exit.clone();
                    Builder::new()
                        .name("treecast-block-handler".to_string())
                        .spawn(move || Self::handle_connection(stream, addr, &store, &exit))
                        .unwrap();
                }
                Err(err) => warn!("block server {} accept failed: {:?}", addr, err),
            }
        }
        debug!("block server {} shut down", addr);
    }

    fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        store: &Arc<BlockStore>,
        exit: &Arc<AtomicBool>,
    ) {
        loop {
            // EOF here is just the client hanging up after its pull
            let request: ServerRequest = match frame::read_frame(&mut stream) {
                Ok(request) => request,
                Err(_) => break,
            };
            match request {
                ServerRequest::Block(index) => match store.wait_for(index, exit) {
                    Some(block) => {
                        trace!("{} serving block {}", addr, index);
                        if frame::write_frame(&mut stream, &block).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                ServerRequest::Stop => {
                    debug!("block server {} received stop", addr);
                    exit.store(true, Ordering::Relaxed);
                    Self::wake(addr);
                    break;
                }
            }
        }
    }

    // unblocks the accept loop so it can observe the exit flag
    fn wake(addr: SocketAddr) {
        let _ = TcpStream::connect(addr);
    }

    pub fn close(&self) {
        self.exit.store(true, Ordering::Relaxed);
        Self::wake(self.addr);
    }
}

impl Service for BlockServer {
    type JoinReturnType = ();

    fn join(self) -> thread::Result<()> {
        self.thread_hdl.join()
    }
}

#[cfg(test)]
mod tests {
    use crate::block::Block;
    use crate::block_server::{BlockServer, BlockStore, ServerRequest};
    use crate::frame;
    use crate::logger;
    use crate::service::Service;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn test_blocks(n: u64) -> Vec<Block> {
        (0..n)
            .map(|index| Block {
                index,
                data: vec![index as u8; 8],
            })
            .collect()
    }

    fn pull_block(stream: &mut TcpStream, index: u64) -> Block {
        frame::write_frame(stream, &ServerRequest::Block(index)).unwrap();
        frame::read_frame(stream).unwrap()
    }

    #[test]
    fn test_serves_blocks_in_any_order() {
        logger::setup();
        let store = Arc::new(BlockStore::with_blocks(test_blocks(3)));
        let server = BlockServer::new(LOCALHOST, store).unwrap();
        let mut stream = TcpStream::connect(server.addr()).unwrap();
        for index in [2u64, 0, 1] {
            let block = pull_block(&mut stream, index);
            assert_eq!(block.index, index);
            assert_eq!(block.data, vec![index as u8; 8]);
        }
        drop(stream);
        server.close();
        server.join().unwrap();
    }

    #[test]
    fn test_waits_for_late_producer() {
        logger::setup();
        let store = Arc::new(BlockStore::default());
        let server = BlockServer::new(LOCALHOST, store.clone()).unwrap();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            for block in test_blocks(2) {
                store.push(block);
            }
        });
        let mut stream = TcpStream::connect(server.addr()).unwrap();
        let block = pull_block(&mut stream, 1);
        assert_eq!(block.index, 1);
        producer.join().unwrap();
        drop(stream);
        server.close();
        server.join().unwrap();
    }

    #[test]
    fn test_parallel_clients() {
        logger::setup();
        let store = Arc::new(BlockStore::with_blocks(test_blocks(4)));
        let server = BlockServer::new(LOCALHOST, store).unwrap();
        let addr = server.addr();
        let clients: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(move || {
                    let mut stream = TcpStream::connect(addr).unwrap();
                    for index in 0..4 {
                        assert_eq!(pull_block(&mut stream, index).index, index);
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }
        server.close();
        server.join().unwrap();
    }

    #[test]
    fn test_stop_request_shuts_down() {
        logger::setup();
        let store = Arc::new(BlockStore::with_blocks(test_blocks(1)));
        let server = BlockServer::new(LOCALHOST, store).unwrap();
        let mut stream = TcpStream::connect(server.addr()).unwrap();
        frame::write_frame(&mut stream, &ServerRequest::Stop).unwrap();
        server.join().unwrap();
    }
}
