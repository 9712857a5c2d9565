//! The `block_client` module pulls all blocks of a broadcast from one chosen
//! seeder, strictly in index order. The in-order pull keeps the server state
//! machine trivial and makes an unhealthy seeder fail fast, handing control
//! to the fallback path.

use crate::block::Block;
use crate::block_server::{BlockStore, ServerRequest};
use crate::frame;
use crate::guide::SourceInfo;
use crate::result::{BroadcastError, Error, Result};
use std::net::TcpStream;
use std::time::Duration;

/// Requests indices `0..total_blocks` from `source`, appending each received
/// block to `store` as it arrives, which makes this peer useful to
/// downstream leechers while its own pull is still in flight. Any reply
/// whose index does not match the request is `BadBlock`; every other
/// socket or protocol failure is `TransferFailed`.
pub fn fetch_blocks(source: &SourceInfo, store: &BlockStore, timeout: Duration) -> Result<()> {
    match pull_all(source, store, timeout) {
        Err(Error::Broadcast(BroadcastError::BadBlock)) => Err(BroadcastError::BadBlock.into()),
        Err(err) => {
            warn!("transfer from {} failed: {:?}", source.addr, err);
            Err(BroadcastError::TransferFailed.into())
        }
        Ok(()) => {
            debug!(
                "pulled {} blocks ({} bytes) from {}",
                source.total_blocks, source.total_bytes, source.addr
            );
            Ok(())
        }
    }
}

fn pull_all(source: &SourceInfo, store: &BlockStore, timeout: Duration) -> Result<()> {
    let mut stream = TcpStream::connect_timeout(&source.addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    for index in 0..source.total_blocks {
        frame::write_frame(&mut stream, &ServerRequest::Block(index))?;
        let block: Block = frame::read_frame(&mut stream)?;
        if block.index != index {
            warn!(
                "bad block from {}: requested {}, got {}",
                source.addr, index, block.index
            );
            return Err(BroadcastError::BadBlock.into());
        }
        trace!("received block {} from {}", index, source.addr);
        store.push(block);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::block::{blocks_from_bytes, bytes_from_blocks, Block};
    use crate::block_client::fetch_blocks;
    use crate::block_server::{BlockServer, BlockStore, ServerRequest};
    use crate::frame;
    use crate::guide::SourceInfo;
    use crate::logger;
    use crate::result::{BroadcastError, Error};
    use std::net::{IpAddr, Ipv4Addr, TcpListener};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_pulls_all_blocks_in_order() {
        logger::setup();
        let bytes = vec![42u8; 1000];
        let (blocks, meta) = blocks_from_bytes(&bytes, 256);
        let server = BlockServer::new(LOCALHOST, Arc::new(BlockStore::with_blocks(blocks))).unwrap();
        let source = SourceInfo::with_meta(server.addr(), &meta);

        let store = BlockStore::default();
        fetch_blocks(&source, &store, TIMEOUT).unwrap();
        assert_eq!(store.count(), meta.total_blocks);
        assert_eq!(bytes_from_blocks(&store.snapshot(), &meta).unwrap(), bytes);
        server.close();
    }

    #[test]
    fn test_unreachable_seeder_is_transfer_failed() {
        logger::setup();
        let dead_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut source = SourceInfo::new(dead_addr);
        source.total_blocks = 1;
        let store = BlockStore::default();
        assert_matches!(
            fetch_blocks(&source, &store, Duration::from_millis(200)),
            Err(Error::Broadcast(BroadcastError::TransferFailed))
        );
    }

    #[test]
    fn test_mismatched_index_is_bad_block() {
        logger::setup();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // a rogue seeder that answers every request with block 7
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _request: ServerRequest = frame::read_frame(&mut stream).unwrap();
            let reply = Block {
                index: 7,
                data: vec![0u8; 4],
            };
            frame::write_frame(&mut stream, &reply).unwrap();
        });
        let mut source = SourceInfo::new(addr);
        source.total_blocks = 2;
        let store = BlockStore::default();
        assert_matches!(
            fetch_blocks(&source, &store, TIMEOUT),
            Err(Error::Broadcast(BroadcastError::BadBlock))
        );
    }
}
