//! The `block` module implements the block codec: values are serialized to a
//! byte buffer and partitioned into fixed-size indexed blocks, the unit all
//! peer transfers work in. The final block of a broadcast may be short.

use crate::result::{BroadcastError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// One slice of an encoded value. Blocks are immutable once produced and
/// shared by value between peers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Per-broadcast metadata. Consumers learn it from the guide rather than
/// from configuration, so producer and consumer need not agree on a block
/// size up front.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMeta {
    pub total_blocks: u64,
    pub total_bytes: u64,
    pub block_size: u64,
}

pub fn serialize_object<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn deserialize_object<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|err| {
        warn!("object deserialization failed: {:?}", err);
        BroadcastError::DecodeFailed.into()
    })
}

/// Partitions `bytes` into `ceil(len / block_size)` contiguous blocks.
pub fn blocks_from_bytes(bytes: &[u8], block_size: usize) -> (Vec<Block>, BroadcastMeta) {
    assert!(block_size > 0);
    let blocks: Vec<Block> = bytes
        .chunks(block_size)
        .enumerate()
        .map(|(index, chunk)| Block {
            index: index as u64,
            data: chunk.to_vec(),
        })
        .collect();
    let meta = BroadcastMeta {
        total_blocks: blocks.len() as u64,
        total_bytes: bytes.len() as u64,
        block_size: block_size as u64,
    };
    (blocks, meta)
}

/// Reassembles the original byte buffer, verifying that a block is present
/// for every index in `[0, total_blocks)` and that the concatenation has
/// exactly `total_bytes` bytes.
pub fn bytes_from_blocks(blocks: &[Block], meta: &BroadcastMeta) -> Result<Vec<u8>> {
    if blocks.len() as u64 != meta.total_blocks {
        warn!(
            "reassembly failed: {} of {} blocks present",
            blocks.len(),
            meta.total_blocks
        );
        return Err(BroadcastError::DecodeFailed.into());
    }
    let mut bytes = Vec::with_capacity(meta.total_bytes as usize);
    for (position, block) in blocks.iter().enumerate() {
        if block.index != position as u64 {
            warn!(
                "reassembly failed: block {} found at position {}",
                block.index, position
            );
            return Err(BroadcastError::DecodeFailed.into());
        }
        bytes.extend_from_slice(&block.data);
    }
    if bytes.len() as u64 != meta.total_bytes {
        warn!(
            "reassembly failed: {} bytes from blocks, expected {}",
            bytes.len(),
            meta.total_bytes
        );
        return Err(BroadcastError::DecodeFailed.into());
    }
    Ok(bytes)
}

pub fn encode_blocks<T: Serialize>(
    value: &T,
    block_size: usize,
) -> Result<(Vec<Block>, BroadcastMeta)> {
    let bytes = serialize_object(value)?;
    Ok(blocks_from_bytes(&bytes, block_size))
}

pub fn decode_blocks<T: DeserializeOwned>(blocks: &[Block], meta: &BroadcastMeta) -> Result<T> {
    let bytes = bytes_from_blocks(blocks, meta)?;
    deserialize_object(&bytes)
}

#[cfg(test)]
mod tests {
    use crate::block::{blocks_from_bytes, decode_blocks, encode_blocks};
    use crate::result::{BroadcastError, Error};

    #[test]
    fn test_encode_decode_identity() {
        let value: Vec<u64> = (0..1000).collect();
        let (blocks, meta) = encode_blocks(&value, 64).unwrap();
        assert_eq!(meta.total_blocks, blocks.len() as u64);
        assert_eq!(
            meta.total_blocks,
            (meta.total_bytes + meta.block_size - 1) / meta.block_size
        );
        let decoded: Vec<u64> = decode_blocks(&blocks, &meta).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_final_block_may_be_short() {
        let bytes = vec![7u8; 100];
        let (blocks, meta) = blocks_from_bytes(&bytes, 64);
        assert_eq!(meta.total_blocks, 2);
        assert_eq!(blocks[0].data.len(), 64);
        assert_eq!(blocks[1].data.len(), 36);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let bytes = vec![1u8; 128];
        let (blocks, meta) = blocks_from_bytes(&bytes, 64);
        assert_eq!(meta.total_blocks, 2);
        assert_eq!(blocks.last().unwrap().data.len(), 64);
    }

    #[test]
    fn test_missing_block_fails_decode() {
        let value: Vec<u64> = (0..1000).collect();
        let (mut blocks, meta) = encode_blocks(&value, 64).unwrap();
        blocks.pop();
        assert_matches!(
            decode_blocks::<Vec<u64>>(&blocks, &meta),
            Err(Error::Broadcast(BroadcastError::DecodeFailed))
        );
    }

    #[test]
    fn test_misordered_block_fails_decode() {
        let value: Vec<u64> = (0..1000).collect();
        let (mut blocks, meta) = encode_blocks(&value, 64).unwrap();
        blocks.swap(0, 1);
        assert_matches!(
            decode_blocks::<Vec<u64>>(&blocks, &meta),
            Err(Error::Broadcast(BroadcastError::DecodeFailed))
        );
    }

    #[test]
    fn test_garbage_bytes_fail_decode() {
        let (blocks, meta) = blocks_from_bytes(&[0xffu8; 7], 4);
        assert_matches!(
            decode_blocks::<Vec<u64>>(&blocks, &meta),
            Err(Error::Broadcast(BroadcastError::DecodeFailed))
        );
    }
}
