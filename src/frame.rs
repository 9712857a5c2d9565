//! The `frame` module implements the length-prefixed request/reply framing
//! shared by the tracker, guide, and block server sockets: a little-endian
//! u32 byte count followed by one bincode payload. Every connection carries
//! at most one outstanding request at a time.

use crate::result::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Hard cap on a single frame. Generous enough for one block at any sane
/// block size plus envelope, small enough to bound a misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, msg: &T) -> Result<()> {
    let payload = bincode::serialize(msg)?;
    assert!(payload.len() <= MAX_FRAME_SIZE);
    let mut prefix = [0u8; 4];
    LittleEndian::write_u32(&mut prefix, payload.len() as u32);
    writer.write_all(&prefix)?;
    writer.write_all(&payload)?;
    Ok(())
}

pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = LittleEndian::read_u32(&prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

fn connect(addr: &SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

/// One request/reply exchange on a fresh connection.
pub fn request<Q: Serialize, R: DeserializeOwned>(
    addr: &SocketAddr,
    req: &Q,
    timeout: Duration,
) -> Result<R> {
    let mut stream = connect(addr, timeout)?;
    write_frame(&mut stream, req)?;
    read_frame(&mut stream)
}

/// Fire-and-forget send on a fresh connection; no reply is awaited.
pub fn send<Q: Serialize>(addr: &SocketAddr, msg: &Q, timeout: Duration) -> Result<()> {
    let mut stream = connect(addr, timeout)?;
    write_frame(&mut stream, msg)
}
