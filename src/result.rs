//! The `result` module exposes a Result type that propagates one of many
//! different Error types.

use std::any::Any;

/// Failures of the broadcast itself, as opposed to the plumbing underneath
/// it. Peer-path kinds (`BadBlock`, `TransferFailed`, `DecodeFailed`) are
/// recoverable through the shared-filesystem fallback; `FallbackUnavailable`
/// and `BroadcastUnavailable` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    /// `is_local` publication of a value larger than the cache budget.
    TooLargeForCache,
    /// A seeder replied with a block whose index does not match the request.
    BadBlock,
    /// Socket or protocol failure while pulling from a seeder.
    TransferFailed,
    /// Blocks could not be reassembled or deserialized into a value.
    DecodeFailed,
    /// The fallback file is missing or no workdir is configured.
    FallbackUnavailable,
    /// The peer path failed and so did the fallback.
    BroadcastUnavailable,
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    AddrParse(std::net::AddrParseError),
    JoinError(Box<dyn Any + Send + 'static>),
    Serialize(std::boxed::Box<bincode::ErrorKind>),
    Broadcast(BroadcastError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "treecast error")
    }
}

impl std::error::Error for Error {}

impl std::convert::From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}
impl std::convert::From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Error {
        Error::AddrParse(e)
    }
}
impl std::convert::From<Box<dyn Any + Send + 'static>> for Error {
    fn from(e: Box<dyn Any + Send + 'static>) -> Error {
        Error::JoinError(e)
    }
}
impl std::convert::From<std::boxed::Box<bincode::ErrorKind>> for Error {
    fn from(e: std::boxed::Box<bincode::ErrorKind>) -> Error {
        Error::Serialize(e)
    }
}
impl std::convert::From<BroadcastError> for Error {
    fn from(e: BroadcastError) -> Error {
        Error::Broadcast(e)
    }
}

#[cfg(test)]
mod tests {
    use crate::result::BroadcastError;
    use crate::result::Error;
    use crate::result::Result;
    use std::io;
    use std::io::Write;
    use std::net::SocketAddr;
    use std::panic;
    use std::thread;

    fn addr_parse_error() -> Result<SocketAddr> {
        let r = "12fdfasfsafsadfs".parse()?;
        Ok(r)
    }

    fn join_error() -> Result<()> {
        panic::set_hook(Box::new(|_info| {}));
        let r = thread::spawn(|| panic!("hi")).join()?;
        Ok(r)
    }

    fn serialize_error() -> Result<u64> {
        let r = bincode::deserialize(&[0u8; 2])?;
        Ok(r)
    }

    #[test]
    fn from_test() {
        assert_matches!(addr_parse_error(), Err(Error::AddrParse(_)));
        assert_matches!(join_error(), Err(Error::JoinError(_)));
        assert_matches!(serialize_error(), Err(Error::Serialize(_)));
        let ioe = io::Error::new(io::ErrorKind::NotFound, "hi");
        assert_matches!(Error::from(ioe), Error::Io(_));
        assert_matches!(
            Error::from(BroadcastError::BadBlock),
            Error::Broadcast(BroadcastError::BadBlock)
        );
    }

    #[test]
    fn fmt_test() {
        write!(io::sink(), "{:?}", addr_parse_error()).unwrap();
        write!(io::sink(), "{:?}", join_error()).unwrap();
        write!(io::sink(), "{:?}", Error::from(BroadcastError::TransferFailed)).unwrap();
        write!(
            io::sink(),
            "{:?}",
            Error::from(io::Error::new(io::ErrorKind::NotFound, "hi"))
        )
        .unwrap();
    }
}
