//! Error type and well-known 9P error strings.
//!
//! 9P2000 carries no numeric error codes on the wire; a failed request is
//! answered with `Rerror` holding a single human-readable string (`ename`).
//! Every error in this crate renders to such a string.

use std::{error, fmt, io};

/// Well-known error strings exchanged over the wire.
pub mod string {
    pub const EDUPTAG: &str = "tag in use";
    pub const EDUPFID: &str = "fid in use";
    pub const ENOFUNC: &str = "function not implemented";
    pub const EOPEN: &str = "fid is already open";
    pub const ENOFILE: &str = "file does not exist";
    pub const ENOREAD: &str = "file not open for reading";
    pub const ENOWRITE: &str = "write on fid not opened for writing";
    pub const ENOFID: &str = "fid does not exist";
    pub const ENOTAG: &str = "tag does not exist";
    pub const ENOTDIR: &str = "not a directory";
    pub const EINTR: &str = "interrupted";
    pub const EISDIR: &str = "cannot perform operation on a directory";
    pub const EWALKOPEN: &str = "cannot walk from an open fid";
    pub const EEOF: &str = "unexpected eof";
}

/// The error type used throughout the crate.
#[derive(Debug)]
pub enum Error {
    /// A protocol-level error string: either received in an `Rerror` from the
    /// remote end, or destined to be sent as one.
    Msg(String),
    /// A transport or serialization failure.
    Io(io::Error),
}

impl Error {
    pub fn msg<S: Into<String>>(s: S) -> Error {
        Error::Msg(s.into())
    }

    /// The string to place in an `Rerror` reply.
    pub fn ename(&self) -> String {
        match self {
            Error::Msg(s) => s.clone(),
            Error::Io(e) => e.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(s) => f.write_str(s),
            Error::Io(e) => e.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Msg(_) => None,
            Error::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
