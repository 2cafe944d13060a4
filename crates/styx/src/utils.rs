use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split `scheme!rest` into the scheme name and the remainder.
pub fn parse_addr(arg: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = arg.split_once('!')?;
    if scheme.is_empty() {
        return None;
    }
    Some((scheme, rest))
}
