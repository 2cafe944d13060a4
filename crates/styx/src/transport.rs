//! Stream transports: message framing, `dial`/`announce`, and the address
//! scheme registry.
//!
//! Addresses follow the Plan 9 resource specification format,
//! `scheme!address[!port]`. The built-in schemes are `unix` (filesystem
//! socket), `tcp` (hostname and port, resolved through DNS) and `debug`
//! (logs the address and fails). Further schemes can be added with
//! [`register_scheme`].

use {
    crate::{
        error::Error,
        fcall::{Msg, MAX_MSG},
        serialize,
        utils::{self, Result},
    },
    bytes::{Buf, BufMut},
    futures::{future::BoxFuture, sink::SinkExt},
    log::info,
    once_cell::sync::Lazy,
    std::collections::HashMap,
    std::path::PathBuf,
    std::sync::RwLock,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, TcpStream, UnixListener, UnixStream},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{length_delimited::LengthDelimitedCodec, FramedRead, FramedWrite},
};

/// A byte stream carrying framed 9P messages.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// A listening endpoint produced by [`announce`].
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<BoxedConn>;
}

pub type BoxedListener = Box<dyn Listener>;

/// An async callable that connects to an address within one scheme.
pub type DialFn = Box<dyn Fn(String) -> BoxFuture<'static, Result<BoxedConn>> + Send + Sync>;
/// An async callable that starts listening on an address within one scheme.
pub type AnnounceFn = Box<dyn Fn(String) -> BoxFuture<'static, Result<BoxedListener>> + Send + Sync>;

struct Scheme {
    dial: DialFn,
    announce: AnnounceFn,
}

static SCHEMES: Lazy<RwLock<HashMap<String, Scheme>>> = Lazy::new(|| {
    let mut tab = HashMap::new();
    tab.insert(
        "unix".to_owned(),
        Scheme {
            dial: Box::new(|addr| Box::pin(dial_unix(addr))),
            announce: Box::new(|addr| Box::pin(announce_unix(addr))),
        },
    );
    tab.insert(
        "tcp".to_owned(),
        Scheme {
            dial: Box::new(|addr| Box::pin(dial_tcp(addr))),
            announce: Box::new(|addr| Box::pin(announce_tcp(addr))),
        },
    );
    tab.insert(
        "debug".to_owned(),
        Scheme {
            dial: Box::new(|addr| {
                Box::pin(async move {
                    info!("dial address: {}", addr);
                    Err(Error::msg("debug scheme never connects"))
                })
            }),
            announce: Box::new(|addr| {
                Box::pin(async move {
                    info!("announce address: {}", addr);
                    Err(Error::msg("debug scheme never connects"))
                })
            }),
        },
    );
    RwLock::new(tab)
});

/// Register an additional address scheme. Registering a name twice is an
/// error.
pub fn register_scheme(name: &str, dial: DialFn, announce: AnnounceFn) -> Result<()> {
    let mut tab = SCHEMES.write().unwrap();
    if tab.contains_key(name) {
        return Err(Error::msg(format!(
            "'{}' already registered as a connection scheme",
            name
        )));
    }
    tab.insert(name.to_owned(), Scheme { dial, announce });
    Ok(())
}

fn lookup_dial(addr: &str) -> Result<BoxFuture<'static, Result<BoxedConn>>> {
    let (scheme, rest) =
        utils::parse_addr(addr).ok_or_else(|| Error::msg("no address type defined"))?;
    let tab = SCHEMES.read().unwrap();
    let entry = tab
        .get(scheme)
        .ok_or_else(|| Error::msg(format!("unknown address scheme '{}'", scheme)))?;
    Ok((entry.dial)(rest.to_owned()))
}

fn lookup_announce(addr: &str) -> Result<BoxFuture<'static, Result<BoxedListener>>> {
    let (scheme, rest) =
        utils::parse_addr(addr).ok_or_else(|| Error::msg("no address type defined"))?;
    let tab = SCHEMES.read().unwrap();
    let entry = tab
        .get(scheme)
        .ok_or_else(|| Error::msg(format!("unknown address scheme '{}'", scheme)))?;
    Ok((entry.announce)(rest.to_owned()))
}

/// Connect to the resource at `addr`.
pub async fn dial(addr: &str) -> Result<BoxedConn> {
    lookup_dial(addr)?.await
}

/// Begin listening on `addr`.
pub async fn announce(addr: &str) -> Result<BoxedListener> {
    lookup_announce(addr)?.await
}

async fn dial_unix(addr: String) -> Result<BoxedConn> {
    let stream = UnixStream::connect(&addr).await?;
    Ok(Box::new(stream))
}

async fn dial_tcp(addr: String) -> Result<BoxedConn> {
    let (host, port) = addr
        .split_once('!')
        .ok_or_else(|| Error::msg("no port provided"))?;
    let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
    Ok(Box::new(stream))
}

/// A bound unix socket whose filesystem entry is removed when the listener is
/// dropped.
struct UnixSock {
    path: PathBuf,
    listener: UnixListener,
}

impl Drop for UnixSock {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

#[async_trait::async_trait]
impl Listener for UnixSock {
    async fn accept(&self) -> Result<BoxedConn> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }
}

async fn announce_unix(addr: String) -> Result<BoxedListener> {
    use std::os::unix::fs::PermissionsExt;

    let path = PathBuf::from(&addr);
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    Ok(Box::new(UnixSock { path, listener }))
}

#[async_trait::async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<BoxedConn> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(Box::new(stream))
    }
}

async fn announce_tcp(addr: String) -> Result<BoxedListener> {
    let (host, port) = addr
        .split_once('!')
        .ok_or_else(|| Error::msg("no port provided"))?;
    // `*` announces on every interface
    let host = if host == "*" { "0.0.0.0" } else { host };
    let listener = TcpListener::bind(format!("{}:{}", host, port)).await?;
    Ok(Box::new(listener))
}

/// Build the framed reader for 9P's length prefix: a four-byte little-endian
/// total size that includes itself.
pub fn frame_read<R: AsyncRead>(r: R) -> FramedRead<R, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(MAX_MSG as usize)
        .new_read(r)
}

/// Build the framed writer; the same codec configuration applies the size
/// prefix on the way out.
pub fn frame_write<W: AsyncWrite>(w: W) -> FramedWrite<W, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(MAX_MSG as usize)
        .new_write(w)
}

/// Serialize `msg` and send it as one frame.
pub async fn send_msg<W>(w: &mut FramedWrite<W, LengthDelimitedCodec>, msg: &Msg) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = bytes::BytesMut::with_capacity(256).writer();
    serialize::write_msg(&mut writer, msg)?;
    w.send(writer.into_inner().freeze()).await?;
    Ok(())
}

/// Receive one frame and deserialize it; `None` on a cleanly closed stream.
pub async fn recv_msg<R>(r: &mut FramedRead<R, LengthDelimitedCodec>) -> Result<Option<Msg>>
where
    R: AsyncRead + Unpin,
{
    match r.next().await {
        None => Ok(None),
        Some(frame) => {
            let bytes = frame?;
            Ok(Some(serialize::read_msg(&mut bytes.reader())?))
        }
    }
}
