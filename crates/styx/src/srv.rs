//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! The engine owns the protocol bookkeeping: it tracks the fids and in-flight
//! tags of every connection, enforces the per-message preconditions, and
//! performs the reply-side state updates when a handler finishes. Handlers
//! implement [`Filesystem`]; each returns its reply (or an error string)
//! exactly once, after any number of awaits. Whenever a client disconnects,
//! the engine generates the flush and clunk events required to leave the
//! connection in a clean state before releasing it.

use {
    crate::{
        error::{string::*, Error},
        fcall::*,
        transport::{self, BoxedConn},
        utils::Result,
    },
    async_trait::async_trait,
    log::{error, info},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex as StdMutex,
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, WriteHalf},
        sync::Mutex,
    },
    tokio_util::codec::{length_delimited::LengthDelimitedCodec, FramedRead, FramedWrite},
};

/// A client's handle on a file of the served tree, with the engine-tracked
/// open state and the `Filesystem::Aux` value associated with it.
pub struct Fid<T> {
    fid: u32,
    meta: StdMutex<FidMeta>,

    /// `Filesystem::Aux` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

#[derive(Clone, Copy)]
struct FidMeta {
    qid: QId,
    omode: i8,
    iounit: u32,
}

impl<T: Default> Fid<T> {
    fn new(fid: u32) -> Fid<T> {
        Fid {
            fid,
            meta: StdMutex::new(FidMeta {
                qid: QId::default(),
                omode: -1,
                iounit: 0,
            }),
            aux: T::default(),
        }
    }
}

impl<T> Fid<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The qid recorded at attach, walk, open or create time.
    pub fn qid(&self) -> QId {
        self.meta.lock().unwrap().qid
    }

    /// Open mode of the fid; −1 until a successful open or create.
    pub fn omode(&self) -> i8 {
        self.meta.lock().unwrap().omode
    }

    /// Maximum I/O payload granted at open time, 0 before that.
    pub fn iounit(&self) -> u32 {
        self.meta.lock().unwrap().iounit
    }

    fn set_qid(&self, qid: QId) {
        self.meta.lock().unwrap().qid = qid;
    }

    fn set_open(&self, omode: i8, qid: QId, iounit: u32) {
        let mut meta = self.meta.lock().unwrap();
        meta.omode = omode;
        meta.qid = qid;
        meta.iounit = iounit;
    }
}

/// The trait a 9P2000 server implements.
///
/// Every method corresponds to a protocol request and returns the matching
/// R-message. The engine has already checked the preconditions of the
/// dispatch table (fid existence, open modes, wstat sentinels and so on)
/// before a method runs, and applies the reply to its bookkeeping afterwards,
/// so implementations deal only with their own tree.
///
/// Most methods default to replying "function not implemented"; implement the
/// operations your tree supports. `rclunk` defaults to success, and
/// `rfreefid` is a destruction hook, not a request handler.
#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    /// Per-fid state associated with every fid the engine creates.
    type Aux: Send + Sync + Default;

    /// Begin an authentication exchange on `afid` (9P2000 `Tauth`).
    ///
    /// The engine allocates `afid` like any other fid and destroys it if this
    /// returns an error. There is no auth policy in the library itself.
    async fn rauth(
        &self,
        _afid: &Fid<Self::Aux>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Associate a fresh fid with the root of the served tree.
    ///
    /// Return `FCall::RAttach` carrying the root qid; the engine records that
    /// qid on the fid.
    async fn rattach(
        &self,
        _fid: &Fid<Self::Aux>,
        _afid: Option<&Fid<Self::Aux>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Abort a pending operation. `old` is the request being flushed, if it
    /// is still in flight. The engine answers the flushed request with
    /// "interrupted" by itself; this hook only gives the server a chance to
    /// stop work early.
    async fn rflush(&self, _old: Option<&FCall>) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Walk `wnames` starting from `fid`, binding the destination to
    /// `newfid`. Return one qid per traversed element; fewer than requested
    /// means the walk stopped early (and the engine discards `newfid`).
    async fn rwalk(
        &self,
        _fid: &Fid<Self::Aux>,
        _newfid: &Fid<Self::Aux>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Open `fid` with the given `om` mode. On success the engine records
    /// mode, qid and iounit (defaulted to msize − IOHDRSZ if left 0) on the
    /// fid.
    async fn ropen(&self, _fid: &Fid<Self::Aux>, _mode: u8) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Create `name` in the directory bound to `fid` and open it; `fid`
    /// comes to represent the new file.
    async fn rcreate(
        &self,
        _fid: &Fid<Self::Aux>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    async fn rread(&self, _fid: &Fid<Self::Aux>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    async fn rwrite(&self, _fid: &Fid<Self::Aux>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Release `fid`. The engine destroys the fid whatever this returns.
    async fn rclunk(&self, _fid: &Fid<Self::Aux>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file bound to `fid`. Following 9P, the fid is destroyed
    /// even when the removal fails.
    async fn rremove(&self, _fid: &Fid<Self::Aux>) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    async fn rstat(&self, _fid: &Fid<Self::Aux>) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Change file metadata. The engine has already rejected writes to the
    /// sentinel-protected fields (type, dev, qid, muid, the DMDIR bit).
    async fn rwstat(&self, _fid: &Fid<Self::Aux>, _stat: &Stat) -> Result<FCall> {
        Err(Error::msg(ENOFUNC))
    }

    /// Called once for every fid about to be destroyed, whether by clunk,
    /// remove, a failed walk or attach, or connection teardown. Release any
    /// handler-owned resources tied to `fid.aux` here.
    async fn rfreefid(&self, _fid: &Fid<Self::Aux>) {}
}

struct ConnState<Fs: Filesystem> {
    fs: Fs,
    fids: StdMutex<HashMap<u32, Arc<Fid<Fs::Aux>>>>,
    /// In-flight requests by tag; an entry exists from decode until the
    /// reply (or a flush on its behalf) has been sent.
    tags: StdMutex<HashMap<u16, FCall>>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedConn>, LengthDelimitedCodec>>,
    msize: AtomicU32,
}

/// One dispatched request: the decoded fcall plus the fids resolved for it.
struct Req<T> {
    tag: u16,
    ifcall: FCall,
    fid: Option<Arc<Fid<T>>>,
    newfid: Option<Arc<Fid<T>>>,
}

fn lookup_fid<Fs: Filesystem>(conn: &ConnState<Fs>, fid: u32) -> Option<Arc<Fid<Fs::Aux>>> {
    conn.fids.lock().unwrap().get(&fid).cloned()
}

fn create_fid<Fs: Filesystem>(conn: &ConnState<Fs>, fid: u32) -> Option<Arc<Fid<Fs::Aux>>> {
    let mut fids = conn.fids.lock().unwrap();
    if fids.contains_key(&fid) {
        return None;
    }
    let f = Arc::new(Fid::new(fid));
    fids.insert(fid, f.clone());
    Some(f)
}

async fn destroy_fid<Fs: Filesystem>(conn: &ConnState<Fs>, fid: u32) {
    let f = conn.fids.lock().unwrap().remove(&fid);
    if let Some(f) = f {
        conn.fs.rfreefid(&f).await;
    }
}

/// Claim `tag` for an incoming request. False if the tag is already in
/// flight.
fn install_tag<Fs: Filesystem>(conn: &ConnState<Fs>, tag: u16, body: &FCall) -> bool {
    let mut tags = conn.tags.lock().unwrap();
    if tags.contains_key(&tag) {
        return false;
    }
    tags.insert(tag, body.clone());
    true
}

async fn send_reply<Fs: Filesystem>(conn: &ConnState<Fs>, tag: u16, body: FCall) {
    let msg = Msg { tag, body };
    info!("\t→ {:?}", msg);
    let mut writer = conn.writer.lock().await;
    if let Err(e) = transport::send_msg(&mut writer, &msg).await {
        error!("failed to send reply for tag {}: {}", tag, e);
    }
}

/// Release `tag` and send its reply, unless a flush already answered it.
async fn respond_final<Fs: Filesystem>(conn: &ConnState<Fs>, tag: u16, out: Result<FCall>) {
    let body = match out {
        Ok(fcall) => fcall,
        Err(e) => FCall::RError { ename: e.ename() },
    };
    if conn.tags.lock().unwrap().remove(&tag).is_none() {
        info!("dropping reply for flushed tag {}", tag);
        return;
    }
    send_reply(conn, tag, body).await;
}

/// Version negotiation is the engine's own: accept `9P` and `9P2000`, answer
/// `unknown` otherwise, clamp msize and resize the frame limits in both
/// directions.
async fn negotiate<Fs, R>(
    conn: &ConnState<Fs>,
    reader: &mut FramedRead<R, LengthDelimitedCodec>,
    msize: u32,
    version: &str,
) -> FCall
where
    Fs: Filesystem,
    R: AsyncRead + Unpin,
{
    let msize = msize.min(MAX_MSG);
    conn.msize.store(msize, Ordering::Relaxed);
    reader.decoder_mut().set_max_frame_length(msize as usize);
    conn.writer
        .lock()
        .await
        .encoder_mut()
        .set_max_frame_length(msize as usize);

    let version = match version {
        P92000 => P92000,
        P9 => P9,
        _ => VERSION_UNKNOWN,
    };
    FCall::RVersion {
        msize,
        version: version.to_owned(),
    }
}

/// The dispatch table's precondition column: resolve and allocate fids,
/// reject protocol misuse before the handler ever runs.
fn precheck<Fs: Filesystem>(
    conn: &ConnState<Fs>,
    body: &FCall,
) -> Result<(Option<Arc<Fid<Fs::Aux>>>, Option<Arc<Fid<Fs::Aux>>>)> {
    use FCall::*;

    match *body {
        TAuth { afid, .. } => {
            let af = create_fid(conn, afid).ok_or_else(|| Error::msg(EDUPFID))?;
            Ok((None, Some(af)))
        }
        TAttach { fid, .. } => {
            let f = create_fid(conn, fid).ok_or_else(|| Error::msg(EDUPFID))?;
            Ok((Some(f), None))
        }
        TFlush { oldtag } => {
            if !conn.tags.lock().unwrap().contains_key(&oldtag) {
                return Err(Error::msg(ENOTAG));
            }
            Ok((None, None))
        }
        TWalk {
            fid,
            newfid,
            ref wnames,
        } => {
            let f = lookup_fid(conn, fid).ok_or_else(|| Error::msg(ENOFID))?;
            if f.omode() != -1 {
                return Err(Error::msg(EWALKOPEN));
            }
            if !wnames.is_empty() && !f.qid().is_dir() {
                return Err(Error::msg(ENOTDIR));
            }
            let nf = if fid != newfid {
                create_fid(conn, newfid).ok_or_else(|| Error::msg(EDUPFID))?
            } else {
                f.clone()
            };
            Ok((Some(f), Some(nf)))
        }
        TOpen { fid, mode } => {
            let f = lookup_fid(conn, fid).ok_or_else(|| Error::msg(ENOFID))?;
            // a directory only opens for read, with or without ORCLOSE
            if f.qid().is_dir() && (mode | om::RCLOSE) != (om::READ | om::RCLOSE) {
                return Err(Error::msg(EISDIR));
            }
            Ok((Some(f), None))
        }
        TCreate { fid, .. } => {
            let f = lookup_fid(conn, fid).ok_or_else(|| Error::msg(ENOFID))?;
            if f.omode() != -1 {
                return Err(Error::msg(EOPEN));
            }
            if !f.qid().is_dir() {
                return Err(Error::msg(ENOTDIR));
            }
            Ok((Some(f), None))
        }
        TRead { fid, .. } => {
            let f = lookup_fid(conn, fid).ok_or_else(|| Error::msg(ENOFID))?;
            let omode = f.omode();
            if omode == -1 || omode == om::WRITE as i8 {
                return Err(Error::msg(ENOREAD));
            }
            Ok((Some(f), None))
        }
        TWrite { fid, .. } => {
            let f = lookup_fid(conn, fid).ok_or_else(|| Error::msg(ENOFID))?;
            let omode = f.omode();
            if (omode & 3) != om::WRITE as i8 && (omode & 3) != om::RDWR as i8 {
                return Err(Error::msg(ENOWRITE));
            }
            Ok((Some(f), None))
        }
        TClunk { fid } | TRemove { fid } | TStat { fid } => {
            let f = lookup_fid(conn, fid).ok_or_else(|| Error::msg(ENOFID))?;
            Ok((Some(f), None))
        }
        TWStat { fid, ref stat } => {
            let f = lookup_fid(conn, fid).ok_or_else(|| Error::msg(ENOFID))?;
            if stat.typ != !0 {
                return Err(Error::msg("wstat of type"));
            }
            if stat.dev != !0 {
                return Err(Error::msg("wstat of dev"));
            }
            if stat.qid.typ.bits() != !0 || stat.qid.version != !0 || stat.qid.path != !0 {
                return Err(Error::msg("wstat of qid"));
            }
            if !stat.muid.is_empty() {
                return Err(Error::msg("wstat of muid"));
            }
            if stat.mode != !0
                && ((stat.mode & dm::DIR) >> 24) as u8 != (f.qid().typ.bits() & QIdType::DIR.bits())
            {
                return Err(Error::msg("wstat on DMDIR bit"));
            }
            Ok((Some(f), None))
        }
        _ => Err(Error::msg(ENOFUNC)),
    }
}

async fn invoke<Fs: Filesystem>(conn: &ConnState<Fs>, req: &Req<Fs::Aux>) -> Result<FCall> {
    use FCall::*;

    let fs = &conn.fs;
    let get_fid = || req.fid.as_deref().ok_or_else(|| Error::msg(ENOFID));
    let get_newfid = || req.newfid.as_deref().ok_or_else(|| Error::msg(ENOFID));

    match req.ifcall {
        TAuth {
            ref uname,
            ref aname,
            ..
        } => fs.rauth(get_newfid()?, uname, aname).await,
        TAttach {
            afid,
            ref uname,
            ref aname,
            ..
        } => {
            let auth = if afid != NOFID {
                lookup_fid(conn, afid)
            } else {
                None
            };
            fs.rattach(get_fid()?, auth.as_deref(), uname, aname).await
        }
        TFlush { oldtag } => {
            let old = conn.tags.lock().unwrap().get(&oldtag).cloned();
            fs.rflush(old.as_ref()).await
        }
        TWalk { ref wnames, .. } => fs.rwalk(get_fid()?, get_newfid()?, wnames).await,
        TOpen { mode, .. } => fs.ropen(get_fid()?, mode).await,
        TCreate {
            ref name,
            perm,
            mode,
            ..
        } => fs.rcreate(get_fid()?, name, perm, mode).await,
        TRead { offset, count, .. } => fs.rread(get_fid()?, offset, count).await,
        TWrite {
            offset, ref data, ..
        } => fs.rwrite(get_fid()?, offset, data).await,
        TClunk { .. } => fs.rclunk(get_fid()?).await,
        TRemove { .. } => fs.rremove(get_fid()?).await,
        TStat { .. } => fs.rstat(get_fid()?).await,
        TWStat { ref stat, .. } => fs.rwstat(get_fid()?, stat).await,
        _ => Err(Error::msg(ENOFUNC)),
    }
}

/// Reply-side bookkeeping: apply the handler's result to the fid and tag
/// state, then send the reply (the reply type is the request type + 1; an
/// error renders to `RError`).
async fn respond<Fs: Filesystem>(conn: &ConnState<Fs>, req: Req<Fs::Aux>, out: Result<FCall>) {
    use FCall::*;

    let mut out = out;

    match req.ifcall {
        TAuth { .. } => match (&out, &req.newfid) {
            (Ok(RAuth { aqid }), Some(af)) => af.set_qid(*aqid),
            (Err(_), Some(af)) => destroy_fid(conn, af.fid()).await,
            _ => {}
        },
        TAttach { .. } => match (&out, &req.fid) {
            (Ok(RAttach { qid }), Some(f)) => f.set_qid(*qid),
            (Err(_), Some(f)) => destroy_fid(conn, f.fid()).await,
            _ => {}
        },
        TOpen { mode, .. } | TCreate { mode, .. } => {
            if let Ok(ROpen { qid, iounit }) | Ok(RCreate { qid, iounit }) = &mut out {
                if *iounit == 0 {
                    *iounit = conn.msize.load(Ordering::Relaxed) - IOHDRSZ;
                }
                if let Some(f) = &req.fid {
                    f.set_open(mode as i8, *qid, *iounit);
                }
            }
        }
        TWalk {
            fid,
            newfid,
            ref wnames,
        } => match &out {
            Ok(RWalk { wqids }) if wqids.len() >= wnames.len() => {
                if let (Some(f), Some(nf)) = (&req.fid, &req.newfid) {
                    // an empty walk clones the origin
                    let qid = wqids.last().copied().unwrap_or_else(|| f.qid());
                    nf.set_qid(qid);
                }
            }
            _ => {
                // short walk or failure: the new fid never comes to life
                if fid != newfid {
                    if let Some(nf) = &req.newfid {
                        destroy_fid(conn, nf.fid()).await;
                    }
                }
                if let Ok(RWalk { wqids }) = &out {
                    if wqids.is_empty() {
                        out = Err(Error::msg(ENOFILE));
                    }
                }
            }
        },
        TClunk { .. } | TRemove { .. } => {
            if let Some(f) = &req.fid {
                destroy_fid(conn, f.fid()).await;
            }
        }
        TFlush { oldtag } => {
            // answer the flushed request first, then the flush itself
            let pending = conn.tags.lock().unwrap().remove(&oldtag).is_some();
            if pending {
                send_reply(
                    conn,
                    oldtag,
                    RError {
                        ename: EINTR.to_owned(),
                    },
                )
                .await;
            }
        }
        _ => {}
    }

    respond_final(conn, req.tag, out).await;
}

/// Generate the flush and clunk events a disconnect leaves behind: one flush
/// per outstanding tag, then one clunk (and `rfreefid`) per live fid.
async fn cleanup<Fs: Filesystem>(conn: &ConnState<Fs>) {
    let tags: Vec<FCall> = {
        let mut tags = conn.tags.lock().unwrap();
        tags.drain().map(|(_, ifcall)| ifcall).collect()
    };
    for old in &tags {
        let _ = conn.fs.rflush(Some(old)).await;
    }

    let fids: Vec<Arc<Fid<Fs::Aux>>> = {
        let mut fids = conn.fids.lock().unwrap();
        fids.drain().map(|(_, f)| f).collect()
    };
    for f in fids {
        let _ = conn.fs.rclunk(&f).await;
        conn.fs.rfreefid(&f).await;
    }
}

/// Serve 9P2000 on one established byte stream until it is closed or a
/// protocol error forces a hangup.
pub async fn serve_connection<Fs, S>(fs: Fs, stream: S) -> Result<()>
where
    Fs: Filesystem,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let stream: BoxedConn = Box::new(stream);
    let (rhalf, whalf) = tokio::io::split(stream);
    let mut reader = transport::frame_read(rhalf);

    let conn = Arc::new(ConnState {
        fs,
        fids: StdMutex::new(HashMap::new()),
        tags: StdMutex::new(HashMap::new()),
        writer: Mutex::new(transport::frame_write(whalf)),
        msize: AtomicU32::new(MAX_MSG),
    });

    loop {
        let msg = match transport::recv_msg(&mut reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                error!("hangup: {}", e);
                break;
            }
        };
        info!("\t← {:?}", msg);

        if !install_tag(&conn, msg.tag, &msg.body) {
            send_reply(
                &conn,
                msg.tag,
                FCall::RError {
                    ename: EDUPTAG.to_owned(),
                },
            )
            .await;
            continue;
        }

        if let FCall::TVersion { msize, ref version } = msg.body {
            let reply = negotiate(&conn, &mut reader, msize, version).await;
            respond_final(&conn, msg.tag, Ok(reply)).await;
            continue;
        }

        match precheck(&conn, &msg.body) {
            Err(e) => respond_final(&conn, msg.tag, Err(e)).await,
            Ok((fid, newfid)) => {
                let req = Req {
                    tag: msg.tag,
                    ifcall: msg.body,
                    fid,
                    newfid,
                };
                let conn = conn.clone();
                tokio::spawn(async move {
                    let out = invoke(&conn, &req).await;
                    respond(&conn, req, out).await;
                });
            }
        }
    }

    cleanup(&conn).await;
    Ok(())
}

/// Announce `addr` and serve every accepted connection with a clone of
/// `filesystem`.
pub async fn srv<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: Filesystem + Clone,
{
    let listener = transport::announce(addr).await?;

    loop {
        let stream = listener.accept().await?;
        info!("accepted connection");

        let fs = filesystem.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(fs, stream).await {
                error!("connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{DuplexStream, ReadHalf};
    use tokio::task::JoinHandle;

    const ROOT: QId = QId {
        typ: QIdType::DIR,
        version: 0,
        path: 1,
    };
    const HELLO: QId = QId {
        typ: QIdType::FILE,
        version: 0,
        path: 2,
    };
    const SLOW: QId = QId {
        typ: QIdType::FILE,
        version: 0,
        path: 3,
    };
    const CONTENT: &[u8] = b"hello, world";

    /// Three-file tree: `/` (dir), `/hello` (readable), `/slow` (reads never
    /// complete). Counts every handler invocation.
    #[derive(Clone, Default)]
    struct TestFs {
        counts: Arc<Counts>,
    }

    #[derive(Default)]
    struct Counts {
        attach: AtomicUsize,
        read: AtomicUsize,
        flush: AtomicUsize,
        freefid: AtomicUsize,
    }

    fn node_by_name(name: &str) -> Option<QId> {
        match name {
            "hello" => Some(HELLO),
            "slow" => Some(SLOW),
            _ => None,
        }
    }

    #[async_trait]
    impl Filesystem for TestFs {
        type Aux = ();

        async fn rattach(
            &self,
            _fid: &Fid<()>,
            _afid: Option<&Fid<()>>,
            _uname: &str,
            _aname: &str,
        ) -> Result<FCall> {
            self.counts.attach.fetch_add(1, Ordering::SeqCst);
            Ok(FCall::RAttach { qid: ROOT })
        }

        async fn rwalk(
            &self,
            fid: &Fid<()>,
            _newfid: &Fid<()>,
            wnames: &[String],
        ) -> Result<FCall> {
            let mut wqids = Vec::new();
            let mut at = fid.qid();
            for name in wnames {
                if !at.is_dir() {
                    break;
                }
                match node_by_name(name) {
                    Some(qid) => {
                        wqids.push(qid);
                        at = qid;
                    }
                    None => break,
                }
            }
            Ok(FCall::RWalk { wqids })
        }

        async fn ropen(&self, fid: &Fid<()>, _mode: u8) -> Result<FCall> {
            Ok(FCall::ROpen {
                qid: fid.qid(),
                iounit: 0,
            })
        }

        async fn rread(&self, fid: &Fid<()>, offset: u64, count: u32) -> Result<FCall> {
            self.counts.read.fetch_add(1, Ordering::SeqCst);
            if fid.qid() == SLOW {
                std::future::pending::<()>().await;
            }
            let start = (offset as usize).min(CONTENT.len());
            let end = (start + count as usize).min(CONTENT.len());
            Ok(FCall::RRead {
                data: Data(CONTENT[start..end].to_vec()),
            })
        }

        async fn rwrite(&self, _fid: &Fid<()>, _offset: u64, data: &Data) -> Result<FCall> {
            Ok(FCall::RWrite {
                count: data.0.len() as u32,
            })
        }

        async fn rstat(&self, fid: &Fid<()>) -> Result<FCall> {
            let mut stat = Stat::sentinel();
            stat.qid = fid.qid();
            stat.name = "hello".to_owned();
            Ok(FCall::RStat { stat })
        }

        async fn rremove(&self, _fid: &Fid<()>) -> Result<FCall> {
            Err(Error::msg("remove forbidden"))
        }

        async fn rflush(&self, _old: Option<&FCall>) -> Result<FCall> {
            self.counts.flush.fetch_add(1, Ordering::SeqCst);
            Ok(FCall::RFlush)
        }

        async fn rfreefid(&self, _fid: &Fid<()>) {
            self.counts.freefid.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestWriter = FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>;
    type TestReader = FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>;

    fn start(fs: TestFs) -> (TestWriter, TestReader, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(serve_connection(fs, server));
        let (rhalf, whalf) = tokio::io::split(client);
        (
            transport::frame_write(whalf),
            transport::frame_read(rhalf),
            handle,
        )
    }

    async fn call(tx: &mut TestWriter, rx: &mut TestReader, msg: Msg) -> Msg {
        let tag = msg.tag;
        transport::send_msg(tx, &msg).await.unwrap();
        let reply = transport::recv_msg(rx).await.unwrap().unwrap();
        assert_eq!(reply.tag, tag);
        reply
    }

    fn t(tag: u16, body: FCall) -> Msg {
        Msg { tag, body }
    }

    async fn session(tx: &mut TestWriter, rx: &mut TestReader) {
        let reply = call(
            tx,
            rx,
            t(
                NOTAG,
                FCall::TVersion {
                    msize: 8192,
                    version: P92000.to_owned(),
                },
            ),
        )
        .await;
        assert_eq!(
            reply.body,
            FCall::RVersion {
                msize: 8192,
                version: P92000.to_owned()
            }
        );

        let reply = call(
            tx,
            rx,
            t(
                1,
                FCall::TAttach {
                    fid: 0,
                    afid: NOFID,
                    uname: "u".to_owned(),
                    aname: String::new(),
                },
            ),
        )
        .await;
        assert_eq!(reply.body, FCall::RAttach { qid: ROOT });
    }

    fn ename(reply: &Msg) -> &str {
        match &reply.body {
            FCall::RError { ename } => ename,
            other => panic!("expected RError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn lifecycle() {
        let fs = TestFs::default();
        let counts = fs.counts.clone();
        let (mut tx, mut rx, _h) = start(fs);

        session(&mut tx, &mut rx).await;
        assert_eq!(counts.attach.load(Ordering::SeqCst), 1);

        let reply = call(
            &mut tx,
            &mut rx,
            t(
                2,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["hello".to_owned()],
                },
            ),
        )
        .await;
        assert_eq!(reply.body, FCall::RWalk { wqids: vec![HELLO] });

        let reply = call(&mut tx, &mut rx, t(3, FCall::TOpen { fid: 1, mode: om::READ })).await;
        assert_eq!(
            reply.body,
            FCall::ROpen {
                qid: HELLO,
                iounit: 8192 - IOHDRSZ,
            }
        );

        for i in 0..3u16 {
            let reply = call(
                &mut tx,
                &mut rx,
                t(
                    4 + i,
                    FCall::TRead {
                        fid: 1,
                        offset: 0,
                        count: 100,
                    },
                ),
            )
            .await;
            assert_eq!(
                reply.body,
                FCall::RRead {
                    data: Data(CONTENT.to_vec())
                }
            );
        }
        assert_eq!(counts.read.load(Ordering::SeqCst), 3);

        let reply = call(&mut tx, &mut rx, t(7, FCall::TClunk { fid: 1 })).await;
        assert_eq!(reply.body, FCall::RClunk);
        assert_eq!(counts.freefid.load(Ordering::SeqCst), 1);

        // the fid is gone from clunk onwards
        let reply = call(&mut tx, &mut rx, t(8, FCall::TOpen { fid: 1, mode: om::READ })).await;
        assert_eq!(ename(&reply), ENOFID);
    }

    #[tokio::test]
    async fn version_negotiation() {
        let (mut tx, mut rx, _h) = start(TestFs::default());

        let reply = call(
            &mut tx,
            &mut rx,
            t(
                NOTAG,
                FCall::TVersion {
                    msize: 1_000_000,
                    version: "9P2029".to_owned(),
                },
            ),
        )
        .await;
        assert_eq!(
            reply.body,
            FCall::RVersion {
                msize: MAX_MSG,
                version: VERSION_UNKNOWN.to_owned()
            }
        );

        let reply = call(
            &mut tx,
            &mut rx,
            t(
                NOTAG,
                FCall::TVersion {
                    msize: 8192,
                    version: P9.to_owned(),
                },
            ),
        )
        .await;
        assert_eq!(
            reply.body,
            FCall::RVersion {
                msize: 8192,
                version: P9.to_owned()
            }
        );
    }

    #[tokio::test]
    async fn preconditions() {
        let fs = TestFs::default();
        let counts = fs.counts.clone();
        let (mut tx, mut rx, _h) = start(fs);
        session(&mut tx, &mut rx).await;

        // reattaching an existing fid never reaches the handler
        let reply = call(
            &mut tx,
            &mut rx,
            t(
                2,
                FCall::TAttach {
                    fid: 0,
                    afid: NOFID,
                    uname: "u".to_owned(),
                    aname: String::new(),
                },
            ),
        )
        .await;
        assert_eq!(ename(&reply), EDUPFID);
        assert_eq!(counts.attach.load(Ordering::SeqCst), 1);

        // a directory opens only for read
        let reply = call(&mut tx, &mut rx, t(3, FCall::TOpen { fid: 0, mode: om::WRITE })).await;
        assert_eq!(ename(&reply), EISDIR);

        // reading an unopened fid
        call(
            &mut tx,
            &mut rx,
            t(
                4,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["hello".to_owned()],
                },
            ),
        )
        .await;
        let reply = call(
            &mut tx,
            &mut rx,
            t(
                5,
                FCall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 100,
                },
            ),
        )
        .await;
        assert_eq!(ename(&reply), ENOREAD);

        // writing a fid opened for read
        call(&mut tx, &mut rx, t(6, FCall::TOpen { fid: 1, mode: om::READ })).await;
        let reply = call(
            &mut tx,
            &mut rx,
            t(
                7,
                FCall::TWrite {
                    fid: 1,
                    offset: 0,
                    data: Data(b"x".to_vec()),
                },
            ),
        )
        .await;
        assert_eq!(ename(&reply), ENOWRITE);

        // walking from an open fid
        let reply = call(
            &mut tx,
            &mut rx,
            t(
                8,
                FCall::TWalk {
                    fid: 1,
                    newfid: 2,
                    wnames: vec![],
                },
            ),
        )
        .await;
        assert_eq!(ename(&reply), EWALKOPEN);

        // flushing a tag that is not outstanding
        let reply = call(&mut tx, &mut rx, t(9, FCall::TFlush { oldtag: 999 })).await;
        assert_eq!(ename(&reply), ENOTAG);

        // wstat of a sentinel-protected field
        let mut stat = Stat::sentinel();
        stat.typ = 5;
        let reply = call(&mut tx, &mut rx, t(10, FCall::TWStat { fid: 0, stat })).await;
        assert_eq!(ename(&reply), "wstat of type");

        // unsupported message type
        let reply = call(&mut tx, &mut rx, t(11, FCall::RFlush)).await;
        assert_eq!(ename(&reply), ENOFUNC);
    }

    #[tokio::test]
    async fn walk_failures() {
        let (mut tx, mut rx, _h) = start(TestFs::default());
        session(&mut tx, &mut rx).await;

        // no qids at all: "file does not exist" and no newfid
        let reply = call(
            &mut tx,
            &mut rx,
            t(
                2,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["x".to_owned()],
                },
            ),
        )
        .await;
        assert_eq!(ename(&reply), ENOFILE);
        let reply = call(&mut tx, &mut rx, t(3, FCall::TOpen { fid: 1, mode: om::READ })).await;
        assert_eq!(ename(&reply), ENOFID);

        // partial walk: the partial RWalk is returned but newfid still dies
        let reply = call(
            &mut tx,
            &mut rx,
            t(
                4,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["hello".to_owned(), "sub".to_owned()],
                },
            ),
        )
        .await;
        assert_eq!(reply.body, FCall::RWalk { wqids: vec![HELLO] });
        let reply = call(&mut tx, &mut rx, t(5, FCall::TOpen { fid: 1, mode: om::READ })).await;
        assert_eq!(ename(&reply), ENOFID);

        // zero-name walk clones the origin, qid included
        let reply = call(
            &mut tx,
            &mut rx,
            t(
                6,
                FCall::TWalk {
                    fid: 0,
                    newfid: 4,
                    wnames: vec![],
                },
            ),
        )
        .await;
        assert_eq!(reply.body, FCall::RWalk { wqids: vec![] });
        let reply = call(&mut tx, &mut rx, t(7, FCall::TOpen { fid: 4, mode: om::WRITE })).await;
        assert_eq!(ename(&reply), EISDIR);
    }

    #[tokio::test]
    async fn remove_destroys_fid_even_on_error() {
        let fs = TestFs::default();
        let counts = fs.counts.clone();
        let (mut tx, mut rx, _h) = start(fs);
        session(&mut tx, &mut rx).await;

        call(
            &mut tx,
            &mut rx,
            t(
                2,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["hello".to_owned()],
                },
            ),
        )
        .await;

        let reply = call(&mut tx, &mut rx, t(3, FCall::TRemove { fid: 1 })).await;
        assert_eq!(ename(&reply), "remove forbidden");
        assert_eq!(counts.freefid.load(Ordering::SeqCst), 1);

        let reply = call(&mut tx, &mut rx, t(4, FCall::TStat { fid: 1 })).await;
        assert_eq!(ename(&reply), ENOFID);
    }

    #[tokio::test]
    async fn flush_interrupts_stalled_request() {
        let fs = TestFs::default();
        let counts = fs.counts.clone();
        let (mut tx, mut rx, _h) = start(fs);
        session(&mut tx, &mut rx).await;

        call(
            &mut tx,
            &mut rx,
            t(
                2,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["slow".to_owned()],
                },
            ),
        )
        .await;
        call(&mut tx, &mut rx, t(3, FCall::TOpen { fid: 1, mode: om::READ })).await;

        // this read never completes on its own
        transport::send_msg(
            &mut tx,
            &t(
                5,
                FCall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 10,
                },
            ),
        )
        .await
        .unwrap();

        // wait for it to be in flight, then flush it
        while counts.read.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        transport::send_msg(&mut tx, &t(6, FCall::TFlush { oldtag: 5 }))
            .await
            .unwrap();

        // the interrupted original comes back first, then the flush
        let first = transport::recv_msg(&mut rx).await.unwrap().unwrap();
        assert_eq!(first.tag, 5);
        assert_eq!(ename(&first), EINTR);
        let second = transport::recv_msg(&mut rx).await.unwrap().unwrap();
        assert_eq!(second.tag, 6);
        assert_eq!(second.body, FCall::RFlush);
        assert_eq!(counts.flush.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_tag_rejected_while_in_flight() {
        let fs = TestFs::default();
        let counts = fs.counts.clone();
        let (mut tx, mut rx, _h) = start(fs);
        session(&mut tx, &mut rx).await;

        call(
            &mut tx,
            &mut rx,
            t(
                2,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["slow".to_owned()],
                },
            ),
        )
        .await;
        call(&mut tx, &mut rx, t(3, FCall::TOpen { fid: 1, mode: om::READ })).await;

        transport::send_msg(
            &mut tx,
            &t(
                5,
                FCall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 10,
                },
            ),
        )
        .await
        .unwrap();
        while counts.read.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        let reply = call(&mut tx, &mut rx, t(5, FCall::TStat { fid: 0 })).await;
        assert_eq!(ename(&reply), EDUPTAG);
    }

    #[tokio::test]
    async fn hangup_cleanup_synthesizes_flushes_and_clunks() {
        let fs = TestFs::default();
        let counts = fs.counts.clone();
        let (mut tx, mut rx, handle) = start(fs);
        session(&mut tx, &mut rx).await;

        // three live fids: 0 (root), 1 (hello), 2 (slow, open)
        call(
            &mut tx,
            &mut rx,
            t(
                2,
                FCall::TWalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["hello".to_owned()],
                },
            ),
        )
        .await;
        call(
            &mut tx,
            &mut rx,
            t(
                3,
                FCall::TWalk {
                    fid: 0,
                    newfid: 2,
                    wnames: vec!["slow".to_owned()],
                },
            ),
        )
        .await;
        call(&mut tx, &mut rx, t(4, FCall::TOpen { fid: 2, mode: om::READ })).await;

        // two reads that will still be outstanding at hangup
        for tag in [10, 11] {
            transport::send_msg(
                &mut tx,
                &t(
                    tag,
                    FCall::TRead {
                        fid: 2,
                        offset: 0,
                        count: 10,
                    },
                ),
            )
            .await
            .unwrap();
        }
        while counts.read.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        drop(tx);
        drop(rx);
        handle.await.unwrap().unwrap();

        assert_eq!(counts.flush.load(Ordering::SeqCst), 2);
        assert_eq!(counts.freefid.load(Ordering::SeqCst), 3);
    }
}
