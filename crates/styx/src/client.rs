//! Client side 9P library: the tag multiplexer and file handles.
//!
//! # Protocol
//! 9P2000
//!
//! Any number of tasks may issue requests over one connection. There is no
//! dedicated reader task: every outstanding request sits on a sleep queue,
//! and exactly one of them at a time is elected *muxer*, reading the socket
//! and handing each reply to its waiter by tag. When the muxer receives its
//! own reply it passes the seat to another sleeper, or clears it so the next
//! caller takes over. Lost wake-ups here would deadlock the client, so the
//! seat only changes hands inside the same critical section that inspects it.

use {
    crate::{
        error::{string::*, Error},
        fcall::*,
        sync::{Mutex, Rendez},
        transport::{self, BoxedConn},
        utils::Result,
    },
    log::error,
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex as StdMutex,
        },
    },
    tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    tokio_util::codec::{length_delimited::LengthDelimitedCodec, FramedRead, FramedWrite},
};

/// Options for [`Client::connect`].
#[derive(Clone, Debug)]
pub struct ClientOpts {
    /// Message size proposed at version negotiation.
    pub msize: u32,
    /// First tag handed out by the allocator.
    pub mintag: u16,
    /// One past the largest tag; `maxtag − mintag` bounds the number of
    /// outstanding requests.
    pub maxtag: u16,
}

impl Default for ClientOpts {
    fn default() -> ClientOpts {
        ClientOpts {
            msize: MAX_MSG,
            mintag: 0,
            maxtag: 256,
        }
    }
}

/// One outstanding request.
struct Rpc {
    tag: u16,
    reply: StdMutex<Option<FCall>>,
    rendez: Rendez,
}

impl Rpc {
    fn new(tag: u16) -> Rpc {
        Rpc {
            tag,
            reply: StdMutex::new(None),
            rendez: Rendez::new(),
        }
    }

    fn has_reply(&self) -> bool {
        self.reply.lock().unwrap().is_some()
    }

    fn put_reply(&self, body: FCall) {
        *self.reply.lock().unwrap() = Some(body);
    }

    fn take_reply(&self) -> Option<FCall> {
        self.reply.lock().unwrap().take()
    }
}

struct MuxState {
    /// Dense tag table; index + mintag is the tag.
    wait: Vec<Option<Arc<Rpc>>>,
    nwait: usize,
    /// Hint: index freed most recently.
    freetag: usize,
    /// Tags of outstanding rpcs, oldest first; the muxer is elected from
    /// here.
    sleep: VecDeque<u16>,
    /// The tag currently holding the read side, if any.
    muxer: Option<u16>,
}

struct Mux {
    state: StdMutex<MuxState>,
    /// Where senders wait out tag exhaustion.
    tagrend: Rendez,
    reader: Mutex<FramedRead<ReadHalf<BoxedConn>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedConn>, LengthDelimitedCodec>>,
    mintag: u16,
    maxtag: u16,
}

enum Role {
    Done,
    Muxer,
    Sleep,
}

impl Mux {
    /// Allocate a tag and enqueue a fresh rpc under it. Grows the table by
    /// doubling up to the tag window, then blocks until a tag is freed.
    async fn gettag(&self) -> Result<Arc<Rpc>> {
        loop {
            {
                let mut st = self.state.lock().unwrap();
                let limit = (self.maxtag - self.mintag) as usize;
                if st.nwait == st.wait.len() && st.wait.len() < limit {
                    let grown = if st.wait.is_empty() {
                        1
                    } else {
                        (st.wait.len() * 2).min(limit)
                    };
                    st.freetag = st.wait.len();
                    st.wait.resize(grown, None);
                }
                if st.nwait < st.wait.len() {
                    // probe the hint, scan forward, then wrap to the start
                    let mwait = st.wait.len();
                    let hint = st.freetag.min(mwait - 1);
                    let mut found = None;
                    for i in (hint..mwait).chain(0..hint) {
                        if st.wait[i].is_none() {
                            found = Some(i);
                            break;
                        }
                    }
                    let i = found.ok_or_else(|| Error::msg("no free tag in a non-full table"))?;
                    let rpc = Arc::new(Rpc::new(self.mintag + i as u16));
                    st.wait[i] = Some(rpc.clone());
                    st.nwait += 1;
                    st.sleep.push_back(rpc.tag);
                    return Ok(rpc);
                }
            }
            self.tagrend.sleep().await;
        }
    }

    fn puttag(&self, st: &mut MuxState, rpc: &Rpc) {
        let i = (rpc.tag - self.mintag) as usize;
        st.wait[i] = None;
        st.nwait -= 1;
        st.freetag = i;
        self.tagrend.wake();
    }

    fn dequeue(st: &mut MuxState, tag: u16) {
        if let Some(pos) = st.sleep.iter().position(|t| *t == tag) {
            st.sleep.remove(pos);
        }
    }

    /// Assign the tag and put the request on the wire. On a send failure the
    /// rpc is unwound as if it never existed.
    async fn sendrpc(&self, body: FCall) -> Result<Arc<Rpc>> {
        let rpc = self.gettag().await?;
        let msg = Msg {
            tag: rpc.tag,
            body,
        };

        let sent = {
            let mut writer = self.writer.lock().await;
            transport::send_msg(&mut writer, &msg).await
        };
        if let Err(e) = sent {
            let mut st = self.state.lock().unwrap();
            Self::dequeue(&mut st, rpc.tag);
            self.puttag(&mut st, &rpc);
            return Err(e);
        }
        Ok(rpc)
    }

    /// Hand an incoming reply to the rpc sleeping on its tag.
    fn dispatch(&self, msg: Msg) {
        let mut st = self.state.lock().unwrap();
        let idx = msg.tag.wrapping_sub(self.mintag) as usize;
        if msg.tag < self.mintag || idx >= st.wait.len() {
            error!(
                "received unfeasible tag: {} (min: {}, max: {})",
                msg.tag,
                self.mintag,
                self.mintag as usize + st.wait.len()
            );
            return;
        }
        let rpc = match &st.wait[idx] {
            Some(rpc) if st.sleep.contains(&rpc.tag) => rpc.clone(),
            _ => {
                error!("received message with bad tag {}", msg.tag);
                return;
            }
        };
        rpc.put_reply(msg.body);
        Self::dequeue(&mut st, rpc.tag);
        rpc.rendez.wake();
    }

    /// Pass the muxer seat to a remaining sleeper, or clear it.
    fn electmuxer(&self, st: &mut MuxState) {
        for &tag in &st.sleep {
            let i = (tag - self.mintag) as usize;
            if let Some(rpc) = &st.wait[i] {
                st.muxer = Some(tag);
                rpc.rendez.wake();
                return;
            }
        }
        st.muxer = None;
    }

    /// Send one request and wait for its reply, muxing the socket on behalf
    /// of every other caller when elected to.
    async fn muxrpc(&self, body: FCall) -> Result<FCall> {
        let rpc = self.sendrpc(body).await?;

        loop {
            let role = {
                let mut st = self.state.lock().unwrap();
                if rpc.has_reply() {
                    Role::Done
                } else if st.muxer.is_none() || st.muxer == Some(rpc.tag) {
                    st.muxer = Some(rpc.tag);
                    Role::Muxer
                } else {
                    Role::Sleep
                }
            };
            match role {
                Role::Done => break,
                Role::Sleep => rpc.rendez.sleep().await,
                Role::Muxer => {
                    while !rpc.has_reply() {
                        let frame = {
                            let mut reader = self.reader.lock().await;
                            transport::recv_msg(&mut reader).await
                        };
                        match frame {
                            Ok(Some(msg)) => self.dispatch(msg),
                            Ok(None) | Err(_) => {
                                // eof: just give up and pass the buck
                                let mut st = self.state.lock().unwrap();
                                Self::dequeue(&mut st, rpc.tag);
                                break;
                            }
                        }
                    }
                    let mut st = self.state.lock().unwrap();
                    self.electmuxer(&mut st);
                    break;
                }
            }
        }

        let reply = rpc.take_reply();
        {
            let mut st = self.state.lock().unwrap();
            self.puttag(&mut st, &rpc);
        }
        reply.ok_or_else(|| Error::msg(EEOF))
    }
}

struct ClientInner {
    mux: Mux,
    msize: u32,
    nextfid: AtomicU32,
}

impl ClientInner {
    fn alloc_fid(&self) -> u32 {
        let mut fid = self.nextfid.fetch_add(1, Ordering::Relaxed);
        while fid == NOFID {
            fid = self.nextfid.fetch_add(1, Ordering::Relaxed);
        }
        fid
    }

    /// One request/reply exchange; `RError` and reply-type mismatches come
    /// back as errors.
    async fn transact(&self, body: FCall) -> Result<FCall> {
        let want = MsgType::from(&body) as u8 + 1;
        let reply = self.mux.muxrpc(body).await?;
        match reply {
            FCall::RError { ename } => Err(Error::Msg(ename)),
            reply if MsgType::from(&reply) as u8 == want => Ok(reply),
            reply => Err(Error::msg(format!(
                "unexpected reply type {:?}",
                MsgType::from(&reply)
            ))),
        }
    }
}

/// A mounted 9P connection.
///
/// All methods take `&self`; a `Client` can be shared behind an `Arc` and
/// used from many tasks at once.
pub struct Client {
    inner: Arc<ClientInner>,
    root: u32,
    root_qid: QId,
}

impl Client {
    /// Dial `addr`, negotiate the protocol and attach to the served tree.
    pub async fn mount(addr: &str, uname: &str, aname: &str) -> Result<Client> {
        let stream = transport::dial(addr).await?;
        Client::connect(stream, uname, aname, ClientOpts::default()).await
    }

    /// Like [`Client::mount`], over an already-established stream.
    pub async fn connect<S>(stream: S, uname: &str, aname: &str, opts: ClientOpts) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if opts.maxtag <= opts.mintag {
            return Err(Error::msg("empty tag window"));
        }

        let stream: BoxedConn = Box::new(stream);
        let (rhalf, whalf) = tokio::io::split(stream);
        let mut reader = transport::frame_read(rhalf);
        let mut writer = transport::frame_write(whalf);

        // version negotiation travels alone, under the reserved tag, before
        // any multiplexing starts
        let proposed = opts.msize.min(MAX_MSG);
        let tversion = Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: proposed,
                version: P92000.to_owned(),
            },
        };
        transport::send_msg(&mut writer, &tversion).await?;
        let reply = transport::recv_msg(&mut reader)
            .await?
            .ok_or_else(|| Error::msg(EEOF))?;
        let msize = match reply.body {
            FCall::RVersion { msize, ref version } if version.as_str() == P92000 => {
                msize.min(proposed)
            }
            FCall::RVersion { ref version, .. } => {
                return Err(Error::msg(format!(
                    "server speaks unsupported version '{}'",
                    version
                )))
            }
            FCall::RError { ename } => return Err(Error::Msg(ename)),
            ref other => {
                return Err(Error::msg(format!(
                    "unexpected version reply {:?}",
                    MsgType::from(other)
                )))
            }
        };
        reader.decoder_mut().set_max_frame_length(msize as usize);
        writer.encoder_mut().set_max_frame_length(msize as usize);

        let inner = Arc::new(ClientInner {
            mux: Mux {
                state: StdMutex::new(MuxState {
                    wait: Vec::new(),
                    nwait: 0,
                    freetag: 0,
                    sleep: VecDeque::new(),
                    muxer: None,
                }),
                tagrend: Rendez::new(),
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                mintag: opts.mintag,
                maxtag: opts.maxtag,
            },
            msize,
            nextfid: AtomicU32::new(0),
        });

        let root = inner.alloc_fid();
        let reply = inner
            .transact(FCall::TAttach {
                fid: root,
                afid: NOFID,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?;
        let root_qid = match reply {
            FCall::RAttach { qid } => qid,
            _ => return Err(Error::msg("mismatched attach reply")),
        };

        Ok(Client {
            inner,
            root,
            root_qid,
        })
    }

    /// The message size negotiated with the server.
    pub fn msize(&self) -> u32 {
        self.inner.msize
    }

    pub fn root_qid(&self) -> QId {
        self.root_qid
    }

    /// Walk from the root to `path` (slash-separated, empty for the root
    /// itself), returning a fresh unopened fid.
    pub async fn walk(&self, path: &str) -> Result<Cfid> {
        let names: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        let newfid = self.inner.alloc_fid();

        let mut qid = self.root_qid;
        let mut from = self.root;
        let mut chunks = names.chunks(MAXWELEM);
        // the root clone is a zero-element walk
        let first: &[String] = chunks.next().unwrap_or(&[]);
        let mut pending = Some(first);
        while let Some(chunk) = pending.take() {
            match self.walk_chunk(from, newfid, chunk).await {
                Ok(Some(last_qid)) => qid = last_qid,
                Ok(None) => {}
                Err(e) => {
                    if from != self.root {
                        // the fid survived the earlier chunks; don't leak it
                        let _ = self.inner.transact(FCall::TClunk { fid: newfid }).await;
                    }
                    return Err(e);
                }
            }
            from = newfid;
            pending = chunks.next();
        }

        Ok(Cfid {
            inner: self.inner.clone(),
            fid: newfid,
            qid,
            mode: -1,
            iounit: 0,
            offset: 0,
        })
    }

    async fn walk_chunk(&self, from: u32, newfid: u32, chunk: &[String]) -> Result<Option<QId>> {
        let reply = self
            .inner
            .transact(FCall::TWalk {
                fid: from,
                newfid,
                wnames: chunk.to_vec(),
            })
            .await?;
        match reply {
            FCall::RWalk { wqids } => {
                if wqids.len() < chunk.len() {
                    return Err(Error::msg(ENOFILE));
                }
                Ok(wqids.last().copied())
            }
            _ => Err(Error::msg("mismatched walk reply")),
        }
    }

    /// Walk to `path` and open it.
    pub async fn open(&self, path: &str, mode: u8) -> Result<Cfid> {
        let mut fid = self.walk(path).await?;
        match fid.open(mode).await {
            Ok(()) => Ok(fid),
            Err(e) => {
                let _ = fid.clunk().await;
                Err(e)
            }
        }
    }

    /// Create (and open) `path` in its parent directory.
    pub async fn create(&self, path: &str, perm: u32, mode: u8) -> Result<Cfid> {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };
        if name.is_empty() {
            return Err(Error::msg("create needs a file name"));
        }
        let mut fid = self.walk(dir).await?;
        match fid.create(name, perm, mode).await {
            Ok(()) => Ok(fid),
            Err(e) => {
                let _ = fid.clunk().await;
                Err(e)
            }
        }
    }

    pub async fn stat(&self, path: &str) -> Result<Stat> {
        let fid = self.walk(path).await?;
        let stat = fid.stat().await;
        let _ = fid.clunk().await;
        stat
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let fid = self.walk(path).await?;
        fid.remove().await
    }

    /// Clunk the root fid; the connection closes when the client is dropped.
    pub async fn unmount(self) -> Result<()> {
        self.inner
            .transact(FCall::TClunk { fid: self.root })
            .await?;
        Ok(())
    }
}

/// A client-side file handle.
///
/// Dropping a `Cfid` without [`Cfid::clunk`] leaks the fid on the server
/// until the connection goes away.
pub struct Cfid {
    inner: Arc<ClientInner>,
    fid: u32,
    qid: QId,
    mode: i8,
    iounit: u32,
    offset: u64,
}

impl Cfid {
    pub fn qid(&self) -> QId {
        self.qid
    }

    pub fn iounit(&self) -> u32 {
        self.iounit
    }

    /// Largest read or write payload worth sending on this fid.
    fn iosize(&self) -> u32 {
        let msize = self.inner.msize - IOHDRSZ;
        if self.iounit != 0 {
            self.iounit.min(msize)
        } else {
            msize
        }
    }

    pub async fn open(&mut self, mode: u8) -> Result<()> {
        if self.mode != -1 {
            return Err(Error::msg(EOPEN));
        }
        match self
            .inner
            .transact(FCall::TOpen {
                fid: self.fid,
                mode,
            })
            .await?
        {
            FCall::ROpen { qid, iounit } => {
                self.qid = qid;
                self.iounit = iounit;
                self.mode = mode as i8;
                Ok(())
            }
            _ => Err(Error::msg("mismatched open reply")),
        }
    }

    /// Create `name` in the directory this fid names; on success the fid
    /// represents the new file, open with `mode`.
    pub async fn create(&mut self, name: &str, perm: u32, mode: u8) -> Result<()> {
        if self.mode != -1 {
            return Err(Error::msg(EOPEN));
        }
        match self
            .inner
            .transact(FCall::TCreate {
                fid: self.fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await?
        {
            FCall::RCreate { qid, iounit } => {
                self.qid = qid;
                self.iounit = iounit;
                self.mode = mode as i8;
                Ok(())
            }
            _ => Err(Error::msg("mismatched create reply")),
        }
    }

    /// Read up to `count` bytes at `offset`, splitting at the iounit and
    /// stopping at end of file.
    pub async fn pread(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut offset = offset;
        let mut left = count;
        while left > 0 {
            let ask = left.min(self.iosize());
            let reply = self
                .inner
                .transact(FCall::TRead {
                    fid: self.fid,
                    offset,
                    count: ask,
                })
                .await?;
            let data = match reply {
                FCall::RRead { data } => data.0,
                _ => return Err(Error::msg("mismatched read reply")),
            };
            if data.is_empty() {
                break;
            }
            let got = data.len() as u32;
            offset += got as u64;
            left = left.saturating_sub(got);
            out.extend_from_slice(&data);
            if got < ask {
                break;
            }
        }
        Ok(out)
    }

    /// Read at the fid's own offset, advancing it.
    pub async fn read(&mut self, count: u32) -> Result<Vec<u8>> {
        let data = self.pread(self.offset, count).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    /// Write `data` at `offset`, splitting at the iounit. Returns the number
    /// of bytes the server accepted.
    pub async fn pwrite(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let chunk = ((data.len() - written) as u32).min(self.iosize()) as usize;
            let reply = self
                .inner
                .transact(FCall::TWrite {
                    fid: self.fid,
                    offset: offset + written as u64,
                    data: Data(data[written..written + chunk].to_vec()),
                })
                .await?;
            let count = match reply {
                FCall::RWrite { count } => count as usize,
                _ => return Err(Error::msg("mismatched write reply")),
            };
            if count == 0 {
                break;
            }
            written += count;
        }
        Ok(written)
    }

    /// Write at the fid's own offset, advancing it.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.pwrite(self.offset, data).await?;
        self.offset += n as u64;
        Ok(n)
    }

    pub async fn stat(&self) -> Result<Stat> {
        match self.inner.transact(FCall::TStat { fid: self.fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(Error::msg("mismatched stat reply")),
        }
    }

    pub async fn wstat(&self, stat: Stat) -> Result<()> {
        self.inner
            .transact(FCall::TWStat {
                fid: self.fid,
                stat,
            })
            .await?;
        Ok(())
    }

    /// Remove the file and release the fid. Following 9P, the fid is gone
    /// even if the removal fails.
    pub async fn remove(self) -> Result<()> {
        self.inner
            .transact(FCall::TRemove { fid: self.fid })
            .await?;
        Ok(())
    }

    /// Release the fid without touching the file.
    pub async fn clunk(self) -> Result<()> {
        self.inner.transact(FCall::TClunk { fid: self.fid }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srv::{serve_connection, Fid, Filesystem};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const ROOT: QId = QId {
        typ: QIdType::DIR,
        version: 0,
        path: 1,
    };

    fn file_qid(name: &str) -> QId {
        let path = name.bytes().fold(7u64, |h, b| h.wrapping_mul(31) + b as u64);
        QId {
            typ: QIdType::FILE,
            version: 0,
            path,
        }
    }

    fn file_content(name: &str) -> Vec<u8> {
        name.repeat(8).into_bytes()
    }

    /// Every name exists; a file's content is its name, repeated. Reads
    /// yield briefly so concurrent callers interleave, and a gauge records
    /// how many reads ever ran at once.
    #[derive(Clone, Default)]
    struct EchoFs {
        reads: Arc<Gauge>,
    }

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        total: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Filesystem for EchoFs {
        type Aux = StdMutex<String>;

        async fn rattach(
            &self,
            _fid: &Fid<Self::Aux>,
            _afid: Option<&Fid<Self::Aux>>,
            _uname: &str,
            _aname: &str,
        ) -> Result<FCall> {
            Ok(FCall::RAttach { qid: ROOT })
        }

        async fn rwalk(
            &self,
            _fid: &Fid<Self::Aux>,
            newfid: &Fid<Self::Aux>,
            wnames: &[String],
        ) -> Result<FCall> {
            let wqids: Vec<QId> = wnames.iter().map(|n| file_qid(n)).collect();
            if let Some(last) = wnames.last() {
                *newfid.aux.lock().unwrap() = last.clone();
            }
            Ok(FCall::RWalk { wqids })
        }

        async fn ropen(&self, fid: &Fid<Self::Aux>, _mode: u8) -> Result<FCall> {
            Ok(FCall::ROpen {
                qid: fid.qid(),
                iounit: 0,
            })
        }

        async fn rread(&self, fid: &Fid<Self::Aux>, offset: u64, count: u32) -> Result<FCall> {
            self.reads.enter();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let content = file_content(&fid.aux.lock().unwrap().clone());
            self.reads.exit();

            let start = (offset as usize).min(content.len());
            let end = (start + count as usize).min(content.len());
            Ok(FCall::RRead {
                data: Data(content[start..end].to_vec()),
            })
        }

        async fn rwrite(&self, _fid: &Fid<Self::Aux>, _offset: u64, data: &Data) -> Result<FCall> {
            Ok(FCall::RWrite {
                count: data.0.len() as u32,
            })
        }

        async fn rstat(&self, fid: &Fid<Self::Aux>) -> Result<FCall> {
            let name = fid.aux.lock().unwrap().clone();
            let mut stat = Stat::sentinel();
            stat.qid = fid.qid();
            stat.length = file_content(&name).len() as u64;
            stat.name = name;
            Ok(FCall::RStat { stat })
        }
    }

    /// Reads never complete; used to pile up sleepers before an EOF.
    #[derive(Clone, Default)]
    struct StallFs {
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Filesystem for StallFs {
        type Aux = ();

        async fn rattach(
            &self,
            _fid: &Fid<()>,
            _afid: Option<&Fid<()>>,
            _uname: &str,
            _aname: &str,
        ) -> Result<FCall> {
            Ok(FCall::RAttach { qid: ROOT })
        }

        async fn rwalk(&self, _fid: &Fid<()>, _new: &Fid<()>, wnames: &[String]) -> Result<FCall> {
            Ok(FCall::RWalk {
                wqids: wnames.iter().map(|n| file_qid(n)).collect(),
            })
        }

        async fn ropen(&self, fid: &Fid<()>, _mode: u8) -> Result<FCall> {
            Ok(FCall::ROpen {
                qid: fid.qid(),
                iounit: 0,
            })
        }

        async fn rread(&self, _fid: &Fid<()>, _offset: u64, _count: u32) -> Result<FCall> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    async fn connect_pair<Fs: Filesystem + Clone>(
        fs: Fs,
        opts: ClientOpts,
    ) -> (Client, tokio::task::JoinHandle<Result<()>>) {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(serve_connection(fs, server_io));
        let client = Client::connect(client_io, "test", "", opts)
            .await
            .expect("connect");
        (client, handle)
    }

    #[tokio::test]
    async fn mount_open_read_stat() {
        let (client, _srv) = connect_pair(EchoFs::default(), ClientOpts::default()).await;
        assert_eq!(client.root_qid(), ROOT);

        let mut fid = client.open("/motd", om::READ).await.unwrap();
        assert_eq!(fid.qid(), file_qid("motd"));
        let data = fid.read(1 << 16).await.unwrap();
        assert_eq!(data, file_content("motd"));

        let stat = fid.stat().await.unwrap();
        assert_eq!(stat.name, "motd");
        assert_eq!(stat.length, data.len() as u64);

        fid.clunk().await.unwrap();
        client.unmount().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_each_get_their_own_reply() {
        let (client, _srv) = connect_pair(EchoFs::default(), ClientOpts::default()).await;
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("file{}", i);
                let fid = client.open(&format!("/{}", name), om::READ).await?;
                let data = fid.pread(0, 1 << 16).await?;
                assert_eq!(data, file_content(&name));
                fid.clunk().await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tag_window_of_one_serializes_requests() {
        let fs = EchoFs::default();
        let gauge = fs.reads.clone();
        let opts = ClientOpts {
            mintag: 0,
            maxtag: 1,
            ..ClientOpts::default()
        };
        let (client, _srv) = connect_pair(fs, opts).await;

        let fid = Arc::new(client.open("/solo", om::READ).await.unwrap());
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let fid = fid.clone();
            tasks.push(tokio::spawn(async move { fid.pread(0, 8).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(gauge.total.load(Ordering::SeqCst) >= 4);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn eof_unwinds_every_sleeping_caller() {
        let fs = StallFs::default();
        let reads = fs.reads.clone();
        let (client, srv_handle) = connect_pair(fs, ClientOpts::default()).await;
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for i in 0..3 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let fid = client.open(&format!("/f{}", i), om::READ).await?;
                fid.pread(0, 8).await
            }));
        }

        // wait until all three reads are parked in the server
        while reads.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // killing the server closes the stream under the muxer
        srv_handle.abort();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), EEOF);
        }
    }
}
