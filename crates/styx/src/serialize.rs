//! Serialize/deserialize 9P messages into/from binary.
//!
//! Each message variant's wire layout is written down exactly once, in the
//! `fcall_wire!` table at the bottom; the macro expands the table into both
//! the encoding and the decoding side of the `Msg` traversal. The four-byte
//! total-size prefix of a framed message is applied by the transport layer,
//! so the byte streams handled here begin at the type byte.

use crate::{fcall::*, io_err};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;

/// Hard ceiling on any count field, independent of the negotiated msize.
/// The protocol caps whole messages at 2^24 bytes.
const MAX_COUNT: u32 = 1 << 24;

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return Err(io_err!(InvalidInput, "string too long"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "invalid UTF-8 sequence"))
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = self.typ.bits().encode(w)?;
        bytes += self.version.encode(w)?;
        bytes += self.path.encode(w)?;
        Ok(bytes)
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: QIdType::from_bits_retain(Decodable::decode(r)?),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = self.size().encode(w)?;
        bytes += self.typ.encode(w)?;
        bytes += self.dev.encode(w)?;
        bytes += self.qid.encode(w)?;
        bytes += self.mode.encode(w)?;
        bytes += self.atime.encode(w)?;
        bytes += self.mtime.encode(w)?;
        bytes += self.length.encode(w)?;
        bytes += self.name.encode(w)?;
        bytes += self.uid.encode(w)?;
        bytes += self.gid.encode(w)?;
        bytes += self.muid.encode(w)?;
        Ok(bytes)
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        if len > MAX_COUNT {
            return Err(io_err!(InvalidData, "data count exceeds protocol limit"));
        }
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        for elem in self {
            bytes += elem.encode(w)?;
        }
        Ok(bytes)
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Encode a value behind a u16 byte-count prefix, as `RStat`/`TWStat` carry
/// their stat.
fn encode_counted<T: Encodable, W: WriteBytesExt>(val: &T, w: &mut W) -> Result<usize> {
    let mut buf = Vec::new();
    val.encode(&mut buf)?;
    if buf.len() > u16::MAX as usize {
        return Err(io_err!(InvalidInput, "counted payload too long"));
    }
    let bytes = (buf.len() as u16).encode(w)?;
    w.write_all(&buf)?;
    Ok(bytes + buf.len())
}

fn decode_counted<T: Decodable, R: ReadBytesExt>(r: &mut R) -> Result<T> {
    let len: u16 = Decodable::decode(r)?;
    let buf = read_exact(r, len as usize)?;
    let mut cur = Cursor::new(buf);
    let val = Decodable::decode(&mut cur)?;
    if cur.position() != len as u64 {
        return Err(io_err!(InvalidData, "counted payload length mismatch"));
    }
    Ok(val)
}

macro_rules! enc_field {
    (@ $ct:ident $f:ident, $w:ident) => {
        encode_counted($f, $w)?
    };
    ($f:ident, $w:ident) => {
        $f.encode($w)?
    };
}

macro_rules! dec_field {
    (@ $ct:ident $r:ident) => {
        decode_counted($r)?
    };
    ($r:ident) => {
        Decodable::decode($r)?
    };
}

/// One entry per message variant, fields in wire order; `@counted` marks a
/// field wrapped in an extra u16 byte-count. Expands to both directions of
/// the `Msg` traversal: type[1] tag[2] fields.
macro_rules! fcall_wire {
    (
        empty { $($EV:ident),* $(,)? }
        body { $($BV:ident { $( $(@$ct:ident)? $f:ident ),* $(,)? }),* $(,)? }
    ) => {
        impl Encodable for Msg {
            fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
                let typ = MsgType::from(&self.body);
                let mut bytes = (typ as u8).encode(w)?;
                bytes += self.tag.encode(w)?;
                match self.body {
                    $(
                        FCall::$BV { $( ref $f ),* } => {
                            $( bytes += enc_field!($(@ $ct)? $f, w); )*
                        }
                    )*
                    $( FCall::$EV => {} )*
                }
                Ok(bytes)
            }
        }

        impl Decodable for Msg {
            fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
                let typ = MsgType::from_u8(Decodable::decode(r)?)
                    .ok_or_else(|| io_err!(InvalidData, "invalid message type"))?;
                let tag = Decodable::decode(r)?;
                let body = match typ {
                    $(
                        MsgType::$BV => FCall::$BV {
                            $( $f: dec_field!($(@ $ct)? r), )*
                        },
                    )*
                    $( MsgType::$EV => FCall::$EV, )*
                };
                Ok(Msg { tag, body })
            }
        }
    };
}

fcall_wire! {
    empty { RFlush, RClunk, RRemove, RWStat }
    body {
        TVersion { msize, version },
        RVersion { msize, version },
        TAuth { afid, uname, aname },
        RAuth { aqid },
        TAttach { fid, afid, uname, aname },
        RAttach { qid },
        RError { ename },
        TFlush { oldtag },
        TWalk { fid, newfid, wnames },
        RWalk { wqids },
        TOpen { fid, mode },
        ROpen { qid, iounit },
        TCreate { fid, name, perm, mode },
        RCreate { qid, iounit },
        TRead { fid, offset, count },
        RRead { data },
        TWrite { fid, offset, data },
        RWrite { count },
        TClunk { fid },
        TRemove { fid },
        TStat { fid },
        RStat { @counted stat },
        TWStat { fid, @counted stat },
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (i as u8).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    while let Ok(i) = u8::decode(&mut decoder) {
        actual.push(i);
    }
    assert_eq!(expected, actual);
}

#[cfg(test)]
fn sample_stat() -> Stat {
    Stat {
        typ: 1,
        dev: 2,
        qid: QId {
            typ: QIdType::DIR,
            version: 3,
            path: 4,
        },
        mode: dm::DIR | 0o755,
        atime: 5,
        mtime: 6,
        length: 0,
        name: "etc".to_owned(),
        uid: "glenda".to_owned(),
        gid: "sys".to_owned(),
        muid: "glenda".to_owned(),
    }
}

#[cfg(test)]
fn sample_msgs() -> Vec<Msg> {
    let qid = QId {
        typ: QIdType::FILE,
        version: 1,
        path: 42,
    };
    vec![
        Msg { tag: NOTAG, body: FCall::TVersion { msize: 8192, version: P92000.to_owned() } },
        Msg { tag: NOTAG, body: FCall::RVersion { msize: 8192, version: P92000.to_owned() } },
        Msg { tag: 1, body: FCall::TAuth { afid: 0, uname: "u".to_owned(), aname: String::new() } },
        Msg { tag: 1, body: FCall::RAuth { aqid: qid } },
        Msg { tag: 2, body: FCall::TAttach { fid: 0, afid: NOFID, uname: "u".to_owned(), aname: String::new() } },
        Msg { tag: 2, body: FCall::RAttach { qid } },
        Msg { tag: 3, body: FCall::RError { ename: "file does not exist".to_owned() } },
        Msg { tag: 4, body: FCall::TFlush { oldtag: 3 } },
        Msg { tag: 4, body: FCall::RFlush },
        Msg { tag: 5, body: FCall::TWalk { fid: 0, newfid: 1, wnames: vec!["usr".to_owned(), "glenda".to_owned()] } },
        Msg { tag: 5, body: FCall::RWalk { wqids: vec![qid, qid] } },
        Msg { tag: 6, body: FCall::TOpen { fid: 1, mode: om::RDWR } },
        Msg { tag: 6, body: FCall::ROpen { qid, iounit: 8168 } },
        Msg { tag: 7, body: FCall::TCreate { fid: 1, name: "tmp".to_owned(), perm: 0o644, mode: om::WRITE } },
        Msg { tag: 7, body: FCall::RCreate { qid, iounit: 0 } },
        Msg { tag: 8, body: FCall::TRead { fid: 1, offset: 512, count: 4096 } },
        Msg { tag: 8, body: FCall::RRead { data: Data(vec![0xde, 0xad, 0xbe, 0xef]) } },
        Msg { tag: 9, body: FCall::TWrite { fid: 1, offset: 0, data: Data(b"hello".to_vec()) } },
        Msg { tag: 9, body: FCall::RWrite { count: 5 } },
        Msg { tag: 10, body: FCall::TClunk { fid: 1 } },
        Msg { tag: 10, body: FCall::RClunk },
        Msg { tag: 11, body: FCall::TRemove { fid: 1 } },
        Msg { tag: 11, body: FCall::RRemove },
        Msg { tag: 12, body: FCall::TStat { fid: 1 } },
        Msg { tag: 12, body: FCall::RStat { stat: sample_stat() } },
        Msg { tag: 13, body: FCall::TWStat { fid: 1, stat: Stat::sentinel() } },
        Msg { tag: 13, body: FCall::RWStat },
    ]
}

#[test]
fn roundtrip_every_variant() {
    for expected in sample_msgs() {
        let mut buf = Vec::new();
        let written = expected.encode(&mut buf).unwrap();
        assert_eq!(written, buf.len(), "{:?}", expected);

        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(expected, actual);
        assert_eq!(readbuf.position() as usize, written);
    }
}

#[test]
fn truncated_input_fails() {
    for expected in sample_msgs() {
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();
        buf.pop();
        if buf.len() < 3 {
            continue; // nothing left to mis-parse
        }
        let mut readbuf = Cursor::new(buf);
        assert!(read_msg(&mut readbuf).is_err(), "{:?}", expected);
    }
}

#[test]
fn unknown_type_byte_fails() {
    // Terror = 106 is illegal on the wire
    let mut readbuf = Cursor::new(vec![106u8, 0, 0]);
    assert!(read_msg(&mut readbuf).is_err());
}

#[test]
fn stat_carries_double_count() {
    let stat = sample_stat();
    let msg = Msg {
        tag: 1,
        body: FCall::RStat { stat: stat.clone() },
    };
    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();

    // type[1] tag[2], then the outer count, then the stat's own size field
    let outer = u16::from_le_bytes([buf[3], buf[4]]);
    let inner = u16::from_le_bytes([buf[5], buf[6]]);
    assert_eq!(inner, stat.size());
    assert_eq!(outer, stat.size() + 2);
}

#[test]
fn oversized_data_count_fails() {
    let mut buf = Vec::new();
    // RRead header followed by an absurd count and no payload
    117u8.encode(&mut buf).unwrap();
    1u16.encode(&mut buf).unwrap();
    (MAX_COUNT + 1).encode(&mut buf).unwrap();
    let mut readbuf = Cursor::new(buf);
    assert!(read_msg(&mut readbuf).is_err());
}

#[test]
fn overlong_string_fails_encode() {
    let msg = Msg {
        tag: 0,
        body: FCall::RError {
            ename: "e".repeat(u16::MAX as usize + 1),
        },
    };
    let mut buf = Vec::new();
    assert!(msg.encode(&mut buf).is_err());
}
