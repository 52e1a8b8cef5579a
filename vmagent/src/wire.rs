//! Byte-exact framing over the command channel.
//!
//! Every integer is little-endian. A byte-string is `u64 length` then
//! `length` bytes; a C-string byte-string additionally requires a
//! trailing NUL (and the NUL is not counted separately — callers strip
//! it). A string array is a sequence of byte-strings terminated by a
//! zero-length entry.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Read exactly `buf.len()` bytes, looping over short reads the way a
/// character device may deliver them.
pub fn readn<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<()> {
    r.read_exact(buf)
}

/// Write exactly `buf.len()` bytes, looping over short writes.
pub fn writen<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
    w.write_all(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    r.read_u8()
}

pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    r.read_u16::<LittleEndian>()
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<LittleEndian>()
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<LittleEndian>()
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_u8(v)
}

pub fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_u16::<LittleEndian>(v)
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<LittleEndian>(v)
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64::<LittleEndian>(v)
}

/// Cap on a single incoming byte-string; the controller is trusted but
/// a corrupt length field should not make us try to allocate
/// petabytes.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Read a `u64 length` + `length` bytes byte-string.
pub fn read_bytestring<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u64(r)?;
    if len > MAX_STRING_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "string too long"));
    }
    let mut buf = vec![0u8; len as usize];
    readn(r, &mut buf)?;
    Ok(buf)
}

/// Read a byte-string and validate it as a NUL-terminated C string,
/// returning the content without the trailing NUL.
pub fn read_cstring<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = read_bytestring(r)?;
    if buf.last() != Some(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing NUL terminator",
        ));
    }
    buf.pop();
    Ok(buf)
}

/// Read a C-string byte-string and require it to be valid UTF-8 (paths
/// and hostnames in this protocol are always UTF-8).
pub fn read_cstring_utf8<R: Read>(r: &mut R) -> io::Result<String> {
    let buf = read_cstring(r)?;
    String::from_utf8(buf).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "not utf8"))
}

pub fn write_bytestring<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    write_u64(w, data.len() as u64)?;
    writen(w, data)
}

pub fn write_cstring<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    write_bytestring(w, &buf)
}

/// Read a string array: a sequence of byte-strings terminated by a
/// zero-length entry. Each entry is itself validated as a C string.
pub fn read_cstring_array<R: Read>(r: &mut R) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    loop {
        let len = read_u64(r)?;
        if len == 0 {
            return Ok(out);
        }
        if len > MAX_STRING_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "string too long"));
        }
        let mut buf = vec![0u8; len as usize];
        readn(r, &mut buf)?;
        if buf.last() != Some(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing NUL terminator",
            ));
        }
        buf.pop();
        let s = String::from_utf8(buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "not utf8"))?;
        out.push(s);
    }
}

pub fn write_cstring_array<W: Write, S: AsRef<str>>(w: &mut W, items: &[S]) -> io::Result<()> {
    for item in items {
        write_cstring(w, item.as_ref())?;
    }
    write_u64(w, 0)
}

/// The fixed 9-byte header in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_id: u64,
    pub msg_type: u8,
}

impl MsgHeader {
    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let msg_id = read_u64(r)?;
        let msg_type = read_u8(r)?;
        Ok(MsgHeader { msg_id, msg_type })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u64(w, self.msg_id)?;
        write_u8(w, self.msg_type)
    }

    /// `msg_id` carried by every unsolicited notification.
    pub const NOTIFY_ID: u64 = 0;
}

/// Top-level request message types.
pub mod msg {
    pub const QUIT: u8 = 0;
    pub const RUN_PROCESS: u8 = 1;
    pub const KILL_PROCESS: u8 = 2;
    pub const MOUNT_VOLUME: u8 = 3;
    pub const QUERY_OUTPUT: u8 = 4;
    pub const NET_CTL: u8 = 5;
    pub const NET_HOST: u8 = 6;
    pub const UPLOAD_FILE: u8 = 7;
    pub const PUT_INPUT: u8 = 8;
    pub const SYNC_FS: u8 = 9;
}

/// Response message types.
pub mod resp {
    pub const OK: u8 = 0;
    pub const OK_U64: u8 = 1;
    pub const OK_BYTES: u8 = 2;
    pub const ERR: u8 = 3;
}

/// Unsolicited notification types (sent with `msg_id = 0`).
pub mod notify {
    pub const OUTPUT_AVAILABLE: u8 = 4;
    pub const PROCESS_DIED: u8 = 5;
}

/// `MSG_RUN_PROCESS` sub-message types.
pub mod sub_run_process {
    pub const END: u8 = 0;
    pub const BIN: u8 = 1;
    pub const ARG: u8 = 2;
    pub const ENV: u8 = 3;
    pub const UID: u8 = 4;
    pub const GID: u8 = 5;
    pub const RFD: u8 = 6;
    pub const CWD: u8 = 7;
    pub const ENT: u8 = 8;
}

/// Redirection-type tag carried by a `RFD` sub-message.
pub mod redir_type {
    pub const FILE: u8 = 0;
    pub const PIPE_BLOCKING: u8 = 1;
    pub const PIPE_CYCLIC: u8 = 2;
}

/// `MSG_KILL_PROCESS` sub-message types.
pub mod sub_kill_process {
    pub const END: u8 = 0;
    pub const ID: u8 = 1;
}

/// `MSG_MOUNT_VOLUME` sub-message types.
pub mod sub_mount_volume {
    pub const END: u8 = 0;
    pub const TAG: u8 = 1;
    pub const PATH: u8 = 2;
}

/// `MSG_QUERY_OUTPUT` sub-message types.
pub mod sub_query_output {
    pub const END: u8 = 0;
    pub const ID: u8 = 1;
    pub const FD: u8 = 2;
    pub const OFF: u8 = 3;
    pub const LEN: u8 = 4;
}

/// `MSG_NET_CTL` sub-message types.
pub mod sub_net_ctl {
    pub const END: u8 = 0;
    pub const FLAGS: u8 = 1;
    pub const ADDR: u8 = 2;
    pub const MASK: u8 = 3;
    pub const GATEWAY: u8 = 4;
    pub const IF_ADDR: u8 = 5;
    pub const IF: u8 = 6;
}

/// `MSG_NET_HOST` sub-message types.
pub mod sub_net_host {
    pub const END: u8 = 0;
    pub const ENTRY: u8 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_header() {
        let h = MsgHeader {
            msg_id: 0xdead_beef,
            msg_type: 7,
        };
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 9);
        let h2 = MsgHeader::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn roundtrip_bytestring() {
        let mut buf = Vec::new();
        write_bytestring(&mut buf, b"hello world").unwrap();
        let mut c = Cursor::new(buf);
        let out = read_bytestring(&mut c).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn roundtrip_cstring() {
        let mut buf = Vec::new();
        write_cstring(&mut buf, "/bin/echo").unwrap();
        let mut c = Cursor::new(buf);
        let out = read_cstring_utf8(&mut c).unwrap();
        assert_eq!(out, "/bin/echo");
    }

    #[test]
    fn cstring_requires_nul() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 3).unwrap();
        buf.extend_from_slice(b"abc"); // no trailing NUL
        let mut c = Cursor::new(buf);
        assert!(read_cstring(&mut c).is_err());
    }

    #[test]
    fn roundtrip_cstring_array() {
        let mut buf = Vec::new();
        write_cstring_array(&mut buf, &["echo", "hi"]).unwrap();
        let mut c = Cursor::new(buf);
        let out = read_cstring_array(&mut c).unwrap();
        assert_eq!(out, vec!["echo".to_string(), "hi".to_string()]);
    }

    #[test]
    fn empty_array_is_just_terminator() {
        let mut buf = Vec::new();
        write_cstring_array::<_, &str>(&mut buf, &[]).unwrap();
        assert_eq!(buf, 0u64.to_le_bytes());
    }
}
