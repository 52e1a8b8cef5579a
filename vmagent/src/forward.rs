//! Packet forwarder: a worker pair bridging a host character device
//! and a guest TAP.
//!
//! Each direction is an independent thread looping "read one frame,
//! write one frame" until told to stop or until it hits an
//! unrecoverable fd error. A shutdown channel (rather than a shared
//! `AtomicBool`) keeps the stop condition explicit — each worker owns
//! a `Receiver<()>` and treats any message, or the sender dropping, as
//! "stop".

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

/// Maximum frame size for prefixed framing; the two-byte LE length
/// field caps a single frame at u16::MAX bytes.
const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy)]
pub enum Framing {
    /// Two-byte little-endian length precedes the payload (needed on
    /// the host-character-device side, which does not preserve frame
    /// boundaries).
    Prefixed,
    /// Read up to `capacity` bytes in one call and forward exactly
    /// those bytes (the TAP preserves frame boundaries intrinsically).
    Raw,
}

fn is_would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn read_frame<R: Read>(src: &mut R, framing: Framing, capacity: usize) -> io::Result<Option<Vec<u8>>> {
    match framing {
        Framing::Prefixed => {
            let mut len_buf = [0u8; 2];
            if let Err(e) = src.read_exact(&mut len_buf) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    return Ok(None);
                }
                return Err(e);
            }
            let len = u16::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            src.read_exact(&mut payload)?;
            Ok(Some(payload))
        }
        Framing::Raw => {
            let mut buf = vec![0u8; capacity];
            let n = src.read(&mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some(buf))
        }
    }
}

fn write_frame<W: Write>(dst: &mut W, framing: Framing, payload: &[u8]) -> io::Result<()> {
    match framing {
        Framing::Prefixed => {
            if payload.len() > MAX_FRAME_LEN {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
            }
            let len = (payload.len() as u16).to_le_bytes();
            dst.write_all(&len)?;
            dst.write_all(payload)
        }
        Framing::Raw => dst.write_all(payload),
    }
}

/// One direction of a packet bridge: blocking reads on `src`, blocking
/// writes to `dst`. Supervisor-state-free: this never touches the
/// registry or any other agent state.
pub struct Forwarder {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Forwarder {
    pub fn spawn(
        name: &'static str,
        src: OwnedFd,
        dst: OwnedFd,
        capacity: usize,
        read_framing: Framing,
        write_framing: Framing,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("fwd-{name}"))
            .spawn(move || run(name, src, dst, capacity, read_framing, write_framing, stop_rx))
            .expect("spawn forwarder thread");
        Forwarder {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Request the worker to stop and block until it exits.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn should_stop(stop_rx: &Receiver<()>) -> bool {
    match stop_rx.try_recv() {
        Ok(()) => true,
        Err(mpsc::TryRecvError::Empty) => false,
        Err(mpsc::TryRecvError::Disconnected) => true,
    }
}

fn run(
    name: &'static str,
    src: OwnedFd,
    dst: OwnedFd,
    capacity: usize,
    read_framing: Framing,
    write_framing: Framing,
    stop_rx: Receiver<()>,
) {
    let mut src_file: std::fs::File = src.into();
    let mut dst_file: std::fs::File = dst.into();
    debug!("forwarder {name} starting (src fd {}, dst fd {})", src_file.as_raw_fd(), dst_file.as_raw_fd());
    loop {
        if should_stop(&stop_rx) {
            break;
        }
        match read_frame(&mut src_file, read_framing, capacity) {
            Ok(Some(payload)) => {
                if let Err(e) = write_frame(&mut dst_file, write_framing, &payload) {
                    if !is_would_block(&e) {
                        warn!("forwarder {name} write error: {e}");
                        break;
                    }
                }
            }
            Ok(None) => {
                debug!("forwarder {name} saw EOF");
                break;
            }
            Err(e) => {
                if is_would_block(&e) {
                    continue;
                }
                warn!("forwarder {name} read error: {e}");
                break;
            }
        }
    }
    debug!("forwarder {name} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn prefixed_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Framing::Prefixed, b"hello").unwrap();
        assert_eq!(buf, [5, 0, b'h', b'e', b'l', b'l', b'o']);
        let mut c = Cursor::new(buf);
        let out = read_frame(&mut c, Framing::Prefixed, 0).unwrap().unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn raw_reads_whatever_is_available() {
        let data = b"abcdefgh".to_vec();
        let mut c = Cursor::new(data.clone());
        let out = read_frame(&mut c, Framing::Raw, 4).unwrap().unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn prefixed_eof_is_none() {
        let mut c = Cursor::new(Vec::<u8>::new());
        let out = read_frame(&mut c, Framing::Prefixed, 0).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn stop_joins_synchronously() {
        let (a_r, a_w) = rustix::pipe::pipe().unwrap();
        let (b_r, b_w) = rustix::pipe::pipe().unwrap();
        drop(a_w);
        drop(b_r);
        let fwd = Forwarder::spawn("test", a_r, b_w, 256, Framing::Raw, Framing::Raw);
        fwd.stop();
    }
}
