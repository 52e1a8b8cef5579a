//! Fixed-capacity byte ring buffer.
//!
//! Backs non-blocking pipe redirections. `capacity` must be a positive
//! multiple of the page size. In blocking mode the caller refuses to
//! read into a full buffer (enforced by the event loop, not here); in
//! cyclic mode a full buffer is still admitted and oldest bytes are
//! overwritten.

use std::os::fd::RawFd;

use crate::error::{AgentError, Result};

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name is always safe to call.
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        4096
    } else {
        ret as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Blocking,
    Cyclic,
}

/// A contiguous byte store of `capacity` bytes addressed by a
/// head/tail pair that counts monotonically and wraps only on index
/// into `buf`. `tail - head` (as a difference of the monotonic
/// counters) is always `data_size`.
pub struct CyclicBuffer {
    buf: Vec<u8>,
    capacity: usize,
    head: usize,
    tail: usize,
    mode: Mode,
    /// Total bytes ever read in, used by tests to assert the
    /// contiguous-suffix invariant.
    total_read: u64,
}

impl CyclicBuffer {
    pub fn init(capacity: usize, mode: Mode) -> Result<Self> {
        let page = page_size();
        if capacity == 0 || capacity % page != 0 {
            return Err(AgentError::InvalidArgument);
        }
        Ok(CyclicBuffer {
            buf: vec![0u8; capacity],
            capacity,
            head: 0,
            tail: 0,
            mode,
            total_read: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn data_size(&self) -> usize {
        self.tail - self.head
    }

    pub fn free_size(&self) -> usize {
        self.capacity - self.data_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data_size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.data_size() == self.capacity
    }

    pub fn is_cyclic(&self) -> bool {
        self.mode == Mode::Cyclic
    }

    fn idx(&self, pos: usize) -> usize {
        pos % self.capacity
    }

    /// Append up to `n` bytes read non-blockingly from `fd`.
    ///
    /// Returns `Ok(Some(count))` with `count == 0` meaning EOF,
    /// `Ok(None)` meaning "would block, try again later", and `Err`
    /// for any other failure. In cyclic mode, when the buffer is full
    /// the read is still admitted and oldest bytes are discarded; in
    /// blocking mode the caller must not invoke this when
    /// [`Self::is_full`] (see the event loop in `agent.rs`).
    pub fn read_from_fd(&mut self, fd: RawFd, n: usize) -> Result<Option<usize>> {
        let avail = match self.mode {
            Mode::Blocking => self.free_size().min(n),
            Mode::Cyclic => n.min(self.capacity),
        };
        if avail == 0 {
            return Ok(Some(0 /* nothing requested, treat as no-op read */));
        }
        let mut tmp = vec![0u8; avail];
        let ret = unsafe {
            libc::read(fd, tmp.as_mut_ptr() as *mut libc::c_void, tmp.len())
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(AgentError::Io(errno));
        }
        let got = ret as usize;
        if got == 0 {
            return Ok(Some(0));
        }
        for &b in &tmp[..got] {
            if self.mode == Mode::Cyclic && self.data_size() == self.capacity {
                // overwrite oldest byte
                self.head += 1;
            }
            let i = self.idx(self.tail);
            self.buf[i] = b;
            self.tail += 1;
        }
        self.total_read += got as u64;
        Ok(Some(got))
    }

    /// Consume up to `n` bytes and return them (the caller frames them
    /// as a length-prefixed payload for the command channel).
    pub fn drain(&mut self, n: usize) -> Vec<u8> {
        let take = n.min(self.data_size());
        let mut out = Vec::with_capacity(take);
        for i in 0..take {
            out.push(self.buf[self.idx(self.head + i)]);
        }
        self.head += take;
        out
    }

    #[cfg(test)]
    pub fn total_read(&self) -> u64 {
        self.total_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn page() -> usize {
        page_size()
    }

    #[test]
    fn rejects_non_page_multiple() {
        assert!(CyclicBuffer::init(1, Mode::Blocking).is_err());
        assert!(CyclicBuffer::init(0, Mode::Blocking).is_err());
        assert!(CyclicBuffer::init(page() + 1, Mode::Blocking).is_err());
    }

    #[test]
    fn accepts_one_page() {
        assert!(CyclicBuffer::init(page(), Mode::Blocking).is_ok());
    }

    fn make_pipe() -> (std::fs::File, std::fs::File) {
        let (r, w) = rustix::pipe::pipe_with(
            rustix::pipe::PipeFlags::NONBLOCK | rustix::pipe::PipeFlags::CLOEXEC,
        )
        .unwrap();
        (r.into(), w.into())
    }

    #[test]
    fn blocking_mode_tracks_size_invariant() {
        let (r, mut w) = make_pipe();
        let mut cb = CyclicBuffer::init(page(), Mode::Blocking).unwrap();
        w.write_all(b"hello").unwrap();
        let got = cb.read_from_fd(r.as_raw_fd(), page()).unwrap().unwrap();
        assert_eq!(got, 5);
        assert_eq!(cb.data_size() + cb.free_size(), cb.capacity());
        assert_eq!(cb.data_size(), 5);
        let out = cb.drain(3);
        assert_eq!(out, b"hel");
        assert_eq!(cb.data_size(), 2);
        assert_eq!(cb.data_size() + cb.free_size(), cb.capacity());
    }

    #[test]
    fn would_block_returns_none() {
        let (r, _w) = make_pipe();
        let mut cb = CyclicBuffer::init(page(), Mode::Blocking).unwrap();
        let ret = cb.read_from_fd(r.as_raw_fd(), page()).unwrap();
        assert_eq!(ret, None);
    }

    #[test]
    fn cyclic_overwrites_oldest_on_full() {
        let (r, mut w) = make_pipe();
        let cap = page();
        let mut cb = CyclicBuffer::init(cap, Mode::Cyclic).unwrap();
        // write 2x capacity in page-size chunks through the pipe
        let chunk = vec![0xABu8; cap];
        w.write_all(&chunk).unwrap();
        cb.read_from_fd(r.as_raw_fd(), cap).unwrap();
        assert!(cb.is_full());

        let mut last_chunk = vec![0xCDu8; cap];
        last_chunk[cap - 1] = 0xEF;
        w.write_all(&last_chunk).unwrap();
        let mut remaining = cap;
        while remaining > 0 {
            match cb.read_from_fd(r.as_raw_fd(), remaining) {
                Ok(Some(0)) | Ok(None) => break,
                Ok(Some(n)) => remaining -= n,
                Err(_) => break,
            }
        }
        assert_eq!(cb.data_size(), cap);
        let drained = cb.drain(cap);
        assert_eq!(drained, last_chunk);
    }

    #[test]
    fn is_cyclic_reports_mode() {
        let blocking = CyclicBuffer::init(page(), Mode::Blocking).unwrap();
        let cyclic = CyclicBuffer::init(page(), Mode::Cyclic).unwrap();
        assert!(!blocking.is_cyclic());
        assert!(cyclic.is_cyclic());
    }
}
