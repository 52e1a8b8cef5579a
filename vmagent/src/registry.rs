//! Process registry: two lookup views (by agent id, by OS pid) over
//! the same set of process descriptors.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use crate::cyclic_buffer::CyclicBuffer;

/// How fd slot `fd_idx` of a process is materialised.
pub enum Redirect {
    /// Child's stream is an ordinary file; `path` is its location for
    /// reference (query-by-offset reads straight from the file).
    File { path: String },
    /// Child's stream is backed by a ring buffer and a pipe pair; the
    /// parent keeps the non-child side.
    Pipe {
        buf: CyclicBuffer,
        parent_fd: OwnedFd,
        /// Whether the read end is currently registered with epoll.
        /// Deregistered when the buffer fills; re-armed by
        /// `MSG_QUERY_OUTPUT`.
        registered: bool,
    },
    /// Slot not yet configured.
    Invalid,
}

impl Redirect {
    pub fn is_pipe(&self) -> bool {
        matches!(self, Redirect::Pipe { .. })
    }

    /// Whether this redirection is fully drained and can be torn down:
    /// a descriptor is freed only once `!alive && all_redir_buffers_empty`.
    pub fn is_empty(&self) -> bool {
        match self {
            Redirect::Pipe { buf, .. } => buf.is_empty(),
            Redirect::File { .. } | Redirect::Invalid => true,
        }
    }
}

/// One supervised process. `fd` index 0/1/2 maps to stdin/stdout/stderr.
pub struct ProcessDesc {
    pub id: u64,
    pub pid: i32,
    pub alive: bool,
    pub is_entrypoint: bool,
    pub redir: [Redirect; 3],
}

impl ProcessDesc {
    /// Destroyable once dead and every redirection has drained.
    pub fn destroyable(&self) -> bool {
        !self.alive && self.redir.iter().all(|r| r.is_empty())
    }
}

/// Two indexes, one set of owned descriptors. Descriptors live in a
/// slab keyed by agent id; the pid index stores the same id.
#[derive(Default)]
pub struct Registry {
    by_id: HashMap<u64, ProcessDesc>,
    pid_to_id: HashMap<i32, u64>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            by_id: HashMap::new(),
            pid_to_id: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate the next monotonically increasing id. 0 is reserved to
    /// mean "none" and is never handed out.
    pub fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, desc: ProcessDesc) {
        self.pid_to_id.insert(desc.pid, desc.id);
        self.by_id.insert(desc.id, desc);
    }

    pub fn get(&self, id: u64) -> Option<&ProcessDesc> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ProcessDesc> {
        self.by_id.get_mut(&id)
    }

    pub fn get_by_pid(&self, pid: i32) -> Option<&ProcessDesc> {
        self.pid_to_id.get(&pid).and_then(|id| self.by_id.get(id))
    }

    pub fn get_mut_by_pid(&mut self, pid: i32) -> Option<&mut ProcessDesc> {
        let id = *self.pid_to_id.get(&pid)?;
        self.by_id.get_mut(&id)
    }

    /// Removal is idempotent: removing an id twice (or one that was
    /// never present) is a no-op.
    pub fn remove(&mut self, id: u64) -> Option<ProcessDesc> {
        let desc = self.by_id.remove(&id)?;
        self.pid_to_id.remove(&desc.pid);
        Some(desc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessDesc> {
        self.by_id.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessDesc> {
        self.by_id.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_desc(id: u64, pid: i32) -> ProcessDesc {
        ProcessDesc {
            id,
            pid,
            alive: true,
            is_entrypoint: false,
            redir: [Redirect::Invalid, Redirect::Invalid, Redirect::Invalid],
        }
    }

    #[test]
    fn lookup_by_id_and_pid() {
        let mut reg = Registry::new();
        let id = reg.alloc_id();
        reg.insert(stub_desc(id, 4242));
        assert!(reg.get(id).is_some());
        assert!(reg.get_by_pid(4242).is_some());
        assert!(reg.get_by_pid(1).is_none());
    }

    #[test]
    fn ids_are_monotonic_and_skip_zero() {
        let mut reg = Registry::new();
        let a = reg.alloc_id();
        let b = reg.alloc_id();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = Registry::new();
        let id = reg.alloc_id();
        reg.insert(stub_desc(id, 10));
        assert!(reg.remove(id).is_some());
        assert!(reg.remove(id).is_none());
        assert!(reg.get_by_pid(10).is_none());
    }

    #[test]
    fn destroyable_requires_dead_and_drained() {
        let mut d = stub_desc(1, 10);
        assert!(!d.destroyable());
        d.alive = false;
        assert!(d.destroyable());
    }
}
