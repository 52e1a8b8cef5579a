//! Errno-like error type shared by every request handler.
//!
//! The wire protocol reports failures as a bare `u32` in `RESP_ERR`.
//! Internally we keep a small `thiserror` enum so call sites can match
//! on the failure kind, but every variant knows how to collapse itself
//! to the errno value that goes on the wire.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid argument")]
    InvalidArgument,
    /// No process with this id in the registry. `MSG_KILL_PROCESS` maps
    /// this to `EINVAL`; `MSG_QUERY_OUTPUT` maps it to `ESRCH` via
    /// [`AgentError::NoSuchProcessForQuery`] instead, since the two
    /// request types disagree on the errno.
    #[error("process {0} not found")]
    NoSuchProcess(u64),
    #[error("process {0} not found")]
    NoSuchProcessForQuery(u64),
    /// Target of `MSG_KILL_PROCESS` exists but has already exited.
    #[error("process {0} already exited")]
    ProcessNotAlive(u64),
    #[error("entrypoint already exists")]
    AlreadyExists,
    #[error("no data available")]
    NoData,
    #[error("unsupported request")]
    NotSupported,
    #[error("protocol violation")]
    ProtocolError,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AgentError {
    /// Errno-compatible code placed in `RESP_ERR`.
    pub fn to_errno(&self) -> u32 {
        match self {
            AgentError::InvalidArgument => libc::EINVAL as u32,
            AgentError::NoSuchProcess(_) => libc::EINVAL as u32,
            AgentError::NoSuchProcessForQuery(_) => libc::ESRCH as u32,
            AgentError::ProcessNotAlive(_) => libc::ESRCH as u32,
            AgentError::AlreadyExists => libc::EEXIST as u32,
            AgentError::NoData => libc::ENXIO as u32,
            AgentError::NotSupported => libc::EPROTONOSUPPORT as u32,
            AgentError::ProtocolError => libc::ENOPROTOOPT as u32,
            AgentError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO) as u32,
        }
    }

    /// True for the fatal regime: a protocol violation. Causes the
    /// caller to power the VM off after responding.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::ProtocolError)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
