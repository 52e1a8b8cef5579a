//! Spawning a supervised process.
//!
//! Built on `std::process::Command` rather than a hand-rolled
//! `fork`+status-pipe pair — see DESIGN.md for why that's the Rust
//! equivalent of the same fork/exec/errno-relay algorithm, not a
//! deviation from it.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use rustix::fs::{self, Mode, OFlags};

use crate::cyclic_buffer::{CyclicBuffer, Mode as BufMode};
use crate::error::{AgentError, Result};
use crate::registry::{ProcessDesc, Redirect};

/// Requested redirection for one child fd slot (0/1/2), as parsed out
/// of a `MSG_RUN_PROCESS` `RFD` sub-message.
pub enum RedirectRequest {
    File { path: Option<String> },
    Pipe { capacity: usize, cyclic: bool },
}

pub struct SpawnRequest {
    pub bin: String,
    pub argv: Vec<String>,
    pub envp: Option<Vec<String>>,
    pub uid: u32,
    pub gid: u32,
    pub cwd: Option<String>,
    pub is_entrypoint: bool,
    pub redirs: [RedirectRequest; 3],
}

fn output_dir(prefix: &Path, id: u64) -> PathBuf {
    prefix.join(id.to_string())
}

fn create_output_dir(prefix: &Path, id: u64) -> Result<PathBuf> {
    let dir = output_dir(prefix, id);
    fs::mkdir(&dir, Mode::from_bits_truncate(0o700)).map_err(|e| AgentError::Io(e.into()))?;
    Ok(dir)
}

/// Create `<dir>/<fd>` exclusively and open it read-write.
fn create_synthesized_output_file(dir: &Path, fd: usize) -> Result<PathBuf> {
    let path = dir.join(fd.to_string());
    let f = fs::open(
        &path,
        OFlags::RDWR | OFlags::CREATE | OFlags::EXCL,
        Mode::from_bits_truncate(0o700),
    )
    .map_err(|e| AgentError::Io(e.into()))?;
    drop(f);
    Ok(path)
}

fn open_stdin_file(path: &Path) -> Result<File> {
    File::open(path).map_err(AgentError::from)
}

fn open_stdout_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o700)
        .open(path)
        .map_err(AgentError::from)
}

/// Build the Stdio + bookkeeping for one fd slot. Returns the Stdio to
/// hand to `Command` plus the `Redirect` value that will live in the
/// registry (holding the parent side of a pipe, if any).
fn prepare_redirect(dir: &Path, fd: usize, req: RedirectRequest) -> Result<(Stdio, Redirect)> {
    match req {
        RedirectRequest::File { path } => {
            let path_buf = match path {
                Some(p) if !p.is_empty() => PathBuf::from(p),
                _ => create_synthesized_output_file(dir, fd)?,
            };
            let stdio = if fd == 0 {
                Stdio::from(open_stdin_file(&path_buf)?)
            } else {
                Stdio::from(open_stdout_file(&path_buf)?)
            };
            Ok((
                stdio,
                Redirect::File {
                    path: path_buf.to_string_lossy().into_owned(),
                },
            ))
        }
        RedirectRequest::Pipe { capacity, cyclic } => {
            let mode = if cyclic { BufMode::Cyclic } else { BufMode::Blocking };
            let buf = CyclicBuffer::init(capacity, mode)?;
            let (r, w) = rustix::pipe::pipe_with(
                rustix::pipe::PipeFlags::CLOEXEC | rustix::pipe::PipeFlags::NONBLOCK,
            )
            .map_err(|e| AgentError::Io(e.into()))?;
            // fd 0 (stdin): child reads, so child gets the read end and
            // the parent keeps the write end... but the agent only
            // ever *produces* output for fd 1/2, it never feeds stdin,
            // so the parent side of a pipe redirection is always the
            // end the event loop polls for readability: the read end
            // for fd 1/2, the write end for fd 0 (reserved slot, never
            // actually armed in epoll).
            let (child_side, parent_side) = if fd == 0 { (r, w) } else { (w, r) };
            let stdio = Stdio::from(child_side);
            Ok((
                stdio,
                Redirect::Pipe {
                    buf,
                    parent_fd: parent_side,
                    registered: false,
                },
            ))
        }
    }
}

/// Spawn one supervised process. On success, returns the fully
/// populated [`ProcessDesc`] (not yet inserted into the registry — the
/// caller does that after also registering the pipe ends with epoll).
pub fn spawn(
    output_prefix: &Path,
    next_id: u64,
    has_entrypoint: bool,
    req: SpawnRequest,
) -> Result<ProcessDesc> {
    if req.is_entrypoint && has_entrypoint {
        return Err(AgentError::AlreadyExists);
    }

    let dir = create_output_dir(output_prefix, next_id)?;

    let [r0, r1, r2] = req.redirs;
    let (stdin, redir0) = prepare_redirect(&dir, 0, r0)?;
    let (stdout, redir1) = prepare_redirect(&dir, 1, r1)?;
    let (stderr, redir2) = prepare_redirect(&dir, 2, r2)?;

    let mut cmd = Command::new(&req.bin);
    // execve's argv[0] is whatever the controller sent, not necessarily
    // `bin` itself: multi-call binaries (busybox et al.) dispatch on it.
    if let Some(arg0) = req.argv.first() {
        cmd.arg0(arg0);
    }
    if req.argv.len() > 1 {
        cmd.args(&req.argv[1..]);
    }
    if let Some(envp) = &req.envp {
        cmd.env_clear();
        for kv in envp {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }
    }
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(stdin).stdout(stdout).stderr(stderr);

    let uid = req.uid;
    let gid = req.gid;
    unsafe {
        cmd.pre_exec(move || {
            // Restore the default signal mask: a blocked signal in the
            // agent must not carry over to the child.
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            if libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut()) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setresgid(gid, gid, gid) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setresuid(uid, uid, uid) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child: Child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(AgentError::Io(e));
        }
    };

    let pid = child.id() as i32;
    // Reaped ourselves via the signal channel; std::process::Child
    // does not auto-wait on drop, so forgetting it here is not a
    // resource leak, just a handoff of reaping responsibility.
    std::mem::forget(child);

    Ok(ProcessDesc {
        id: next_id,
        pid,
        alive: true,
        is_entrypoint: req.is_entrypoint,
        redir: [redir0, redir1, redir2],
    })
}

/// Validate a requested pipe capacity: must be a positive multiple of
/// the page size.
pub fn validate_pipe_capacity(capacity: u64) -> Result<usize> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    if capacity == 0 || capacity % page != 0 {
        return Err(AgentError::InvalidArgument);
    }
    Ok(capacity as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn req_true(entrypoint: bool) -> SpawnRequest {
        SpawnRequest {
            bin: "/bin/true".to_string(),
            argv: vec!["true".to_string()],
            envp: None,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            cwd: None,
            is_entrypoint: entrypoint,
            redirs: [
                RedirectRequest::File { path: Some("/dev/null".to_string()) },
                RedirectRequest::File { path: None },
                RedirectRequest::File { path: None },
            ],
        }
    }

    #[test]
    fn spawn_creates_output_dir() {
        let dir = tempdir().unwrap();
        let desc = spawn(dir.path(), 1, false, req_true(false)).unwrap();
        assert_eq!(desc.id, 1);
        assert!(desc.pid > 0);
        assert!(dir.path().join("1").is_dir());
    }

    #[test]
    fn second_entrypoint_rejected() {
        let dir = tempdir().unwrap();
        let first = spawn(dir.path(), 1, false, req_true(true)).unwrap();
        assert!(first.is_entrypoint);
        let err = spawn(dir.path(), 2, true, req_true(true)).unwrap_err();
        assert!(matches!(err, AgentError::AlreadyExists));
    }

    #[test]
    fn bad_pipe_capacity_rejected() {
        assert!(validate_pipe_capacity(0).is_err());
        assert!(validate_pipe_capacity(1).is_err());
        assert!(validate_pipe_capacity(4096).is_ok());
    }

    #[test]
    fn nonexistent_binary_surfaces_as_error() {
        let dir = tempdir().unwrap();
        let mut req = req_true(false);
        req.bin = "/nonexistent/bin".to_string();
        let err = spawn(dir.path(), 1, false, req).unwrap_err();
        assert!(matches!(err, AgentError::Io(_)));
    }
}
