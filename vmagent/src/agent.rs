//! The dispatcher: owns the command channel, the signal channel, and
//! the epoll readiness loop that drives both plus every registered
//! child pipe.
//!
//! Raw `libc` calls cover epoll/signalfd/sigprocmask/reboot rather
//! than a higher-level wrapper crate — see DESIGN.md for why.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::forward::{Forwarder, Framing};
use crate::net;
use crate::registry::{ProcessDesc, Redirect, Registry};
use crate::supervisor::{self, RedirectRequest, SpawnRequest};
use crate::wire;

/// Unwrap an I/O result or treat it the way the original's `CHECK`
/// macro does: any failure on the command or signal channel is
/// unrecoverable, so log it and power off.
fn check<T>(r: io::Result<T>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => fatal(&format!("I/O error: {e}")),
    }
}

fn fatal(msg: &str) -> ! {
    log::error!("{msg}");
    power_off();
}

fn power_off() -> ! {
    unsafe {
        libc::sync();
        libc::reboot(libc::LINUX_REBOOT_CMD_POWER_OFF);
    }
    loop {
        unsafe {
            libc::pause();
        }
    }
}

fn epoll_add(epoll_fd: RawFd, fd: RawFd, events: u32) {
    let mut ev = libc::epoll_event { events, u64: fd as u64 };
    let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if ret < 0 {
        fatal(&format!("epoll_ctl(ADD) failed: {}", io::Error::last_os_error()));
    }
}

fn epoll_del(epoll_fd: RawFd, fd: RawFd) {
    let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    if ret < 0 {
        fatal(&format!("epoll_ctl(DEL) failed: {}", io::Error::last_os_error()));
    }
}

/// What an epoll-registered fd is for. The write-end-to-child slot
/// from the original design (`EPOLL_FD_OUT`) is intentionally absent:
/// it is reserved but never armed.
#[derive(Debug, Clone, Copy)]
enum EpollTag {
    Cmds,
    Sig,
    PipeIn { id: u64, fd_idx: usize },
}

fn mount_volume(tag: &str, path: &str) -> Result<()> {
    let src = CString::new(tag).map_err(|_| AgentError::InvalidArgument)?;
    let target = CString::new(path).map_err(|_| AgentError::InvalidArgument)?;
    let fstype = CString::new("virtiofs").map_err(|_| AgentError::InvalidArgument)?;
    let ret = unsafe {
        libc::mount(
            src.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            std::ptr::null(),
        )
    };
    if ret < 0 {
        return Err(AgentError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Blocks `SIGCHLD`/`SIGPIPE` on the calling thread and returns a
/// signalfd that delivers `SIGCHLD` as readable events.
fn setup_signal_channel() -> OwnedFd {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        libc::sigaddset(&mut set, libc::SIGPIPE);
        if libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) < 0 {
            fatal(&format!("sigprocmask failed: {}", io::Error::last_os_error()));
        }

        let mut chld_only: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut chld_only);
        libc::sigaddset(&mut chld_only, libc::SIGCHLD);
        let fd = libc::signalfd(-1, &chld_only, libc::SFD_CLOEXEC);
        if fd < 0 {
            fatal(&format!("signalfd failed: {}", io::Error::last_os_error()));
        }
        OwnedFd::from_raw_fd(fd)
    }
}

struct InterfaceLink {
    forwarders: [Forwarder; 2],
}

/// Process-wide singletons: the command channel, the readiness
/// multiplexer, the process registry, and the two optional packet
/// interfaces.
pub struct Agent {
    cmds: File,
    sig_fd: OwnedFd,
    epoll_fd: OwnedFd,
    epoll_tags: HashMap<RawFd, EpollTag>,
    registry: Registry,
    entrypoint_id: Option<u64>,
    output_prefix: PathBuf,
    vpn_if_name: String,
    inet_if_name: String,
    _vpn_link: Option<InterfaceLink>,
    _inet_link: Option<InterfaceLink>,
    shutting_down: bool,
}

impl Agent {
    pub fn new(cfg: Config) -> Result<Self> {
        let cmds = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&cfg.cmd_device)?;

        let sig_fd = setup_signal_channel();

        let epoll_fd = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(AgentError::Io(io::Error::last_os_error()));
            }
            OwnedFd::from_raw_fd(fd)
        };

        let mut epoll_tags = HashMap::new();
        epoll_add(epoll_fd.as_raw_fd(), cmds.as_raw_fd(), libc::EPOLLIN as u32);
        epoll_tags.insert(cmds.as_raw_fd(), EpollTag::Cmds);
        epoll_add(epoll_fd.as_raw_fd(), sig_fd.as_raw_fd(), libc::EPOLLIN as u32);
        epoll_tags.insert(sig_fd.as_raw_fd(), EpollTag::Sig);

        net::startup()?;

        let vpn_link = Self::bring_up_interface(
            &cfg.vpn_device,
            &cfg.vpn_if_name,
            net::MTU_VPN,
            4,
        )?;
        let inet_link = Self::bring_up_interface(
            &cfg.inet_device,
            &cfg.inet_if_name,
            net::MTU_INET,
            1,
        )?;

        Ok(Agent {
            cmds,
            sig_fd,
            epoll_fd,
            epoll_tags,
            registry: Registry::new(),
            entrypoint_id: None,
            output_prefix: cfg.output_prefix,
            vpn_if_name: cfg.vpn_if_name,
            inet_if_name: cfg.inet_if_name,
            _vpn_link: vpn_link,
            _inet_link: inet_link,
            shutting_down: false,
        })
    }

    fn bring_up_interface(
        device_path: &str,
        if_name: &str,
        mtu: u32,
        multiplier: u32,
    ) -> Result<Option<InterfaceLink>> {
        let char_dev = match net::open_char_device(device_path)? {
            Some(f) => f,
            None => return Ok(None),
        };
        let tap = net::create_tap(if_name)?;
        let capacity = net::forwarder_buffer_capacity(mtu, multiplier);

        let char_fd: OwnedFd = char_dev.into();
        let tap_fd: OwnedFd = tap.into();
        let tap_fd_dup: OwnedFd = tap_fd.try_clone().map_err(AgentError::from)?;
        let char_fd_dup: OwnedFd = char_fd.try_clone().map_err(AgentError::from)?;

        let host_to_tap = Forwarder::spawn(
            "host-to-tap",
            char_fd,
            tap_fd,
            capacity,
            Framing::Prefixed,
            Framing::Raw,
        );
        let tap_to_host = Forwarder::spawn(
            "tap-to-host",
            tap_fd_dup,
            char_fd_dup,
            capacity,
            Framing::Raw,
            Framing::Prefixed,
        );

        Ok(Some(InterfaceLink {
            forwarders: [host_to_tap, tap_to_host],
        }))
    }

    fn interface_name(&self, iface: net::Interface) -> String {
        match iface {
            net::Interface::Vpn => self.vpn_if_name.clone(),
            net::Interface::Inet => self.inet_if_name.clone(),
        }
    }

    pub fn run(mut self) -> ! {
        loop {
            self.wait_and_dispatch();
            if self.shutting_down {
                break;
            }
        }
        self.shutdown();
    }

    fn wait_and_dispatch(&mut self) {
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epoll_fd.as_raw_fd(), &mut event, 1, -1) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return;
            }
            fatal(&format!("epoll_wait failed: {e}"));
        }
        if n == 0 {
            return;
        }
        if event.events & (libc::EPOLLNVAL as u32) != 0 {
            fatal("epoll reported EPOLLNVAL");
        }

        let fd = event.u64 as RawFd;
        let tag = match self.epoll_tags.get(&fd) {
            Some(t) => *t,
            None => return,
        };
        match tag {
            EpollTag::Cmds => {
                if event.events & (libc::EPOLLIN as u32) != 0 {
                    self.handle_message();
                }
            }
            EpollTag::Sig => {
                if event.events & (libc::EPOLLIN as u32) != 0 {
                    self.handle_sigchld();
                }
            }
            EpollTag::PipeIn { id, fd_idx } => {
                if event.events & (libc::EPOLLIN as u32) != 0 {
                    self.handle_pipe_readable(id, fd_idx);
                } else if event.events & (libc::EPOLLHUP as u32) != 0 {
                    epoll_del(self.epoll_fd.as_raw_fd(), fd);
                    self.epoll_tags.remove(&fd);
                }
            }
        }
    }

    fn shutdown(self) -> ! {
        drop(self);
        power_off();
    }

    // --- response helpers -------------------------------------------------

    fn send_header(&mut self, msg_id: u64, msg_type: u8) {
        check(wire::MsgHeader { msg_id, msg_type }.write(&mut self.cmds));
    }

    fn send_ok(&mut self, msg_id: u64) {
        self.send_header(msg_id, wire::resp::OK);
    }

    fn send_ok_u64(&mut self, msg_id: u64, v: u64) {
        self.send_header(msg_id, wire::resp::OK_U64);
        check(wire::write_u64(&mut self.cmds, v));
    }

    fn send_ok_bytes(&mut self, msg_id: u64, data: &[u8]) {
        self.send_header(msg_id, wire::resp::OK_BYTES);
        check(wire::write_bytestring(&mut self.cmds, data));
    }

    fn send_err(&mut self, msg_id: u64, errno: u32) {
        self.send_header(msg_id, wire::resp::ERR);
        check(wire::write_u32(&mut self.cmds, errno));
    }

    fn send_notify_output_available(&mut self, id: u64, fd: u32) {
        self.send_header(wire::MsgHeader::NOTIFY_ID, wire::notify::OUTPUT_AVAILABLE);
        check(wire::write_u64(&mut self.cmds, id));
        check(wire::write_u32(&mut self.cmds, fd));
    }

    fn send_notify_process_died(&mut self, id: u64, status: u8, type_code: u8) {
        self.send_header(wire::MsgHeader::NOTIFY_ID, wire::notify::PROCESS_DIED);
        check(wire::write_u64(&mut self.cmds, id));
        check(wire::write_u8(&mut self.cmds, status));
        check(wire::write_u8(&mut self.cmds, type_code));
    }

    fn fatal_protocol(&mut self, msg_id: u64) -> ! {
        self.send_err(msg_id, libc::ENOPROTOOPT as u32);
        fatal("protocol violation")
    }

    // --- command-channel dispatch ------------------------------------------

    fn handle_message(&mut self) {
        let hdr = check(wire::MsgHeader::read(&mut self.cmds));
        match hdr.msg_type {
            wire::msg::QUIT => self.handle_quit(hdr.msg_id),
            wire::msg::RUN_PROCESS => self.handle_run_process(hdr.msg_id),
            wire::msg::KILL_PROCESS => self.handle_kill_process(hdr.msg_id),
            wire::msg::MOUNT_VOLUME => self.handle_mount_volume(hdr.msg_id),
            wire::msg::QUERY_OUTPUT => self.handle_query_output(hdr.msg_id),
            wire::msg::NET_CTL => self.handle_net_ctl(hdr.msg_id),
            wire::msg::NET_HOST => self.handle_net_host(hdr.msg_id),
            wire::msg::UPLOAD_FILE | wire::msg::PUT_INPUT | wire::msg::SYNC_FS => {
                self.send_err(hdr.msg_id, libc::EPROTONOSUPPORT as u32);
                fatal("unsupported request type");
            }
            _ => self.fatal_protocol(hdr.msg_id),
        }
    }

    fn handle_quit(&mut self, msg_id: u64) {
        self.send_ok(msg_id);
        self.shutting_down = true;
    }

    fn handle_run_process(&mut self, msg_id: u64) {
        let mut bin: Option<String> = None;
        let mut argv: Vec<String> = Vec::new();
        let mut envp: Option<Vec<String>> = None;
        let mut uid = 0u32;
        let mut gid = 0u32;
        let mut cwd: Option<String> = None;
        let mut is_entrypoint = false;
        let mut redirs = [
            RedirectRequest::File { path: None },
            RedirectRequest::File { path: None },
            RedirectRequest::File { path: None },
        ];
        let mut first_err: Option<AgentError> = None;

        loop {
            let subtype = check(wire::read_u8(&mut self.cmds));
            match subtype {
                wire::sub_run_process::END => break,
                wire::sub_run_process::BIN => {
                    bin = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                wire::sub_run_process::ARG => argv = check(wire::read_cstring_array(&mut self.cmds)),
                wire::sub_run_process::ENV => {
                    envp = Some(check(wire::read_cstring_array(&mut self.cmds)))
                }
                wire::sub_run_process::UID => uid = check(wire::read_u32(&mut self.cmds)),
                wire::sub_run_process::GID => gid = check(wire::read_u32(&mut self.cmds)),
                wire::sub_run_process::RFD => {
                    let fd_raw = check(wire::read_u32(&mut self.cmds));
                    let rtype = check(wire::read_u8(&mut self.cmds));
                    let req = match rtype {
                        wire::redir_type::FILE => {
                            let path = check(wire::read_cstring_utf8(&mut self.cmds));
                            Some(RedirectRequest::File {
                                path: if path.is_empty() { None } else { Some(path) },
                            })
                        }
                        wire::redir_type::PIPE_BLOCKING | wire::redir_type::PIPE_CYCLIC => {
                            let cap = check(wire::read_u64(&mut self.cmds));
                            Some(RedirectRequest::Pipe {
                                capacity: cap as usize,
                                cyclic: rtype == wire::redir_type::PIPE_CYCLIC,
                            })
                        }
                        _ => None,
                    };
                    match req {
                        None => self.fatal_protocol(msg_id),
                        Some(req) => {
                            let bad_capacity = matches!(
                                &req,
                                RedirectRequest::Pipe { capacity, .. }
                                    if supervisor::validate_pipe_capacity(*capacity as u64).is_err()
                            );
                            if fd_raw >= 3 || bad_capacity {
                                if first_err.is_none() {
                                    first_err = Some(AgentError::InvalidArgument);
                                }
                            } else {
                                redirs[fd_raw as usize] = req;
                            }
                        }
                    }
                }
                wire::sub_run_process::CWD => {
                    cwd = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                wire::sub_run_process::ENT => is_entrypoint = true,
                _ => self.fatal_protocol(msg_id),
            }
        }

        if let Some(e) = first_err {
            self.send_err(msg_id, e.to_errno());
            return;
        }
        let bin = match bin {
            Some(b) => b,
            None => {
                self.send_err(msg_id, libc::EINVAL as u32);
                return;
            }
        };
        if argv.is_empty() {
            self.send_err(msg_id, libc::EINVAL as u32);
            return;
        }

        let next_id = self.registry.alloc_id();
        let req = SpawnRequest {
            bin,
            argv,
            envp,
            uid,
            gid,
            cwd,
            is_entrypoint,
            redirs,
        };
        match supervisor::spawn(&self.output_prefix, next_id, self.entrypoint_id.is_some(), req) {
            Ok(mut desc) => {
                self.register_process_redirs(&mut desc);
                if desc.is_entrypoint {
                    self.entrypoint_id = Some(desc.id);
                }
                self.registry.insert(desc);
                self.send_ok_u64(msg_id, next_id);
            }
            Err(e) => self.send_err(msg_id, e.to_errno()),
        }
    }

    /// Arm epoll for the read ends of fd 1/2 pipe redirections. fd 0's
    /// write end is never armed (reserved `EPOLL_FD_OUT` slot).
    fn register_process_redirs(&mut self, desc: &mut ProcessDesc) {
        for fd_idx in 1..=2 {
            if let Redirect::Pipe {
                parent_fd,
                registered,
                ..
            } = &mut desc.redir[fd_idx]
            {
                let raw = parent_fd.as_raw_fd();
                epoll_add(self.epoll_fd.as_raw_fd(), raw, libc::EPOLLIN as u32);
                self.epoll_tags.insert(
                    raw,
                    EpollTag::PipeIn {
                        id: desc.id,
                        fd_idx,
                    },
                );
                *registered = true;
            }
        }
    }

    fn do_kill_process(&mut self, id: u64) -> Result<()> {
        let desc = self
            .registry
            .get(id)
            .ok_or(AgentError::NoSuchProcess(id))?;
        if !desc.alive {
            return Err(AgentError::ProcessNotAlive(id));
        }
        let pid = desc.pid;
        let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
        if ret < 0 {
            return Err(AgentError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn handle_kill_process(&mut self, msg_id: u64) {
        let mut id: u64 = 0;
        loop {
            let subtype = check(wire::read_u8(&mut self.cmds));
            match subtype {
                wire::sub_kill_process::END => break,
                wire::sub_kill_process::ID => id = check(wire::read_u64(&mut self.cmds)),
                _ => self.fatal_protocol(msg_id),
            }
        }
        match self.do_kill_process(id) {
            Ok(()) => self.send_ok(msg_id),
            Err(e) => self.send_err(msg_id, e.to_errno()),
        }
    }

    fn handle_mount_volume(&mut self, msg_id: u64) {
        let mut tag: Option<String> = None;
        let mut path: Option<String> = None;
        loop {
            let subtype = check(wire::read_u8(&mut self.cmds));
            match subtype {
                wire::sub_mount_volume::END => break,
                wire::sub_mount_volume::TAG => {
                    tag = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                wire::sub_mount_volume::PATH => {
                    path = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                _ => self.fatal_protocol(msg_id),
            }
        }
        let result = match (tag, path) {
            (Some(tag), Some(path)) => mount_volume(&tag, &path),
            _ => Err(AgentError::InvalidArgument),
        };
        match result {
            Ok(()) => self.send_ok(msg_id),
            Err(e) => self.send_err(msg_id, e.to_errno()),
        }
    }

    fn handle_query_output(&mut self, msg_id: u64) {
        let mut id = 0u64;
        let mut fd: u8 = 0;
        let mut off = 0u64;
        let mut len = 0u64;
        loop {
            let subtype = check(wire::read_u8(&mut self.cmds));
            match subtype {
                wire::sub_query_output::END => break,
                wire::sub_query_output::ID => id = check(wire::read_u64(&mut self.cmds)),
                wire::sub_query_output::FD => fd = check(wire::read_u8(&mut self.cmds)),
                wire::sub_query_output::OFF => off = check(wire::read_u64(&mut self.cmds)),
                wire::sub_query_output::LEN => len = check(wire::read_u64(&mut self.cmds)),
                _ => self.fatal_protocol(msg_id),
            }
        }

        if id == 0 || len == 0 || fd == 0 || fd > 2 {
            self.send_err(msg_id, libc::EINVAL as u32);
            return;
        }

        match self.do_query_output(id, fd as usize, off, len) {
            Ok(bytes) => self.send_ok_bytes(msg_id, &bytes),
            Err(e) => self.send_err(msg_id, e.to_errno()),
        }
    }

    fn do_query_output(&mut self, id: u64, fd_idx: usize, off: u64, len: u64) -> Result<Vec<u8>> {
        let epoll_fd = self.epoll_fd.as_raw_fd();
        let mut reregister: Option<(RawFd, u64, usize)> = None;
        let out = {
            let desc = self
                .registry
                .get_mut(id)
                .ok_or(AgentError::NoSuchProcessForQuery(id))?;
            match &mut desc.redir[fd_idx] {
                Redirect::File { path } => {
                    let mut f = File::open(path.as_str())?;
                    f.seek(io::SeekFrom::Start(off))?;
                    let mut buf = vec![0u8; len as usize];
                    let n = f.read(&mut buf)?;
                    if n == 0 {
                        return Err(AgentError::NoData);
                    }
                    buf.truncate(n);
                    buf
                }
                Redirect::Pipe {
                    buf,
                    parent_fd,
                    registered,
                } => {
                    if off != 0 {
                        return Err(AgentError::InvalidArgument);
                    }
                    let was_full = buf.is_full();
                    let data = buf.drain(len as usize);
                    if was_full && !*registered {
                        reregister = Some((parent_fd.as_raw_fd(), id, fd_idx));
                        *registered = true;
                    }
                    data
                }
                Redirect::Invalid => return Err(AgentError::InvalidArgument),
            }
        };
        if let Some((raw, id, fd_idx)) = reregister {
            epoll_add(epoll_fd, raw, libc::EPOLLIN as u32);
            self.epoll_tags.insert(raw, EpollTag::PipeIn { id, fd_idx });
        }
        let destroyable = self.registry.get(id).map(|d| d.destroyable()).unwrap_or(false);
        if destroyable {
            self.registry.remove(id);
        }
        Ok(out)
    }

    fn handle_net_ctl(&mut self, msg_id: u64) {
        let mut ctl = net::NetCtl::default();
        let mut iface = net::Interface::Vpn;
        loop {
            let subtype = check(wire::read_u8(&mut self.cmds));
            match subtype {
                wire::sub_net_ctl::END => break,
                wire::sub_net_ctl::FLAGS => ctl.flags = check(wire::read_u16(&mut self.cmds)),
                wire::sub_net_ctl::ADDR => {
                    ctl.addr = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                wire::sub_net_ctl::MASK => {
                    ctl.mask = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                wire::sub_net_ctl::GATEWAY => {
                    ctl.gateway = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                wire::sub_net_ctl::IF_ADDR => {
                    ctl.if_addr = Some(check(wire::read_cstring_utf8(&mut self.cmds)))
                }
                wire::sub_net_ctl::IF => {
                    iface = net::Interface::from_wire(check(wire::read_u16(&mut self.cmds)))
                }
                _ => self.fatal_protocol(msg_id),
            }
        }
        ctl.iface = Some(iface);
        let if_name = self.interface_name(iface);
        match net::apply_net_ctl(&if_name, &ctl) {
            Ok(()) => self.send_ok(msg_id),
            Err(e) => self.send_err(msg_id, e.to_errno()),
        }
    }

    fn handle_net_host(&mut self, msg_id: u64) {
        let mut entries: Vec<(String, String)> = Vec::new();
        loop {
            let subtype = check(wire::read_u8(&mut self.cmds));
            match subtype {
                wire::sub_net_host::END => break,
                wire::sub_net_host::ENTRY => {
                    let ip = check(wire::read_cstring_utf8(&mut self.cmds));
                    let hostname = check(wire::read_cstring_utf8(&mut self.cmds));
                    entries.push((ip, hostname));
                }
                _ => self.fatal_protocol(msg_id),
            }
        }
        match net::apply_net_host(&entries) {
            Ok(()) => self.send_ok(msg_id),
            Err(e) => self.send_err(msg_id, e.to_errno()),
        }
    }

    // --- signal-channel dispatch --------------------------------------------

    fn handle_sigchld(&mut self) {
        let mut siginfo: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        let raw = self.sig_fd.as_raw_fd();
        let n = unsafe {
            libc::read(
                raw,
                &mut siginfo as *mut _ as *mut libc::c_void,
                std::mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n as usize != std::mem::size_of::<libc::signalfd_siginfo>() {
            fatal(&format!("invalid signalfd read: {}", io::Error::last_os_error()));
        }
        if siginfo.ssi_signo as i32 != libc::SIGCHLD {
            fatal("unexpected signal from signalfd");
        }

        let code = siginfo.ssi_code;
        if code != libc::CLD_EXITED && code != libc::CLD_KILLED && code != libc::CLD_DUMPED {
            return; // spurious wake-up
        }

        let pid = siginfo.ssi_pid as libc::pid_t;
        let mut status = 0i32;
        let w = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if w != pid {
            log::warn!("waitpid({pid}) did not reap the reported child");
            return;
        }

        let id = match self.registry.get_by_pid(pid) {
            Some(d) => d.id,
            None => return, // untracked process
        };

        let type_code: u8 = if code == libc::CLD_EXITED {
            0
        } else if code == libc::CLD_KILLED {
            1
        } else {
            2
        };
        let status_byte = (siginfo.ssi_status & 0xff) as u8;

        if let Some(d) = self.registry.get_mut(id) {
            d.alive = false;
        }

        self.send_notify_process_died(id, status_byte, type_code);

        if self.entrypoint_id == Some(id) {
            log::info!("entrypoint exited, shutting down");
            unsafe {
                libc::kill(-1, libc::SIGKILL);
            }
            self.shutting_down = true;
            return;
        }

        let destroyable = self.registry.get(id).map(|d| d.destroyable()).unwrap_or(false);
        if destroyable {
            self.registry.remove(id);
        }
    }

    // --- pipe readiness ------------------------------------------------------

    fn handle_pipe_readable(&mut self, id: u64, fd_idx: usize) {
        let epoll_fd = self.epoll_fd.as_raw_fd();
        let mut notify = false;
        let mut deregister_raw: Option<RawFd> = None;

        {
            let desc = match self.registry.get_mut(id) {
                Some(d) => d,
                None => return,
            };
            if let Redirect::Pipe {
                buf,
                parent_fd,
                registered,
            } = &mut desc.redir[fd_idx]
            {
                let was_empty = buf.is_empty();
                let raw = parent_fd.as_raw_fd();
                // Cyclic pipes never stop reading on full: a full cyclic
                // buffer overwrites its oldest bytes, so the request size
                // is the whole capacity, not the (zero) free space.
                // Blocking pipes refuse to read into a full buffer and
                // deregister until MSG_QUERY_OUTPUT drains it.
                let request = if buf.is_cyclic() { buf.capacity() } else { buf.free_size() };
                if request == 0 {
                    deregister_raw = Some(raw);
                    *registered = false;
                } else {
                    match buf.read_from_fd(raw, request) {
                        Ok(Some(0)) => {
                            // EOF: the write end closed, nothing more will
                            // ever arrive on this fd.
                            deregister_raw = Some(raw);
                            *registered = false;
                        }
                        Ok(Some(_)) => {
                            if was_empty {
                                notify = true;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => fatal(&format!("pipe read error: {e}")),
                    }
                }
            }
        }

        if let Some(raw) = deregister_raw {
            epoll_del(epoll_fd, raw);
            self.epoll_tags.remove(&raw);
        }
        if notify {
            self.send_notify_output_available(id, fd_idx as u32);
        }

        let destroyable = self.registry.get(id).map(|d| d.destroyable()).unwrap_or(false);
        if destroyable {
            self.registry.remove(id);
        }
    }
}
