//! One-shot early boot: the handful of mounts and device nodes a
//! freshly-started kernel needs before anything else can run. Runs
//! once, synchronously, before the event loop starts.
//!
//! Mirrors the panic-hook/`check_libc`/raw-`mount` idiom used for the
//! container-runtime boot sequence this crate is descended from, pared
//! down to just the filesystem setup every guest needs regardless of
//! what workload it ends up supervising.

fn check_libc(ret: i32) {
    if ret < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        panic!("mount/mknod setup failed with errno {errno}");
    }
}

/// Replaces the default panic hook so an early-boot panic powers the
/// VM off instead of leaving it wedged with no console to read from.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("{info}");
        unsafe {
            libc::sync();
            libc::reboot(libc::LINUX_REBOOT_CMD_POWER_OFF);
        }
        std::process::exit(1);
    }));
}

unsafe fn mount_pseudo_filesystems() {
    check_libc(libc::mount(
        c"none".as_ptr(),
        c"/proc".as_ptr(),
        c"proc".as_ptr(),
        libc::MS_SILENT,
        std::ptr::null(),
    ));
    check_libc(libc::mount(
        c"none".as_ptr(),
        c"/sys".as_ptr(),
        c"sysfs".as_ptr(),
        libc::MS_SILENT,
        std::ptr::null(),
    ));
    check_libc(libc::mount(
        c"none".as_ptr(),
        c"/dev".as_ptr(),
        c"devtmpfs".as_ptr(),
        libc::MS_SILENT,
        std::ptr::null(),
    ));
    check_libc(libc::mkdir(c"/dev/pts".as_ptr(), 0o755));
    check_libc(libc::mount(
        c"none".as_ptr(),
        c"/dev/pts".as_ptr(),
        c"devpts".as_ptr(),
        libc::MS_SILENT,
        std::ptr::null(),
    ));
    check_libc(libc::mkdir(c"/dev/shm".as_ptr(), 0o1777));
    check_libc(libc::mount(
        c"none".as_ptr(),
        c"/dev/shm".as_ptr(),
        c"tmpfs".as_ptr(),
        libc::MS_SILENT,
        std::ptr::null(),
    ));
}

/// `devtmpfs` normally populates these itself; synthesize them in case
/// the kernel was built without `CONFIG_DEVTMPFS_MOUNT` or the nodes
/// raced the mount above.
unsafe fn ensure_device_node(path: &std::ffi::CStr, mode: libc::mode_t, major: u32, minor: u32) {
    let dev = libc::makedev(major, minor);
    let ret = libc::mknod(path.as_ptr(), mode, dev);
    if ret < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EEXIST {
            panic!("mknod {path:?} failed with errno {errno}");
        }
    }
}

unsafe fn synthesize_missing_device_nodes() {
    ensure_device_node(c"/dev/null", libc::S_IFCHR | 0o666, 1, 3);
    ensure_device_node(c"/dev/ptmx", libc::S_IFCHR | 0o666, 5, 2);
}

/// Runs the mounts and device nodes every guest needs, then returns.
/// Caller brings up the rest (networking, command channel) afterward.
pub fn early_init() {
    install_panic_hook();
    unsafe {
        mount_pseudo_filesystems();
        synthesize_missing_device_nodes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_libc_accepts_non_negative() {
        check_libc(0);
        check_libc(1);
    }

    #[test]
    #[should_panic(expected = "errno")]
    fn check_libc_panics_on_negative() {
        check_libc(-1);
    }
}
