// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unix double-fork daemonisation, detaching the process from its
//! controlling terminal once all listening sockets are bound.

#[cfg(unix)]
pub fn daemonise() -> std::io::Result<()> {
    unix::daemonise()
}

#[cfg(not(unix))]
pub fn daemonise() -> std::io::Result<()> {
    log::warn!("daemonisation was requested but is not supported on this platform; running in the foreground");
    Ok(())
}

#[cfg(unix)]
mod unix {
    use std::ffi::CString;
    use std::os::unix::io::RawFd;

    /// Fork, `setsid` in the child, fork again so the final process is
    /// not a session leader, `chdir("/")`, and redirect stdio to
    /// `/dev/null`. Deliberately always chdirs (the historic
    /// `daemon(1, 0)` call passed `1` for "do not chdir"; this
    /// implementation tightens that, documented in the project's design
    /// notes).
    pub fn daemonise() -> std::io::Result<()> {
        match first_fork()? {
            ForkResult::Parent(_) => std::process::exit(0),
            ForkResult::Child => {}
        }

        // SAFETY: single-threaded at this point in startup, no other
        // thread can race the PID/session transition.
        if unsafe { libc::setsid() } < 0 {
            return Err(std::io::Error::last_os_error());
        }

        match first_fork()? {
            ForkResult::Parent(_) => std::process::exit(0),
            ForkResult::Child => {}
        }

        let root = CString::new("/").expect("no interior NUL");
        // SAFETY: `root` is a valid NUL-terminated C string for the
        // duration of this call.
        if unsafe { libc::chdir(root.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }

        redirect_stdio_to_devnull()?;
        Ok(())
    }

    enum ForkResult {
        Parent(libc::pid_t),
        Child,
    }

    fn first_fork() -> std::io::Result<ForkResult> {
        // SAFETY: `fork` is safe to call in a single-threaded process;
        // the gateway daemonises before spawning any worker threads.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if pid == 0 {
            Ok(ForkResult::Child)
        } else {
            Ok(ForkResult::Parent(pid))
        }
    }

    fn redirect_stdio_to_devnull() -> std::io::Result<()> {
        let devnull = CString::new("/dev/null").expect("no interior NUL");
        // SAFETY: `devnull` is a valid NUL-terminated path; the returned
        // fd is checked before use.
        let fd: RawFd = unsafe { libc::open(devnull.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            // SAFETY: `fd` is a valid, open descriptor for the duration
            // of this loop; `dup2` is safe with any valid fds.
            if unsafe { libc::dup2(fd, target) } < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        if fd > libc::STDERR_FILENO {
            // SAFETY: `fd` was just opened above and is not one of the
            // standard descriptors we dup'd into.
            unsafe {
                libc::close(fd);
            }
        }

        Ok(())
    }
}
