//! Pty allocation and raw-mode primitives.
//!
//! This is deliberately a thin wrapper (spec §4.4): pty allocation and raw-mode
//! configuration are well-trodden, so the only job here is to give the rest of
//! the crate owned, close-on-drop file descriptors instead of bare ints.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use anyhow::{Context, Result};

/// Allocate a pty pair with the given initial window size.
///
/// Returns `(master, slave)`. Neither fd has `O_NONBLOCK` set; callers that
/// need non-blocking reads on the master (the driver does) must set that
/// themselves after deciding whether they want it.
pub(crate) fn open_pty(winsize: &libc::winsize) -> Result<(OwnedFd, OwnedFd)> {
    let mut master: RawFd = -1;
    let mut slave: RawFd = -1;

    // SAFETY: master/slave are valid out-pointers on the stack; winsize points
    // at a live value; termp is null (default termios).
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            ptr::null_mut(),
            ptr::null_mut(),
            // openpty's signature wants `*mut winsize`; we only read from it.
            winsize as *const libc::winsize as *mut libc::winsize,
        )
    };
    if rc != 0 {
        return Err(errno_error("openpty"));
    }

    // SAFETY: both fds were just returned by a successful openpty() call and
    // are not owned anywhere else yet.
    unsafe { Ok((OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))) }
}

/// Disable canonical mode, echo and signal generation on the pty so raw bytes
/// pass through verbatim in both directions.
pub(crate) fn set_raw(fd: &OwnedFd) -> Result<()> {
    let mut term: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: term is a valid out-pointer; fd is a live pty fd.
    if unsafe { libc::tcgetattr(fd.as_raw_fd(), &mut term) } != 0 {
        return Err(errno_error("tcgetattr")).context("set_raw: reading current pty termios");
    }
    // SAFETY: term was just populated by tcgetattr above.
    unsafe { libc::cfmakeraw(&mut term) };
    // SAFETY: fd is live; term is a fully initialized termios.
    if unsafe { libc::tcsetattr(fd.as_raw_fd(), libc::TCSANOW, &term) } != 0 {
        return Err(errno_error("tcsetattr")).context("set_raw: applying raw-mode termios");
    }
    Ok(())
}

/// Make `fd` (the slave side, after `setsid()`) the controlling terminal of
/// the calling process. Must be called from the process that is to own it —
/// the stub, never the driver.
pub(crate) fn make_controlling_terminal(fd: RawFd) -> Result<()> {
    // SAFETY: fd is a valid pty slave fd belonging to the calling process.
    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 0) } != 0 {
        return Err(errno_error("ioctl(TIOCSCTTY)"));
    }
    Ok(())
}

/// Read the foreground process group of the terminal behind `fd`.
pub(crate) fn tcgetpgrp(fd: RawFd) -> io::Result<libc::pid_t> {
    // SAFETY: fd is a live terminal fd for the duration of the call.
    let pgrp = unsafe { libc::tcgetpgrp(fd) };
    if pgrp < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pgrp)
}

/// Set the foreground process group of the terminal behind `fd`.
///
/// Job control only allows this to succeed when the caller is either in the
/// background (and has `SIGTTOU` ignored or blocked — the stub always does)
/// or is already the foreground process.
pub(crate) fn tcsetpgrp(fd: RawFd, pgrp: libc::pid_t) -> io::Result<()> {
    // SAFETY: fd is a live terminal fd; pgrp is a plain integer.
    if unsafe { libc::tcsetpgrp(fd, pgrp) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Borrow `fd` long enough to set or clear `O_NONBLOCK`.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: raw is a valid, open fd for the duration of this call.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(errno_error("fcntl(F_GETFL)"));
    }
    let new_flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    // SAFETY: same as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, new_flags) } < 0 {
        return Err(errno_error("fcntl(F_SETFL)"));
    }
    Ok(())
}

/// Mark `fd` close-on-exec so it never leaks across the stub's `exec`.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fd is a valid, open descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(errno_error("fcntl(F_GETFD)"));
    }
    // SAFETY: same as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(errno_error("fcntl(F_SETFD, FD_CLOEXEC)"));
    }
    Ok(())
}

pub(crate) fn default_winsize(rows: u16, cols: u16) -> libc::winsize {
    libc::winsize {
        ws_row: if rows > 0 { rows } else { 24 },
        ws_col: if cols > 0 { cols } else { 80 },
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

pub(crate) fn errno_error(context: &str) -> anyhow::Error {
    anyhow::anyhow!("{context}: {}", io::Error::last_os_error())
}
