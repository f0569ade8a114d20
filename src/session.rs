//! The driver side (spec §3–§4.3): owns the pty master and the two control
//! pipes, and exposes the synchronous `write`/`recv`/`kill` surface.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::backoff;
use crate::process_signal::signal_process_group_or_pid;
use crate::protocol::{decode_pid, CMD_STEP, EventDecoder, StubEvent};
use crate::pty;
use crate::stub;

/// Tuning knobs for a session, beyond the fixed protocol. All fields default
/// to the platform-appropriate values `spawn` uses.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Initial retry lag for the stub's step loop (spec §4.2).
    pub initial_lag: Duration,
    /// Growth factor applied to the lag after each failed step.
    pub lag_multiplier: f64,
    /// Whether the stub performs the BSD termios kick between stop/cont
    /// cycles. Defaults to on for BSD-family targets, off elsewhere.
    pub bsd_kick: bool,
    /// Initial pty window size, as (rows, cols).
    pub winsize: (u16, u16),
    /// How `kill` escalates if the slave doesn't exit promptly.
    pub kill_policy: KillPolicy,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            initial_lag: backoff::platform_default_lag(),
            lag_multiplier: backoff::DEFAULT_MULTIPLIER,
            bsd_kick: backoff::IS_BSD_FAMILY,
            winsize: (24, 80),
            kill_policy: KillPolicy::default(),
        }
    }
}

/// Signal and timing policy for [`Session::kill`]: an ordered list of
/// `(signal, grace period)` pairs, generalizing the spec's hardcoded
/// `[(SIGTERM, 3s), (SIGKILL, 3s)]` default (spec §4.3) into a
/// caller-overridable escalation sequence of any length.
#[derive(Debug, Clone)]
pub struct KillPolicy(pub Vec<(libc::c_int, Duration)>);

impl Default for KillPolicy {
    fn default() -> Self {
        Self(vec![
            (libc::SIGTERM, Duration::from_secs(3)),
            (libc::SIGKILL, Duration::from_secs(3)),
        ])
    }
}

/// How the slave process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// Result of [`Session::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// One or more sync cycles completed; carries everything produced by the
    /// slave since the previous successful `recv` (possibly empty).
    Data(Vec<u8>),
    /// The slave died during this call; no more data will ever arrive.
    Died(ExitStatus),
    /// The deadline passed with nothing to report. Buffers and `sent_sync`
    /// are left exactly as they were; the next `recv` resumes waiting.
    Timeout,
    /// The session is already closed; there's nothing to wait for.
    Inactive,
}

/// Result of [`Session::kill`].
#[derive(Debug)]
pub enum KillOutcome {
    /// The slave had already exited, or exited during one of the policy's
    /// waits.
    Exited(ExitStatus),
    /// Every wait elapsed; the slave is presumed still alive.
    AliveSignalled,
    /// The session was already inactive when `kill` was called.
    AlreadyInactive,
    /// A policy signal could not be delivered at all.
    SignalFailed(io::Error),
}

enum SignalWaitResult {
    Exited(ExitStatus),
    StillAlive,
    SignalFailed(io::Error),
}

/// A synchronous request/response driver for a pty-backed child process.
///
/// `Session` is single-threaded top to bottom: every call blocks the caller
/// for as long as it needs and returns, there is no background thread and no
/// hidden concurrency beyond the OS processes it manages.
pub struct Session {
    /// `None` once `close` has released the pty master.
    master: Option<File>,
    ctl_write: File,
    info_read: File,
    stub_pid: libc::pid_t,
    slave_pgid: libc::pid_t,
    write_buffer: Vec<u8>,
    read_buffer: Vec<u8>,
    decoder: EventDecoder,
    sent_sync: bool,
    active: bool,
    exit_status: Option<ExitStatus>,
    kill_policy: KillPolicy,
}

impl Session {
    /// Spawn `argv[0]` with the remaining entries as arguments, using
    /// platform-default tuning.
    pub fn spawn<S: AsRef<str>>(argv: &[S]) -> Result<Session> {
        Self::spawn_with(argv, SpawnOptions::default())
    }

    /// Spawn with explicit [`SpawnOptions`].
    pub fn spawn_with<S: AsRef<str>>(argv: &[S], opts: SpawnOptions) -> Result<Session> {
        anyhow::ensure!(!argv.is_empty(), "spawn: argv must not be empty");
        let argv_c: Vec<CString> = argv
            .iter()
            .map(|s| CString::new(s.as_ref()).context("spawn: argv entry contains a NUL byte"))
            .collect::<Result<_>>()?;

        let winsize = pty::default_winsize(opts.winsize.0, opts.winsize.1);
        let (master, slave) = pty::open_pty(&winsize)?;
        pty::set_raw(&master).context("spawn: putting pty into raw mode")?;

        let (ctl_read, ctl_write) = make_pipe().context("spawn: allocating control pipe")?;
        let (info_read, info_write) = make_pipe().context("spawn: allocating info pipe")?;

        let slave_raw = slave.as_raw_fd();

        // SAFETY: fork() duplicates the address space; both branches below
        // only touch already-open fds and plain data until the child calls
        // into `stub::run`, which itself only uses async-signal-safe calls
        // before the next fork/exec. The child branch always diverges, so
        // the parent-only bindings below are never considered moved there.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(pty::errno_error("fork"));
        }

        if pid == 0 {
            // Child: becomes the stub. Drop the ends only the driver needs so
            // EOF on the pipes is observable once the driver closes its own.
            drop(master);
            drop(ctl_write);
            drop(info_read);

            if child_setup_failed(slave_raw) {
                std::process::exit(1);
            }
            drop(slave);

            let ctl_read: File = ctl_read.into();
            let info_write: File = info_write.into();
            stub::run(info_write, ctl_read, argv_c, opts);
        }

        // Parent (driver): drop the ends only the stub needs.
        drop(slave);
        drop(ctl_read);
        drop(info_write);

        let mut info_read_file: File = info_read.into();
        let mut pid_buf = [0u8; 4];
        info_read_file
            .read_exact(&mut pid_buf)
            .context("spawn: stub exited before completing the pid handshake")?;
        let slave_pgid = decode_pid(pid_buf) as libc::pid_t;

        pty::set_nonblocking(master.as_fd(), true).context("spawn: setting master non-blocking")?;
        pty::set_nonblocking(info_read_file.as_fd(), true)
            .context("spawn: setting info pipe non-blocking")?;

        Ok(Session {
            master: Some(master.into()),
            ctl_write: ctl_write.into(),
            info_read: info_read_file,
            stub_pid: pid,
            slave_pgid,
            write_buffer: Vec::new(),
            read_buffer: Vec::new(),
            decoder: EventDecoder::new(),
            sent_sync: false,
            active: true,
            exit_status: None,
            kill_policy: opts.kill_policy,
        })
    }

    /// Append bytes to the slave's input. No I/O happens here — the bytes go
    /// out on the next `recv`. Discarded (with a warning) if the session is
    /// no longer active.
    pub fn write(&mut self, data: &[u8]) {
        if !self.active {
            tracing::warn!(len = data.len(), "write: session inactive, discarding bytes");
            return;
        }
        self.write_buffer.extend_from_slice(data);
    }

    /// Flush the write buffer, run one or more synchronization cycles, and
    /// return everything the slave produced. `timeout` bounds total
    /// wall-clock time; `None` waits indefinitely.
    ///
    /// On [`RecvOutcome::Timeout`] every internal buffer is left exactly as
    /// it was — the next call resumes where this one left off.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<RecvOutcome> {
        if !self.active {
            tracing::warn!("recv: session inactive, returning immediately");
            return Ok(RecvOutcome::Inactive);
        }
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            tracing::debug!("recv: send phase");
            self.send_phase()?;
            if !self.active {
                return Ok(RecvOutcome::Died(self.exit_status.unwrap_or(ExitStatus::Signaled(0))));
            }

            if !self.sent_sync {
                tracing::debug!("recv: issuing sync request");
                self.ctl_write
                    .write_all(&[CMD_STEP])
                    .context("recv: writing sync request to ctl pipe")?;
                self.sent_sync = true;
            }

            tracing::debug!("recv: wait phase");
            match self.wait_phase(deadline)? {
                WaitPhaseResult::Responded => {}
                WaitPhaseResult::Died(status) => return Ok(RecvOutcome::Died(status)),
                WaitPhaseResult::TimedOut => return Ok(RecvOutcome::Timeout),
            }

            if self.write_buffer.is_empty() || !self.active {
                break;
            }
        }

        self.send_phase()?;
        if !self.active {
            return Ok(RecvOutcome::Died(self.exit_status.unwrap_or(ExitStatus::Signaled(0))));
        }
        Ok(RecvOutcome::Data(std::mem::take(&mut self.read_buffer)))
    }

    /// Terminate the slave using the session's default [`KillPolicy`] (set at
    /// spawn time via [`SpawnOptions::kill_policy`], `[(SIGTERM, 3s),
    /// (SIGKILL, 3s)]` unless overridden).
    pub fn kill(&mut self) -> Result<KillOutcome> {
        let policy = self.kill_policy.clone();
        self.kill_with(&policy)
    }

    /// Terminate the slave with an explicit [`KillPolicy`], overriding the
    /// session's default for this call only (spec §6's `kill(pairs?)`). For
    /// each `(signal, grace)` pair in order: deliver `signal` to the slave's
    /// process group, then wait up to `grace` for it to exit, discarding any
    /// output observed along the way, before moving to the next pair.
    pub fn kill_with(&mut self, policy: &KillPolicy) -> Result<KillOutcome> {
        if !self.active {
            return Ok(KillOutcome::AlreadyInactive);
        }

        let mut last = KillOutcome::AliveSignalled;
        for &(signal, grace) in &policy.0 {
            match self.signal_and_wait(signal, grace)? {
                SignalWaitResult::Exited(status) => {
                    return Ok(KillOutcome::Exited(status));
                }
                SignalWaitResult::SignalFailed(e) => return Ok(KillOutcome::SignalFailed(e)),
                SignalWaitResult::StillAlive => {
                    last = KillOutcome::AliveSignalled;
                }
            }
        }
        Ok(last)
    }

    fn signal_and_wait(&mut self, signal: libc::c_int, grace: Duration) -> Result<SignalWaitResult> {
        if let Err(e) = signal_process_group_or_pid(self.slave_pgid, signal, true) {
            return Ok(SignalWaitResult::SignalFailed(e));
        }
        let deadline = Instant::now() + grace;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(SignalWaitResult::StillAlive);
            }
            match self.recv(Some(remaining))? {
                RecvOutcome::Died(status) => return Ok(SignalWaitResult::Exited(status)),
                RecvOutcome::Inactive => {
                    return Ok(SignalWaitResult::Exited(
                        self.exit_status.unwrap_or(ExitStatus::Signaled(0)),
                    ))
                }
                RecvOutcome::Data(_) | RecvOutcome::Timeout => {}
            }
        }
    }

    /// Resize the pty's window. Setting the master's window size makes the
    /// kernel deliver `SIGWINCH` to the pty's foreground process group (the
    /// slave) as a side effect — no separate signal is needed. A no-op if
    /// the session is inactive.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let Some(master) = self.master.as_ref() else {
            return Ok(());
        };
        let winsize = pty::default_winsize(rows, cols);
        // SAFETY: master is a live pty master fd; winsize is a valid, fully
        // initialized value for the duration of the call.
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if rc != 0 {
            return Err(pty::errno_error("ioctl(TIOCSWINSZ)"));
        }
        Ok(())
    }

    /// Whether the session still has a live slave process.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The slave's exit status, once observed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// `kill` plus releasing the pty master (spec §4.3/§6). Idempotent; every
    /// subsequent operation on this session reports inactive rather than
    /// erroring.
    pub fn close(&mut self) {
        if self.active {
            let policy = self.kill_policy.clone();
            let _ = self.kill_with(&policy);
        }
        self.master = None;
        self.active = false;
    }

    /// Non-blocking drain loop over (master-readable, master-writable,
    /// info-readable). Exits once `write_buffer` is empty or a poll finds
    /// nothing ready (spec §4.3 step 1).
    fn send_phase(&mut self) -> Result<()> {
        loop {
            let want_write = !self.write_buffer.is_empty();
            let mut pfds = [
                libc::pollfd {
                    fd: self.master_fd(),
                    events: libc::POLLIN | if want_write { libc::POLLOUT } else { 0 },
                    revents: 0,
                },
                libc::pollfd { fd: self.info_read.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            ];
            // SAFETY: pfds has two valid entries for the duration of the call.
            let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, 0) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("recv: non-blocking poll failed");
            }
            if rc == 0 {
                return Ok(());
            }

            if pfds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                self.drain_master_once()?;
            }
            if want_write && pfds[0].revents & libc::POLLOUT != 0 {
                self.flush_write_once()?;
            }
            if pfds[1].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                self.service_info_pipe()?;
            }

            if self.write_buffer.is_empty() || !self.active {
                return Ok(());
            }
        }
    }

    /// Blocking wait (bounded by `deadline`) on (master-readable,
    /// info-readable), servicing each as it arrives, until `sent_sync`
    /// clears, the session goes inactive, or the deadline passes (spec
    /// §4.3 step 3).
    fn wait_phase(&mut self, deadline: Option<Instant>) -> Result<WaitPhaseResult> {
        loop {
            if !self.active {
                return Ok(WaitPhaseResult::Died(self.exit_status.unwrap_or(ExitStatus::Signaled(0))));
            }
            if !self.sent_sync {
                return Ok(WaitPhaseResult::Responded);
            }

            let timeout_ms = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(WaitPhaseResult::TimedOut);
                    }
                    (d - now).as_millis().min(i32::MAX as u128) as i32
                }
                None => -1,
            };

            let mut pfds = [
                libc::pollfd { fd: self.master_fd(), events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: self.info_read.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            ];
            // SAFETY: pfds has two valid entries for the duration of the call.
            let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("recv: blocking poll failed");
            }
            if rc == 0 {
                return Ok(WaitPhaseResult::TimedOut);
            }

            if pfds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                self.drain_master_once()?;
            }
            if pfds[1].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                self.service_info_pipe()?;
            }
        }
    }

    /// The master's raw fd, or `-1` once `close` has released it. `poll`
    /// ignores negative fds (sets `revents` to 0), so callers can pass this
    /// straight into a `pollfd` without special-casing the closed state.
    fn master_fd(&self) -> RawFd {
        match &self.master {
            Some(f) => f.as_raw_fd(),
            None => -1,
        }
    }

    fn drain_master_once(&mut self) -> Result<()> {
        if self.master.is_none() {
            return Ok(());
        }
        match read_nonblocking(self.master_fd(), &mut self.read_buffer) {
            ReadResult::Got(_) | ReadResult::WouldBlock => Ok(()),
            ReadResult::Eof => {
                // The pty itself doesn't EOF while the slave pgrp holds the
                // slave end open; nothing special to do here. (Also reached
                // for the EIO-after-leader-exit case squashed in
                // `read_nonblocking`.)
                Ok(())
            }
            ReadResult::Err(e) => Err(e).context("recv: reading pty master"),
        }
    }

    fn flush_write_once(&mut self) -> Result<()> {
        let Some(master) = self.master.as_mut() else {
            return Ok(());
        };
        match master.write(&self.write_buffer) {
            Ok(0) => Ok(()),
            Ok(n) => {
                self.write_buffer.drain(..n);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e).context("recv: writing to pty master"),
        }
    }

    /// One non-blocking read of the info pipe, decoding and applying
    /// whatever complete events it yields.
    fn service_info_pipe(&mut self) -> Result<()> {
        let mut buf = [0u8; 64];
        match self.info_read.read(&mut buf) {
            Ok(0) => {
                // EOF: the stub is gone without a final event. Per spec
                // §4.3, drain any pty output left behind, reap the stub, and
                // mark inactive with whatever exit status that yields.
                tracing::warn!("recv: info pipe EOF without a died event, stub crashed");
                let _ = self.drain_master_once();
                self.reap_stub_on_info_eof();
            }
            Ok(n) => {
                for event in self.decoder.feed(&buf[..n]) {
                    match event {
                        StubEvent::Ready => {
                            tracing::debug!("recv: stub reported ready");
                            self.sent_sync = false;
                        }
                        StubEvent::Died { signal, code } => {
                            tracing::debug!(signal, code, "recv: stub reported slave death");
                            self.mark_dead(signal, code);
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("recv: reading info pipe"),
        }
        Ok(())
    }

    /// Records the slave's death and reaps the stub: per spec §3's
    /// lifecycle, the stub exits immediately after writing the `d` event, so
    /// by the time this runs it's already a waitable zombie.
    fn mark_dead(&mut self, signal: u8, code: u8) {
        self.active = false;
        self.exit_status = Some(if signal == 0 {
            ExitStatus::Exited(code as i32)
        } else {
            ExitStatus::Signaled(signal as i32)
        });
        let _ = self.reap_stub();
    }

    fn reap_stub_on_info_eof(&mut self) {
        self.active = false;
        if self.exit_status.is_some() {
            return;
        }
        self.exit_status = Some(match self.reap_stub() {
            Some(status) if libc::WIFSIGNALED(status) => ExitStatus::Signaled(libc::WTERMSIG(status)),
            Some(status) if libc::WIFEXITED(status) => ExitStatus::Exited(libc::WEXITSTATUS(status)),
            _ => ExitStatus::Signaled(0),
        });
    }

    /// Reaps the stub process, returning its raw wait status if the wait
    /// succeeded. The stub is always our direct child, recorded at fork time.
    fn reap_stub(&self) -> Option<libc::c_int> {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer; stub_pid is our direct
        // child, recorded at fork time.
        let ret = unsafe { libc::waitpid(self.stub_pid, &mut status, 0) };
        if ret > 0 {
            Some(status)
        } else {
            None
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.active {
            let _ = signal_process_group_or_pid(self.slave_pgid, libc::SIGKILL, true);
            let _ = signal_process_group_or_pid(self.stub_pid, libc::SIGKILL, true);
        }
    }
}

enum WaitPhaseResult {
    Responded,
    Died(ExitStatus),
    TimedOut,
}

enum ReadResult {
    Got(usize),
    WouldBlock,
    Eof,
    Err(io::Error),
}

fn read_nonblocking(fd: RawFd, out: &mut Vec<u8>) -> ReadResult {
    let mut buf = [0u8; 4096];
    // SAFETY: buf is a valid, appropriately-sized stack buffer; fd is a live
    // non-blocking fd for the duration of this call.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        out.extend_from_slice(&buf[..n as usize]);
        ReadResult::Got(n as usize)
    } else if n == 0 {
        ReadResult::Eof
    } else {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            ReadResult::WouldBlock
        } else if err.raw_os_error() == Some(libc::EIO) {
            // Linux: the pty master can report EIO once the session leader
            // has exited, racily, before the slave's own death is observed
            // through the usual channel. Spec §7 squashes this to EOF.
            ReadResult::Eof
        } else {
            ReadResult::Err(err)
        }
    }
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];
    // SAFETY: fds is a valid two-element out-array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(pty::errno_error("pipe"));
    }
    pty::set_cloexec(fds[0])?;
    pty::set_cloexec(fds[1])?;
    // SAFETY: both fds were just returned by a successful pipe() call and are
    // not owned anywhere else.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// `true` on failure. Kept as a plain bool return (rather than threading an
/// `anyhow::Error` through a child fork branch) because the only thing the
/// caller can do with a setup failure here is exit non-zero — the driver
/// already detects it independently via the short pid-handshake read.
fn child_setup_failed(slave_raw: RawFd) -> bool {
    // SAFETY: slave_raw is a valid pty slave fd owned by this process.
    if unsafe { libc::setsid() } < 0 {
        return true;
    }
    if pty::make_controlling_terminal(slave_raw).is_err() {
        return true;
    }
    for target in 0..=2 {
        // SAFETY: slave_raw and target are both valid fd numbers for dup2.
        if unsafe { libc::dup2(slave_raw, target) } < 0 {
            return true;
        }
    }
    false
}
