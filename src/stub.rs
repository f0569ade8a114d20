//! The stub job-control engine (spec §4.2) — the heart of the system.
//!
//! Runs as the process the driver forked: it already has the pty slave as its
//! controlling terminal and owns the control/info pipe ends by the time
//! [`run`] is called. It forks the slave, cycles it between foreground and
//! background with `tcsetpgrp`/`SIGSTOP`/`SIGCONT`, and reports outcomes on
//! the info pipe. `run` never returns — every exit path is a process exit.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::protocol::{encode_died, encode_pid, CMD_STEP, EVT_READY};
use crate::pty;
use crate::session::SpawnOptions;

const CONTROLLING_TERMINAL_FD: RawFd = libc::STDIN_FILENO;

/// Runs the stub's whole lifetime: startup handshake, then the `s`-request
/// main loop. Diverges — every path out of this function is a process exit.
pub(crate) fn run(
    info_write: File,
    ctl_read: File,
    argv: Vec<CString>,
    opts: SpawnOptions,
) -> ! {
    // Step 1: SIGTTOU must be ignored so our own tcsetpgrp() calls from the
    // background (step 5 of the algorithm) don't stop us.
    ignore_sigttou();

    let slave_pid = match fork_slave(&argv) {
        Ok(pid) => pid,
        Err(_) => std::process::exit(1),
    };

    // Step 3: hand the slave pid to the driver before anything else — a short
    // read here is how the driver detects a setup failure (spec §7).
    let mut info_write = info_write;
    if info_write.write_all(&encode_pid(slave_pid as u32)).is_err() {
        std::process::exit(1);
    }

    // Step 4: wait for the slave's self-raised SIGSTOP so the driver can
    // assume it begins stopped and in the background.
    match wait_stopped_or_died(slave_pid) {
        WaitResult::Stopped => {}
        WaitResult::Died(signal, code) => {
            let _ = info_write.write_all(&encode_died(signal, code));
            std::process::exit(0);
        }
    }

    main_loop(ctl_read, info_write, slave_pid, opts)
}

fn ignore_sigttou() {
    // SAFETY: installing a signal disposition has no preconditions beyond a
    // valid signal number, which SIGTTOU is.
    unsafe {
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
    }
}

/// Forks the slave. The child becomes its own process group leader, restores
/// default dispositions for the job-control signals, stops itself, then
/// execs the target command. Only async-signal-safe calls happen in the
/// child between fork and exec/exit.
fn fork_slave(argv: &[CString]) -> io::Result<libc::pid_t> {
    // SAFETY: fork() itself has no preconditions. The child branch below only
    // calls async-signal-safe functions before exec/_exit.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        // SAFETY: child branch, async-signal-safe only until exec/_exit.
        unsafe { exec_slave(argv) }
    }
    Ok(pid)
}

/// Child-side setup and `exec`. Never returns.
unsafe fn exec_slave(argv: &[CString]) -> ! {
    // Become our own process group leader so the stub can tcsetpgrp us in
    // and out of the foreground independently of the stub's own group.
    if libc::setpgid(0, 0) != 0 {
        libc::_exit(1);
    }

    // The stub ignored SIGTTOU and will manage SIGCHLD/SIGTTIN/SIGTSTP/SIGCONT
    // itself; the slave gets normal dispositions back so job control behaves
    // the way a plain interactive program expects.
    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    libc::signal(libc::SIGTTIN, libc::SIG_DFL);
    libc::signal(libc::SIGTSTP, libc::SIG_DFL);
    libc::signal(libc::SIGCONT, libc::SIG_DFL);
    libc::signal(libc::SIGTTOU, libc::SIG_DFL);

    // Stop ourselves before exec so the stub observes us starting stopped.
    libc::raise(libc::SIGSTOP);

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());

    // execvp only returns on failure.
    libc::_exit(127);
}

enum WaitResult {
    Stopped,
    Died(u8, u8),
}

fn wait_stopped_or_died(pid: libc::pid_t) -> WaitResult {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer; pid is the slave we just forked.
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WUNTRACED) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // The slave is gone and we can't even learn how; report a bare death.
            return WaitResult::Died(0, 0);
        }
        return classify_status(status);
    }
}

fn classify_status(status: libc::c_int) -> WaitResult {
    if libc::WIFSTOPPED(status) {
        WaitResult::Stopped
    } else if libc::WIFEXITED(status) {
        WaitResult::Died(0, libc::WEXITSTATUS(status) as u8)
    } else if libc::WIFSIGNALED(status) {
        WaitResult::Died(libc::WTERMSIG(status) as u8, 0)
    } else {
        // Continued or other transient state — not a terminal outcome, and
        // not a stop we requested either; treat as still-running and let the
        // caller re-wait.
        WaitResult::Stopped
    }
}

fn stop_signal(status_after_stop: libc::c_int) -> libc::c_int {
    libc::WSTOPSIG(status_after_stop)
}

/// Re-waits and additionally exposes the raw status so `step` can inspect the
/// stop signal (needed for the non-SIGTTIN open question, spec §9).
fn wait_for_stop_or_death(pid: libc::pid_t) -> Result<libc::c_int, WaitResult> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: see wait_stopped_or_died.
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WUNTRACED) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(WaitResult::Died(0, 0));
        }
        if libc::WIFSTOPPED(status) {
            return Ok(status);
        }
        if libc::WIFEXITED(status) {
            return Err(WaitResult::Died(0, libc::WEXITSTATUS(status) as u8));
        }
        if libc::WIFSIGNALED(status) {
            return Err(WaitResult::Died(libc::WTERMSIG(status) as u8, 0));
        }
        // Continued/other — keep waiting for an actual stop or death.
    }
}

fn main_loop(
    ctl_read: File,
    mut info_write: File,
    slave_pid: libc::pid_t,
    opts: SpawnOptions,
) -> ! {
    let mut ctl_read = ctl_read;
    let mut byte = [0u8; 1];
    loop {
        match ctl_read.read(&mut byte) {
            Ok(0) => {
                tracing::debug!("stub: ctl pipe EOF, exiting");
                break;
            }
            Ok(_) if byte[0] == CMD_STEP => {
                tracing::debug!("stub: idle -> stepping");
                run_step_loop(slave_pid, &mut info_write, &opts);
                tracing::debug!("stub: stepping -> idle");
            }
            Ok(_) => {
                tracing::warn!(byte = byte[0], "unrecognized control byte, ignoring");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    std::process::exit(0)
}

/// Runs the retry loop described in spec §4.2: `for (lag = initial; !step(lag);
/// lag *= mult) {}`. Exits the process directly if the slave dies along the
/// way (`step` already reported it); otherwise reports `r` once it succeeds.
fn run_step_loop(slave_pid: libc::pid_t, info_write: &mut File, opts: &SpawnOptions) {
    let stub_pid = unsafe { libc::getpid() };
    let mut backoff = Backoff::new(opts.initial_lag, opts.lag_multiplier);
    loop {
        tracing::trace!(lag_ms = backoff.current().as_millis() as u64, "stub step attempt");
        match step(slave_pid, stub_pid, backoff.current(), opts.bsd_kick) {
            StepOutcome::Success => {
                tracing::debug!("stub: step succeeded, emitting ready");
                let _ = info_write.write_all(&[EVT_READY]);
                return;
            }
            StepOutcome::Failure => {
                tracing::debug!("stub: step failed, growing lag and retrying");
                backoff.grow();
            }
            StepOutcome::Died(signal, code) => {
                tracing::debug!(signal, code, "stub: slave died, emitting died event");
                let _ = info_write.write_all(&encode_died(signal, code));
                std::process::exit(0);
            }
        }
    }
}

enum StepOutcome {
    Success,
    Failure,
    Died(u8, u8),
}

/// One synchronization cycle (spec §4.2 steps 1–8). Precondition: the slave
/// is stopped and in the background.
fn step(slave_pid: libc::pid_t, stub_pid: libc::pid_t, lag: Duration, bsd_kick: bool) -> StepOutcome {
    // 1. Grant foreground to the slave.
    if pty::tcsetpgrp(CONTROLLING_TERMINAL_FD, slave_pid).is_err() {
        tracing::debug!("tcsetpgrp(slave) failed, retrying next cycle");
    }

    // 2. Continue the slave.
    kill_group(slave_pid, libc::SIGCONT);

    // 3. Let it run.
    std::thread::sleep(lag);

    // 4. Stop it and wait for the stop to land.
    kill_group(slave_pid, libc::SIGSTOP);
    match wait_for_stop_or_death(slave_pid) {
        Err(WaitResult::Died(sig, code)) => return StepOutcome::Died(sig, code),
        Err(WaitResult::Stopped) => unreachable!("Died is the only Err variant"),
        Ok(_status) => {}
    }

    // 5. Take back foreground.
    if pty::tcsetpgrp(CONTROLLING_TERMINAL_FD, stub_pid).is_err() {
        tracing::debug!("tcsetpgrp(stub) failed");
    }
    kill_group(slave_pid, libc::SIGCONT);

    // 6. BSD kick: perturb termios so a reader blocked before this cycle
    // began gets re-checked by the kernel for job-control eligibility.
    if bsd_kick {
        bsd_termios_kick(CONTROLLING_TERMINAL_FD);
    }

    // 7. Wait for the next stop.
    let status = match wait_for_stop_or_death(slave_pid) {
        Err(WaitResult::Died(sig, code)) => return StepOutcome::Died(sig, code),
        Err(WaitResult::Stopped) => unreachable!("Died is the only Err variant"),
        Ok(status) => status,
    };

    // Open question (spec §9): a stop for a reason other than SIGTTIN (e.g. a
    // user-delivered SIGTSTP) does not tell us anything about tty-input
    // blocking. Rather than loop on the select-based disambiguation forever,
    // treat it as success so a stopped child never hangs the driver.
    if stop_signal(status) != libc::SIGTTIN {
        tracing::debug!(
            signal = stop_signal(status),
            "slave stopped for a non-SIGTTIN reason; treating as ready"
        );
        return StepOutcome::Success;
    }

    // 8. Disambiguate: does the slave still have unread input pending?
    if stdin_has_pending_input() {
        StepOutcome::Failure
    } else {
        StepOutcome::Success
    }
}

fn kill_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: plain integer arguments; -pgid addresses the whole group.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// Zero-timeout poll on fd 0 (the stub's stdin, which *is* the pty slave end)
/// to see whether the slave left unread bytes behind.
fn stdin_has_pending_input() -> bool {
    let mut pfd = libc::pollfd {
        fd: CONTROLLING_TERMINAL_FD,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a single valid pollfd; timeout 0 makes this non-blocking.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc > 0 && (pfd.revents & libc::POLLIN) != 0
}

/// On BSD kernels, a process already blocked in a tty read when it was
/// backgrounded will not transition to "stopped on tty input" from the
/// SIGCONT/SIGSTOP cycle alone; any termios write wakes blocked readers so
/// the kernel re-checks their job-control eligibility. Get-then-restore VMIN
/// is the least invasive perturbation.
fn bsd_termios_kick(fd: RawFd) {
    let mut term: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: term is a valid out-pointer; fd is our controlling terminal.
    if unsafe { libc::tcgetattr(fd, &mut term) } != 0 {
        return;
    }
    let original_vmin = term.c_cc[libc::VMIN];
    term.c_cc[libc::VMIN] = original_vmin.wrapping_add(1);
    // SAFETY: term was just read from the same fd.
    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &term) };
    term.c_cc[libc::VMIN] = original_vmin;
    // SAFETY: same as above.
    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &term) };
}
