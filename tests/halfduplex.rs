//! End-to-end scenarios against real `/bin/sh` slaves, exercising the whole
//! driver/stub/slave process trio through the public `Session` API.

use std::sync::OnceLock;
use std::time::Duration;

use halfduplex::{ExitStatus, KillOutcome, KillPolicy, RecvOutcome, Session};

const SHORT: Duration = Duration::from_secs(5);

/// Installs a `tracing` subscriber once, only when `RUST_LOG` is set. The
/// library itself never does this — it's purely for diagnosing a failing
/// test run locally.
fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        if std::env::var_os("RUST_LOG").is_some() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }
    });
}

fn sh(script: &str) -> Session {
    init_tracing();
    Session::spawn(&["/bin/sh", "-c", script]).expect("spawn /bin/sh")
}

fn recv_data(session: &mut Session, timeout: Duration) -> Vec<u8> {
    match session.recv(Some(timeout)).expect("recv") {
        RecvOutcome::Data(bytes) => bytes,
        other => panic!("expected Data, got {other:?}"),
    }
}

#[test]
fn functional_success_round_trip() {
    let echo_file = tempfile_path("round-trip-echo");
    let script = format!(
        "printf '2'; read line1; printf '%s' \"$line1\" > {path}; read line2",
        path = shell_quote(&echo_file)
    );
    let mut session = sh(&script);

    let out = recv_data(&mut session, SHORT);
    assert_eq!(out, b"2");

    session.write(b"3\n");
    let out = recv_data(&mut session, SHORT);
    assert_eq!(out, b"");

    let received = std::fs::read_to_string(&echo_file).unwrap_or_default();
    assert_eq!(received.trim_end(), "3");

    let _ = session.kill();
    let _ = std::fs::remove_file(&echo_file);
}

#[test]
fn laggy_write_does_not_return_early() {
    let mut session = sh("printf '4'; sleep 1; printf '5'; read _line");

    let out = recv_data(&mut session, Duration::from_secs(3));
    assert_eq!(out, b"45");

    let _ = session.kill();
}

#[test]
fn non_blocking_read_false_positive_is_retried() {
    // A zero-timeout select on stdin the job-control scheme treats as an
    // input attempt, triggering a spurious stop the stub's backoff loop must
    // re-step past without losing the bytes printed on either side of it.
    let mut session = sh(
        "printf '6'; \
         sh -c 'read -t 0 _ 2>/dev/null'; \
         printf '7'; \
         read _line",
    );

    let out = recv_data(&mut session, Duration::from_secs(5));
    assert_eq!(out, b"67");

    let _ = session.kill();
}

#[test]
fn death_during_recv_deactivates_session() {
    let mut session = sh("printf '8'; exit 0");

    assert!(session.is_active());
    match session.recv(Some(SHORT)).expect("recv") {
        RecvOutcome::Died(ExitStatus::Exited(0)) => {}
        other => panic!("expected a clean exit, got {other:?}"),
    }
    assert!(!session.is_active());

    match session.recv(Some(SHORT)).expect("recv") {
        RecvOutcome::Inactive => {}
        other => panic!("expected Inactive after death, got {other:?}"),
    }
}

#[test]
fn reuse_spawns_a_fresh_session_after_kill() {
    let mut first = sh("read _line; printf 'first'");
    first.write(b"go\n");
    let out = recv_data(&mut first, SHORT);
    assert_eq!(out, b"first");
    assert!(matches!(first.kill().expect("kill"), KillOutcome::Exited(_)));

    let mut second = sh("read _line; printf 'second'");
    second.write(b"go\n");
    let out = recv_data(&mut second, SHORT);
    assert_eq!(out, b"second");
    let _ = second.kill();
}

#[test]
fn terminal_ioctl_with_pending_input_not_misread() {
    let mut session = sh("read _a; stty -a >/dev/null; read _b; printf '10'; exit 0");

    session.write(b"\n\n");
    let out = recv_data(&mut session, Duration::from_secs(5));
    assert_eq!(out, b"10");
}

#[test]
fn idempotent_empty_step_without_intervening_write() {
    let mut session = sh("read _line; printf 'once'");
    session.write(b"go\n");
    let first = recv_data(&mut session, SHORT);
    assert_eq!(first, b"once");

    let second = recv_data(&mut session, Duration::from_millis(500));
    assert_eq!(second, b"");

    let _ = session.kill();
}

#[test]
fn recv_timeout_preserves_buffers_for_next_call() {
    let mut session = sh("sleep 2; printf 'late'; read _line");

    match session.recv(Some(Duration::from_millis(100))).expect("recv") {
        RecvOutcome::Timeout => {}
        other => panic!("expected Timeout, got {other:?}"),
    }

    let out = recv_data(&mut session, Duration::from_secs(5));
    assert_eq!(out, b"late");

    let _ = session.kill();
}

#[test]
fn kill_on_unresponsive_slave_escalates_to_sigkill() {
    let mut session = sh("trap '' TERM; while :; do sleep 1; done");
    let outcome = session.kill().expect("kill");
    assert!(matches!(
        outcome,
        KillOutcome::Exited(ExitStatus::Signaled(_)) | KillOutcome::AliveSignalled
    ));
}

#[test]
fn kill_with_overrides_the_default_policy_for_one_call() {
    let mut session = sh("trap 'exit 5' TERM; while :; do sleep 1; done");
    let outcome = session
        .kill_with(&KillPolicy(vec![(libc::SIGTERM, Duration::from_secs(3))]))
        .expect("kill_with");
    assert!(matches!(
        outcome,
        KillOutcome::Exited(ExitStatus::Exited(5)) | KillOutcome::AliveSignalled
    ));
}

#[test]
fn write_after_close_is_discarded_not_fatal() {
    let mut session = sh("read _line; printf 'x'");
    session.close();
    session.write(b"should be discarded\n");
    assert!(!session.is_active());
}

fn tempfile_path(tag: &str) -> String {
    let pid = std::process::id();
    format!("{}/halfduplex-test-{tag}-{pid}", std::env::temp_dir().display())
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}
