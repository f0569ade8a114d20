//! Synchronous request/response driver for a pty-backed child process,
//! built on POSIX job control instead of any framing convention the child
//! itself has to cooperate with.
//!
//! See [`Session`] for the entry point.

mod backoff;
mod process_signal;
mod protocol;
mod pty;
mod session;
mod stub;

pub use session::{ExitStatus, KillOutcome, KillPolicy, RecvOutcome, Session, SpawnOptions};
