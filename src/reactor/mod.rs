//! Submit-and-callback I/O reactor.
//!
//! Every asynchronous thing the server does — socket accepts, client
//! reads/writes, dirty-pipe reads, render timers — is an operation
//! submitted here. Submission returns a [`TaskId`] synchronously; the
//! completion is delivered exactly once, as a [`Completion`] in a batch
//! returned from [`Reactor::poll`]. The caller dispatches the batch with
//! `&mut self` free — collecting before dispatching is what keeps the
//! borrow checker out of the event loop.
//!
//! Two backends:
//! - [`PollReactor`] — the production readiness backend (`mio`, so epoll
//!   on Linux and kqueue on the BSDs) with syscalls performed on
//!   readiness and a binary-heap timer queue.
//! - [`MockReactor`] — a deterministic in-process backend with a virtual
//!   clock, used by tests.

pub mod mock;
pub mod poll;

pub use mock::MockReactor;
pub use poll::PollReactor;

use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Identifies one submitted operation. Never reused within a reactor.
pub type TaskId = u64;

/// How long [`Reactor::poll`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Poll once and return a single batch, even if it is empty.
    Once,
    /// Loop until no operations remain pending.
    UntilDone,
}

/// Terminal error for a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpError {
    /// The op was cancelled via [`Reactor::cancel`] / [`Reactor::cancel_by_fd`].
    #[error("operation canceled")]
    Canceled,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("broken pipe")]
    BrokenPipe,
    /// Any other OS error, by errno.
    #[error("os error {errno}")]
    Os { errno: i32 },
}

impl OpError {
    pub(crate) fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECONNRESET => OpError::ConnectionReset,
            libc::EPIPE => OpError::BrokenPipe,
            _ => OpError::Os { errno },
        }
    }
}

/// The per-kind payload of a completed operation.
#[derive(Debug)]
pub enum OpResult {
    /// A new connection; the fd is owned by the caller from here on.
    Accepted(RawFd),
    /// Outbound connect finished; the fd is ready for reads/writes.
    Connected(RawFd),
    /// Bytes read. An empty buffer means EOF.
    Read(Vec<u8>),
    /// The whole submitted buffer was written.
    Wrote(usize),
    Closed,
    TimerFired,
    Err(OpError),
}

impl OpResult {
    /// Whether this completion is [`OpResult::Err`]`(Canceled)`.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, OpResult::Err(OpError::Canceled))
    }
}

/// One delivered completion. `user_data` is returned verbatim from the
/// submission and is how the caller routes the event.
#[derive(Debug)]
pub struct Completion {
    pub task: TaskId,
    pub user_data: u64,
    pub result: OpResult,
}

/// The uniform operation interface both backends implement.
///
/// Contract highlights (see the backend docs for the rest):
/// - every submitted op completes exactly once, including on cancel;
/// - [`Reactor::cancel`] after completion is a no-op;
/// - [`Reactor::cancel_by_fd`] cancels every pending op targeting the fd,
///   timers exempt;
/// - completions within a batch are in kernel-report order; independent
///   ops have no ordering between them.
pub trait Reactor {
    /// Accept one connection on a listening socket.
    fn accept(&mut self, fd: RawFd, user_data: u64) -> TaskId;

    /// Connect a new unix stream socket to `path`.
    fn connect(&mut self, path: &Path, user_data: u64) -> TaskId;

    /// Read up to `cap` bytes from `fd`.
    fn read(&mut self, fd: RawFd, cap: usize, user_data: u64) -> TaskId;

    /// Write all of `data` to `fd`. Completes once the full buffer is out.
    fn write(&mut self, fd: RawFd, data: Vec<u8>, user_data: u64) -> TaskId;

    /// Close `fd`. Synchronous on the readiness backend; the completion
    /// still arrives through [`Reactor::poll`].
    fn close(&mut self, fd: RawFd, user_data: u64) -> TaskId;

    /// One-shot timer.
    fn timeout(&mut self, after: Duration, user_data: u64) -> TaskId;

    /// Best-effort cancel. If the op already completed (or never existed)
    /// this is a no-op; otherwise the op completes with `Err(Canceled)`.
    fn cancel(&mut self, task: TaskId);

    /// Cancel every pending op whose target is `fd`, regardless of kind.
    /// Timer ops have no fd and are exempt.
    fn cancel_by_fd(&mut self, fd: RawFd);

    /// Number of operations still pending.
    fn pending(&self) -> usize;

    /// Drive the backend and return completed operations.
    ///
    /// # Errors
    ///
    /// Only fatal backend failures (e.g. the poll fd itself breaking)
    /// surface here; per-op errors are completions.
    fn poll(&mut self, mode: RunMode) -> anyhow::Result<Vec<Completion>>;
}
