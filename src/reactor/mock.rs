//! Deterministic in-process reactor backend for tests.
//!
//! No fds are touched and no wall clock is consulted. Tests drive it
//! directly: [`MockReactor::complete`] injects the completion for a
//! pending op, [`MockReactor::advance`] moves the virtual clock and fires
//! due timers. Cancel semantics are identical to the production backend,
//! which is the point — the reactor laws are asserted against both.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{Completion, OpError, OpResult, Reactor, RunMode, TaskId};

/// What a submitted op was, for test inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Accept { fd: RawFd },
    Connect { path: PathBuf },
    Read { fd: RawFd, cap: usize },
    Write { fd: RawFd, data: Vec<u8> },
    Timer { deadline: Instant },
}

impl MockOp {
    fn fd(&self) -> Option<RawFd> {
        match self {
            MockOp::Accept { fd } | MockOp::Read { fd, .. } | MockOp::Write { fd, .. } => {
                Some(*fd)
            }
            MockOp::Connect { .. } | MockOp::Timer { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Pending {
    user_data: u64,
    op: MockOp,
}

/// Test backend with a virtual clock.
#[derive(Debug)]
pub struct MockReactor {
    now: Instant,
    next_task: TaskId,
    pending: HashMap<TaskId, Pending>,
    ready: VecDeque<Completion>,
}

impl Default for MockReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReactor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            next_task: 1,
            pending: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    fn submit(&mut self, op: MockOp, user_data: u64) -> TaskId {
        let task = self.next_task;
        self.next_task += 1;
        self.pending.insert(task, Pending { user_data, op });
        task
    }

    /// The virtual now.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Inspect a pending op by task id.
    #[must_use]
    pub fn op(&self, task: TaskId) -> Option<&MockOp> {
        self.pending.get(&task).map(|p| &p.op)
    }

    /// Pending task ids, unordered.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<TaskId> {
        self.pending.keys().copied().collect()
    }

    /// Complete a pending op with an arbitrary result.
    ///
    /// Completing an unknown (or already completed) task is a no-op, the
    /// same way a late cancel is.
    pub fn complete(&mut self, task: TaskId, result: OpResult) {
        if let Some(p) = self.pending.remove(&task) {
            self.ready.push_back(Completion {
                task,
                user_data: p.user_data,
                result,
            });
        }
    }

    /// Advance the virtual clock, firing every timer that comes due, in
    /// deadline order.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        let mut due: Vec<(Instant, TaskId)> = self
            .pending
            .iter()
            .filter_map(|(task, p)| match p.op {
                MockOp::Timer { deadline } if deadline <= now => Some((deadline, *task)),
                _ => None,
            })
            .collect();
        due.sort();
        for (_, task) in due {
            self.complete(task, OpResult::TimerFired);
        }
    }
}

impl Reactor for MockReactor {
    fn accept(&mut self, fd: RawFd, user_data: u64) -> TaskId {
        self.submit(MockOp::Accept { fd }, user_data)
    }

    fn connect(&mut self, path: &Path, user_data: u64) -> TaskId {
        self.submit(
            MockOp::Connect {
                path: path.to_path_buf(),
            },
            user_data,
        )
    }

    fn read(&mut self, fd: RawFd, cap: usize, user_data: u64) -> TaskId {
        self.submit(MockOp::Read { fd, cap }, user_data)
    }

    fn write(&mut self, fd: RawFd, data: Vec<u8>, user_data: u64) -> TaskId {
        self.submit(MockOp::Write { fd, data }, user_data)
    }

    fn close(&mut self, fd: RawFd, user_data: u64) -> TaskId {
        self.cancel_by_fd(fd);
        let task = self.next_task;
        self.next_task += 1;
        self.ready.push_back(Completion {
            task,
            user_data,
            result: OpResult::Closed,
        });
        task
    }

    fn timeout(&mut self, after: Duration, user_data: u64) -> TaskId {
        let deadline = self.now + after;
        self.submit(MockOp::Timer { deadline }, user_data)
    }

    fn cancel(&mut self, task: TaskId) {
        self.complete(task, OpResult::Err(OpError::Canceled));
    }

    fn cancel_by_fd(&mut self, fd: RawFd) {
        let targets: Vec<TaskId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.op.fd() == Some(fd))
            .map(|(task, _)| *task)
            .collect();
        for task in targets {
            self.cancel(task);
        }
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn poll(&mut self, _mode: RunMode) -> anyhow::Result<Vec<Completion>> {
        // Nothing completes on its own: both modes just drain what tests
        // (or cancels) have staged.
        Ok(self.ready.drain(..).collect())
    }
}
