//! Readiness-based reactor backend.
//!
//! `mio::Poll` (epoll / kqueue) watches raw fds; the actual syscall for a
//! submitted op is performed when the kernel reports the fd ready for the
//! relevant direction. One token per fd, with independent read-side and
//! write-side task slots, so a socket can have a pending read and a
//! pending write at the same time.
//!
//! Timers live in a binary heap and drive the poll timeout; cancelled
//! timer entries are pruned lazily when they surface at the top.
//!
//! `connect` follows the classic non-blocking shape: issue `connect(2)`,
//! wait for writability, then read `SO_ERROR` to learn the verdict.
//! `close` and socket creation need no suspension and execute
//! synchronously, with the close completion still delivered through
//! [`Reactor::poll`] like every other op.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::{Completion, OpError, OpResult, Reactor, RunMode, TaskId};

/// Capacity of the `mio::Events` batch buffer.
const EVENTS_CAPACITY: usize = 256;

#[derive(Debug)]
enum Op {
    Accept { fd: RawFd },
    Connect { fd: RawFd },
    Read { fd: RawFd, cap: usize },
    Write { fd: RawFd, data: Vec<u8>, written: usize },
    /// Deadline bookkeeping lives in the timer heap.
    Timer,
}

impl Op {
    fn fd(&self) -> Option<RawFd> {
        match self {
            Op::Accept { fd }
            | Op::Connect { fd }
            | Op::Read { fd, .. }
            | Op::Write { fd, .. } => Some(*fd),
            Op::Timer => None,
        }
    }

    /// Whether this op waits on write-side readiness.
    fn is_write_side(&self) -> bool {
        matches!(self, Op::Connect { .. } | Op::Write { .. })
    }
}

#[derive(Debug)]
struct Task {
    user_data: u64,
    op: Op,
}

/// Per-fd pending-op slots plus the currently registered interest.
#[derive(Debug, Default)]
struct FdSlots {
    read: Option<TaskId>,
    write: Option<TaskId>,
    registered: Option<Interest>,
}

/// The production reactor backend.
pub struct PollReactor {
    poll: Poll,
    events: Events,
    next_task: TaskId,
    tasks: HashMap<TaskId, Task>,
    fds: HashMap<RawFd, FdSlots>,
    timers: BinaryHeap<Reverse<(Instant, TaskId)>>,
    /// Completions produced outside the poll cycle (cancels, sync ops,
    /// submit-time failures), delivered with the next batch.
    ready: VecDeque<Completion>,
}

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("pending", &self.tasks.len())
            .field("fds", &self.fds.len())
            .field("ready", &self.ready.len())
            .finish_non_exhaustive()
    }
}

impl PollReactor {
    /// Create the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poll instance cannot be created — a
    /// fatal startup condition.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            next_task: 1,
            tasks: HashMap::new(),
            fds: HashMap::new(),
            timers: BinaryHeap::new(),
            ready: VecDeque::new(),
        })
    }

    fn alloc_task(&mut self) -> TaskId {
        let task = self.next_task;
        self.next_task += 1;
        task
    }

    fn push_ready(&mut self, task: TaskId, user_data: u64, result: OpResult) {
        self.ready.push_back(Completion {
            task,
            user_data,
            result,
        });
    }

    /// Register/reregister/deregister `fd` so the kernel interest matches
    /// the occupied slots. Removes the fd entry when both slots are empty.
    fn update_registration(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(slots) = self.fds.get(&fd) else {
            return Ok(());
        };
        let want = match (slots.read.is_some(), slots.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let current = slots.registered;
        let mut source = SourceFd(&fd);
        match (current, want) {
            (None, Some(interest)) => {
                self.poll
                    .registry()
                    .register(&mut source, Token(fd as usize), interest)?;
                if let Some(slots) = self.fds.get_mut(&fd) {
                    slots.registered = Some(interest);
                }
            }
            (Some(_), None) => {
                let res = self.poll.registry().deregister(&mut source);
                self.fds.remove(&fd);
                res?;
            }
            (Some(current), Some(interest)) if current != interest => {
                self.poll
                    .registry()
                    .reregister(&mut source, Token(fd as usize), interest)?;
                if let Some(slots) = self.fds.get_mut(&fd) {
                    slots.registered = Some(interest);
                }
            }
            (None, None) => {
                self.fds.remove(&fd);
            }
            _ => {}
        }
        Ok(())
    }

    fn submit_fd_op(&mut self, fd: RawFd, op: Op, user_data: u64) -> TaskId {
        let task = self.alloc_task();
        let write_side = op.is_write_side();

        let occupied = {
            let slots = self.fds.entry(fd).or_default();
            let slot = if write_side {
                &mut slots.write
            } else {
                &mut slots.read
            };
            if slot.is_some() {
                true
            } else {
                *slot = Some(task);
                false
            }
        };
        if occupied {
            // One op per direction per fd; a second submission is a bug
            // in the caller, surfaced as a normal completion.
            self.push_ready(task, user_data, OpResult::Err(OpError::Os { errno: libc::EBUSY }));
            return task;
        }
        self.tasks.insert(task, Task { user_data, op });

        if let Err(e) = self.update_registration(fd) {
            if let Some(entry) = self.tasks.remove(&task) {
                self.clear_slot(fd, task);
                let _ = self.update_registration(fd); // drop the empty entry
                let errno = e.raw_os_error().unwrap_or(libc::EINVAL);
                self.push_ready(task, entry.user_data, OpResult::Err(OpError::from_errno(errno)));
            }
        }
        task
    }

    fn clear_slot(&mut self, fd: RawFd, task: TaskId) {
        if let Some(slots) = self.fds.get_mut(&fd) {
            if slots.read == Some(task) {
                slots.read = None;
            }
            if slots.write == Some(task) {
                slots.write = None;
            }
        }
    }

    /// Remove a completed fd op and emit its completion.
    fn finish_fd_op(&mut self, task: TaskId, out: &mut Vec<Completion>, result: OpResult) {
        if let Some(entry) = self.tasks.remove(&task) {
            if let Some(fd) = entry.op.fd() {
                self.clear_slot(fd, task);
                let _ = self.update_registration(fd);
            }
            out.push(Completion {
                task,
                user_data: entry.user_data,
                result,
            });
        }
    }

    fn perform_read_side(&mut self, task: TaskId, out: &mut Vec<Completion>) {
        enum ReadKind {
            Accept(RawFd),
            Read(RawFd, usize),
        }
        let kind = match self.tasks.get(&task).map(|t| &t.op) {
            Some(Op::Accept { fd }) => ReadKind::Accept(*fd),
            Some(Op::Read { fd, cap }) => ReadKind::Read(*fd, *cap),
            _ => return,
        };
        match kind {
            ReadKind::Accept(fd) => loop {
                let r = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
                if r >= 0 {
                    if let Err(e) = set_nonblocking_cloexec(r) {
                        unsafe { libc::close(r) };
                        let errno = e.raw_os_error().unwrap_or(libc::EINVAL);
                        self.finish_fd_op(task, out, OpResult::Err(OpError::from_errno(errno)));
                    } else {
                        self.finish_fd_op(task, out, OpResult::Accepted(r));
                    }
                    return;
                }
                match errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => return, // spurious wakeup, stay armed
                    e => {
                        self.finish_fd_op(task, out, OpResult::Err(OpError::from_errno(e)));
                        return;
                    }
                }
            },
            ReadKind::Read(fd, cap) => {
                let mut buf = vec![0u8; cap];
                loop {
                    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), cap) };
                    if n >= 0 {
                        buf.truncate(n as usize);
                        self.finish_fd_op(task, out, OpResult::Read(buf));
                        return;
                    }
                    match errno() {
                        libc::EINTR => continue,
                        libc::EAGAIN => return,
                        e => {
                            self.finish_fd_op(task, out, OpResult::Err(OpError::from_errno(e)));
                            return;
                        }
                    }
                }
            }
        }
    }

    fn perform_write_side(&mut self, task: TaskId, out: &mut Vec<Completion>) {
        let fd = match self.tasks.get(&task).map(|t| &t.op) {
            Some(Op::Connect { fd }) => {
                let fd = *fd;
                let verdict = socket_error(fd)
                    .unwrap_or_else(|e| e.raw_os_error().unwrap_or(libc::EINVAL));
                if verdict == 0 {
                    self.finish_fd_op(task, out, OpResult::Connected(fd));
                } else {
                    self.finish_fd_op(task, out, OpResult::Err(OpError::from_errno(verdict)));
                    unsafe { libc::close(fd) };
                }
                return;
            }
            Some(Op::Write { fd, .. }) => *fd,
            _ => return,
        };

        enum Step {
            Done(usize),
            Retry,
            Again,
            Fail(i32),
        }
        loop {
            let step = {
                let Some(Task {
                    op: Op::Write { data, written, .. },
                    ..
                }) = self.tasks.get_mut(&task)
                else {
                    return;
                };
                let remaining = data.len() - *written;
                let n =
                    unsafe { libc::write(fd, data.as_ptr().add(*written).cast(), remaining) };
                if n >= 0 {
                    *written += n as usize;
                    if *written == data.len() {
                        Step::Done(*written)
                    } else {
                        // Short write without EAGAIN: keep pushing, the
                        // edge may not fire again on its own.
                        Step::Retry
                    }
                } else {
                    match errno() {
                        libc::EINTR => Step::Retry,
                        libc::EAGAIN => Step::Again,
                        e => Step::Fail(e),
                    }
                }
            };
            match step {
                Step::Done(total) => {
                    self.finish_fd_op(task, out, OpResult::Wrote(total));
                    return;
                }
                Step::Retry => continue,
                Step::Again => return,
                Step::Fail(e) => {
                    self.finish_fd_op(task, out, OpResult::Err(OpError::from_errno(e)));
                    return;
                }
            }
        }
    }

    /// Drop cancelled timer entries sitting at the top of the heap.
    fn prune_timers(&mut self) {
        while let Some(Reverse((_, task))) = self.timers.peek() {
            if self.tasks.contains_key(task) {
                break;
            }
            self.timers.pop();
        }
    }

    fn fire_due_timers(&mut self, out: &mut Vec<Completion>) {
        let now = Instant::now();
        loop {
            self.prune_timers();
            match self.timers.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {
                    let Reverse((_, task)) = self.timers.pop().expect("peeked entry");
                    if let Some(entry) = self.tasks.remove(&task) {
                        out.push(Completion {
                            task,
                            user_data: entry.user_data,
                            result: OpResult::TimerFired,
                        });
                    }
                }
                _ => break,
            }
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        self.prune_timers();
        self.timers.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn poll_once(&mut self) -> anyhow::Result<Vec<Completion>> {
        let mut out: Vec<Completion> = self.ready.drain(..).collect();
        self.fire_due_timers(&mut out);

        // Block only when nothing is deliverable yet; with zero pending
        // ops a bare poll returns an empty batch instead of hanging.
        let timeout = if !out.is_empty() || self.tasks.is_empty() {
            Some(Duration::ZERO)
        } else {
            self.next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(out),
            Err(e) => return Err(e.into()),
        }

        // Collect first so dispatch can take &mut self.
        let ready: Vec<(RawFd, bool, bool)> = self
            .events
            .iter()
            .map(|ev| {
                let fd = ev.token().0 as RawFd;
                let readable = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                let writable = ev.is_writable() || ev.is_write_closed() || ev.is_error();
                (fd, readable, writable)
            })
            .collect();

        for (fd, readable, writable) in ready {
            if readable {
                if let Some(task) = self.fds.get(&fd).and_then(|s| s.read) {
                    self.perform_read_side(task, &mut out);
                }
            }
            if writable {
                if let Some(task) = self.fds.get(&fd).and_then(|s| s.write) {
                    self.perform_write_side(task, &mut out);
                }
            }
        }

        self.fire_due_timers(&mut out);
        Ok(out)
    }
}

impl Reactor for PollReactor {
    fn accept(&mut self, fd: RawFd, user_data: u64) -> TaskId {
        self.submit_fd_op(fd, Op::Accept { fd }, user_data)
    }

    fn connect(&mut self, path: &Path, user_data: u64) -> TaskId {
        let fd = match unix_socket() {
            Ok(fd) => fd,
            Err(e) => {
                let task = self.alloc_task();
                let errno = e.raw_os_error().unwrap_or(libc::EINVAL);
                self.push_ready(task, user_data, OpResult::Err(OpError::from_errno(errno)));
                return task;
            }
        };
        let raw = std::os::fd::IntoRawFd::into_raw_fd(fd);

        let (addr, len) = match unix_sockaddr(path) {
            Ok(pair) => pair,
            Err(e) => {
                unsafe { libc::close(raw) };
                let task = self.alloc_task();
                let errno = e.raw_os_error().unwrap_or(libc::EINVAL);
                self.push_ready(task, user_data, OpResult::Err(OpError::from_errno(errno)));
                return task;
            }
        };

        let r = unsafe { libc::connect(raw, std::ptr::addr_of!(addr).cast(), len) };
        if r == 0 {
            let task = self.alloc_task();
            self.push_ready(task, user_data, OpResult::Connected(raw));
            return task;
        }
        match errno() {
            libc::EINPROGRESS => self.submit_fd_op(raw, Op::Connect { fd: raw }, user_data),
            e => {
                unsafe { libc::close(raw) };
                let task = self.alloc_task();
                self.push_ready(task, user_data, OpResult::Err(OpError::from_errno(e)));
                task
            }
        }
    }

    fn read(&mut self, fd: RawFd, cap: usize, user_data: u64) -> TaskId {
        self.submit_fd_op(fd, Op::Read { fd, cap }, user_data)
    }

    fn write(&mut self, fd: RawFd, data: Vec<u8>, user_data: u64) -> TaskId {
        self.submit_fd_op(
            fd,
            Op::Write {
                fd,
                data,
                written: 0,
            },
            user_data,
        )
    }

    fn close(&mut self, fd: RawFd, user_data: u64) -> TaskId {
        // Never close an fd out from under a pending op.
        self.cancel_by_fd(fd);
        let task = self.alloc_task();
        let result = if unsafe { libc::close(fd) } == 0 {
            OpResult::Closed
        } else {
            OpResult::Err(OpError::from_errno(errno()))
        };
        self.push_ready(task, user_data, result);
        task
    }

    fn timeout(&mut self, after: Duration, user_data: u64) -> TaskId {
        let task = self.alloc_task();
        let deadline = Instant::now() + after;
        self.tasks.insert(
            task,
            Task {
                user_data,
                op: Op::Timer,
            },
        );
        self.timers.push(Reverse((deadline, task)));
        task
    }

    fn cancel(&mut self, task: TaskId) {
        let Some(entry) = self.tasks.remove(&task) else {
            return; // already completed or never existed
        };
        if let Some(fd) = entry.op.fd() {
            self.clear_slot(fd, task);
            let _ = self.update_registration(fd);
            if let Op::Connect { fd } = entry.op {
                // The in-flight connect socket is reactor-owned.
                unsafe { libc::close(fd) };
            }
        }
        self.push_ready(task, entry.user_data, OpResult::Err(OpError::Canceled));
    }

    fn cancel_by_fd(&mut self, fd: RawFd) {
        let Some(slots) = self.fds.get(&fd) else {
            return;
        };
        let pending: Vec<TaskId> = slots.read.into_iter().chain(slots.write).collect();
        for task in pending {
            self.cancel(task);
        }
    }

    fn pending(&self) -> usize {
        self.tasks.len()
    }

    fn poll(&mut self, mode: RunMode) -> anyhow::Result<Vec<Completion>> {
        match mode {
            RunMode::Once => self.poll_once(),
            RunMode::UntilDone => {
                let mut out = Vec::new();
                while !self.tasks.is_empty() || !self.ready.is_empty() {
                    out.extend(self.poll_once()?);
                }
                Ok(out)
            }
        }
    }
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a non-blocking unix stream socket.
///
/// Socket creation needs no suspension on the readiness backend, so this
/// is a plain synchronous call.
pub fn unix_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking_cloexec(fd)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn unix_sockaddr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long for sun_path",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let base = std::mem::size_of::<libc::sockaddr_un>() - addr.sun_path.len();
    Ok((addr, (base + bytes.len() + 1) as libc::socklen_t))
}

fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let r = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}
