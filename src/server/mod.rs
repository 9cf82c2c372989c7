//! The server event core.
//!
//! One OS thread, one reactor. Everything the server does — accepting
//! clients, decoding RPC, running the script, scheduling frames — runs
//! here, driven by completion batches from [`Reactor::poll`]. The only
//! other threads are the per-PTY reader workers, which talk to this
//! thread exclusively through their dirty pipes.
//!
//! Completion routing packs an 8-bit route kind and a 56-bit id into the
//! op's `user_data`, io_uring style; [`route`] is the codec for it.
//!
//! ```text
//! accept ──> Client ── reads ──> RpcSession ──> method dispatch
//!                                    │                │
//! dirty pipe ──> FrameScheduler ── render        ScriptRuntime
//!       ▲                            │                │
//!  reader worker                 redraw fan-out   action drain
//! ```

pub mod scheduler;
pub mod sessions;

use std::fs;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use nix::fcntl::OFlag;
use rmpv::Value;

use crate::config::Config;
use crate::keys::{encode_key, KeyEvent};
use crate::pty::{SpawnOptions, EXIT_BYTE};
use crate::reactor::{Completion, OpResult, PollReactor, Reactor, RunMode, TaskId};
use crate::rpc::codec::{param_bytes, param_decode, param_u64};
use crate::rpc::{Message, OutboundKind, QueueOutcome};
use crate::script::api::Action;
use crate::script::ScriptRuntime;
use crate::term::TermEvent;

use scheduler::DirtyDecision;
use sessions::{SessionIds, SessionManager};

/// Bytes per client socket read.
const CLIENT_READ_CAP: usize = 64 * 1024;
/// Bytes per dirty-pipe drain; signals coalesce, so small is fine.
const DIRTY_READ_CAP: usize = 64;
/// How long shutdown waits for outbound queues to flush.
const SHUTDOWN_FLUSH_BUDGET: Duration = Duration::from_millis(250);
/// Backoff before re-arming accept after an accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Completion routing: 8-bit kind, 56-bit id, packed into `user_data`.
mod route {
    pub const ACCEPT: u8 = 1;
    pub const ACCEPT_RETRY: u8 = 2;
    pub const CLIENT_READ: u8 = 3;
    pub const CLIENT_WRITE: u8 = 4;
    pub const DIRTY_PIPE: u8 = 5;
    pub const RENDER_TIMER: u8 = 6;
    pub const SCRIPT_TIMER: u8 = 7;
    pub const SIGNAL: u8 = 8;
    /// Fire-and-forget; completion carries nothing actionable.
    pub const IGNORE: u8 = 9;

    const ID_MASK: u64 = (1 << 56) - 1;

    pub fn pack(kind: u8, id: u64) -> u64 {
        (u64::from(kind) << 56) | (id & ID_MASK)
    }

    pub fn unpack(user_data: u64) -> (u8, u64) {
        ((user_data >> 56) as u8, user_data & ID_MASK)
    }
}

/// The multiplexer server.
pub struct Server<R: Reactor> {
    reactor: R,
    mgr: SessionManager,
    script: ScriptRuntime,
    ids: SessionIds,
    listener: OwnedFd,
    socket_path: PathBuf,
    signal_read: Option<OwnedFd>,
    /// Script timer id -> reactor task, for cancellation.
    script_timers: std::collections::HashMap<u64, TaskId>,
    running: bool,
}

impl Server<PollReactor> {
    /// Bind the socket, set up signals, load the script.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal init: reactor creation, socket bind,
    /// script load.
    pub fn new(config: &Config) -> Result<Self> {
        let reactor = PollReactor::new().context("Failed to create reactor")?;
        let listener = bind_socket(&config.socket_path)?;
        let signal_read = match register_signal_pipe() {
            Ok(fd) => Some(fd),
            Err(e) => {
                log::warn!("signal handling unavailable: {e:#}");
                None
            }
        };

        let ids = SessionIds::default();
        let script = ScriptRuntime::new(ids.clone())?;
        script.load(config.resolve_script().as_deref())?;

        Ok(Self {
            reactor,
            mgr: SessionManager::new(),
            script,
            ids,
            listener,
            socket_path: config.socket_path.clone(),
            signal_read,
            script_timers: std::collections::HashMap::new(),
            running: true,
        })
    }
}

impl<R: Reactor> Server<R> {
    /// Run until `quit()` or a termination signal.
    ///
    /// # Errors
    ///
    /// Only fatal reactor failures escape; everything else is recovered
    /// at client or session scope.
    pub fn run(&mut self) -> Result<()> {
        self.arm_accept();
        if let Some(fd) = self.signal_read.as_ref().map(AsRawFd::as_raw_fd) {
            self.reactor.read(fd, 16, route::pack(route::SIGNAL, 0));
        }
        // The startup script may have queued its initial layout.
        self.drain_script_actions();

        while self.running {
            let batch = self.reactor.poll(RunMode::Once)?;
            for completion in batch {
                self.dispatch(completion);
            }
            self.drain_script_actions();
            self.reap_exited_sessions();
        }

        self.shutdown()?;
        Ok(())
    }

    fn dispatch(&mut self, completion: Completion) {
        let (kind, id) = route::unpack(completion.user_data);
        match kind {
            route::ACCEPT => self.on_accept(completion.result),
            route::ACCEPT_RETRY => self.arm_accept(),
            route::CLIENT_READ => self.on_client_read(id, completion.result),
            route::CLIENT_WRITE => self.on_client_write(id, completion.result),
            route::DIRTY_PIPE => self.on_dirty_pipe(id, completion.result),
            route::RENDER_TIMER => self.on_render_timer(id, completion.task, completion.result),
            route::SCRIPT_TIMER => self.on_script_timer(id, completion.result),
            route::SIGNAL => self.on_signal(completion.result),
            route::IGNORE => {}
            other => log::warn!("completion with unknown route kind {other}"),
        }
    }

    // ── Accept path ───────────────────────────────────────────────────────────

    fn arm_accept(&mut self) {
        let fd = self.listener.as_raw_fd();
        self.reactor.accept(fd, route::pack(route::ACCEPT, 0));
    }

    fn on_accept(&mut self, result: OpResult) {
        match result {
            OpResult::Accepted(fd) => {
                let owned = sessions::owned_fd_from_accept(fd);
                let client_id = self.mgr.add_client(owned).id;
                self.arm_client_read(client_id);
                self.arm_accept();
            }
            result if result.is_canceled() => {}
            other => {
                // Transient accept failures (fd exhaustion) back off
                // instead of spinning on a still-readable listener.
                log::error!("accept failed: {other:?}");
                self.reactor
                    .timeout(ACCEPT_RETRY_DELAY, route::pack(route::ACCEPT_RETRY, 0));
            }
        }
    }

    // ── Client read path ──────────────────────────────────────────────────────

    fn arm_client_read(&mut self, client_id: u64) {
        let Some(client) = self.mgr.client_ref(client_id) else {
            return;
        };
        let fd = client.fd();
        self.reactor
            .read(fd, CLIENT_READ_CAP, route::pack(route::CLIENT_READ, client_id));
    }

    fn on_client_read(&mut self, client_id: u64, result: OpResult) {
        match result {
            OpResult::Read(bytes) if bytes.is_empty() => {
                self.close_client(client_id, "EOF");
            }
            OpResult::Read(bytes) => {
                let messages = match self.mgr.client(client_id) {
                    Some(client) => client.rpc.feed(&bytes),
                    None => return,
                };
                match messages {
                    Ok(messages) => {
                        for message in messages {
                            self.handle_message(client_id, message);
                            if self.mgr.client_ref(client_id).is_none() {
                                return; // closed mid-batch
                            }
                        }
                        self.arm_client_read(client_id);
                    }
                    Err(e) => {
                        // Protocol violations cost exactly one client.
                        self.close_client(client_id, &format!("protocol violation: {e}"));
                    }
                }
            }
            result if result.is_canceled() => {}
            other => {
                self.close_client(client_id, &format!("read failed: {other:?}"));
            }
        }
    }

    fn handle_message(&mut self, client_id: u64, message: Message) {
        match message {
            Message::Request { id, method, params } => {
                let reply = match self.dispatch_method(client_id, &method, &params) {
                    Ok(result) => Message::response_ok(id, result),
                    Err(e) => {
                        log::warn!("[client {client_id}] {method} failed: {e:#}");
                        Message::response_err(id, format!("{e:#}"))
                    }
                };
                self.send_to_client(client_id, reply.encode(), OutboundKind::Other);
            }
            Message::Notification { method, params } => {
                if let Err(e) = self.dispatch_method(client_id, &method, &params) {
                    log::warn!("[client {client_id}] notification {method} failed: {e:#}");
                }
            }
            Message::Response { id, .. } => {
                let Some(client) = self.mgr.client(client_id) else {
                    return;
                };
                match client.rpc.fulfill(id) {
                    Some(pending) => {
                        log::debug!("[client {client_id}] response for '{}'", pending.method);
                    }
                    None => {
                        log::warn!("[client {client_id}] response for unknown id {id}, dropped");
                    }
                }
            }
        }
    }

    /// The server-exposed method table.
    fn dispatch_method(
        &mut self,
        client_id: u64,
        method: &str,
        params: &[Value],
    ) -> Result<Value> {
        match method {
            "attach" => {
                let session_id = param_u64(params, 0)?;
                self.mgr.attach(client_id, session_id)?;
                // A fresh subscriber gets the current screen at once.
                if let Some(bytes) = self.encode_redraw(session_id) {
                    self.send_to_client(
                        client_id,
                        bytes,
                        OutboundKind::Redraw { session: session_id },
                    );
                }
                Ok(Value::Nil)
            }
            "detach" => {
                let session_id = param_u64(params, 0)?;
                self.mgr.detach(client_id, session_id)?;
                Ok(Value::Nil)
            }
            "spawn" => {
                let opts: SpawnOptions = param_decode(params, 0)?;
                let session_id = self.ids.next();
                self.spawn_session(session_id, &opts)?;
                // The caller is attached from the first frame on; it can
                // detach if it only wanted the id.
                self.mgr.attach(client_id, session_id)?;
                Ok(Value::from(session_id))
            }
            "write" => {
                let session_id = param_u64(params, 0)?;
                let bytes = param_bytes(params, 1)?;
                let session = self
                    .mgr
                    .session(session_id)
                    .ok_or_else(|| anyhow!("unknown session: {session_id}"))?;
                session.pty.write(&bytes)?;
                Ok(Value::Nil)
            }
            "key" => {
                let session_id = param_u64(params, 0)?;
                let key: KeyEvent = param_decode(params, 1)?;
                self.handle_key(session_id, &key)?;
                Ok(Value::Nil)
            }
            "resize" => {
                let session_id = param_u64(params, 0)?;
                let cols = u16::try_from(param_u64(params, 1)?)?;
                let rows = u16::try_from(param_u64(params, 2)?)?;
                self.resize_session(session_id, cols, rows)?;
                Ok(Value::Nil)
            }
            "list_sessions" => {
                let mut rows: Vec<(u64, Value)> = self
                    .mgr
                    .sessions()
                    .map(|s| {
                        (
                            s.id,
                            Value::Map(vec![
                                (Value::from("id"), Value::from(s.id)),
                                (Value::from("title"), Value::from(s.title.as_str())),
                                (Value::from("cols"), Value::from(s.cols)),
                                (Value::from("rows"), Value::from(s.rows)),
                            ]),
                        )
                    })
                    .collect();
                rows.sort_by_key(|(id, _)| *id);
                Ok(Value::Array(rows.into_iter().map(|(_, v)| v).collect()))
            }
            "quit" => {
                log::info!("[client {client_id}] quit requested");
                self.running = false;
                Ok(Value::Nil)
            }
            unknown => bail!("unknown method: {unknown}"),
        }
    }

    /// Route a key through the script; unconsumed keys pass through to
    /// the PTY encoded for its current cursor-keys mode.
    fn handle_key(&mut self, session_id: u64, key: &KeyEvent) -> Result<()> {
        if self
            .mgr
            .session_ref(session_id)
            .is_none()
        {
            bail!("unknown session: {session_id}");
        }
        if self.script.on_key_press(session_id, key) {
            return Ok(());
        }
        let Some(session) = self.mgr.session(session_id) else {
            return Ok(()); // script tore it down; key is moot
        };
        let bytes = encode_key(key, session.application_cursor());
        session.pty.write(&bytes)
    }

    fn resize_session(&mut self, session_id: u64, cols: u16, rows: u16) -> Result<()> {
        let session = self
            .mgr
            .session(session_id)
            .ok_or_else(|| anyhow!("unknown session: {session_id}"))?;
        session.pty.resize(rows, cols)?;
        session
            .terminal
            .lock()
            .expect("terminal lock poisoned")
            .resize(rows, cols);
        session.cols = cols;
        session.rows = rows;
        self.script.on_winsize(session_id, cols, rows);
        // The grid changed shape; treat it like a dirty signal.
        self.schedule_render(session_id);
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    fn spawn_session(&mut self, session_id: u64, opts: &SpawnOptions) -> Result<()> {
        let (dirty_fd, title) = {
            let session = self.mgr.spawn(session_id, opts)?;
            (
                session.dirty_fd().expect("fresh session has a dirty pipe"),
                session.title.clone(),
            )
        };
        let task = self.reactor.read(
            dirty_fd,
            DIRTY_READ_CAP,
            route::pack(route::DIRTY_PIPE, session_id),
        );
        if let Some(session) = self.mgr.session(session_id) {
            session.dirty_task = Some(task);
        }
        self.script.set_title(session_id, &title);
        self.script.on_pty_attach(session_id);
        Ok(())
    }

    fn on_dirty_pipe(&mut self, session_id: u64, result: OpResult) {
        match result {
            OpResult::Read(bytes) => {
                let Some(session) = self.mgr.session(session_id) else {
                    return;
                };
                session.dirty_task = None;
                if bytes.is_empty() || bytes.contains(&EXIT_BYTE) {
                    // Worker exit (or pipe EOF, same thing): reap after
                    // this dispatch round, skip rendering.
                    session.exited = true;
                    return;
                }

                self.drain_term_events(session_id);
                self.schedule_render(session_id);

                // Re-arm; remaining pipe bytes re-trigger readiness.
                let Some(session) = self.mgr.session(session_id) else {
                    return;
                };
                if let Some(fd) = session.dirty_fd() {
                    let task = self.reactor.read(
                        fd,
                        DIRTY_READ_CAP,
                        route::pack(route::DIRTY_PIPE, session_id),
                    );
                    if let Some(session) = self.mgr.session(session_id) {
                        session.dirty_task = Some(task);
                    }
                }
            }
            result if result.is_canceled() => {}
            other => {
                log::warn!("[pty {session_id}] dirty pipe read failed: {other:?}");
                if let Some(session) = self.mgr.session(session_id) {
                    session.dirty_task = None;
                    session.exited = true;
                }
            }
        }
    }

    /// Surface title/bell events the worker's last batch produced.
    fn drain_term_events(&mut self, session_id: u64) {
        let events = {
            let Some(session) = self.mgr.session(session_id) else {
                return;
            };
            let mut term = session.terminal.lock().expect("terminal lock poisoned");
            term.take_events()
        };
        for event in events {
            match event {
                TermEvent::Title(title) => {
                    if let Some(session) = self.mgr.session(session_id) {
                        session.title = title.clone();
                    }
                    self.script.set_title(session_id, &title);
                    let bytes = Message::notification(
                        "title",
                        vec![Value::from(session_id), Value::from(title)],
                    )
                    .encode();
                    self.broadcast(session_id, bytes);
                }
                TermEvent::Bell => {
                    let bytes =
                        Message::notification("bell", vec![Value::from(session_id)]).encode();
                    self.broadcast(session_id, bytes);
                }
            }
        }
    }

    /// Apply the frame clamp to a dirty signal for `session_id`.
    fn schedule_render(&mut self, session_id: u64) {
        let now = Instant::now();
        let decision = match self.mgr.session(session_id) {
            Some(session) => session.scheduler.on_dirty(now),
            None => return,
        };
        match decision {
            DirtyDecision::RenderNow => self.render(session_id),
            DirtyDecision::Schedule(delay) => {
                let task = self
                    .reactor
                    .timeout(delay, route::pack(route::RENDER_TIMER, session_id));
                if let Some(session) = self.mgr.session(session_id) {
                    session.scheduler.timer_scheduled(task);
                }
            }
            DirtyDecision::AlreadyScheduled => {}
        }
    }

    fn on_render_timer(&mut self, session_id: u64, task: TaskId, result: OpResult) {
        if !matches!(result, OpResult::TimerFired) {
            return; // cancelled at teardown
        }
        let fired = match self.mgr.session(session_id) {
            Some(session) => session.scheduler.timer_fired(task),
            None => false,
        };
        if fired {
            self.render(session_id);
        }
    }

    /// Snapshot and fan out one redraw to every attached client.
    ///
    /// All clients get byte-identical payloads queued in the same tick.
    fn render(&mut self, session_id: u64) {
        let clients = self.mgr.attached_clients(session_id);
        if clients.is_empty() {
            // Output is consumed regardless; only rendering is skipped.
            if let Some(session) = self.mgr.session(session_id) {
                session.scheduler.mark_rendered(Instant::now());
            }
            return;
        }
        let Some(bytes) = self.encode_redraw(session_id) else {
            return;
        };
        for client_id in clients {
            self.send_to_client(
                client_id,
                bytes.clone(),
                OutboundKind::Redraw { session: session_id },
            );
        }
        if let Some(session) = self.mgr.session(session_id) {
            session.scheduler.mark_rendered(Instant::now());
        }
    }

    fn encode_redraw(&self, session_id: u64) -> Option<Vec<u8>> {
        let session = self.mgr.session_ref(session_id)?;
        let frame = session
            .terminal
            .lock()
            .expect("terminal lock poisoned")
            .snapshot();
        let frame_value = match rmpv::ext::to_value(&frame) {
            Ok(value) => value,
            Err(e) => {
                log::error!("[pty {session_id}] frame serialization failed: {e}");
                return None;
            }
        };
        Some(
            Message::notification("redraw", vec![Value::from(session_id), frame_value]).encode(),
        )
    }

    fn reap_exited_sessions(&mut self) {
        for session_id in self.mgr.exited_sessions() {
            self.destroy_session(session_id);
        }
    }

    /// Teardown in the safe order: cancel reactor ops on the session's
    /// fds, kill/reap the child (unblocking the worker), join the
    /// worker, close fds, then post the final `pty_exited`.
    fn destroy_session(&mut self, session_id: u64) {
        let (timer, dirty_fd) = match self.mgr.session(session_id) {
            Some(session) => (session.scheduler.take_timer(), session.dirty_fd()),
            None => return,
        };
        if let Some(timer) = timer {
            self.reactor.cancel(timer);
        }
        if let Some(fd) = dirty_fd {
            self.reactor.cancel_by_fd(fd);
        }

        let attached = self.mgr.attached_clients(session_id);
        // The exit byte can share a drain with the child's last output;
        // post one final frame so clients see it before `pty_exited`.
        if !attached.is_empty() {
            self.render(session_id);
        }
        let Some(session) = self.mgr.take_session(session_id) else {
            return;
        };
        let status = session.teardown();
        log::info!("[pty {session_id}] destroyed (exit status {status:?})");

        self.script.on_pty_exited(session_id);
        self.script.remove_pty(session_id);

        let status_value = status.map_or(Value::Nil, Value::from);
        let bytes = Message::notification(
            "pty_exited",
            vec![Value::from(session_id), status_value],
        )
        .encode();
        for client_id in attached {
            self.send_to_client(client_id, bytes.clone(), OutboundKind::Other);
        }
    }

    // ── Client write path ─────────────────────────────────────────────────────

    fn broadcast(&mut self, session_id: u64, bytes: Vec<u8>) {
        for client_id in self.mgr.attached_clients(session_id) {
            self.send_to_client(client_id, bytes.clone(), OutboundKind::Other);
        }
    }

    fn send_to_client(&mut self, client_id: u64, bytes: Vec<u8>, kind: OutboundKind) {
        let outcome = match self.mgr.client(client_id) {
            Some(client) => client.rpc.queue(bytes, kind),
            None => return,
        };
        match outcome {
            QueueOutcome::StartWrite => self.start_client_write(client_id),
            QueueOutcome::WriteInFlight => {}
            QueueOutcome::Overflow => {
                self.close_client(client_id, "outbound queue overflow");
            }
        }
    }

    fn start_client_write(&mut self, client_id: u64) {
        let (fd, batch) = match self.mgr.client(client_id) {
            Some(client) => match client.rpc.take_write_batch() {
                Some(batch) => (client.fd(), batch),
                None => return,
            },
            None => return,
        };
        let task = self
            .reactor
            .write(fd, batch, route::pack(route::CLIENT_WRITE, client_id));
        if let Some(client) = self.mgr.client(client_id) {
            client.rpc.write_started(task);
        }
    }

    fn on_client_write(&mut self, client_id: u64, result: OpResult) {
        match result {
            OpResult::Wrote(_) => {
                if let Some(client) = self.mgr.client(client_id) {
                    client.rpc.write_finished();
                }
                // Anything queued while the write was in flight goes out
                // as the next coalesced buffer.
                self.start_client_write(client_id);
            }
            result if result.is_canceled() => {}
            other => {
                self.close_client(client_id, &format!("write failed: {other:?}"));
            }
        }
    }

    fn close_client(&mut self, client_id: u64, reason: &str) {
        let Some(client) = self.mgr.remove_client(client_id) else {
            return;
        };
        log::info!("[client {client_id}] closing: {reason}");
        // Reactor::close cancels every pending op on the socket before
        // the fd goes away; never close out from under a pending op.
        let fd = client.into_fd();
        self.reactor
            .close(fd.into_raw_fd(), route::pack(route::IGNORE, 0));
    }

    // ── Script actions ────────────────────────────────────────────────────────

    /// Drain script-queued actions until quiescent (actions may fire
    /// events that queue more actions).
    fn drain_script_actions(&mut self) {
        loop {
            let actions = self.script.drain_actions();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                self.apply_action(action);
            }
        }
    }

    fn apply_action(&mut self, action: Action) {
        match action {
            Action::Spawn { id, opts } => {
                if let Err(e) = self.spawn_session(id, &opts) {
                    log::error!("script spawn failed: {e:#}");
                }
            }
            Action::Write { pty, bytes } => match self.mgr.session(pty) {
                Some(session) => {
                    if let Err(e) = session.pty.write(&bytes) {
                        log::warn!("script write to pty {pty} failed: {e:#}");
                    }
                }
                None => log::warn!("script write to dead pty {pty} ignored"),
            },
            Action::SendKey { pty, key } => match self.mgr.session(pty) {
                Some(session) => {
                    let bytes = encode_key(&key, session.application_cursor());
                    if let Err(e) = session.pty.write(&bytes) {
                        log::warn!("script send_key to pty {pty} failed: {e:#}");
                    }
                }
                None => log::warn!("script send_key to dead pty {pty} ignored"),
            },
            Action::RequestFrame { pty } => self.schedule_render(pty),
            Action::StartTimer { timer, ms } => {
                let task = self.reactor.timeout(
                    Duration::from_millis(ms),
                    route::pack(route::SCRIPT_TIMER, timer),
                );
                self.script_timers.insert(timer, task);
            }
            Action::CancelTimer { timer } => {
                if let Some(task) = self.script_timers.remove(&timer) {
                    self.reactor.cancel(task);
                }
            }
            Action::Quit => {
                log::info!("script requested quit");
                self.running = false;
            }
        }
    }

    fn on_script_timer(&mut self, timer: u64, result: OpResult) {
        self.script_timers.remove(&timer);
        if matches!(result, OpResult::TimerFired) {
            self.script.fire_timer(timer);
        }
    }

    // ── Signals & shutdown ────────────────────────────────────────────────────

    fn on_signal(&mut self, result: OpResult) {
        match result {
            OpResult::Read(bytes) if !bytes.is_empty() => {
                log::info!("termination signal received");
                self.running = false;
            }
            _ => {}
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        log::info!("shutting down");

        let session_ids: Vec<u64> = self.mgr.sessions().map(|s| s.id).collect();
        for session_id in session_ids {
            self.destroy_session(session_id);
        }

        self.flush_clients()?;
        for client_id in self.mgr.client_ids() {
            self.close_client(client_id, "server shutdown");
        }

        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to unlink socket: {e}");
            }
        }
        Ok(())
    }

    /// Give queued replies (quit responses, final pty_exited) a bounded
    /// chance to reach their sockets before the fds close.
    fn flush_clients(&mut self) -> Result<()> {
        // Kick a write for anything still queued.
        for client_id in self.mgr.client_ids() {
            let needs_kick = self
                .mgr
                .client_ref(client_id)
                .is_some_and(|c| !c.rpc.write_in_flight() && c.rpc.queued_bytes() > 0);
            if needs_kick {
                self.start_client_write(client_id);
            }
        }

        let guard = self
            .reactor
            .timeout(SHUTDOWN_FLUSH_BUDGET, route::pack(route::IGNORE, 0));
        loop {
            let pending_writes = self.mgr.client_ids().into_iter().any(|id| {
                self.mgr
                    .client_ref(id)
                    .is_some_and(|c| c.rpc.write_in_flight() || c.rpc.queued_bytes() > 0)
            });
            if !pending_writes {
                self.reactor.cancel(guard);
                return Ok(());
            }
            let batch = self.reactor.poll(RunMode::Once)?;
            let mut expired = false;
            for completion in batch {
                if completion.task == guard {
                    expired = true;
                    continue;
                }
                let (kind, id) = route::unpack(completion.user_data);
                if kind == route::CLIENT_WRITE {
                    self.on_client_write(id, completion.result);
                }
            }
            if expired {
                log::warn!("shutdown flush budget expired with writes pending");
                return Ok(());
            }
        }
    }
}

/// Bind the listening socket: validate `sun_path` length, unlink any
/// stale file, bind, restrict to owner, go non-blocking.
fn bind_socket(path: &Path) -> Result<OwnedFd> {
    // sun_path is 104 bytes on macOS, 108 on Linux; use the conservative
    // limit.
    const MAX_SOCKET_PATH: usize = 104;
    let path_len = path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        bail!(
            "Socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            path.display()
        );
    }

    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind socket: {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    listener.set_nonblocking(true)?;

    log::info!("listening on {}", path.display());
    Ok(OwnedFd::from(listener))
}

/// SIGINT/SIGTERM write a byte into a self-pipe; the reactor reads the
/// other end like any dirty pipe. The write end is intentionally leaked
/// to the signal handlers for the process lifetime.
fn register_signal_pipe() -> Result<OwnedFd> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
        .context("Failed to create signal pipe")?;
    let write_raw = write_end.into_raw_fd();
    signal_hook::low_level::pipe::register_raw(signal_hook::consts::SIGINT, write_raw)
        .context("Failed to register SIGINT")?;
    signal_hook::low_level::pipe::register_raw(signal_hook::consts::SIGTERM, write_raw)
        .context("Failed to register SIGTERM")?;
    Ok(read_end)
}
