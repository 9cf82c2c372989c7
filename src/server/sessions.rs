//! Session and client tables.
//!
//! Clients and PTY sessions reference each other, so both live in flat
//! id-keyed tables and every cross-reference is an id. Destruction is
//! id-driven: removing either side walks the adjacency and cleans up the
//! other's reference, never a dangling pointer.

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};

use crate::pty::{self, PtyHandle, SpawnOptions};
use crate::reactor::TaskId;
use crate::rpc::RpcSession;
use crate::server::scheduler::FrameScheduler;
use crate::term::Terminal;

/// Session id allocator, shared between the RPC path and the script
/// bridge (`prise.spawn` must hand a live id back synchronously).
///
/// Ids start at 1 and are never reused within a process lifetime.
#[derive(Debug, Clone, Default)]
pub struct SessionIds(Arc<Mutex<u64>>);

impl SessionIds {
    #[must_use]
    pub fn next(&self) -> u64 {
        let mut counter = self.0.lock().expect("session id counter poisoned");
        *counter += 1;
        *counter
    }
}

/// One live PTY session.
pub struct PtySession {
    pub id: u64,
    pub title: String,
    pub cols: u16,
    pub rows: u16,
    pub pty: PtyHandle,
    pub terminal: Arc<Mutex<Terminal>>,
    pub scheduler: FrameScheduler,
    /// Armed reactor read on the dirty pipe.
    pub dirty_task: Option<TaskId>,
    /// Clients subscribed to redraws.
    pub clients: HashSet<u64>,
    /// Worker exit observed; session is awaiting teardown.
    pub exited: bool,
    dirty_read: Option<OwnedFd>,
    reader: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("clients", &self.clients.len())
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Read end of the dirty pipe, registered with the reactor.
    #[must_use]
    pub fn dirty_fd(&self) -> Option<RawFd> {
        self.dirty_read.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Whether the terminal is in application cursor-keys mode.
    #[must_use]
    pub fn application_cursor(&self) -> bool {
        self.terminal
            .lock()
            .expect("terminal lock poisoned")
            .application_cursor()
    }

    /// Final teardown: kill and reap the child (unblocking the worker's
    /// read), join the worker, close the pipe and PTY fds.
    ///
    /// The caller must have cancelled the session's reactor ops first.
    /// Returns the child exit status when one was collected.
    pub fn teardown(mut self) -> Option<u32> {
        let status = self.pty.kill();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("[pty {}] reader thread panicked", self.id);
            }
        }
        self.dirty_read.take();
        status
    }
}

/// A connected client.
pub struct Client {
    pub id: u64,
    pub rpc: RpcSession,
    /// Sessions this client subscribes to.
    pub attached: HashSet<u64>,
    fd: OwnedFd,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("fd", &self.fd.as_raw_fd())
            .field("attached", &self.attached.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Take ownership of the socket fd so the caller can close it
    /// explicitly (through the reactor) instead of on drop.
    #[must_use]
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

/// The flat tables plus lifecycle operations. Main thread only.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<u64, PtySession>,
    clients: HashMap<u64, Client>,
    next_client_id: u64,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a PTY session under a pre-allocated id: open the PTY, start
    /// the emulator and the reader worker, wire the dirty pipe.
    ///
    /// The caller registers the dirty-pipe read with the reactor.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY cannot be opened or the child cannot
    /// be spawned; nothing is left behind on failure.
    pub fn spawn(&mut self, id: u64, opts: &SpawnOptions) -> Result<&mut PtySession> {
        let (pty, reader) = PtyHandle::open(opts)?;
        let terminal = Arc::new(Mutex::new(Terminal::new(opts.rows, opts.cols)));
        let (dirty_read, dirty_write) = pty::dirty_pipe()?;

        let reader_handle = pty::spawn_reader(
            id,
            reader,
            Arc::clone(&terminal),
            pty.shared_writer(),
            dirty_write,
        );

        let title = default_title(opts);
        log::info!("[pty {id}] spawned {:?} ({}x{})", opts.argv, opts.cols, opts.rows);

        let session = PtySession {
            id,
            title,
            cols: opts.cols,
            rows: opts.rows,
            pty,
            terminal,
            scheduler: FrameScheduler::new(),
            dirty_task: None,
            clients: HashSet::new(),
            exited: false,
            dirty_read: Some(dirty_read),
            reader: Some(reader_handle),
        };
        Ok(self.sessions.entry(id).or_insert(session))
    }

    pub fn session(&mut self, id: u64) -> Option<&mut PtySession> {
        self.sessions.get_mut(&id)
    }

    #[must_use]
    pub fn session_ref(&self, id: u64) -> Option<&PtySession> {
        self.sessions.get(&id)
    }

    /// Remove a session from the table for teardown.
    pub fn take_session(&mut self, id: u64) -> Option<PtySession> {
        let session = self.sessions.remove(&id)?;
        for client_id in &session.clients {
            if let Some(client) = self.clients.get_mut(client_id) {
                client.attached.remove(&id);
            }
        }
        Some(session)
    }

    /// Ids of sessions whose worker has exited.
    #[must_use]
    pub fn exited_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| s.exited)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PtySession> {
        self.sessions.values()
    }

    /// Register an accepted client socket.
    pub fn add_client(&mut self, fd: OwnedFd) -> &mut Client {
        self.next_client_id += 1;
        let id = self.next_client_id;
        log::info!("[client {id}] connected (fd {})", fd.as_raw_fd());
        self.clients.entry(id).or_insert(Client {
            id,
            rpc: RpcSession::new(),
            attached: HashSet::new(),
            fd,
        })
    }

    pub fn client(&mut self, id: u64) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    #[must_use]
    pub fn client_ref(&self, id: u64) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.clients.keys().copied().collect()
    }

    /// Remove a client, clearing the attach adjacency. The socket fd
    /// closes when the returned value drops.
    pub fn remove_client(&mut self, id: u64) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        for session_id in &client.attached {
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.clients.remove(&id);
            }
        }
        log::info!("[client {id}] removed");
        Some(client)
    }

    /// Subscribe `client_id` to `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if either id is unknown.
    pub fn attach(&mut self, client_id: u64, session_id: u64) -> Result<()> {
        if !self.clients.contains_key(&client_id) {
            bail!("unknown client: {client_id}");
        }
        let session = self
            .sessions
            .get_mut(&session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;
        session.clients.insert(client_id);
        self.clients
            .get_mut(&client_id)
            .expect("checked above")
            .attached
            .insert(session_id);
        Ok(())
    }

    /// Unsubscribe `client_id` from `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown.
    pub fn detach(&mut self, client_id: u64, session_id: u64) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;
        session.clients.remove(&client_id);
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.attached.remove(&session_id);
        }
        Ok(())
    }

    /// Clients attached to a session, sorted for deterministic fan-out.
    #[must_use]
    pub fn attached_clients(&self, session_id: u64) -> Vec<u64> {
        let Some(session) = self.sessions.get(&session_id) else {
            return Vec::new();
        };
        let mut ids: Vec<u64> = session.clients.iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn default_title(opts: &SpawnOptions) -> String {
    opts.argv
        .first()
        .map(|argv0| {
            std::path::Path::new(argv0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| argv0.clone())
        })
        .unwrap_or_default()
}

/// Wrap an accepted raw fd. The fd must be owned by no one else.
#[must_use]
pub fn owned_fd_from_accept(fd: RawFd) -> OwnedFd {
    // Safety: the reactor hands out each accepted fd exactly once.
    unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) }
}

/// Dummy socketpair end for tests that need a client fd.
#[cfg(test)]
fn test_fd() -> OwnedFd {
    let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
    // Leak the peer; the test only needs a valid fd number.
    std::mem::forget(_b);
    OwnedFd::from(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_opts() -> SpawnOptions {
        SpawnOptions {
            argv: vec!["/bin/echo".to_string(), "hello".to_string()],
            ..SpawnOptions::default()
        }
    }

    #[test]
    fn test_session_ids_are_unique_and_monotonic() {
        let ids = SessionIds::default();
        let a = ids.next();
        let b = ids.next();
        let from_clone = ids.clone().next();
        assert!(a < b && b < from_clone);
    }

    #[test]
    fn test_spawn_attach_detach_adjacency() {
        let mut mgr = SessionManager::new();
        let ids = SessionIds::default();
        let sid = ids.next();
        mgr.spawn(sid, &echo_opts()).unwrap();

        let cid = mgr.add_client(test_fd()).id;
        mgr.attach(cid, sid).unwrap();
        assert_eq!(mgr.attached_clients(sid), vec![cid]);
        assert!(mgr.client_ref(cid).unwrap().attached.contains(&sid));

        mgr.detach(cid, sid).unwrap();
        assert!(mgr.attached_clients(sid).is_empty());

        let session = mgr.take_session(sid).unwrap();
        session.teardown();
    }

    #[test]
    fn test_attach_unknown_session_fails() {
        let mut mgr = SessionManager::new();
        let cid = mgr.add_client(test_fd()).id;
        assert!(mgr.attach(cid, 404).is_err());
    }

    #[test]
    fn test_remove_client_clears_session_side() {
        let mut mgr = SessionManager::new();
        let ids = SessionIds::default();
        let sid = ids.next();
        mgr.spawn(sid, &echo_opts()).unwrap();

        let cid = mgr.add_client(test_fd()).id;
        mgr.attach(cid, sid).unwrap();
        mgr.remove_client(cid);
        assert!(mgr.attached_clients(sid).is_empty());

        mgr.take_session(sid).unwrap().teardown();
    }

    #[test]
    fn test_take_session_clears_client_side() {
        let mut mgr = SessionManager::new();
        let ids = SessionIds::default();
        let sid = ids.next();
        mgr.spawn(sid, &echo_opts()).unwrap();

        let cid = mgr.add_client(test_fd()).id;
        mgr.attach(cid, sid).unwrap();

        mgr.take_session(sid).unwrap().teardown();
        assert!(!mgr.client_ref(cid).unwrap().attached.contains(&sid));
    }

    #[test]
    fn test_default_title_is_argv0_basename() {
        let opts = SpawnOptions {
            argv: vec!["/usr/bin/vim".to_string(), "file".to_string()],
            ..SpawnOptions::default()
        };
        assert_eq!(default_title(&opts), "vim");
    }
}
