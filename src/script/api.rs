//! Lua primitives for the script bridge.
//!
//! # Design principle: "the script decides, the server acts"
//!
//! Scripts never touch server state directly. Every primitive either
//! reads a shared snapshot (titles) or pushes an [`Action`] onto a queue
//! the server drains after each dispatch, converting actions into
//! reactor submissions and session-manager calls. Handles given to Lua
//! (`pty`, `timer`) are opaque ids resolved per call — a handle whose
//! target died makes the action a logged no-op, never a dangling
//! reference.
//!
//! # Usage in Lua
//!
//! ```lua
//! local pty = prise.spawn{argv = {"/bin/sh"}, cols = 80, rows = 24}
//! pty:write("ls\n")
//!
//! prise.on("key_press", function(ev)
//!   return ev.key == "q" and ev.ctrl  -- true consumes the key
//! end)
//!
//! local t = prise.set_timeout(1000, function() log.info("tick") end)
//! t:cancel()
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use mlua::prelude::*;
use mlua::LuaSerdeExt;

use crate::keys::KeyEvent;
use crate::pty::SpawnOptions;
use crate::server::sessions::SessionIds;

/// A deferred side effect requested by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Spawn a session under the pre-allocated id.
    Spawn { id: u64, opts: SpawnOptions },
    Write { pty: u64, bytes: Vec<u8> },
    SendKey { pty: u64, key: KeyEvent },
    /// Force a render on the next scheduler tick.
    RequestFrame { pty: u64 },
    StartTimer { timer: u64, ms: u64 },
    CancelTimer { timer: u64 },
    Quit,
}

/// Queue of actions awaiting the server's drain.
pub type ActionQueue = Arc<Mutex<VecDeque<Action>>>;

#[must_use]
pub fn new_action_queue() -> ActionQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

fn push_action(queue: &ActionQueue, action: Action) {
    queue
        .lock()
        .expect("script action queue poisoned")
        .push_back(action);
}

/// Session titles, maintained by the server, read by `pty:title()`.
pub type TitleTable = Arc<Mutex<HashMap<u64, String>>>;

#[must_use]
pub fn new_title_table() -> TitleTable {
    Arc::new(Mutex::new(HashMap::new()))
}

// ── Event callbacks ───────────────────────────────────────────────────────────

/// Callbacks registered via `prise.on`, keyed by event name.
///
/// Functions are pinned in the Lua registry so the GC keeps them alive.
#[derive(Default)]
pub struct EventCallbacks {
    callbacks: HashMap<String, Vec<(String, LuaRegistryKey)>>,
    next_id: u64,
}

impl std::fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("events", &self.callbacks.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl EventCallbacks {
    /// Register a callback; returns the subscription id.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry key cannot be created.
    pub fn register(&mut self, lua: &Lua, event: &str, callback: LuaFunction) -> Result<String> {
        let id = format!("sub_{}", self.next_id);
        self.next_id += 1;
        let key = lua
            .create_registry_value(callback)
            .map_err(|e| anyhow!("Failed to pin callback: {e}"))?;
        self.callbacks
            .entry(event.to_string())
            .or_default()
            .push((id.clone(), key));
        Ok(id)
    }

    /// Remove a subscription by id. Unknown ids are a no-op.
    pub fn unregister(&mut self, id: &str) -> bool {
        for list in self.callbacks.values_mut() {
            if let Some(pos) = list.iter().position(|(sub, _)| sub == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Resolve the callbacks for `event` into callable functions.
    pub fn functions_for(&self, lua: &Lua, event: &str) -> Vec<LuaFunction> {
        let Some(list) = self.callbacks.get(event) else {
            return Vec::new();
        };
        list.iter()
            .filter_map(|(_, key)| lua.registry_value::<LuaFunction>(key).ok())
            .collect()
    }
}

pub type SharedEventCallbacks = Arc<Mutex<EventCallbacks>>;

#[must_use]
pub fn new_event_callbacks() -> SharedEventCallbacks {
    Arc::new(Mutex::new(EventCallbacks::default()))
}

// ── Timers ────────────────────────────────────────────────────────────────────

struct TimerEntry {
    callback_key: LuaRegistryKey,
    cancelled: bool,
}

/// Timers created by `prise.set_timeout`, keyed by timer id.
///
/// The firing itself is reactor-driven: creation queues a `StartTimer`
/// action, the server submits the timeout op, and the completion routes
/// back into [`crate::script::ScriptRuntime::fire_timer`].
#[derive(Default)]
pub struct TimerEntries {
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

impl std::fmt::Debug for TimerEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntries")
            .field("active", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl TimerEntries {
    fn insert(&mut self, callback_key: LuaRegistryKey) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            TimerEntry {
                callback_key,
                cancelled: false,
            },
        );
        id
    }

    fn cancel(&mut self, id: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Take the callback for a firing timer; `None` for cancelled or
    /// unknown timers.
    pub fn take_for_fire(&mut self, id: u64) -> Option<LuaRegistryKey> {
        let entry = self.entries.remove(&id)?;
        if entry.cancelled {
            None
        } else {
            Some(entry.callback_key)
        }
    }
}

pub type TimerRegistry = Arc<Mutex<TimerEntries>>;

#[must_use]
pub fn new_timer_registry() -> TimerRegistry {
    Arc::new(Mutex::new(TimerEntries::default()))
}

// ── Userdata handles ──────────────────────────────────────────────────────────

/// Opaque PTY handle held by scripts.
#[derive(Clone)]
pub struct PtyRef {
    pub id: u64,
    queue: ActionQueue,
    titles: TitleTable,
}

impl PtyRef {
    #[must_use]
    pub fn new(id: u64, queue: ActionQueue, titles: TitleTable) -> Self {
        Self { id, queue, titles }
    }
}

impl LuaUserData for PtyRef {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        // pty:id() - the session id
        methods.add_method("id", |_, this, ()| Ok(this.id));

        // pty:title() - last known title
        methods.add_method("title", |_, this, ()| {
            let titles = this.titles.lock().expect("title table poisoned");
            Ok(titles.get(&this.id).cloned().unwrap_or_default())
        });

        // pty:write(bytes) - raw bytes into the PTY master
        methods.add_method("write", |_, this, data: LuaString| {
            push_action(
                &this.queue,
                Action::Write {
                    pty: this.id,
                    bytes: data.as_bytes().to_vec(),
                },
            );
            Ok(())
        });

        // pty:send_key{key = "Enter", ctrl = false, ...}
        methods.add_method("send_key", |lua, this, value: LuaValue| {
            let key: KeyEvent = lua.from_value(value)?;
            push_action(&this.queue, Action::SendKey { pty: this.id, key });
            Ok(())
        });
    }
}

/// Opaque timer handle held by scripts.
pub struct TimerRef {
    id: u64,
    queue: ActionQueue,
    timers: TimerRegistry,
}

impl LuaUserData for TimerRef {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        // timer:cancel() - true if the timer was still pending
        methods.add_method("cancel", |_, this, ()| {
            let was_pending = this
                .timers
                .lock()
                .expect("timer registry poisoned")
                .cancel(this.id);
            if was_pending {
                push_action(&this.queue, Action::CancelTimer { timer: this.id });
            }
            Ok(was_pending)
        });

        // timer:id()
        methods.add_method("id", |_, this, ()| Ok(this.id));
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Register the `log` table (`log.info/warn/error/debug`).
///
/// Messages route through Rust's `log` crate under the `lua` target, so
/// they land in the same output and respect the same filters.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register_log(lua: &Lua) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let info_fn = lua
        .create_function(|_, msg: String| {
            log::info!(target: "lua", "{msg}");
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.info: {e}"))?;
    log_table
        .set("info", info_fn)
        .map_err(|e| anyhow!("Failed to set log.info: {e}"))?;

    let warn_fn = lua
        .create_function(|_, msg: String| {
            log::warn!(target: "lua", "{msg}");
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.warn: {e}"))?;
    log_table
        .set("warn", warn_fn)
        .map_err(|e| anyhow!("Failed to set log.warn: {e}"))?;

    let error_fn = lua
        .create_function(|_, msg: String| {
            log::error!(target: "lua", "{msg}");
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.error: {e}"))?;
    log_table
        .set("error", error_fn)
        .map_err(|e| anyhow!("Failed to set log.error: {e}"))?;

    let debug_fn = lua
        .create_function(|_, msg: String| {
            log::debug!(target: "lua", "{msg}");
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.debug: {e}"))?;
    log_table
        .set("debug", debug_fn)
        .map_err(|e| anyhow!("Failed to set log.debug: {e}"))?;

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table: {e}"))?;
    Ok(())
}

/// Register the `prise` table: spawn, events, timers, quit.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register_prise(
    lua: &Lua,
    queue: ActionQueue,
    events: SharedEventCallbacks,
    timers: TimerRegistry,
    titles: TitleTable,
    ids: SessionIds,
) -> Result<()> {
    let prise = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create prise table: {e}"))?;

    // prise.spawn{argv = {...}, cwd = ?, env = ?, cols = ?, rows = ?} -> pty
    //
    // The session id is allocated here so the handle is usable at once;
    // the actual spawn happens when the server drains the queue.
    let q = Arc::clone(&queue);
    let t = Arc::clone(&titles);
    let id_alloc = ids.clone();
    let spawn_fn = lua
        .create_function(move |lua, value: LuaValue| {
            let opts: SpawnOptions = lua.from_value(value)?;
            if opts.argv.is_empty() {
                return Err(LuaError::external("prise.spawn: argv must be non-empty"));
            }
            let id = id_alloc.next();
            push_action(&q, Action::Spawn { id, opts });
            Ok(PtyRef::new(id, Arc::clone(&q), Arc::clone(&t)))
        })
        .map_err(|e| anyhow!("Failed to create prise.spawn: {e}"))?;
    prise
        .set("spawn", spawn_fn)
        .map_err(|e| anyhow!("Failed to set prise.spawn: {e}"))?;

    // prise.on(event, callback) -> subscription id
    let evs = Arc::clone(&events);
    let on_fn = lua
        .create_function(move |lua, (event, callback): (String, LuaFunction)| {
            let mut callbacks = evs.lock().expect("event callbacks poisoned");
            callbacks
                .register(lua, &event, callback)
                .map_err(LuaError::external)
        })
        .map_err(|e| anyhow!("Failed to create prise.on: {e}"))?;
    prise
        .set("on", on_fn)
        .map_err(|e| anyhow!("Failed to set prise.on: {e}"))?;

    // prise.off(subscription_id) -> bool
    let evs = Arc::clone(&events);
    let off_fn = lua
        .create_function(move |_, id: String| {
            let mut callbacks = evs.lock().expect("event callbacks poisoned");
            Ok(callbacks.unregister(&id))
        })
        .map_err(|e| anyhow!("Failed to create prise.off: {e}"))?;
    prise
        .set("off", off_fn)
        .map_err(|e| anyhow!("Failed to set prise.off: {e}"))?;

    // prise.request_frame(pty_or_id) - force a render on the next tick
    let q = Arc::clone(&queue);
    let request_frame_fn = lua
        .create_function(move |_, value: LuaValue| {
            let pty = match &value {
                LuaValue::UserData(ud) => ud.borrow::<PtyRef>()?.id,
                LuaValue::Integer(id) if *id >= 0 => *id as u64,
                _ => {
                    return Err(LuaError::external(
                        "prise.request_frame: expected a pty handle or id",
                    ))
                }
            };
            push_action(&q, Action::RequestFrame { pty });
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create prise.request_frame: {e}"))?;
    prise
        .set("request_frame", request_frame_fn)
        .map_err(|e| anyhow!("Failed to set prise.request_frame: {e}"))?;

    // prise.set_timeout(ms, callback) -> timer
    let q = Arc::clone(&queue);
    let tm = Arc::clone(&timers);
    let set_timeout_fn = lua
        .create_function(move |lua, (ms, callback): (u64, LuaFunction)| {
            let key = lua.create_registry_value(callback).map_err(|e| {
                LuaError::external(format!("prise.set_timeout: failed to pin callback: {e}"))
            })?;
            let id = tm.lock().expect("timer registry poisoned").insert(key);
            push_action(&q, Action::StartTimer { timer: id, ms });
            Ok(TimerRef {
                id,
                queue: Arc::clone(&q),
                timers: Arc::clone(&tm),
            })
        })
        .map_err(|e| anyhow!("Failed to create prise.set_timeout: {e}"))?;
    prise
        .set("set_timeout", set_timeout_fn)
        .map_err(|e| anyhow!("Failed to set prise.set_timeout: {e}"))?;

    // prise.quit()
    let q = Arc::clone(&queue);
    let quit_fn = lua
        .create_function(move |_, ()| {
            push_action(&q, Action::Quit);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create prise.quit: {e}"))?;
    prise
        .set("quit", quit_fn)
        .map_err(|e| anyhow!("Failed to set prise.quit: {e}"))?;

    lua.globals()
        .set("prise", prise)
        .map_err(|e| anyhow!("Failed to register prise table: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_pieces() -> (Lua, ActionQueue, SharedEventCallbacks, TimerRegistry, TitleTable) {
        let lua = Lua::new();
        let queue = new_action_queue();
        let events = new_event_callbacks();
        let timers = new_timer_registry();
        let titles = new_title_table();
        register_log(&lua).unwrap();
        register_prise(
            &lua,
            Arc::clone(&queue),
            Arc::clone(&events),
            Arc::clone(&timers),
            Arc::clone(&titles),
            SessionIds::default(),
        )
        .unwrap();
        (lua, queue, events, timers, titles)
    }

    fn drain(queue: &ActionQueue) -> Vec<Action> {
        queue.lock().unwrap().drain(..).collect()
    }

    #[test]
    fn test_log_functions_callable() {
        let (lua, ..) = runtime_pieces();
        lua.load(r#"log.info("hello") log.warn("w") log.error("e") log.debug("d")"#)
            .exec()
            .unwrap();
    }

    #[test]
    fn test_spawn_returns_usable_handle_and_queues_action() {
        let (lua, queue, ..) = runtime_pieces();
        lua.load(
            r#"
            local pty = prise.spawn{argv = {"/bin/sh", "-c", "true"}, cols = 100, rows = 30}
            assert(pty:id() > 0)
            pty:write("ls\n")
        "#,
        )
        .exec()
        .unwrap();

        let actions = drain(&queue);
        assert_eq!(actions.len(), 2);
        match &actions[0] {
            Action::Spawn { id, opts } => {
                assert!(*id > 0);
                assert_eq!(opts.cols, 100);
                assert_eq!(opts.argv[0], "/bin/sh");
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
        match &actions[1] {
            Action::Write { bytes, .. } => assert_eq!(bytes, b"ls\n"),
            other => panic!("expected Write, got {other:?}"),
        }
    }

    #[test]
    fn test_spawn_rejects_empty_argv() {
        let (lua, ..) = runtime_pieces();
        let err = lua.load(r#"prise.spawn{argv = {}}"#).exec().unwrap_err();
        assert!(err.to_string().contains("argv"));
    }

    #[test]
    fn test_send_key_decodes_key_event_table() {
        let (lua, queue, ..) = runtime_pieces();
        lua.load(
            r#"
            local pty = prise.spawn{argv = {"/bin/sh"}}
            pty:send_key{key = "Enter", ctrl = false}
        "#,
        )
        .exec()
        .unwrap();

        let actions = drain(&queue);
        match &actions[1] {
            Action::SendKey { key, .. } => assert_eq!(key.key, "Enter"),
            other => panic!("expected SendKey, got {other:?}"),
        }
    }

    #[test]
    fn test_on_off_round_trip() {
        let (lua, _, events, ..) = runtime_pieces();
        lua.load(
            r#"
            sub = prise.on("pty_exited", function(id) end)
            assert(prise.off(sub) == true)
            assert(prise.off(sub) == false)
        "#,
        )
        .exec()
        .unwrap();
        let callbacks = events.lock().unwrap();
        assert!(callbacks.functions_for(&lua, "pty_exited").is_empty());
    }

    #[test]
    fn test_set_timeout_and_cancel() {
        let (lua, queue, _, timers, _) = runtime_pieces();
        lua.load(
            r#"
            local t = prise.set_timeout(250, function() end)
            assert(t:cancel() == true)
            assert(t:cancel() == true) -- already cancelled, still known
        "#,
        )
        .exec()
        .unwrap();

        let actions = drain(&queue);
        assert!(matches!(actions[0], Action::StartTimer { ms: 250, .. }));
        assert!(matches!(actions[1], Action::CancelTimer { .. }));

        // A cancelled timer never yields its callback.
        let Action::StartTimer { timer, .. } = actions[0] else {
            unreachable!()
        };
        assert!(timers.lock().unwrap().take_for_fire(timer).is_none());
    }

    #[test]
    fn test_request_frame_accepts_handle_and_id() {
        let (lua, queue, ..) = runtime_pieces();
        lua.load(
            r#"
            local pty = prise.spawn{argv = {"/bin/sh"}}
            prise.request_frame(pty)
            prise.request_frame(7)
        "#,
        )
        .exec()
        .unwrap();
        let actions = drain(&queue);
        assert!(matches!(actions[1], Action::RequestFrame { .. }));
        assert!(matches!(actions[2], Action::RequestFrame { pty: 7 }));
    }

    #[test]
    fn test_title_reads_shared_table() {
        let (lua, _, _, _, titles) = runtime_pieces();
        lua.load(r#"pty = prise.spawn{argv = {"/bin/sh"}}"#).exec().unwrap();
        let id: u64 = lua.load("pty:id()").eval().unwrap();
        titles.lock().unwrap().insert(id, "vim".to_string());
        let title: String = lua.load("pty:title()").eval().unwrap();
        assert_eq!(title, "vim");
    }

    #[test]
    fn test_quit_queues_action() {
        let (lua, queue, ..) = runtime_pieces();
        lua.load("prise.quit()").exec().unwrap();
        assert_eq!(drain(&queue), vec![Action::Quit]);
    }
}
