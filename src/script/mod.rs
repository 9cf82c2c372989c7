//! Lua scripting runtime.
//!
//! Owns the interpreter, loads the user (or embedded default) script,
//! delivers events, and hands the server the actions scripts queued.
//! Scripts run to completion per event on the main thread and must not
//! block; every side effect is deferred through the action queue.
//!
//! # Error policy
//!
//! A script error is logged and the offending dispatch's actions are
//! still drained (partial effects are allowed; the queue order is the
//! script's own). The server never tears down because a script threw.
//! Set `PRISE_LUA_STRICT=1` to panic instead, for script development.

pub mod api;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mlua::prelude::*;

use crate::keys::KeyEvent;
use crate::server::sessions::SessionIds;

use api::{
    new_action_queue, new_event_callbacks, new_timer_registry, new_title_table, Action,
    ActionQueue, PtyRef, SharedEventCallbacks, TimerRegistry, TitleTable,
};

/// Script embedded into the binary; used when no user script exists.
const DEFAULT_SCRIPT: &str = include_str!("init.lua");

/// The Lua scripting runtime for the server.
pub struct ScriptRuntime {
    lua: Lua,
    actions: ActionQueue,
    events: SharedEventCallbacks,
    timers: TimerRegistry,
    titles: TitleTable,
    strict: bool,
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queued = self.actions.lock().map(|q| q.len()).unwrap_or(0);
        f.debug_struct("ScriptRuntime")
            .field("strict", &self.strict)
            .field("queued_actions", &queued)
            .finish_non_exhaustive()
    }
}

impl ScriptRuntime {
    /// Create the runtime and register all primitives.
    ///
    /// `ids` is the server's session id allocator — `prise.spawn` hands
    /// out real ids synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if primitive registration fails.
    pub fn new(ids: SessionIds) -> Result<Self> {
        let lua = Lua::new();
        let actions = new_action_queue();
        let events = new_event_callbacks();
        let timers = new_timer_registry();
        let titles = new_title_table();

        api::register_log(&lua)?;
        api::register_prise(
            &lua,
            Arc::clone(&actions),
            Arc::clone(&events),
            Arc::clone(&timers),
            Arc::clone(&titles),
            ids,
        )?;

        let strict = std::env::var("PRISE_LUA_STRICT").map(|v| v == "1").unwrap_or(false);

        Ok(Self {
            lua,
            actions,
            events,
            timers,
            titles,
            strict,
        })
    }

    /// Load and run the startup script.
    ///
    /// `path` is the resolved user script; `None` runs the embedded
    /// default. Top-level code runs immediately — a script may
    /// `prise.spawn` its initial layout here.
    ///
    /// # Errors
    ///
    /// A broken startup script is a fatal init failure.
    pub fn load(&self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read script: {}", path.display()))?;
                log::info!("loading script {}", path.display());
                self.lua
                    .load(&source)
                    .set_name(path.display().to_string())
                    .exec()
                    .map_err(|e| anyhow::anyhow!(e.to_string()))
                    .with_context(|| format!("Script failed: {}", path.display()))
            }
            None => {
                log::info!("no user script, loading embedded default");
                self.lua
                    .load(DEFAULT_SCRIPT)
                    .set_name("init.lua")
                    .exec()
                    .map_err(|e| anyhow::anyhow!(e.to_string()))
                    .context("Embedded default script failed")
            }
        }
    }

    /// Drain the actions queued since the last drain, in order.
    pub fn drain_actions(&self) -> Vec<Action> {
        // Recycle registry slots of dropped callback keys while we are
        // here; this is the runtime's regular heartbeat.
        self.lua.expire_registry_values();
        let mut queue = self.actions.lock().expect("script action queue poisoned");
        queue.drain(..).collect()
    }

    /// Server-side title update; visible to `pty:title()`.
    pub fn set_title(&self, pty: u64, title: &str) {
        self.titles
            .lock()
            .expect("title table poisoned")
            .insert(pty, title.to_string());
    }

    /// Forget a dead session's title.
    pub fn remove_pty(&self, pty: u64) {
        self.titles.lock().expect("title table poisoned").remove(&pty);
    }

    /// Deliver `pty_attach` with a fresh handle for the session.
    pub fn on_pty_attach(&self, pty: u64) {
        let handle = PtyRef::new(pty, Arc::clone(&self.actions), Arc::clone(&self.titles));
        self.fire("pty_attach", handle);
    }

    /// Deliver `pty_exited`.
    pub fn on_pty_exited(&self, pty: u64) {
        self.fire("pty_exited", pty);
    }

    /// Deliver `key_press`. Returns true if any callback consumed the
    /// key (returned `true`); the server then skips the default
    /// passthrough write.
    pub fn on_key_press(&self, pty: u64, key: &KeyEvent) -> bool {
        let table = match self.key_event_table(pty, key) {
            Ok(table) => table,
            Err(e) => {
                self.report("key_press", &e);
                return false;
            }
        };
        self.fire_consumable("key_press", table)
    }

    /// Deliver `winsize` after a resize.
    pub fn on_winsize(&self, pty: u64, cols: u16, rows: u16) {
        let table = match self.lua.create_table() {
            Ok(table) => table,
            Err(e) => {
                self.report("winsize", &e);
                return;
            }
        };
        let populated = table
            .set("id", pty)
            .and_then(|()| table.set("cols", cols))
            .and_then(|()| table.set("rows", rows));
        if let Err(e) = populated {
            self.report("winsize", &e);
            return;
        }
        self.fire("winsize", table);
    }

    /// A reactor timer for `prise.set_timeout` fired.
    pub fn fire_timer(&self, timer: u64) {
        let key = {
            let mut timers = self.timers.lock().expect("timer registry poisoned");
            timers.take_for_fire(timer)
        };
        let Some(key) = key else {
            return; // cancelled or unknown
        };
        match self.lua.registry_value::<LuaFunction>(&key) {
            Ok(callback) => {
                if let Err(e) = callback.call::<()>(()) {
                    self.report("timer", &e);
                }
            }
            Err(e) => self.report("timer", &e),
        }
        let _ = self.lua.remove_registry_value(key);
    }

    fn key_event_table(&self, pty: u64, key: &KeyEvent) -> LuaResult<LuaTable> {
        let table = self.lua.create_table()?;
        table.set("key", key.key.as_str())?;
        table.set("ctrl", key.ctrl)?;
        table.set("shift", key.shift)?;
        table.set("alt", key.alt)?;
        table.set("meta", key.meta)?;
        table.set("pty", pty)?;
        Ok(table)
    }

    /// Call every callback for `event`; return values are ignored.
    fn fire(&self, event: &str, arg: impl IntoLua + Clone) {
        for callback in self.callbacks(event) {
            if let Err(e) = callback.call::<()>(arg.clone()) {
                self.report(event, &e);
            }
        }
    }

    /// Call every callback for `event`; true if any returned `true`.
    fn fire_consumable(&self, event: &str, arg: impl IntoLua + Clone) -> bool {
        let mut consumed = false;
        for callback in self.callbacks(event) {
            match callback.call::<Option<bool>>(arg.clone()) {
                Ok(Some(true)) => consumed = true,
                Ok(_) => {}
                Err(e) => self.report(event, &e),
            }
        }
        consumed
    }

    fn callbacks(&self, event: &str) -> Vec<LuaFunction> {
        let callbacks = self.events.lock().expect("event callbacks poisoned");
        callbacks.functions_for(&self.lua, event)
    }

    fn report(&self, event: &str, err: &LuaError) {
        if self.strict {
            panic!("lua error in '{event}': {err}");
        }
        log::error!("lua error in '{event}': {err}");
    }
}
