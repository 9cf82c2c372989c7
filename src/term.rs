//! Terminal emulator wrapper around [`alacritty_terminal`].
//!
//! Bundles a [`Term`] with the vte [`Processor`] that feeds it, behind a
//! simple `process(bytes)` / `resize(rows, cols)` surface, and captures
//! the side-band the emulator produces while parsing:
//!
//! - **replies** (`Event::PtyWrite`) — answers to queries like Device
//!   Attributes, drained by the PTY reader worker and written straight
//!   back to the master;
//! - **events** (`Event::Title` / `Event::Bell`) — drained on the main
//!   thread at dirty-drain time and turned into client notifications.
//!
//! # Thread safety
//!
//! A `Terminal` lives inside an `Arc<Mutex<_>>`. The reader worker is the
//! only writer; the main thread locks it to take a [`Frame`] snapshot
//! only after observing a dirty-pipe byte, so no torn cell read is
//! observable.

use std::sync::{Arc, Mutex};

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line, Point};
use alacritty_terminal::term::cell::Flags;
use alacritty_terminal::term::{Config, Term, TermMode};
use alacritty_terminal::vte::ansi::{Color, NamedColor, Processor};
use serde::{Deserialize, Serialize};

/// Scrollback kept per session. Redraw frames only cover the viewport;
/// this bounds memory while keeping scroll-region handling correct.
const SCROLLBACK_LINES: usize = 1_000;

/// Attribute bits of a [`FrameCell`].
pub mod attr {
    pub const BOLD: u16 = 1;
    pub const ITALIC: u16 = 1 << 1;
    pub const UNDERLINE: u16 = 1 << 2;
    pub const INVERSE: u16 = 1 << 3;
    pub const DIM: u16 = 1 << 4;
    pub const STRIKEOUT: u16 = 1 << 5;
    pub const HIDDEN: u16 = 1 << 6;
}

/// Color channel tags of the u32 cell color encoding.
const COLOR_INDEXED: u32 = 0x0100_0000;
const COLOR_RGB: u32 = 0x0200_0000;

/// Terminal-emitted events surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermEvent {
    /// Window title changed (empty string on reset).
    Title(String),
    Bell,
}

#[derive(Debug, Default)]
struct ProxyState {
    replies: Vec<u8>,
    events: Vec<TermEvent>,
}

/// Listener handed to [`Term`]; collects replies and events for the two
/// drain paths described in the module docs.
#[derive(Debug, Clone, Default)]
struct EventProxy(Arc<Mutex<ProxyState>>);

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        let mut state = self.0.lock().expect("terminal event proxy poisoned");
        match event {
            Event::PtyWrite(text) => state.replies.extend_from_slice(text.as_bytes()),
            Event::Title(title) => state.events.push(TermEvent::Title(title)),
            Event::ResetTitle => state.events.push(TermEvent::Title(String::new())),
            Event::Bell => state.events.push(TermEvent::Bell),
            _ => {}
        }
    }
}

/// Minimal [`Dimensions`] implementor for constructing and resizing a
/// [`Term`] without alacritty's full window-size machinery.
#[derive(Debug, Clone, Copy)]
struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl Dimensions for TermSize {
    fn columns(&self) -> usize {
        self.columns
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn total_lines(&self) -> usize {
        self.screen_lines
    }
}

/// One cell of a redraw frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCell {
    /// Grapheme contents; empty for wide-char spacers.
    pub ch: String,
    pub fg: u32,
    pub bg: u32,
    pub attrs: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCursor {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
}

/// The redraw payload sent to attached clients.
///
/// `kind` self-describes the frame; this implementation always sends
/// `"full"` frames (deltas would use a different kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: String,
    pub cols: u16,
    pub rows: u16,
    pub cells: Vec<Vec<FrameCell>>,
    pub cursor: FrameCursor,
}

/// Terminal emulator for one PTY session.
pub struct Terminal {
    term: Term<EventProxy>,
    processor: Processor,
    proxy: EventProxy,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rows, cols) = self.size();
        f.debug_struct("Terminal")
            .field("rows", &rows)
            .field("cols", &cols)
            .finish_non_exhaustive()
    }
}

impl Terminal {
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        let size = TermSize {
            columns: cols.max(1) as usize,
            screen_lines: rows.max(1) as usize,
        };
        let config = Config {
            scrolling_history: SCROLLBACK_LINES,
            ..Config::default()
        };
        let proxy = EventProxy::default();
        let term = Term::new(config, &size, proxy.clone());
        Self {
            term,
            processor: Processor::new(),
            proxy,
        }
    }

    /// Feed raw PTY bytes. Hot path; called only by the reader worker.
    pub fn process(&mut self, bytes: &[u8]) {
        self.processor.advance(&mut self.term, bytes);
    }

    /// Resize the grid (cursor clamping and reflow included).
    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.term.resize(TermSize {
            columns: cols.max(1) as usize,
            screen_lines: rows.max(1) as usize,
        });
    }

    /// `(rows, cols)` of the viewport.
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        let grid = self.term.grid();
        (grid.screen_lines() as u16, grid.columns() as u16)
    }

    /// Whether DECCKM application cursor-keys mode is active; selects the
    /// arrow-key encoding.
    #[must_use]
    pub fn application_cursor(&self) -> bool {
        self.term.mode().contains(TermMode::APP_CURSOR)
    }

    /// Drain pending query replies (Device Attributes and friends). The
    /// reader worker writes these directly back to the PTY master.
    pub fn take_replies(&mut self) -> Vec<u8> {
        let mut state = self.proxy.0.lock().expect("terminal event proxy poisoned");
        std::mem::take(&mut state.replies)
    }

    /// Drain title/bell events for notification fan-out.
    pub fn take_events(&mut self) -> Vec<TermEvent> {
        let mut state = self.proxy.0.lock().expect("terminal event proxy poisoned");
        std::mem::take(&mut state.events)
    }

    /// Snapshot the viewport into a full redraw frame.
    #[must_use]
    pub fn snapshot(&self) -> Frame {
        let grid = self.term.grid();
        let rows = grid.screen_lines();
        let cols = grid.columns();

        let mut cells = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut line = Vec::with_capacity(cols);
            for col in 0..cols {
                let cell = &grid[Point::new(Line(row as i32), Column(col))];
                let ch = if cell.flags.contains(Flags::WIDE_CHAR_SPACER) {
                    String::new()
                } else {
                    let mut s = String::new();
                    s.push(cell.c);
                    if let Some(zerowidth) = cell.zerowidth() {
                        s.extend(zerowidth);
                    }
                    s
                };
                line.push(FrameCell {
                    ch,
                    fg: encode_color(cell.fg),
                    bg: encode_color(cell.bg),
                    attrs: encode_attrs(cell.flags),
                });
            }
            cells.push(line);
        }

        let cursor = grid.cursor.point;
        Frame {
            kind: "full".to_string(),
            cols: cols as u16,
            rows: rows as u16,
            cells,
            cursor: FrameCursor {
                row: cursor.line.0.max(0) as u16,
                col: cursor.column.0 as u16,
                visible: self.term.mode().contains(TermMode::SHOW_CURSOR),
            },
        }
    }

    /// Plain-text viewport contents, rows joined with newlines. Test aid.
    #[must_use]
    pub fn contents(&self) -> String {
        let grid = self.term.grid();
        let mut out = String::new();
        for row in 0..grid.screen_lines() {
            if row > 0 {
                out.push('\n');
            }
            for col in 0..grid.columns() {
                out.push(grid[Point::new(Line(row as i32), Column(col))].c);
            }
        }
        out
    }
}

/// Cell color to the u32 wire encoding: `0` default,
/// `0x01xx_xxxx` indexed, `0x02RR_GGBB` direct.
fn encode_color(color: Color) -> u32 {
    match color {
        Color::Named(NamedColor::Foreground | NamedColor::Background) => 0,
        Color::Named(named) => {
            let idx = named as usize;
            if idx < 16 {
                COLOR_INDEXED | idx as u32
            } else {
                0 // cursor/dim pseudo-colors render as default
            }
        }
        Color::Indexed(idx) => COLOR_INDEXED | u32::from(idx),
        Color::Spec(rgb) => {
            COLOR_RGB | (u32::from(rgb.r) << 16) | (u32::from(rgb.g) << 8) | u32::from(rgb.b)
        }
    }
}

fn encode_attrs(flags: Flags) -> u16 {
    let mut attrs = 0;
    if flags.contains(Flags::BOLD) {
        attrs |= attr::BOLD;
    }
    if flags.contains(Flags::ITALIC) {
        attrs |= attr::ITALIC;
    }
    if flags.contains(Flags::UNDERLINE) {
        attrs |= attr::UNDERLINE;
    }
    if flags.contains(Flags::INVERSE) {
        attrs |= attr::INVERSE;
    }
    if flags.contains(Flags::DIM) {
        attrs |= attr::DIM;
    }
    if flags.contains(Flags::STRIKEOUT) {
        attrs |= attr::STRIKEOUT;
    }
    if flags.contains(Flags::HIDDEN) {
        attrs |= attr::HIDDEN;
    }
    attrs
}
