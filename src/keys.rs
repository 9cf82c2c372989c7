//! Structured key events and their PTY byte encoding.
//!
//! Clients send keys as web-convention `key_event` maps
//! (`{"key": "ArrowUp", "ctrlKey": false, ...}`); the server encodes them
//! into the byte sequences a terminal application expects. Named keys map
//! to xterm sequences, modifier combinations use the `CSI 1;m` parameter
//! form, and ctrl+letter collapses to the control byte.

use serde::{Deserialize, Serialize};

/// A structured key press, named per the web `KeyboardEvent.key`
/// convention (`"Enter"`, `"ArrowUp"`, `"a"`, `" "`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key: String,
    #[serde(default, rename = "ctrlKey")]
    pub ctrl: bool,
    #[serde(default, rename = "shiftKey")]
    pub shift: bool,
    #[serde(default, rename = "altKey")]
    pub alt: bool,
    #[serde(default, rename = "metaKey")]
    pub meta: bool,
}

impl KeyEvent {
    /// Plain (unmodified) key by name; test and script convenience.
    #[must_use]
    pub fn plain(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    fn has_modifiers(&self) -> bool {
        self.ctrl || self.shift || self.alt || self.meta
    }

    /// xterm modifier parameter: 1 + shift(1) + alt(2) + ctrl(4) + meta(8).
    fn modifier_param(&self) -> u8 {
        1 + u8::from(self.shift)
            + (u8::from(self.alt) << 1)
            + (u8::from(self.ctrl) << 2)
            + (u8::from(self.meta) << 3)
    }
}

/// Encode a key event into the bytes written to the PTY master.
///
/// `app_cursor` selects DECCKM application mode for the cursor keys
/// (SS3 `\x1bOA` instead of CSI `\x1b[A`).
///
/// Unknown named keys are treated as text when they are a single
/// codepoint; longer unknown names are carried through as raw UTF-8.
#[must_use]
pub fn encode_key(ev: &KeyEvent, app_cursor: bool) -> Vec<u8> {
    // Cursor-style keys: final byte in the CSI/SS3 form. F1-F4 are SS3
    // whenever unmodified; cursor keys only under DECCKM.
    if let Some(final_byte) = cursor_final(&ev.key) {
        return if ev.has_modifiers() {
            format!("\x1b[1;{}{}", ev.modifier_param(), final_byte as char).into_bytes()
        } else if matches!(final_byte, b'P' | b'Q' | b'R' | b'S')
            || (app_cursor && matches!(final_byte, b'A' | b'B' | b'C' | b'D' | b'H' | b'F'))
        {
            vec![0x1b, b'O', final_byte]
        } else {
            vec![0x1b, b'[', final_byte]
        };
    }

    // Tilde-style keys: CSI <n> ~ with optional modifier parameter.
    if let Some(number) = tilde_number(&ev.key) {
        return if ev.has_modifiers() {
            format!("\x1b[{};{}~", number, ev.modifier_param()).into_bytes()
        } else {
            format!("\x1b[{number}~").into_bytes()
        };
    }

    match ev.key.as_str() {
        "Enter" => return vec![b'\r'],
        "Tab" => {
            return if ev.shift {
                vec![0x1b, b'[', b'Z']
            } else {
                vec![b'\t']
            }
        }
        "Backspace" => return vec![0x7f],
        "Escape" => return vec![0x1b],
        _ => {}
    }

    // Text keys: at most one codepoint after the named forms above.
    let mut chars = ev.key.chars();
    let (first, rest) = (chars.next(), chars.next());
    let Some(ch) = first else {
        return Vec::new();
    };
    if rest.is_some() {
        // Unidentified named key: carry the raw string through.
        return ev.key.clone().into_bytes();
    }

    let mut bytes = Vec::new();
    if ev.alt {
        bytes.push(0x1b);
    }
    if ev.ctrl {
        if let Some(ctrl) = control_byte(ch) {
            bytes.push(ctrl);
            return bytes;
        }
    }
    let mut utf8 = [0u8; 4];
    bytes.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
    bytes
}

/// Final byte of the CSI/SS3 form, for keys that use one.
fn cursor_final(key: &str) -> Option<u8> {
    Some(match key {
        "ArrowUp" => b'A',
        "ArrowDown" => b'B',
        "ArrowRight" => b'C',
        "ArrowLeft" => b'D',
        "Home" => b'H',
        "End" => b'F',
        "F1" => b'P',
        "F2" => b'Q',
        "F3" => b'R',
        "F4" => b'S',
        _ => return None,
    })
}

/// Parameter of the `CSI <n> ~` form, for keys that use one.
fn tilde_number(key: &str) -> Option<u8> {
    Some(match key {
        "Insert" => 2,
        "Delete" => 3,
        "PageUp" => 5,
        "PageDown" => 6,
        "F5" => 15,
        "F6" => 17,
        "F7" => 18,
        "F8" => 19,
        "F9" => 20,
        "F10" => 21,
        "F11" => 23,
        "F12" => 24,
        _ => return None,
    })
}

/// Ctrl+key collapse to a control byte, per the usual ASCII rules.
fn control_byte(ch: char) -> Option<u8> {
    match ch {
        'a'..='z' => Some(ch as u8 - b'a' + 1),
        'A'..='Z' => Some(ch as u8 - b'A' + 1),
        ' ' | '@' => Some(0x00),
        '[' => Some(0x1b),
        '\\' => Some(0x1c),
        ']' => Some(0x1d),
        '^' => Some(0x1e),
        '_' | '/' => Some(0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}
