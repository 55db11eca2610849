//! PS/2 keyboard, scancode set 1.

use cupid_api_types::input::KeyEvent;

pub const DATA_PORT: u16 = 0x60;

/// Scancode-to-ASCII, unshifted.
static NORMAL: &[u8] = &[
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0,
    0, b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', 0,
    0, b'a', b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`',
    0, b'\\', b'z', b'x', b'c', b'v', b'b', b'n', b'm', b',', b'.', b'/', 0, b'*',
    0, b' ',
];

/// Scancode-to-ASCII, shifted.
static SHIFTED: &[u8] = &[
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 0,
    0, b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', 0,
    0, b'A', b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~',
    0, b'|', b'Z', b'X', b'C', b'V', b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*',
    0, b' ',
];

const EXTENDED_PREFIX: u8 = 0xE0;
const RELEASED: u8 = 0x80;
const LEFT_SHIFT: u8 = 0x2A;
const RIGHT_SHIFT: u8 = 0x36;
const CAPS_LOCK: u8 = 0x3A;
const BACKSPACE: u8 = 0x0E;
const TAB: u8 = 0x0F;
const ENTER: u8 = 0x1C;
const UP: u8 = 0x48;
const DOWN: u8 = 0x50;

/// Modifier state. Owned by the keyboard IRQ.
#[derive(Debug, Default)]
pub struct Keyboard {
    shift: bool,
    caps_lock: bool,
    extended: bool,
}

impl Keyboard {
    pub const fn new() -> Self {
        Self { shift: false, caps_lock: false, extended: false }
    }

    /// Feeds one raw scancode; returns the key it completes, if any.
    pub fn decode(&mut self, scancode: u8) -> Option<KeyEvent> {
        if scancode == EXTENDED_PREFIX {
            self.extended = true;
            return None;
        }
        let pressed = scancode & RELEASED == 0;
        let code = scancode & !RELEASED;

        if core::mem::take(&mut self.extended) {
            return match (pressed, code) {
                (true, UP) => Some(KeyEvent::arrow_up()),
                (true, DOWN) => Some(KeyEvent::arrow_down()),
                (true, ENTER) => Some(KeyEvent::enter()),
                _ => None,
            };
        }

        match code {
            LEFT_SHIFT | RIGHT_SHIFT => {
                self.shift = pressed;
                None
            }
            CAPS_LOCK if pressed => {
                self.caps_lock = !self.caps_lock;
                None
            }
            _ if !pressed => None,
            BACKSPACE => Some(KeyEvent::backspace()),
            TAB => Some(KeyEvent::tab()),
            ENTER => Some(KeyEvent::enter()),
            _ => self.to_ascii(code).map(KeyEvent::char),
        }
    }

    fn to_ascii(&self, code: u8) -> Option<char> {
        let letter = NORMAL.get(usize::from(code)).is_some_and(u8::is_ascii_lowercase);
        // Caps lock only affects letters.
        let shifted = if letter { self.shift ^ self.caps_lock } else { self.shift };
        let table = if shifted { SHIFTED } else { NORMAL };
        match table.get(usize::from(code)) {
            Some(&c) if c != 0 && c != 27 => Some(char::from(c)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use cupid_api_types::input::KeyEventType;

    fn feed(keyboard: &mut Keyboard, codes: &[u8]) -> Vec<KeyEvent> {
        codes.iter().filter_map(|&c| keyboard.decode(c)).collect()
    }

    fn text(events: &[KeyEvent]) -> alloc::string::String {
        events.iter().map(|e| char::from(e.character)).collect()
    }

    #[test]
    fn letters_and_release_codes() {
        let mut keyboard = Keyboard::new();
        // h down, h up, i down, i up
        let events = feed(&mut keyboard, &[0x23, 0xA3, 0x17, 0x97]);
        assert_eq!(text(&events), "hi");
    }

    #[test]
    fn shift_and_caps_lock() {
        let mut keyboard = Keyboard::new();
        // shift down, 1, a, shift up, a
        let events = feed(&mut keyboard, &[LEFT_SHIFT, 0x02, 0x1E, LEFT_SHIFT | RELEASED, 0x1E]);
        assert_eq!(text(&events), "!Aa");

        // caps lock upper-cases letters but not digits
        let events = feed(&mut keyboard, &[CAPS_LOCK, CAPS_LOCK | RELEASED, 0x1E, 0x02]);
        assert_eq!(text(&events), "A1");
    }

    #[test]
    fn special_and_extended_keys() {
        let mut keyboard = Keyboard::new();
        let events = feed(
            &mut keyboard,
            &[ENTER, BACKSPACE, TAB, EXTENDED_PREFIX, UP, EXTENDED_PREFIX, UP | RELEASED, EXTENDED_PREFIX, DOWN],
        );
        let kinds: Vec<KeyEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            [
                KeyEventType::Enter,
                KeyEventType::Backspace,
                KeyEventType::Tab,
                KeyEventType::ArrowUp,
                KeyEventType::ArrowDown
            ]
        );
    }

    #[test]
    fn escape_is_ignored() {
        let mut keyboard = Keyboard::new();
        assert_eq!(keyboard.decode(0x01), None);
    }
}
