/// Decoded keyboard event types.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEventType {
    Char = 0,
    Enter = 1,
    Backspace = 2,
    Tab = 3,
    ArrowUp = 4,
    ArrowDown = 5,
}

/// A decoded key passed from the keyboard IRQ to the shell.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub event_type: KeyEventType,
    /// The character for `Char` events, or `\0` otherwise.
    pub character: u8,
}

impl KeyEvent {
    pub const fn char(c: char) -> Self {
        Self { event_type: KeyEventType::Char, character: c as u8 }
    }

    pub const fn enter() -> Self {
        Self { event_type: KeyEventType::Enter, character: 0 }
    }

    pub const fn backspace() -> Self {
        Self { event_type: KeyEventType::Backspace, character: 0 }
    }

    pub const fn tab() -> Self {
        Self { event_type: KeyEventType::Tab, character: 0 }
    }

    pub const fn arrow_up() -> Self {
        Self { event_type: KeyEventType::ArrowUp, character: 0 }
    }

    pub const fn arrow_down() -> Self {
        Self { event_type: KeyEventType::ArrowDown, character: 0 }
    }
}
