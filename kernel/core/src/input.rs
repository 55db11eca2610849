//! Keyboard input ring: filled by the keyboard IRQ, drained by the shell.

use crate::consts::KEY_QUEUE_LEN;
use crossbeam_queue::ArrayQueue;
use cupid_api_types::input::KeyEvent;

pub struct InputQueue {
    events: ArrayQueue<KeyEvent>,
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputQueue {
    pub fn new() -> Self {
        Self { events: ArrayQueue::new(KEY_QUEUE_LEN) }
    }

    /// IRQ side. A full queue drops the event and returns `false`.
    pub fn push(&self, event: KeyEvent) -> bool {
        self.events.push(event).is_ok()
    }

    pub fn pop(&self) -> Option<KeyEvent> {
        self.events.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Queues every character of `text`, mapping `\n` to Enter. Used by the hosted
    /// harness and tests to play keystrokes.
    pub fn push_str(&self, text: &str) -> usize {
        text.chars()
            .map(|c| match c {
                '\n' => KeyEvent::enter(),
                '\t' => KeyEvent::tab(),
                c => KeyEvent::char(c),
            })
            .take_while(|&event| self.push(event))
            .count()
    }
}
