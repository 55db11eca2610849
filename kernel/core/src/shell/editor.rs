//! Interactive line editing: echo, backspace, history recall and tab completion.

use crate::consts::{HISTORY_LEN, MAX_LINE};
use alloc::string::String as AllocString;
use alloc::vec::Vec;
use core::fmt::Write;
use cupid_api_types::input::{KeyEvent, KeyEventType};
use heapless::{Deque, String};

pub type Line = String<MAX_LINE>;

/// The last `HISTORY_LEN` submitted lines, oldest first.
#[derive(Default)]
pub struct History {
    lines: Deque<Line, HISTORY_LEN>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `line`, dropping the oldest entry when full. Blank lines and
    /// immediate repeats are not recorded.
    pub fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || self.lines.back().is_some_and(|last| last == line) {
            return;
        }
        let Ok(entry) = Line::try_from(line) else {
            return;
        };
        if self.lines.is_full() {
            self.lines.pop_front();
        }
        let _ = self.lines.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// `index` 0 is the oldest entry.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.lines.iter().nth(index).map(|l| l.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| l.as_str())
    }
}

/// Result of feeding one key to the editor.
#[derive(Debug, PartialEq, Eq)]
pub enum EditorEvent {
    None,
    /// Enter was pressed; the line is ready to run.
    Submit(Line),
    /// Tab was pressed; the caller should look up completions for the line.
    Complete,
}

#[derive(Default)]
pub struct LineEditor {
    line: Line,
    history: History,
    /// Position while browsing history, counted from the newest entry.
    browsing: Option<usize>,
    /// The line being typed before history browsing started.
    draft: Line,
    /// Consecutive tabs without any other key in between.
    tabs: u32,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    pub fn handle(&mut self, event: KeyEvent, out: &mut dyn Write) -> EditorEvent {
        if event.event_type != KeyEventType::Tab {
            self.tabs = 0;
        }
        match event.event_type {
            KeyEventType::Char => {
                let c = char::from(event.character);
                if (c.is_ascii_graphic() || c == ' ') && self.line.push(c).is_ok() {
                    let _ = out.write_char(c);
                }
                EditorEvent::None
            }
            KeyEventType::Backspace => {
                if self.line.pop().is_some() {
                    let _ = out.write_str("\x08 \x08");
                }
                EditorEvent::None
            }
            KeyEventType::Enter => {
                let _ = out.write_char('\n');
                let line = core::mem::take(&mut self.line);
                self.history.push(&line);
                self.browsing = None;
                EditorEvent::Submit(line)
            }
            KeyEventType::Tab => {
                self.tabs += 1;
                EditorEvent::Complete
            }
            KeyEventType::ArrowUp => {
                self.recall_older(out);
                EditorEvent::None
            }
            KeyEventType::ArrowDown => {
                self.recall_newer(out);
                EditorEvent::None
            }
        }
    }

    fn replace_line(&mut self, text: &str, out: &mut dyn Write) {
        for _ in 0..self.line.chars().count() {
            let _ = out.write_str("\x08 \x08");
        }
        self.line.clear();
        let _ = self.line.push_str(text);
        let _ = out.write_str(&self.line);
    }

    fn recall_older(&mut self, out: &mut dyn Write) {
        let depth = self.browsing.map_or(0, |d| d + 1);
        if depth >= self.history.len() {
            return;
        }
        if self.browsing.is_none() {
            self.draft = self.line.clone();
        }
        self.browsing = Some(depth);
        let index = self.history.len() - 1 - depth;
        let entry = self.history.get(index).map(Line::try_from);
        if let Some(Ok(entry)) = entry {
            self.replace_line(&entry, out);
        }
    }

    fn recall_newer(&mut self, out: &mut dyn Write) {
        match self.browsing {
            None => {}
            Some(0) => {
                self.browsing = None;
                let draft = core::mem::take(&mut self.draft);
                self.replace_line(&draft, out);
            }
            Some(depth) => {
                self.browsing = Some(depth - 1);
                let index = self.history.len() - depth;
                let entry = self.history.get(index).map(Line::try_from);
                if let Some(Ok(entry)) = entry {
                    self.replace_line(&entry, out);
                }
            }
        }
    }

    /// Byte offset where the word under the cursor starts.
    pub fn word_start(&self) -> usize {
        self.line.rfind(' ').map_or(0, |i| i + 1)
    }

    /// Applies completion `candidates` for the current word. One candidate is inserted
    /// whole; several extend the word to their common prefix, and a second tab lists
    /// them.
    pub fn complete(&mut self, candidates: &[Completion], out: &mut dyn Write, prompt: &str) {
        let start = self.word_start();
        let word_len = self.line.len() - start;
        match candidates {
            [] => {}
            [only] => {
                let mut text = AllocString::from(&only.text[..]);
                if !only.is_dir {
                    text.push(' ');
                }
                self.insert_suffix(&text, word_len, out);
                self.tabs = 0;
            }
            many => {
                let prefix = common_prefix(many.iter().map(|c| c.text.as_str()));
                if prefix.len() > word_len {
                    self.insert_suffix(prefix, word_len, out);
                } else if self.tabs >= 2 {
                    let _ = out.write_char('\n');
                    for candidate in many {
                        let _ = write!(out, "{}{}  ", candidate.display, if candidate.is_dir { "/" } else { "" });
                    }
                    let _ = write!(out, "\n{prompt}{}", self.line);
                    self.tabs = 0;
                }
            }
        }
    }

    fn insert_suffix(&mut self, text: &str, already: usize, out: &mut dyn Write) {
        let suffix = text.get(already..).unwrap_or("");
        for c in suffix.chars() {
            if self.line.push(c).is_err() {
                break;
            }
            let _ = out.write_char(c);
        }
    }
}

/// One possible completion of the current word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Replacement for the whole word.
    pub text: AllocString,
    /// Shown when listing candidates.
    pub display: AllocString,
    pub is_dir: bool,
}

fn common_prefix<'a>(mut words: impl Iterator<Item = &'a str>) -> &'a str {
    let Some(first) = words.next() else {
        return "";
    };
    words.fold(first, |prefix, word| {
        let len = prefix
            .char_indices()
            .zip(word.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((i, a), _)| i + a.len_utf8());
        &prefix[..len]
    })
}

/// Sorted, deduplicated candidates.
pub fn normalise(mut candidates: Vec<Completion>) -> Vec<Completion> {
    candidates.sort_by(|a, b| a.text.cmp(&b.text));
    candidates.dedup_by(|a, b| a.text == b.text);
    candidates
}
