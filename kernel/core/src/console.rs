//! Text console: the "GUI" output sink the shell and the panic path write to when
//! the output mode says so. On bare metal it draws into the VGA text buffer.

use core::fmt::{self, Write};
use unicode_segmentation::UnicodeSegmentation;

pub const WIDTH: usize = 80;
pub const HEIGHT: usize = 25;

/// Light grey on black.
pub const DEFAULT_ATTRIBUTE: u8 = 0x07;
/// White on blue, used for the panic screen.
pub const PANIC_ATTRIBUTE: u8 = 0x1F;

/// A grid of `WIDTH * HEIGHT` character cells, each `attribute << 8 | ascii`.
pub trait CellBuffer {
    fn set(&mut self, index: usize, cell: u16);
    fn get(&self, index: usize) -> u16;
}

impl CellBuffer for [u16; WIDTH * HEIGHT] {
    fn set(&mut self, index: usize, cell: u16) {
        self[index] = cell;
    }

    fn get(&self, index: usize) -> u16 {
        self[index]
    }
}

pub struct TextConsole<B: CellBuffer> {
    cells: B,
    row: usize,
    column: usize,
    attribute: u8,
}

impl<B: CellBuffer> TextConsole<B> {
    pub fn new(cells: B) -> Self {
        let mut console = Self { cells, row: 0, column: 0, attribute: DEFAULT_ATTRIBUTE };
        console.clear();
        console
    }

    pub fn set_attribute(&mut self, attribute: u8) {
        self.attribute = attribute;
    }

    pub fn clear(&mut self) {
        let blank = self.blank();
        for index in 0..WIDTH * HEIGHT {
            self.cells.set(index, blank);
        }
        self.row = 0;
        self.column = 0;
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.column)
    }

    /// Text of one row, trailing blanks removed.
    pub fn line(&self, row: usize) -> heapless::String<WIDTH> {
        let mut out = heapless::String::new();
        for column in 0..WIDTH {
            let _ = out.push(char::from(self.cells.get(row * WIDTH + column) as u8));
        }
        while out.ends_with(' ') {
            out.pop();
        }
        out
    }

    fn blank(&self) -> u16 {
        u16::from(self.attribute) << 8 | u16::from(b' ')
    }

    fn newline(&mut self) {
        self.column = 0;
        if self.row + 1 < HEIGHT {
            self.row += 1;
            return;
        }
        for index in WIDTH..WIDTH * HEIGHT {
            let cell = self.cells.get(index);
            self.cells.set(index - WIDTH, cell);
        }
        let blank = self.blank();
        for column in 0..WIDTH {
            self.cells.set((HEIGHT - 1) * WIDTH + column, blank);
        }
    }

    fn put(&mut self, byte: u8) {
        if self.column == WIDTH {
            self.newline();
        }
        let cell = u16::from(self.attribute) << 8 | u16::from(byte);
        self.cells.set(self.row * WIDTH + self.column, cell);
        self.column += 1;
    }

    fn backspace(&mut self) {
        if self.column > 0 {
            self.column -= 1;
            let blank = self.blank();
            self.cells.set(self.row * WIDTH + self.column, blank);
        }
    }
}

impl<B: CellBuffer> Write for TextConsole<B> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for grapheme in s.graphemes(true) {
            match grapheme {
                "\r" => self.column = 0,
                "\n" | "\r\n" => self.newline(),
                "\x08" => self.backspace(),
                g if g.len() == 1 && g.as_bytes()[0].is_ascii_graphic() || g == " " => {
                    self.put(g.as_bytes()[0]);
                }
                // The VGA font has no glyphs for anything else.
                _ => self.put(b'?'),
            }
        }
        Ok(())
    }
}

/// The memory-mapped VGA text buffer.
#[cfg(target_os = "none")]
pub struct VgaBuffer {
    base: *mut u16,
}

#[cfg(target_os = "none")]
unsafe impl Send for VgaBuffer {}

#[cfg(target_os = "none")]
impl VgaBuffer {
    const ADDRESS: usize = 0xB8000;

    /// # Safety
    /// Only one `VgaBuffer` may exist, and the text buffer must be identity mapped.
    pub const unsafe fn new() -> Self {
        Self { base: Self::ADDRESS as *mut u16 }
    }
}

#[cfg(target_os = "none")]
impl CellBuffer for VgaBuffer {
    fn set(&mut self, index: usize, cell: u16) {
        assert!(index < WIDTH * HEIGHT);
        unsafe { self.base.add(index).write_volatile(cell) };
    }

    fn get(&self, index: usize) -> u16 {
        assert!(index < WIDTH * HEIGHT);
        unsafe { self.base.add(index).read_volatile() }
    }
}
