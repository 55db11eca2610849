//! Kernel log sink. Records go to COM1 as colored lines stamped with the timer
//! tick and the running pid; the hosted build reuses [`write_record`] for stderr.

use crate::panic::PANIC_CONTEXT;
use core::fmt::{self, Display, Write};
use log::{Level, LevelFilter, Log};
use owo_colors::OwoColorize;
use uart_16550::SerialPort;
use unicode_segmentation::UnicodeSegmentation;

const COM1: u16 = 0x3f8;

#[derive(Clone, Copy)]
enum Shade {
    Plain,
    Dim,
    Level(Level),
    Alarm,
}

fn paint(out: &mut impl Write, shade: Shade, text: impl Display) -> fmt::Result {
    let text: &dyn Display = match shade {
        Shade::Plain => &text,
        Shade::Dim => &text.dimmed(),
        Shade::Alarm | Shade::Level(Level::Error) => &text.bright_red(),
        Shade::Level(Level::Warn) => &text.bright_yellow(),
        Shade::Level(Level::Info) => &text.bright_blue(),
        Shade::Level(Level::Debug) => &text.bright_cyan(),
        Shade::Level(Level::Trace) => &text.bright_magenta(),
    };
    write!(out, "{text}")
}

/// Formats one log line: `LEVEL [tick] pid N: message`.
pub fn write_record(out: &mut impl Write, record: &log::Record) -> fmt::Result {
    let level = record.level();
    paint(out, Shade::Level(level), format_args!("{level:5} "))?;
    let (tick, pid) = (PANIC_CONTEXT.tick(), PANIC_CONTEXT.pid());
    paint(out, Shade::Dim, format_args!("[{tick:>8}] pid {pid}: "))?;
    paint(out, Shade::Plain, record.args())?;
    out.write_char('\n')
}

/// Serial terminals want `\r\n`.
pub(crate) struct CrLf<T>(pub T);

impl<T: Write> Write for CrLf<T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for g in s.graphemes(true) {
            match g {
                "\n" => self.0.write_str("\r\n")?,
                g => self.0.write_str(g)?,
            }
        }
        Ok(())
    }
}

struct SerialLogger {
    port: spin::Mutex<SerialPort>,
}

static LOGGER: SerialLogger = SerialLogger { port: spin::Mutex::new(unsafe { SerialPort::new(COM1) }) };

impl Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = self.port.lock();
        // A dead serial line has nowhere to report to.
        let _ = write_record(&mut CrLf(&mut *port), record);
    }

    fn flush(&self) {}
}

/// Initialises COM1 and installs the serial logger. Only valid on bare metal.
pub fn init(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    LOGGER.port.lock().init();
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}

/// Writes straight to COM1, bypassing the log filter. Used by the panic path.
pub fn write_raw(args: fmt::Arguments<'_>) {
    // The panicking code may hold the port.
    let mut port = match LOGGER.port.try_lock() {
        Some(port) => port,
        None => {
            unsafe { LOGGER.port.force_unlock() };
            LOGGER.port.lock()
        }
    };
    let mut out = CrLf(&mut *port);
    let _ = paint(&mut out, Shade::Alarm, args);
    let _ = out.write_char('\n');
}
