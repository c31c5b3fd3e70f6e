//! Console backend for the `log` facade.
//!
//! Used by the demo binary; library embedders and tests may install their
//! own logger instead (the facade is a no-op when none is set).

use log::{Level, LevelFilter, Log, Metadata, Record};

struct Console;

static CONSOLE: Console = Console;

impl Log for Console {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] <{}> => {}",
            record.level(),
            record.target(),
            record.args()
        );
        if record.level() <= Level::Warn {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn flush(&self) {}
}

/// Install the console logger at the given level. Harmless if a logger is
/// already installed.
pub fn init(level: LevelFilter) {
    if log::set_logger(&CONSOLE).is_ok() {
        log::set_max_level(level);
    }
}
