use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;

/// `log` sink for test runs: `[LEVEL] target: message` on stderr.
pub struct SimLogger {
    max_level: LevelFilter,
}

impl SimLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install as the global logger.
    ///
    /// # Errors
    /// [`SetLoggerError`] if a logger is already installed, e.g. by another
    /// test in the same binary.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        log::set_logger(Box::leak(Box::new(self)))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for SimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // stderr is unbuffered; a failed write has nowhere to go.
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
