//! Operator-facing output for the client
//!
//! Severity lines are always shown, colour coded; common and info lines only
//! in verbose mode.

use std::io::{self, Write};

use crossterm::style::Stylize;

use super::classify::LineKind;

pub struct Console {
    verbose: bool,
    out: Box<dyn Write + Send>,
}

impl Console {
    pub fn stdout(verbose: bool) -> Self {
        Self::with_writer(verbose, Box::new(io::stdout()))
    }

    pub fn with_writer(verbose: bool, out: Box<dyn Write + Send>) -> Self {
        Self { verbose, out }
    }

    /// Echo one response line according to its classification
    pub fn line(&mut self, kind: LineKind, text: &str) {
        if !(self.verbose || kind.is_failure()) {
            return;
        }
        let result = match kind {
            LineKind::Common => write!(self.out, "{}", text),
            LineKind::Info => write!(self.out, "{}", text.green()),
            LineKind::Warning => write!(self.out, "{}", text.yellow()),
            LineKind::CriticalWarning | LineKind::Error => write!(self.out, "{}", text.red()),
        };
        self.finish(result);
    }

    /// Print `text` in red regardless of verbosity
    pub fn error(&mut self, text: &str) {
        let result = write!(self.out, "{}", text.red());
        self.finish(result);
    }

    pub fn failure_banner(&mut self) {
        self.error("\nCommand Failed.\n");
    }

    pub fn newline(&mut self) {
        let result = writeln!(self.out);
        self.finish(result);
    }

    fn finish(&mut self, result: io::Result<()>) {
        if result.and_then(|_| self.out.flush()).is_err() {
            tracing::debug!("Console write failed");
        }
    }
}
