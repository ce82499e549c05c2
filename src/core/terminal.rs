//! Controlling terminal mode
//!
//! Raw mode is process-global state, so the supervisor enters it at start and
//! restores it on every stop path, including runs where the child never
//! spawned.

use std::io;

use crossterm::terminal;

/// Tracks whether this process put the terminal into raw mode.
#[derive(Debug, Default)]
pub struct TerminalMode {
    raw: bool,
}

impl TerminalMode {
    /// Switch the controlling terminal to raw mode
    pub fn enter_raw(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        self.raw = true;
        Ok(())
    }

    /// Restore the saved terminal settings.
    ///
    /// Safe to call when raw mode was never entered.
    pub fn restore(&mut self) -> io::Result<()> {
        if !std::mem::take(&mut self.raw) {
            return Ok(());
        }
        terminal::disable_raw_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_without_enter_is_noop() {
        let mut mode = TerminalMode::default();
        assert!(!mode.raw);
        assert!(mode.restore().is_ok());
        assert!(mode.restore().is_ok());
        assert!(!mode.raw);
    }
}
