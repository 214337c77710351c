//! Boot console progress lines.
//!
//! Runlevel transitions outside bootstrap report each service action as a
//! `[ OK ]` / `[WARN]` / `[FAIL]` line, colored when stdout is a terminal.

use std::io::IsTerminal;

use crossterm::style::Stylize;

/// Outcome tag for one progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Action completed.
    Ok,
    /// Action completed with a caveat (e.g. SIGKILL escalation).
    Warn,
    /// Action failed.
    Fail,
}

/// Console progress reporter.
#[derive(Debug)]
pub struct Console {
    enabled: bool,
    color: bool,
}

impl Console {
    /// Creates a reporter; lines are suppressed until
    /// [`Console::set_enabled`] turns them on after bootstrap.
    pub fn new() -> Self {
        Console {
            enabled: false,
            color: std::io::stdout().is_terminal(),
        }
    }

    /// Enables or suppresses progress output.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether lines are currently printed.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Prints one progress line.
    pub fn note(&self, progress: Progress, text: &str) {
        if !self.enabled {
            return;
        }
        let tag = match (progress, self.color) {
            (Progress::Ok, true) => format!("[ {} ]", "OK".green()),
            (Progress::Warn, true) => format!("[{}]", "WARN".yellow()),
            (Progress::Fail, true) => format!("[{}]", "FAIL".red()),
            (Progress::Ok, false) => "[ OK ]".to_string(),
            (Progress::Warn, false) => "[WARN]".to_string(),
            (Progress::Fail, false) => "[FAIL]".to_string(),
        };
        println!("{tag} {text}");
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::new()
    }
}
