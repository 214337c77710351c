//! Error handling for initg.
use std::path::PathBuf;

use thiserror::Error;

/// Umbrella error for the supervisor engine.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Process launch error.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Condition store error.
    #[error(transparent)]
    Cond(#[from] CondError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Raw OS error from a syscall wrapper.
    #[error("system call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// Another supervisor already owns the state directory.
    #[error("state directory {0} is locked by another supervisor")]
    AlreadyRunning(PathBuf),
}

/// Errors raised while reading or parsing service declarations.
///
/// A malformed stanza refuses that record only; other services are
/// unaffected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a configuration file or directory.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// First token of a stanza is not a known service kind.
    #[error("unknown service kind '{0}'")]
    UnknownKind(String),

    /// Malformed runlevel set, e.g. `[2x]`.
    #[error("invalid runlevel set '{0}'")]
    BadRunlevels(String),

    /// Unknown signal name in `halt:`.
    #[error("invalid signal '{0}'")]
    BadSignal(String),

    /// Kill delay outside 1ms..60s.
    #[error("kill delay '{0}' out of range")]
    BadKillDelay(String),

    /// Malformed `rlimit:` entry.
    #[error("invalid rlimit '{0}'")]
    BadLimit(String),

    /// Malformed `log:` sink.
    #[error("invalid log sink '{0}'")]
    BadLogSink(String),

    /// Malformed `tty` line.
    #[error("invalid tty line: {0}")]
    BadTty(String),

    /// Unbalanced quote in a stanza.
    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),

    /// Token that fits no slot of the declaration grammar.
    #[error("unexpected token '{0}'")]
    BadToken(String),

    /// Stanza carries options but never names a command to run.
    #[error("stanza has no command: '{0}'")]
    MissingCommand(String),
}

/// Errors raised by the process launcher before or during exec.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Command not found in PATH; the service is blocked, not retried.
    #[error("command '{0}' not found")]
    MissingBinary(PathBuf),

    /// Declared environment file does not exist.
    #[error("environment file '{0}' not found")]
    MissingEnvFile(PathBuf),

    /// fork(2) failed.
    #[error("fork failed: {0}")]
    Fork(#[source] nix::errno::Errno),

    /// Opening a stdio redirect target failed.
    #[error("failed to open log sink '{path}': {source}")]
    LogSink {
        /// Redirect target that failed to open.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// argv contained an interior NUL and cannot be passed to exec.
    #[error("argument contains NUL byte: '{0}'")]
    BadArgument(String),

    /// User or group lookup failed for `@user[:group]`.
    #[error("unknown user or group: {0}")]
    Credentials(String),

    /// Generic I/O failure while preparing the child.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the condition store.
///
/// Writes before the store is available are silently dropped and never
/// surface here.
#[derive(Debug, Error)]
pub enum CondError {
    /// Condition name escapes the store directory.
    #[error("invalid condition name '{0}'")]
    BadName(String),

    /// Filesystem error under the condition directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
