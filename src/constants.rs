//! Constants and tunables for the initg supervisor.

use std::time::Duration;

// ============================================================================
// Runlevels
// ============================================================================

/// Numeric slot used for the bootstrap runlevel `S` in runlevel bitmasks.
pub const RUNLEVEL_S: u8 = 10;

/// Runlevel entered after bootstrap when the configuration does not name one.
pub const DEFAULT_RUNLEVEL: u8 = 2;

/// Runlevels a service is allowed in when its declaration names none.
pub const DEFAULT_RUNLEVELS: &str = "2345";

// ============================================================================
// Respawn policy
// ============================================================================

/// Consecutive crashes tolerated before a service is blocked as crashing.
pub const SVC_RESPAWN_MAX: u32 = 10;

/// First retry is a bounce through the step loop, not a real delay.
pub const RESPAWN_BOUNCE: Duration = Duration::from_millis(1);

/// Retry interval while the crash counter is in the lower half of the cap.
pub const RESPAWN_INTERVAL_EARLY: Duration = Duration::from_secs(2);

/// Retry interval once the crash counter passes half the cap.
pub const RESPAWN_INTERVAL_LATE: Duration = Duration::from_secs(5);

/// A service that stays up this long has its crash counter reset.
pub const RESPAWN_STABLE_AFTER: Duration = Duration::from_secs(30);

// ============================================================================
// Stop and shutdown timing
// ============================================================================

/// Grace period between the halt signal and SIGKILL when none is configured.
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(3);

/// Lower bound for the configurable kill delay.
pub const KILL_DELAY_MIN: Duration = Duration::from_millis(1);

/// Upper bound for the configurable kill delay.
pub const KILL_DELAY_MAX: Duration = Duration::from_secs(60);

/// Global deadline for shutdown before survivors are killed outright.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Step loop
// ============================================================================

/// Upper bound on quiescence passes in one step round; exceeding it is a bug.
pub const STEP_PASS_LIMIT: usize = 64;

// ============================================================================
// File system
// ============================================================================

/// Name of the status snapshot written after each quiescent step.
pub const STATUS_FILE_NAME: &str = "status.json";

/// Lock file guarding against a second supervisor on the same state dir.
pub const LOCK_FILE_NAME: &str = "initg.lock";

/// Subdirectory of the runtime dir holding condition files.
pub const COND_DIR_NAME: &str = "cond";

/// Config file extension picked up from the configuration directory.
pub const CONF_SUFFIX: &str = ".conf";

// ============================================================================
// sysexits(3) codes used for synchronous launch failures
// ============================================================================

/// Successful exit.
pub const EX_OK: i32 = 0;
/// A required input file (the TTY device) was not usable.
pub const EX_OSFILE: i32 = 72;
/// Configuration error, e.g. a bad TTY device path.
pub const EX_CONFIG: i32 = 78;
/// Exit code reported by the child when exec itself fails.
pub const EX_EXEC_FAILED: i32 = 127;

// ============================================================================
// External programs
// ============================================================================

/// Getty launched for `tty` lines that name a device rather than a command.
pub const DEFAULT_GETTY: &str = "/sbin/agetty";

/// Fallback shell spawned for `tty ... notty` lines.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Sidecar program used for the syslog log sink.
pub const LOGGER_BIN: &str = "logger";

/// PATH exported to children of a non-root supervisor.
pub const USER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// PATH exported to children when running as root.
pub const ROOT_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
