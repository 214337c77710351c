//! Service records: the entity supervised by the engine.
//!
//! A record couples the parsed declaration (command, runlevels, conditions,
//! launch payload) with the live state machine fields (state, block, pid,
//! crash counter). Records are owned by the [`crate::registry::Registry`]
//! arena and addressed by [`SvcId`].

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::{
    cond::CondExpr,
    constants::{DEFAULT_KILL_DELAY, RUNLEVEL_S},
    privilege::LimitsConfig,
};

/// Stable arena handle for a service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SvcId(pub u32);

impl std::fmt::Display for SvcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle family of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SvcKind {
    /// Long-running daemon, respawned on exit.
    Service,
    /// One-shot command, may run in parallel with others.
    Task,
    /// One-shot command, sequential.
    Run,
    /// Program controlled via `start`/`stop` subcommands.
    Sysv,
    /// Getty line; shares the daemon lifecycle.
    Tty,
}

impl SvcKind {
    /// Daemons are monitored and respawned; their exit is a crash.
    pub fn is_daemon(&self) -> bool {
        matches!(self, SvcKind::Service | SvcKind::Tty)
    }

    /// Run-to-completion kinds: task, run and sysv.
    pub fn is_runtask(&self) -> bool {
        matches!(self, SvcKind::Task | SvcKind::Run | SvcKind::Sysv)
    }
}

/// Per-service state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SvcState {
    /// Idle, not cleared to run.
    Halted,
    /// Cleared to start, awaiting conditions.
    Ready,
    /// Child alive.
    Running,
    /// Halt signal sent, awaiting reap.
    Stopping,
    /// Paused via SIGSTOP on a transient condition.
    Waiting,
    /// One-shot completed.
    Done,
}

/// Why a service is administratively disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SvcBlock {
    /// Not blocked.
    None,
    /// Declared `manual:yes` or stopped by the operator.
    Manual,
    /// Command or environment file not found.
    Missing,
    /// Crash cap exceeded; operator start required.
    Crashing,
    /// Respawn retry timer pending.
    Restarting,
    /// Transient internal operation in progress (sysv stop script).
    Busy,
}

/// Bitset over runlevels 0..=9 plus S.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunlevelMask(u16);

impl RunlevelMask {
    /// Empty set.
    pub const fn empty() -> Self {
        RunlevelMask(0)
    }

    /// Adds one runlevel (0..=9, or [`RUNLEVEL_S`]).
    pub fn add(&mut self, level: u8) {
        if level <= RUNLEVEL_S {
            self.0 |= 1 << level;
        }
    }

    /// Membership test.
    pub fn contains(&self, level: u8) -> bool {
        level <= RUNLEVEL_S && self.0 & (1 << level) != 0
    }

    /// True when the set names the bootstrap level and nothing else.
    pub fn is_bootstrap_only(&self) -> bool {
        self.0 == 1 << RUNLEVEL_S
    }

    /// Parses the inner text of a `[...]` runlevel set.
    ///
    /// Digits and `S`/`s` are members; `a-b` denotes a digit range; a
    /// leading `!` complements the result against 0..=9 and S.
    pub fn parse(spec: &str) -> Option<Self> {
        let (negate, body) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        let mut mask = RunlevelMask::empty();
        let chars: Vec<char> = body.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                'S' | 's' => mask.add(RUNLEVEL_S),
                d @ '0'..='9' => {
                    let lo = d as u8 - b'0';
                    if i + 2 < chars.len()
                        && chars[i + 1] == '-'
                        && chars[i + 2].is_ascii_digit()
                    {
                        let hi = chars[i + 2] as u8 - b'0';
                        if hi < lo {
                            return None;
                        }
                        for level in lo..=hi {
                            mask.add(level);
                        }
                        i += 2;
                    } else {
                        mask.add(lo);
                    }
                }
                _ => return None,
            }
            i += 1;
        }

        if negate {
            let full = (1u16 << (RUNLEVEL_S + 1)) - 1;
            mask.0 = full & !mask.0;
        }
        Some(mask)
    }
}

impl std::fmt::Display for RunlevelMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for level in 0..=9u8 {
            if self.contains(level) {
                write!(f, "{level}")?;
            }
        }
        if self.contains(RUNLEVEL_S) {
            write!(f, "S")?;
        }
        write!(f, "]")
    }
}

/// Where the child's stdout/stderr go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogSink {
    /// Discard output.
    #[default]
    Null,
    /// Inherit the supervisor's console.
    Console,
    /// Append to a file.
    File(PathBuf),
    /// Pipe through a `logger` sidecar with the given tag.
    Syslog {
        /// Syslog tag, defaults to the service identifier.
        tag: String,
    },
}

/// Pidfile declaration from `pid:[!]/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidfileSpec {
    /// File the daemon pid is read from or written to.
    pub path: PathBuf,
    /// `pid:!/path`: the daemon forks and writes the file itself.
    pub forking: bool,
}

/// Timer kinds dispatched back to the state machine as `(SvcId, TimerKind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Kill escalation while STOPPING.
    Kill,
    /// Respawn retry after a crash.
    Retry,
    /// Uptime probe that resets the crash counter.
    Stable,
}

/// Fields shared by a parsed declaration, before it becomes a live record.
#[derive(Debug, Clone)]
pub struct ServiceDecl {
    /// Lifecycle family.
    pub kind: SvcKind,
    /// Absolute command path or bare name resolved via PATH.
    pub cmd: PathBuf,
    /// Arguments, prior to word expansion.
    pub args: Vec<String>,
    /// Instance tag from `:id`; empty by default.
    pub instance: String,
    /// Display/condition name from `name:`; falls back to command basename.
    pub name: Option<String>,
    /// Allowed runlevels.
    pub runlevels: RunlevelMask,
    /// Start gate conditions.
    pub cond: CondExpr,
    /// User from `@user`.
    pub user: Option<String>,
    /// Group from `@user:group`.
    pub group: Option<String>,
    /// Environment file from `env:/path`.
    pub env_file: Option<PathBuf>,
    /// Whether a missing env file is tolerated (`env:-/path`).
    pub env_file_optional: bool,
    /// stdout/stderr destination.
    pub log: LogSink,
    /// Pidfile declaration.
    pub pidfile: Option<PidfileSpec>,
    /// Resource limits from `rlimit:`.
    pub rlimits: LimitsConfig,
    /// Opaque cgroup settings from `cgroup:`; forwarded, not interpreted.
    pub cgroup: Option<String>,
    /// Requires an explicit operator start.
    pub manual: bool,
    /// Reload delivers SIGHUP instead of stop/start.
    pub sighup_supported: bool,
    /// Signal sent to stop the service.
    pub sighalt: Signal,
    /// Grace period before SIGKILL.
    pub kill_delay: Duration,
    /// Free text after `--`.
    pub description: String,
}

impl ServiceDecl {
    /// Bare declaration for the given kind and command.
    pub fn new(kind: SvcKind, cmd: PathBuf) -> Self {
        ServiceDecl {
            kind,
            cmd,
            args: Vec::new(),
            instance: String::new(),
            name: None,
            runlevels: RunlevelMask::empty(),
            cond: CondExpr::default(),
            user: None,
            group: None,
            env_file: None,
            env_file_optional: false,
            log: LogSink::default(),
            pidfile: None,
            rlimits: LimitsConfig::default(),
            cgroup: None,
            manual: false,
            sighup_supported: false,
            sighalt: Signal::SIGTERM,
            kill_delay: DEFAULT_KILL_DELAY,
            description: String::new(),
        }
    }

    /// Name used in logs and for the service's own `pid/` condition.
    pub fn display_name(&self) -> String {
        let base = self
            .name
            .clone()
            .or_else(|| {
                self.cmd
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| self.cmd.display().to_string());
        if self.instance.is_empty() {
            base
        } else {
            format!("{base}:{}", self.instance)
        }
    }
}

/// A live, supervised service.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Arena handle.
    pub id: SvcId,
    /// Parsed declaration.
    pub decl: ServiceDecl,
    /// Hash of the stanza text; drives `dirty` detection on reload.
    pub stanza_hash: String,
    /// File the stanza came from.
    pub origin: PathBuf,
    /// Current state machine state.
    pub state: SvcState,
    /// Why the service is disabled, if it is.
    pub block: SvcBlock,
    /// Child pid; 0 when not running. Never 1.
    pub pid: i32,
    /// Previous pid across a forking-daemon pidfile swap.
    pub oldpid: i32,
    /// Monotonic launch time, for restart damping.
    pub start_time: Option<Instant>,
    /// Wall-clock launch time, for the status snapshot.
    pub started_at: Option<DateTime<Utc>>,
    /// Consecutive crash counter.
    pub restart_cnt: u32,
    /// Run-once counter for runtasks within the current runlevel.
    pub once: u32,
    /// SYSV has-run-this-runlevel flag; for tasks, ran-successfully.
    pub started: bool,
    /// Declaration text changed since last (re)start.
    pub dirty: bool,
    /// Marked for removal by the reload sweep.
    pub removed: bool,
    /// Exit status of the last completed run, as reported by wait(2).
    pub exit_status: Option<i32>,
    /// Environment accumulated from the env file at last launch.
    pub launch_env: BTreeMap<String, String>,
}

impl ServiceRecord {
    /// Wraps a declaration into an idle record.
    pub fn new(id: SvcId, decl: ServiceDecl, stanza_hash: String, origin: PathBuf) -> Self {
        let block = if decl.manual {
            SvcBlock::Manual
        } else {
            SvcBlock::None
        };
        ServiceRecord {
            id,
            decl,
            stanza_hash,
            origin,
            state: SvcState::Halted,
            block,
            pid: 0,
            oldpid: 0,
            start_time: None,
            started_at: None,
            restart_cnt: 0,
            once: 0,
            started: false,
            dirty: false,
            removed: false,
            exit_status: None,
            launch_env: BTreeMap::new(),
        }
    }

    /// Identity key: `(command, instance)`.
    pub fn ident(&self) -> (&Path, &str) {
        (self.decl.cmd.as_path(), self.decl.instance.as_str())
    }

    /// Log/condition name.
    pub fn name(&self) -> String {
        self.decl.display_name()
    }

    /// The condition this service asserts while running.
    pub fn own_cond(&self) -> String {
        format!("pid/{}", self.name())
    }

    /// True when a live child is attached. `pid <= 1` never counts.
    pub fn has_child(&self) -> bool {
        self.pid > 1
    }

    /// Clears all process bookkeeping after a reap.
    pub fn forget_child(&mut self) {
        self.pid = 0;
        self.oldpid = 0;
        self.start_time = None;
        self.started_at = None;
    }
}
