//! Condition store: named tri-valued predicates gating service starts.
//!
//! Conditions are files under a tmpfs-backed directory. A file containing
//! the `+` sentinel (or `-` for one-shots) reads ON, a file containing `~`
//! reads FLUX, an absent file reads OFF. The store starts unavailable:
//! until base filesystems are up, writes are dropped and reads return ON so
//! bootstrap tasks are not stalled.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::error::CondError;

const SENTINEL_ON: &[u8] = b"+";
const SENTINEL_ONESHOT: &[u8] = b"-";
const SENTINEL_FLUX: &[u8] = b"~";

/// Value of a single condition or an aggregated expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondValue {
    /// Asserted.
    On,
    /// Not asserted.
    Off,
    /// Being reasserted; dependents pause rather than stop.
    Flux,
}

/// One term of a condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondTerm {
    /// Condition name, e.g. `pid/zebra` or `net/eth0/up`.
    pub name: String,
    /// Satisfied when the condition is OFF instead of ON.
    pub negated: bool,
}

/// AND-aggregated condition expression from a `<...>` declaration field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CondExpr(pub Vec<CondTerm>);

impl CondExpr {
    /// Parses the inner text of a `<...>` field. A leading `!` negates
    /// every listed condition ("none of").
    pub fn parse(spec: &str) -> Self {
        let (negated, body) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let terms = body
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| CondTerm {
                name: name.to_string(),
                negated,
            })
            .collect();
        CondExpr(terms)
    }

    /// True when the expression references no conditions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `changed` is referenced by any term.
    pub fn affects(&self, changed: &str) -> bool {
        self.0.iter().any(|term| term.name == changed)
    }
}

impl std::fmt::Display for CondExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, term) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if term.negated {
                write!(f, "!")?;
            }
            write!(f, "{}", term.name)?;
        }
        Ok(())
    }
}

/// Filesystem-backed condition store.
#[derive(Debug)]
pub struct CondStore {
    base: PathBuf,
    available: bool,
}

impl CondStore {
    /// Creates a store rooted at `base`. The store starts unavailable.
    pub fn new(base: PathBuf) -> Self {
        CondStore {
            base,
            available: false,
        }
    }

    /// Marks the store usable once base filesystems are mounted.
    pub fn enable(&mut self) -> Result<(), CondError> {
        fs::create_dir_all(&self.base)?;
        self.available = true;
        Ok(())
    }

    /// Whether writes are currently honored.
    pub fn available(&self) -> bool {
        self.available
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, CondError> {
        if name.is_empty()
            || name.starts_with('/')
            || name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(CondError::BadName(name.to_string()));
        }
        Ok(self.base.join(name))
    }

    fn write_sentinel(&self, name: &str, sentinel: &[u8]) -> Result<(), CondError> {
        if !self.available {
            trace!("condition store unavailable, dropping write of {name}");
            return Ok(());
        }
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, sentinel)?;
        Ok(())
    }

    /// Asserts a condition. Idempotent.
    pub fn set(&self, name: &str) -> Result<(), CondError> {
        debug!("condition {name} -> on");
        self.write_sentinel(name, SENTINEL_ON)
    }

    /// Asserts a condition that is swept away on reload. Idempotent.
    pub fn set_oneshot(&self, name: &str) -> Result<(), CondError> {
        debug!("condition {name} -> on (oneshot)");
        self.write_sentinel(name, SENTINEL_ONESHOT)
    }

    /// Clears a condition. Clearing an absent condition is a no-op.
    pub fn clear(&self, name: &str) -> Result<(), CondError> {
        if !self.available {
            trace!("condition store unavailable, dropping clear of {name}");
            return Ok(());
        }
        debug!("condition {name} -> off");
        let path = self.path_for(name)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Marks an asserted condition as in flux so dependents pause on the
    /// transient; the writer re-asserts with [`CondStore::set`] afterwards.
    pub fn reassert(&self, name: &str) -> Result<(), CondError> {
        if self.get(name) == CondValue::Off {
            return Ok(());
        }
        debug!("condition {name} -> flux");
        self.write_sentinel(name, SENTINEL_FLUX)
    }

    /// Reads one condition. Before the store is available this returns ON.
    pub fn get(&self, name: &str) -> CondValue {
        if !self.available {
            return CondValue::On;
        }
        let Ok(path) = self.path_for(name) else {
            return CondValue::Off;
        };
        match fs::read(path) {
            Ok(bytes) if bytes == SENTINEL_FLUX => CondValue::Flux,
            Ok(_) => CondValue::On,
            Err(_) => CondValue::Off,
        }
    }

    /// AND-aggregates an expression: OFF dominates, then FLUX, else ON.
    pub fn get_agg(&self, expr: &CondExpr) -> CondValue {
        let mut saw_flux = false;
        for term in &expr.0 {
            let value = self.get(&term.name);
            let effective = if term.negated {
                match value {
                    CondValue::On => CondValue::Off,
                    CondValue::Off => CondValue::On,
                    CondValue::Flux => CondValue::Flux,
                }
            } else {
                value
            };
            match effective {
                CondValue::Off => return CondValue::Off,
                CondValue::Flux => saw_flux = true,
                CondValue::On => {}
            }
        }
        if saw_flux {
            CondValue::Flux
        } else {
            CondValue::On
        }
    }

    /// Removes every one-shot condition; called during config reload.
    pub fn sweep_oneshots(&self) -> Result<(), CondError> {
        if !self.available {
            return Ok(());
        }
        let mut stack = vec![self.base.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if fs::read(&path).map(|b| b == SENTINEL_ONESHOT).unwrap_or(false) {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }
}
