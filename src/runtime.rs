//! Helpers for resolving runtime paths based on the current privilege mode.
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{OnceLock, RwLock},
};

use fs2::FileExt;

use crate::{
    constants::{COND_DIR_NAME, LOCK_FILE_NAME},
    error::SupervisorError,
};

/// Runtime mode that determines where state and conditions live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Userspace mode; state lives under the invoking user's home directory.
    User,
    /// System mode; state is stored under `/run` and `/etc` as process #1
    /// expects.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    config_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        Self {
            mode: RuntimeMode::User,
            state_dir: home.join(".local/share/initg"),
            config_dir: home.join(".config/initg"),
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/run/initg"),
            config_dir: PathBuf::from("/etc/initg.d"),
        }
    }
}

/// Updates the global runtime directories for the provided mode. Subsequent
/// calls overwrite the active configuration.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_mode(mode);
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_user_home(home.to_path_buf());
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .mode
}

/// Root directory for runtime state (conditions, status snapshot, lock).
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// Directory holding condition files; must live on a tmpfs in system mode.
pub fn cond_dir() -> PathBuf {
    state_dir().join(COND_DIR_NAME)
}

/// Directory searched for `*.conf` service declarations.
pub fn config_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .config_dir
        .clone()
}

/// Exclusive lock held for the lifetime of a supervisor instance.
///
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub struct StateLock {
    _file: fs::File,
}

/// Takes the state-directory lock, refusing to run beside another supervisor.
pub fn acquire_lock(state_dir: &Path) -> Result<StateLock, SupervisorError> {
    fs::create_dir_all(state_dir).map_err(SupervisorError::Io)?;
    let path = state_dir.join(LOCK_FILE_NAME);
    let file = fs::File::create(&path).map_err(SupervisorError::Io)?;
    file.try_lock_exclusive()
        .map_err(|_| SupervisorError::AlreadyRunning(state_dir.to_path_buf()))?;
    Ok(StateLock { _file: file })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;
    use tempfile::tempdir;

    #[test]
    fn user_mode_uses_home_scoped_paths() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        init_with_test_home(temp.path());

        assert_eq!(state_dir(), temp.path().join(".local/share/initg"));
        assert_eq!(cond_dir(), temp.path().join(".local/share/initg/cond"));
        assert_eq!(config_dir(), temp.path().join(".config/initg"));
    }

    #[test]
    fn system_mode_uses_run_directories() {
        let _guard = env_lock();
        init(RuntimeMode::System);

        assert_eq!(state_dir(), PathBuf::from("/run/initg"));
        assert_eq!(config_dir(), PathBuf::from("/etc/initg.d"));

        init(RuntimeMode::User);
    }

    #[test]
    fn second_lock_on_same_dir_is_refused() {
        let temp = tempdir().expect("tempdir");
        let first = acquire_lock(temp.path()).expect("first lock");
        let second = acquire_lock(temp.path());
        assert!(matches!(
            second,
            Err(SupervisorError::AlreadyRunning(_))
        ));
        drop(first);
        acquire_lock(temp.path()).expect("relock after release");
    }
}
