//! Process launcher: fork/exec of service children.
//!
//! All fallible preparation (PATH lookup, env file parsing, argv expansion,
//! credential resolution, log sink opening) happens in the parent, where an
//! error can still refuse the launch. The child path between fork and exec
//! only applies pre-resolved state and execs.

use std::{
    collections::BTreeMap,
    env,
    ffi::CString,
    fs,
    io::{self, Write},
    os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask},
    unistd::{ForkResult, dup2, execvpe, fork, setsid},
};
use tracing::{debug, trace, warn};

use crate::{
    constants::{
        EX_CONFIG, EX_EXEC_FAILED, EX_OSFILE, LOGGER_BIN, ROOT_PATH, USER_PATH,
    },
    error::LaunchError,
    privilege::PrivilegeContext,
    expand,
    service::{LogSink, ServiceDecl, SvcKind},
    tty,
};

/// A successfully forked child.
#[derive(Debug)]
pub struct Launched {
    /// Child pid; also its process group after `setsid`.
    pub pid: i32,
    /// Environment that was sourced from the env file, recorded on the
    /// service for later expansion.
    pub env: BTreeMap<String, String>,
}

/// Everything resolved in the parent before fork.
struct Prepared {
    exe: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    env_map: BTreeMap<String, String>,
    privileges: PrivilegeContext,
    stdout: SinkFd,
    stderr: SinkFd,
    stdin_null: bool,
    tty_device: Option<PathBuf>,
}

enum SinkFd {
    Inherit,
    Fd(OwnedFd),
}

impl SinkFd {
    fn raw(&self) -> Option<RawFd> {
        match self {
            SinkFd::Inherit => None,
            SinkFd::Fd(fd) => Some(fd.as_raw_fd()),
        }
    }
}

/// Forks and execs the service child. Returns the child pid, which is also
/// its process group id.
pub fn start(decl: &ServiceDecl) -> Result<Launched, LaunchError> {
    let prepared = prepare(decl)?;

    // Keep the reaper from racing a half-recorded pid.
    let mut chld = SigSet::empty();
    chld.add(Signal::SIGCHLD);
    let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&chld), None);

    let fork_result = unsafe { fork() };
    match fork_result {
        Ok(ForkResult::Parent { child }) => {
            let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&chld), None);
            debug!("forked {} as pid {child}", decl.display_name());
            Ok(Launched {
                pid: child.as_raw(),
                env: prepared.env_map,
            })
        }
        Ok(ForkResult::Child) => {
            // Only async-signal-safe-ish work from here to exec.
            exec_child(&prepared, &chld)
        }
        Err(err) => {
            let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&chld), None);
            Err(LaunchError::Fork(err))
        }
    }
}

fn exec_child(prepared: &Prepared, chld: &SigSet) -> ! {
    if let Some(device) = &prepared.tty_device {
        check_tty_device(device);
    }

    if let Err(err) = unsafe { prepared.privileges.apply_pre_exec() } {
        eprintln!("initg: privilege setup failed: {err}");
        unsafe { libc::_exit(EX_EXEC_FAILED) };
    }

    let _ = setsid();

    if prepared.stdin_null {
        redirect(open_null_read(), 0);
    }
    if let Some(fd) = prepared.stdout.raw() {
        redirect(Some(fd), 1);
    }
    if let Some(fd) = prepared.stderr.raw() {
        redirect(Some(fd), 2);
    }

    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(chld), None);

    let err = execvpe(&prepared.exe, &prepared.argv, &prepared.envp)
        .expect_err("execvpe only returns on failure");
    let _ = writeln!(io::stderr(), "initg: exec failed: {err}");
    unsafe { libc::_exit(EX_EXEC_FAILED) }
}

fn redirect(fd: Option<RawFd>, target: RawFd) {
    if let Some(fd) = fd {
        let _ = dup2(fd, target);
    }
}

fn open_null_read() -> Option<RawFd> {
    fs::File::open("/dev/null").ok().map(|f| f.into_raw_fd())
}

/// Validates the tty device the way a getty expects it, with sysexits
/// codes: missing or non-character device is a configuration error, a char
/// device that is not a terminal is an OS file error.
fn check_tty_device(device: &Path) {
    let Ok(file) = fs::OpenOptions::new().read(true).write(true).open(device) else {
        eprintln!("initg: cannot open tty device {}", device.display());
        unsafe { libc::_exit(EX_CONFIG) };
    };
    let fd = file.as_raw_fd();
    let is_char = fs::metadata(device)
        .map(|meta| {
            use std::os::unix::fs::FileTypeExt;
            meta.file_type().is_char_device()
        })
        .unwrap_or(false);
    if !is_char {
        eprintln!("initg: {} is not a character device", device.display());
        unsafe { libc::_exit(EX_CONFIG) };
    }
    if unsafe { libc::isatty(fd) } == 0 {
        eprintln!("initg: {} is not a tty", device.display());
        unsafe { libc::_exit(EX_OSFILE) };
    }
}

fn prepare(decl: &ServiceDecl) -> Result<Prepared, LaunchError> {
    let exe = resolve_binary(&decl.cmd)
        .ok_or_else(|| LaunchError::MissingBinary(decl.cmd.clone()))?;

    let env_map = match &decl.env_file {
        Some(path) => match parse_env_file(path) {
            Ok(map) => map,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if decl.env_file_optional {
                    BTreeMap::new()
                } else {
                    return Err(LaunchError::MissingEnvFile(path.clone()));
                }
            }
            Err(err) => return Err(LaunchError::Io(err)),
        },
        None => BTreeMap::new(),
    };

    let privileges = PrivilegeContext::from_decl(decl)?;

    let mut environment = base_environment(decl);
    environment.extend(privileges.user.env_overrides());
    environment.extend(env_map.clone());

    // Fixed verbs for sysv scripts; everything else expands its argv.
    let args: Vec<String> = if decl.kind == SvcKind::Sysv {
        vec!["start".to_string()]
    } else {
        expand::expand_args(&decl.args, |name| {
            env_map
                .get(name)
                .cloned()
                .or_else(|| env::var(name).ok())
        })
    };

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(cstring(decl.cmd.display().to_string())?);
    for arg in &args {
        argv.push(cstring(arg.clone())?);
    }

    let envp = environment
        .iter()
        .map(|(k, v)| cstring(format!("{k}={v}")))
        .collect::<Result<Vec<_>, _>>()?;

    let name = decl.display_name();
    let (stdout, stderr) = open_sinks(&decl.log, &name)?;

    Ok(Prepared {
        exe: cstring(exe.display().to_string())?,
        argv,
        envp,
        env_map,
        privileges,
        stdout,
        stderr,
        stdin_null: decl.kind != SvcKind::Tty,
        tty_device: tty::device_of(decl),
    })
}

fn cstring(s: String) -> Result<CString, LaunchError> {
    CString::new(s.clone()).map_err(|_| LaunchError::BadArgument(s))
}

fn base_environment(decl: &ServiceDecl) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let is_root = nix::unistd::getuid().is_root();
    env.insert(
        "PATH".to_string(),
        if is_root { ROOT_PATH } else { USER_PATH }.to_string(),
    );
    env.insert(
        "HOME".to_string(),
        env::var("HOME").unwrap_or_else(|_| "/".to_string()),
    );
    if decl.kind == SvcKind::Tty {
        env.insert("TERM".to_string(), "linux".to_string());
    }
    env
}

fn open_sinks(log: &LogSink, name: &str) -> Result<(SinkFd, SinkFd), LaunchError> {
    match log {
        LogSink::Console => Ok((SinkFd::Inherit, SinkFd::Inherit)),
        LogSink::Null => {
            let out = open_null_write()?;
            let err = open_null_write()?;
            Ok((SinkFd::Fd(out), SinkFd::Fd(err)))
        }
        LogSink::File(path) => {
            let open = |path: &Path| {
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LaunchError::LogSink {
                        path: path.to_path_buf(),
                        source,
                    })
            };
            let out = OwnedFd::from(open(path)?);
            let err = OwnedFd::from(open(path)?);
            Ok((SinkFd::Fd(out), SinkFd::Fd(err)))
        }
        LogSink::Syslog { tag } => {
            let tag = if tag.is_empty() { name } else { tag.as_str() };
            let fd = spawn_logger_sidecar(tag)?;
            let dup = fd.try_clone().map_err(LaunchError::Io)?;
            Ok((SinkFd::Fd(fd), SinkFd::Fd(dup)))
        }
    }
}

fn open_null_write() -> Result<OwnedFd, LaunchError> {
    fs::OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .map(OwnedFd::from)
        .map_err(|source| LaunchError::LogSink {
            path: PathBuf::from("/dev/null"),
            source,
        })
}

/// Forks a `logger` sidecar and returns the write end it reads from. The
/// sidecar exits on its own when the service closes the pipe; its reap
/// shows up as an unknown pid, which the reaper discards.
fn spawn_logger_sidecar(tag: &str) -> Result<OwnedFd, LaunchError> {
    let mut child = Command::new(LOGGER_BIN)
        .arg("-t")
        .arg(tag)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(LaunchError::Io)?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| LaunchError::Io(io::Error::other("logger stdin missing")))?;
    trace!("logger sidecar for '{tag}' is pid {}", child.id());
    Ok(OwnedFd::from(stdin))
}

/// Locates the binary: absolute/relative paths are checked directly, bare
/// names are searched in the supervisor's PATH.
pub fn resolve_binary(cmd: &Path) -> Option<PathBuf> {
    if cmd.components().count() > 1 {
        return is_executable(cmd).then(|| cmd.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(cmd))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Parses a KEY=VALUE environment file. `#` and `;` start comments, values
/// may be single- or double-quoted, surrounding whitespace is trimmed.
pub fn parse_env_file(path: &Path) -> io::Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)?;
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("ignoring malformed line in {}: {line}", path.display());
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        if key.is_empty() {
            warn!("ignoring malformed line in {}: {line}", path.display());
            continue;
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Writes the pid of a freshly launched daemon to its declared pidfile.
pub fn write_pidfile(path: &Path, pid: i32) -> io::Result<()> {
    fs::write(path, format!("{pid}\n"))
}

/// Reads the pid a forking daemon recorded in its pidfile.
pub fn read_pidfile(path: &Path) -> io::Result<i32> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse::<i32>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Runs a sysv `stop` script synchronously, bounded by `timeout`; a script
/// still running at the deadline is killed.
pub fn run_sysv_stop(decl: &ServiceDecl, timeout: Duration) -> Result<(), LaunchError> {
    let exe = resolve_binary(&decl.cmd)
        .ok_or_else(|| LaunchError::MissingBinary(decl.cmd.clone()))?;
    let mut child = Command::new(exe)
        .arg("stop")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(LaunchError::Io)?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().map_err(LaunchError::Io)? {
            Some(status) => {
                debug!("{} stop script exited with {status}", decl.display_name());
                return Ok(());
            }
            None if Instant::now() >= deadline => {
                warn!(
                    "{} stop script exceeded {}s, killing it",
                    decl.display_name(),
                    timeout.as_secs()
                );
                let _ = child.kill();
                let _ = child.wait();
                return Ok(());
            }
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}
