//! Configuration loading for initg.
//!
//! Service declarations are line-based stanzas read from `*.conf` files in
//! a configuration directory:
//!
//! ```text
//! <kind> [@user[:group]] [[!]runlevels] [<!cond[,cond]>] [:id]
//!        [log:...] [pid:[!]/path] [name:NAME] [manual:yes] [sighup:yes]
//!        [halt:SIGNAL] [kill:SECONDS] [env:/path] [rlimit:key=val,...]
//!        [cgroup[.GROUP]:key=val,...]
//!        /path/to/binary arg1 arg2 ... -- Description
//! ```
//!
//! A malformed stanza refuses that record only; remaining lines still load.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use nix::sys::signal::Signal;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    cond::CondExpr,
    constants::{CONF_SUFFIX, DEFAULT_RUNLEVELS, KILL_DELAY_MAX, KILL_DELAY_MIN},
    error::ConfigError,
    privilege::{LimitValue, LimitsConfig},
    service::{LogSink, PidfileSpec, RunlevelMask, ServiceDecl, SvcKind},
    tty,
};

/// One parsed declaration plus the identity hash reload compares.
#[derive(Debug, Clone)]
pub struct Stanza {
    /// Normalised stanza text.
    pub text: String,
    /// Hash of the stanza with the description stripped; description-only
    /// edits must not dirty a running service.
    pub hash: String,
    /// The parsed declaration.
    pub decl: ServiceDecl,
    /// File the stanza came from.
    pub origin: PathBuf,
}

/// A stanza that failed to parse, kept for operator reporting.
#[derive(Debug)]
pub struct ConfigIssue {
    /// File containing the bad stanza.
    pub origin: PathBuf,
    /// 1-based line number.
    pub line: usize,
    /// What was wrong.
    pub error: ConfigError,
}

/// Parsed configuration directory.
#[derive(Debug, Default)]
pub struct Config {
    /// Runlevel entered after bootstrap, from a `runlevel N` directive.
    pub default_runlevel: Option<u8>,
    /// Accepted service declarations.
    pub stanzas: Vec<Stanza>,
    /// Refused stanzas.
    pub issues: Vec<ConfigIssue>,
}

/// Loads every `*.conf` file under `dir`, in file name order.
pub fn load_dir(dir: &Path) -> Result<Config, ConfigError> {
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy().ends_with(CONF_SUFFIX))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut config = Config::default();
    for file in files {
        load_file(&file, &mut config)?;
    }
    Ok(config)
}

fn load_file(path: &Path, config: &mut Config) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    for (index, raw) in content.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line, path) {
            Ok(Item::Service(stanza)) => config.stanzas.push(stanza),
            Ok(Item::Runlevel(level)) => config.default_runlevel = Some(level),
            Err(error) => {
                warn!(
                    "refusing stanza at {}:{}: {error}",
                    path.display(),
                    index + 1
                );
                config.issues.push(ConfigIssue {
                    origin: path.to_path_buf(),
                    line: index + 1,
                    error,
                });
            }
        }
    }
    Ok(())
}

fn strip_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in line.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => return &line[..i],
            _ => {}
        }
    }
    line
}

/// One accepted top-level item.
#[derive(Debug)]
pub enum Item {
    /// A service stanza.
    Service(Stanza),
    /// `runlevel N` directive.
    Runlevel(u8),
}

/// Parses a single non-empty, comment-stripped line.
pub fn parse_line(line: &str, origin: &Path) -> Result<Item, ConfigError> {
    let tokens = tokenize(line)?;
    let Some(first) = tokens.first() else {
        return Err(ConfigError::MissingCommand(line.to_string()));
    };

    if first.as_str() == "runlevel" {
        let level = tokens
            .get(1)
            .and_then(|t| t.parse::<u8>().ok())
            .filter(|l| *l <= 9)
            .ok_or_else(|| ConfigError::BadRunlevels(line.to_string()))?;
        return Ok(Item::Runlevel(level));
    }

    let kind = SvcKind::from_str(first)
        .map_err(|_| ConfigError::UnknownKind(first.clone()))?;

    let mut decl = if kind == SvcKind::Tty {
        tty::parse_tty(&tokens[1..])?
    } else {
        parse_service(kind, &tokens[1..])?
    };

    if decl.runlevels == RunlevelMask::empty() {
        decl.runlevels = RunlevelMask::parse(DEFAULT_RUNLEVELS).expect("static mask");
    }

    let essential = essential_text(line);
    Ok(Item::Service(Stanza {
        text: line.to_string(),
        hash: hash_stanza(&essential),
        decl,
        origin: origin.to_path_buf(),
    }))
}

fn parse_service(kind: SvcKind, tokens: &[String]) -> Result<ServiceDecl, ConfigError> {
    let mut decl = ServiceDecl::new(kind, PathBuf::new());
    let mut iter = tokens.iter().peekable();

    // Option tokens come first; the command starts at the first '/' word.
    while let Some(token) = iter.peek() {
        let token = token.as_str();
        if token.starts_with('/') {
            break;
        }
        let token = iter.next().expect("peeked token");
        apply_option(&mut decl, token)?;
    }

    let Some(cmd) = iter.next() else {
        return Err(ConfigError::MissingCommand(tokens.join(" ")));
    };
    decl.cmd = PathBuf::from(cmd);

    for token in iter.by_ref() {
        if token.as_str() == "--" {
            break;
        }
        decl.args.push(token.clone());
    }
    decl.description = iter.cloned().collect::<Vec<_>>().join(" ");

    Ok(decl)
}

pub(crate) fn apply_option(decl: &mut ServiceDecl, token: &str) -> Result<(), ConfigError> {
    if let Some(user_spec) = token.strip_prefix('@') {
        match user_spec.split_once(':') {
            Some((user, group)) => {
                decl.user = Some(user.to_string());
                decl.group = Some(group.to_string());
            }
            None => decl.user = Some(user_spec.to_string()),
        }
        return Ok(());
    }

    if let Some(inner) = token.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| ConfigError::BadRunlevels(token.to_string()))?;
        decl.runlevels = RunlevelMask::parse(inner)
            .ok_or_else(|| ConfigError::BadRunlevels(token.to_string()))?;
        return Ok(());
    }

    if let Some(inner) = token.strip_prefix('<') {
        let inner = inner
            .strip_suffix('>')
            .ok_or_else(|| ConfigError::BadToken(token.to_string()))?;
        decl.cond = CondExpr::parse(inner);
        return Ok(());
    }

    if let Some(instance) = token.strip_prefix(':') {
        decl.instance = instance.to_string();
        return Ok(());
    }

    if token == "log" {
        decl.log = LogSink::Syslog { tag: String::new() };
        return Ok(());
    }

    let Some((key, value)) = token.split_once(':') else {
        return Err(ConfigError::BadToken(token.to_string()));
    };

    match key {
        "log" => decl.log = parse_log(value)?,
        "pid" => {
            let (forking, path) = match value.strip_prefix('!') {
                Some(path) => (true, path),
                None => (false, value),
            };
            if !path.starts_with('/') {
                return Err(ConfigError::BadToken(token.to_string()));
            }
            decl.pidfile = Some(PidfileSpec {
                path: PathBuf::from(path),
                forking,
            });
        }
        "name" => decl.name = Some(value.to_string()),
        "manual" => decl.manual = value == "yes",
        "sighup" => decl.sighup_supported = value == "yes",
        "halt" => decl.sighalt = parse_signal(value)?,
        "kill" => decl.kill_delay = parse_kill_delay(value)?,
        "env" => {
            let (optional, path) = match value.strip_prefix('-') {
                Some(path) => (true, path),
                None => (false, value),
            };
            decl.env_file = Some(PathBuf::from(path));
            decl.env_file_optional = optional;
        }
        "rlimit" => decl.rlimits = parse_rlimits(value)?,
        _ if key == "cgroup" || key.starts_with("cgroup.") => {
            decl.cgroup = Some(token.to_string());
        }
        _ => return Err(ConfigError::BadToken(token.to_string())),
    }
    Ok(())
}

fn parse_log(value: &str) -> Result<LogSink, ConfigError> {
    match value {
        "null" => Ok(LogSink::Null),
        "console" => Ok(LogSink::Console),
        "syslog" => Ok(LogSink::Syslog { tag: String::new() }),
        _ if value.starts_with('/') => Ok(LogSink::File(PathBuf::from(value))),
        _ => match value.strip_prefix("tag=") {
            Some(tag) if !tag.is_empty() => Ok(LogSink::Syslog {
                tag: tag.to_string(),
            }),
            _ => Err(ConfigError::BadLogSink(value.to_string())),
        },
    }
}

fn parse_signal(value: &str) -> Result<Signal, ConfigError> {
    let name = if value.starts_with("SIG") {
        value.to_string()
    } else {
        format!("SIG{value}")
    };
    Signal::from_str(&name).map_err(|_| ConfigError::BadSignal(value.to_string()))
}

fn parse_kill_delay(value: &str) -> Result<Duration, ConfigError> {
    let delay = if let Some(ms) = value.strip_suffix("ms") {
        ms.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::BadKillDelay(value.to_string()))?
    } else {
        value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::BadKillDelay(value.to_string()))?
    };
    if delay < KILL_DELAY_MIN || delay > KILL_DELAY_MAX {
        return Err(ConfigError::BadKillDelay(value.to_string()));
    }
    Ok(delay)
}

fn parse_rlimits(value: &str) -> Result<LimitsConfig, ConfigError> {
    let mut limits = LimitsConfig::default();
    for pair in value.split(',') {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::BadLimit(pair.to_string()))?;
        let parsed = LimitValue::parse(raw)
            .ok_or_else(|| ConfigError::BadLimit(pair.to_string()))?;
        match key {
            "nofile" => limits.nofile = Some(parsed),
            "nproc" => limits.nproc = Some(parsed),
            "core" => limits.core = Some(parsed),
            "memlock" => limits.memlock = Some(parsed),
            _ => return Err(ConfigError::BadLimit(pair.to_string())),
        }
    }
    Ok(limits)
}

/// Splits a stanza into words, honoring single and double quotes.
pub(crate) fn tokenize(line: &str) -> Result<Vec<String>, ConfigError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        tokens.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(ConfigError::UnterminatedQuote(line.to_string()));
    }
    if in_word {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Stanza text with the trailing `-- description` removed, so description
/// edits never dirty a service.
fn essential_text(line: &str) -> String {
    match line.split_once(" -- ") {
        Some((head, _)) => head.trim().to_string(),
        None => line.trim_end_matches(" --").trim().to_string(),
    }
}

/// Stable identity hash of a stanza, as a 16 character hex string.
pub fn hash_stanza(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    format!(
        "{:016x}",
        u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RUNLEVEL_S;

    fn parse(line: &str) -> ServiceDecl {
        match parse_line(line, Path::new("test.conf")).expect("parse") {
            Item::Service(stanza) => stanza.decl,
            other => panic!("expected service, got {other:?}"),
        }
    }

    #[test]
    fn minimal_service_line() {
        let decl = parse("service /usr/sbin/sshd -D -- SSH daemon");
        assert_eq!(decl.kind, SvcKind::Service);
        assert_eq!(decl.cmd, PathBuf::from("/usr/sbin/sshd"));
        assert_eq!(decl.args, vec!["-D"]);
        assert_eq!(decl.description, "SSH daemon");
        // Defaults.
        assert!(decl.runlevels.contains(2) && decl.runlevels.contains(5));
        assert!(!decl.runlevels.contains(0));
        assert_eq!(decl.sighalt, Signal::SIGTERM);
        assert!(!decl.sighup_supported);
    }

    #[test]
    fn full_option_spread() {
        let decl = parse(
            "service @zebra:quagga [2345] <pid/ospfd,net/eth0/up> :1 \
             log:/var/log/zebra.log pid:!/run/zebra.pid name:zebra \
             sighup:yes halt:QUIT kill:10 env:-/etc/default/zebra \
             rlimit:nofile=1024,core=unlimited \
             /usr/sbin/zebra -d -- Zebra routing daemon",
        );
        assert_eq!(decl.user.as_deref(), Some("zebra"));
        assert_eq!(decl.group.as_deref(), Some("quagga"));
        assert_eq!(decl.instance, "1");
        assert_eq!(decl.name.as_deref(), Some("zebra"));
        assert_eq!(decl.cond.0.len(), 2);
        assert!(decl.cond.affects("net/eth0/up"));
        assert_eq!(decl.log, LogSink::File(PathBuf::from("/var/log/zebra.log")));
        let pidfile = decl.pidfile.expect("pidfile");
        assert!(pidfile.forking);
        assert_eq!(pidfile.path, PathBuf::from("/run/zebra.pid"));
        assert!(decl.sighup_supported);
        assert_eq!(decl.sighalt, Signal::SIGQUIT);
        assert_eq!(decl.kill_delay, Duration::from_secs(10));
        assert_eq!(decl.env_file, Some(PathBuf::from("/etc/default/zebra")));
        assert!(decl.env_file_optional);
        assert_eq!(decl.rlimits.nofile, Some(LimitValue::Fixed(1024)));
        assert_eq!(decl.rlimits.core, Some(LimitValue::Unlimited));
    }

    #[test]
    fn negated_condition_list() {
        let decl = parse("service <!maint,debug> /bin/daemon -- d");
        assert!(decl.cond.0.iter().all(|t| t.negated));
        assert_eq!(decl.cond.0.len(), 2);
    }

    #[test]
    fn bootstrap_task() {
        let decl = parse("task [S] /sbin/mount-tmpfs --");
        assert_eq!(decl.kind, SvcKind::Task);
        assert!(decl.runlevels.contains(RUNLEVEL_S));
        assert!(decl.runlevels.is_bootstrap_only());
        assert_eq!(decl.description, "");
    }

    #[test]
    fn quoted_arguments_survive_tokenizing() {
        let decl = parse(r#"service /bin/daemon -m "hello world" -- d"#);
        assert_eq!(decl.args, vec!["-m", "hello world"]);
    }

    #[test]
    fn comments_are_stripped_outside_quotes() {
        assert_eq!(strip_comment("service /bin/x # y"), "service /bin/x ");
        assert_eq!(strip_comment("a \"#\" b"), "a \"#\" b");
    }

    #[test]
    fn refused_stanzas_do_not_block_others() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("base.conf");
        fs::write(
            &file,
            "service /bin/good -- ok\nwibble /bin/bad\nkill:0 service /bin/x\n",
        )
        .expect("write");

        let config = load_dir(temp.path()).expect("load");
        assert_eq!(config.stanzas.len(), 1);
        assert_eq!(config.issues.len(), 2);
        assert!(matches!(
            config.issues[0].error,
            ConfigError::UnknownKind(_)
        ));
    }

    #[test]
    fn runlevel_directive() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.conf"), "runlevel 3\n").expect("write");
        let config = load_dir(temp.path()).expect("load");
        assert_eq!(config.default_runlevel, Some(3));
    }

    #[test]
    fn description_only_edits_keep_the_hash() {
        let a = parse_line("service /bin/d -- one", Path::new("t")).unwrap();
        let b = parse_line("service /bin/d -- two", Path::new("t")).unwrap();
        let c = parse_line("service /bin/d -x -- one", Path::new("t")).unwrap();
        let (Item::Service(a), Item::Service(b), Item::Service(c)) = (a, b, c) else {
            panic!("expected services");
        };
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn kill_delay_bounds() {
        assert!(parse_kill_delay("1").is_ok());
        assert!(parse_kill_delay("60").is_ok());
        assert!(parse_kill_delay("1ms").is_ok());
        assert!(parse_kill_delay("61").is_err());
        assert!(parse_kill_delay("0").is_err());
        assert!(parse_kill_delay("soon").is_err());
    }

    #[test]
    fn bare_log_token_means_syslog() {
        let decl = parse("service log /bin/daemon -- d");
        assert!(matches!(decl.log, LogSink::Syslog { .. }));
    }

    #[test]
    fn missing_command_is_refused() {
        let err = parse_line("service [2345] name:x", Path::new("t")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCommand(_)));
    }
}
