//! Privilege and resource limit helpers applied between fork and exec.
use std::{collections::HashMap, io, path::PathBuf};

use libc::{RLIM_INFINITY, c_int, id_t};
use nix::unistd::{Group, User, getuid};

use crate::{
    error::LaunchError,
    service::ServiceDecl,
};

/// Target user, group and home metadata a child should inherit after the
/// privilege switch.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    home: Option<PathBuf>,
    username: Option<String>,
}

impl UserContext {
    /// Environment overrides matching the target account.
    pub fn env_overrides(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(home) = &self.home {
            env.insert("HOME".to_string(), home.display().to_string());
        }
        if let Some(username) = &self.username {
            env.insert("USER".to_string(), username.clone());
            env.insert("LOGNAME".to_string(), username.clone());
        }
        env
    }

    /// True when no user or group switch was requested.
    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }
}

/// Resource limits from a `rlimit:` declaration field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Maximum open file descriptors (`RLIMIT_NOFILE`).
    pub nofile: Option<LimitValue>,
    /// Maximum number of processes (`RLIMIT_NPROC`).
    pub nproc: Option<LimitValue>,
    /// Maximum core file size (`RLIMIT_CORE`).
    pub core: Option<LimitValue>,
    /// Maximum locked memory in bytes (`RLIMIT_MEMLOCK`).
    pub memlock: Option<LimitValue>,
}

impl LimitsConfig {
    /// True when no limit is configured.
    pub fn is_empty(&self) -> bool {
        self.nofile.is_none()
            && self.nproc.is_none()
            && self.core.is_none()
            && self.memlock.is_none()
    }
}

/// Value accepted for a `setrlimit`-backed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitValue {
    /// Fixed soft+hard limit.
    Fixed(u64),
    /// Unlimited (`RLIM_INFINITY`).
    Unlimited,
}

impl LimitValue {
    /// Parses `unlimited`, a plain integer, or an integer with a K/M/G/T
    /// binary suffix.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("unlimited")
            || trimmed.eq_ignore_ascii_case("infinity")
        {
            return Some(LimitValue::Unlimited);
        }

        let (number_part, factor) = match trimmed.chars().last() {
            Some(suffix) if suffix.is_ascii_alphabetic() => {
                let len = trimmed.len() - suffix.len_utf8();
                let multiplier = match suffix.to_ascii_uppercase() {
                    'K' => 1u64 << 10,
                    'M' => 1u64 << 20,
                    'G' => 1u64 << 30,
                    'T' => 1u64 << 40,
                    _ => return None,
                };
                (&trimmed[..len], multiplier)
            }
            _ => (trimmed, 1u64),
        };

        number_part
            .parse::<u64>()
            .ok()
            .and_then(|v| v.checked_mul(factor))
            .map(LimitValue::Fixed)
    }

    fn as_rlim(self) -> libc::rlim_t {
        match self {
            LimitValue::Fixed(v) => v as libc::rlim_t,
            LimitValue::Unlimited => RLIM_INFINITY,
        }
    }
}

/// Normalised privilege plan derived from a declaration prior to spawn.
///
/// Name lookups happen in the parent, where failures can still refuse the
/// launch; the switch itself happens in the child.
#[derive(Debug, Clone, Default)]
pub struct PrivilegeContext {
    /// User context for the uid/gid switch.
    pub user: UserContext,
    /// Resource limits to apply before exec.
    pub limits: LimitsConfig,
}

impl PrivilegeContext {
    /// Resolves `@user[:group]` and records the limits to apply.
    pub fn from_decl(decl: &ServiceDecl) -> Result<Self, LaunchError> {
        let mut context = PrivilegeContext {
            limits: decl.rlimits.clone(),
            ..PrivilegeContext::default()
        };

        if decl.user.is_none() && decl.group.is_none() {
            return Ok(context);
        }

        if !getuid().is_root() {
            return Err(LaunchError::Credentials(format!(
                "user/group switching requested but supervisor is not root ({})",
                decl.display_name()
            )));
        }

        let mut user_ctx = UserContext::default();

        if let Some(user_name) = &decl.user {
            let user = User::from_name(user_name)
                .map_err(|err| LaunchError::Credentials(err.to_string()))?
                .ok_or_else(|| LaunchError::Credentials(user_name.clone()))?;
            user_ctx.uid = Some(user.uid.as_raw());
            user_ctx.gid = Some(user.gid.as_raw());
            user_ctx.home = Some(user.dir);
            user_ctx.username = Some(user.name);
        }

        if let Some(group_name) = &decl.group {
            let group = Group::from_name(group_name)
                .map_err(|err| LaunchError::Credentials(err.to_string()))?
                .ok_or_else(|| LaunchError::Credentials(group_name.clone()))?;
            user_ctx.gid = Some(group.gid.as_raw());
        }

        context.user = user_ctx;
        Ok(context)
    }

    /// Executes the privilege adjustments inside the child before exec.
    ///
    /// Limit failures are reported on stderr and do not abort; a failed
    /// uid/gid switch does, since running with the wrong credentials is
    /// worse than not running.
    ///
    /// # Safety
    /// Call only between `fork` and `exec` in the child process.
    pub unsafe fn apply_pre_exec(&self) -> io::Result<()> {
        self.apply_limits();
        unsafe { self.apply_user_switch() }
    }

    fn apply_limits(&self) {
        if let Some(value) = self.limits.nofile {
            set_rlimit("nofile", libc::RLIMIT_NOFILE as c_int, value);
        }
        if let Some(value) = self.limits.nproc {
            set_rlimit("nproc", libc::RLIMIT_NPROC as c_int, value);
        }
        if let Some(value) = self.limits.core {
            set_rlimit("core", libc::RLIMIT_CORE as c_int, value);
        }
        if let Some(value) = self.limits.memlock {
            set_rlimit("memlock", libc::RLIMIT_MEMLOCK as c_int, value);
        }
    }

    unsafe fn apply_user_switch(&self) -> io::Result<()> {
        if let Some(gid) = self.user.gid {
            if unsafe { libc::setgroups(1, &gid) } != 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::setgid(gid as id_t) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some(uid) = self.user.uid
            && unsafe { libc::setuid(uid as id_t) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn set_rlimit(label: &str, resource: c_int, value: LimitValue) {
    let limit = libc::rlimit {
        rlim_cur: value.as_rlim(),
        rlim_max: value.as_rlim(),
    };
    #[cfg(target_os = "linux")]
    let res =
        unsafe { libc::setrlimit(resource as libc::c_uint, &limit as *const libc::rlimit) };
    #[cfg(not(target_os = "linux"))]
    let res = unsafe { libc::setrlimit(resource, &limit as *const libc::rlimit) };
    if res != 0 {
        // Only stderr is async-signal-safe territory here; tracing is not.
        let err = io::Error::last_os_error();
        eprintln!("initg: failed to set rlimit {label}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::SvcKind;
    use std::path::PathBuf;

    #[test]
    fn limit_value_parses_suffixes_and_unlimited() {
        assert_eq!(LimitValue::parse("1024"), Some(LimitValue::Fixed(1024)));
        assert_eq!(
            LimitValue::parse("64K"),
            Some(LimitValue::Fixed(64 * 1024))
        );
        assert_eq!(
            LimitValue::parse("2M"),
            Some(LimitValue::Fixed(2 * 1024 * 1024))
        );
        assert_eq!(LimitValue::parse("unlimited"), Some(LimitValue::Unlimited));
        assert_eq!(LimitValue::parse("infinity"), Some(LimitValue::Unlimited));
        assert_eq!(LimitValue::parse("12Q"), None);
        assert_eq!(LimitValue::parse(""), None);
    }

    #[test]
    fn decl_without_credentials_needs_no_root() {
        let decl = ServiceDecl::new(SvcKind::Service, PathBuf::from("/bin/true"));
        let ctx = PrivilegeContext::from_decl(&decl).expect("context");
        assert!(ctx.user.is_empty());
        assert!(ctx.limits.is_empty());
    }

    #[test]
    fn credential_switch_requires_root() {
        if getuid().is_root() {
            return;
        }
        let mut decl = ServiceDecl::new(SvcKind::Service, PathBuf::from("/bin/true"));
        decl.user = Some("nobody".into());
        assert!(matches!(
            PrivilegeContext::from_decl(&decl),
            Err(LaunchError::Credentials(_))
        ));
    }
}
