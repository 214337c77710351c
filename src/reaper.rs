//! Child reaper: drains `waitpid` and maps exits onto service records.
//!
//! Reaping drains every pending exit before the step loop runs, so
//! simultaneous deaths batch into a single step round.

use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, killpg},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use tracing::{debug, error, warn};

use crate::{spawn, supervisor::Supervisor};

/// What wait(2) reported for one child.
#[derive(Debug, Clone, Copy)]
pub struct Reaped {
    /// Exit code, when the child exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when it was killed.
    pub signal: Option<Signal>,
}

impl Reaped {
    fn exited(code: i32) -> Self {
        Reaped {
            code: Some(code),
            signal: None,
        }
    }

    fn signaled(signal: Signal) -> Self {
        Reaped {
            code: None,
            signal: Some(signal),
        }
    }

    /// A clean run: exited with status 0.
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }

    /// Shell-style status: the exit code, or 128 plus the signal number.
    pub fn status(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal as i32,
            (None, None) => -1,
        }
    }
}

impl std::fmt::Display for Reaped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "terminated by {signal}"),
            (None, None) => write!(f, "vanished"),
        }
    }
}

impl Supervisor {
    /// Drains every pending child exit, then schedules a step.
    pub fn reap_all(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.handle_exit(pid.as_raw(), Reaped::exited(code));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.handle_exit(pid.as_raw(), Reaped::signaled(signal));
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!("waitpid failed: {err}");
                    break;
                }
            }
        }
    }

    fn handle_exit(&mut self, pid: i32, exit: Reaped) {
        let Some(id) = self.registry.find_by_pid(pid) else {
            debug!("reaped unknown pid {pid} ({exit})");
            return;
        };

        // Pre-daemonize exit of a forking daemon: the real pid is in its
        // pidfile, the first child exiting cleanly is not a crash.
        {
            let svc = self.registry.get(id).expect("record for reaped pid");
            if svc.state == crate::service::SvcState::Running
                && svc.decl.kind.is_daemon()
                && pid == svc.pid
                && exit.clean()
                && let Some(pidfile) = &svc.decl.pidfile
                && pidfile.forking
                && svc.oldpid == 0
            {
                match spawn::read_pidfile(&pidfile.path) {
                    Ok(daemon_pid) if daemon_pid > 1 => {
                        let name = svc.name();
                        debug!("{name}: adopting daemonized pid {daemon_pid}");
                        let svc = self.registry.get_mut(id).expect("record");
                        svc.oldpid = pid;
                        svc.pid = daemon_pid;
                        let own = svc.own_cond();
                        let _ = self.conds.set(&own);
                        self.schedule_step();
                        return;
                    }
                    other => {
                        debug!(
                            "{}: pidfile {} unreadable after daemonize ({other:?})",
                            svc.name(),
                            pidfile.path.display()
                        );
                    }
                }
            }
        }

        let svc = self.registry.get_mut(id).expect("record for reaped pid");
        let name = svc.name();
        svc.exit_status = Some(exit.status());
        if svc.decl.kind.is_runtask() {
            svc.started = exit.clean();
        }
        if exit.clean() {
            debug!("{name}[{pid}] {exit}");
        } else {
            warn!("{name}[{pid}] {exit}");
        }

        // Sweep stragglers in the child's process group.
        if svc.pid > 1 {
            let _ = killpg(Pid::from_raw(svc.pid), Signal::SIGKILL);
        }
        svc.forget_child();

        // Daemon pidfiles are stale once the process is gone.
        if svc.decl.kind.is_daemon()
            && let Some(pidfile) = &svc.decl.pidfile
        {
            let _ = std::fs::remove_file(&pidfile.path);
        }

        // Bootstrap-only tasks are one-and-done records.
        if svc.decl.kind.is_runtask() && svc.decl.runlevels.is_bootstrap_only() {
            svc.removed = true;
        }

        self.schedule_step();
    }
}
