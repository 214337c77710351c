//! Global supervisor: the step engine, runlevel sequencing, config reload
//! and shutdown.
//!
//! The supervisor is one owned value; nothing here is process-global, so
//! tests can drive several instances side by side. External events (child
//! exits, timer fires, signals, operator commands) all funnel into a
//! coalesced "step all services" request; the step loop then re-runs until
//! a full pass produces no transition.

use std::{path::PathBuf, time::Instant};

use chrono::Utc;
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::signal::{Signal, kill, killpg},
    unistd::Pid,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cond::{CondStore, CondValue},
    config::{self, Stanza},
    console::{Console, Progress},
    constants::{
        DEFAULT_RUNLEVEL, RESPAWN_STABLE_AFTER, RUNLEVEL_S, SHUTDOWN_TIMEOUT,
        STATUS_FILE_NAME, STEP_PASS_LIMIT,
    },
    error::{LaunchError, SupervisorError},
    registry::Registry,
    respawn::{self, Verdict},
    service::{SvcBlock, SvcId, SvcState, TimerKind},
    signals::SignalPipe,
    spawn, status,
    timer::TimerWheel,
};

/// How the machine goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltKind {
    /// Halt the CPU, leave power on.
    Halt,
    /// Power the machine off.
    PowerOff,
    /// Reboot.
    Reboot,
}

/// Construction parameters for one supervisor instance.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory scanned for `*.conf` declarations.
    pub config_dir: PathBuf,
    /// Runtime state directory (conditions, status snapshot).
    pub state_dir: PathBuf,
    /// Runlevel entered after bootstrap; a `runlevel` directive in the
    /// configuration wins over this, the built-in default loses to both.
    pub default_runlevel: Option<u8>,
}

/// The service supervision engine.
pub struct Supervisor {
    pub(crate) registry: Registry,
    pub(crate) conds: CondStore,
    pub(crate) timers: TimerWheel,
    console: Console,
    config_dir: PathBuf,
    snapshot_path: PathBuf,
    runlevel: u8,
    default_runlevel: u8,
    halt: Option<HaltKind>,
    teardown: bool,
    step_pending: bool,
    respawn_paused: bool,
    shutdown_deadline: Option<Instant>,
}

impl Supervisor {
    /// Creates an idle supervisor in the bootstrap runlevel.
    pub fn new(settings: Settings) -> Self {
        Supervisor {
            registry: Registry::new(),
            conds: CondStore::new(settings.state_dir.join(crate::constants::COND_DIR_NAME)),
            timers: TimerWheel::new(),
            console: Console::new(),
            config_dir: settings.config_dir,
            snapshot_path: settings.state_dir.join(STATUS_FILE_NAME),
            runlevel: RUNLEVEL_S,
            default_runlevel: settings.default_runlevel.unwrap_or(DEFAULT_RUNLEVEL),
            halt: None,
            teardown: false,
            step_pending: false,
            respawn_paused: false,
            shutdown_deadline: None,
        }
    }

    /// Current runlevel; [`RUNLEVEL_S`] while bootstrapping.
    pub fn runlevel(&self) -> u8 {
        self.runlevel
    }

    /// Runlevel entered once bootstrap completes.
    pub fn default_runlevel(&self) -> u8 {
        self.default_runlevel
    }

    /// Pending halt request, if any.
    pub fn halting(&self) -> Option<HaltKind> {
        self.halt
    }

    /// The registry, for observation.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The registry, for test setups and operator tooling.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// The condition store.
    pub fn conds(&self) -> &CondStore {
        &self.conds
    }

    /// Makes the condition store writable; called once base filesystems
    /// are up. Earlier writes were dropped, not queued.
    pub fn enable_conditions(&mut self) -> Result<(), SupervisorError> {
        self.conds.enable()?;
        Ok(())
    }

    /// Requests a coalesced step of all services.
    pub fn schedule_step(&mut self) {
        self.step_pending = true;
    }

    /// True when a step request is pending.
    pub fn step_pending(&self) -> bool {
        self.step_pending
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Initial configuration load.
    pub fn load_config(&mut self) -> Result<(), SupervisorError> {
        let conf = config::load_dir(&self.config_dir)?;
        if let Some(level) = conf.default_runlevel {
            self.default_runlevel = level;
        }
        for stanza in conf.stanzas {
            self.register_stanza(stanza);
        }
        info!(
            "loaded {} service(s) from {}",
            self.registry.len(),
            self.config_dir.display()
        );
        self.schedule_step();
        Ok(())
    }

    fn register_stanza(&mut self, stanza: Stanza) -> SvcId {
        let Stanza {
            decl, hash, origin, ..
        } = stanza;
        let id = self.registry.insert_with(|id| {
            crate::service::ServiceRecord::new(id, decl, hash, origin)
        });
        let svc = self.registry.get(id).expect("freshly inserted record");
        debug!("registered {} ({})", svc.name(), svc.decl.kind);
        id
    }

    /// Config reload: refresh records in place, create new ones, stop and
    /// drop the ones that disappeared, then re-step everything.
    pub fn reload(&mut self) -> Result<(), SupervisorError> {
        info!("reloading configuration from {}", self.config_dir.display());
        for svc in self.registry.iter_mut() {
            svc.removed = true;
        }
        let _ = self.conds.sweep_oneshots();

        let conf = config::load_dir(&self.config_dir)?;
        for stanza in conf.stanzas {
            match self
                .registry
                .find(&stanza.decl.cmd, &stanza.decl.instance)
            {
                Some(id) => {
                    let svc = self.registry.get_mut(id).expect("found record");
                    svc.removed = false;
                    if svc.stanza_hash != stanza.hash {
                        debug!("{} changed, marking dirty", svc.name());
                        svc.decl = stanza.decl;
                        svc.stanza_hash = stanza.hash;
                        svc.origin = stanza.origin;
                        svc.dirty = true;
                    } else {
                        // Description edits never dirty a running service.
                        svc.decl.description = stanza.decl.description;
                        svc.origin = stanza.origin;
                    }
                }
                None => {
                    self.register_stanza(stanza);
                }
            }
        }

        self.propagate_dirty();

        for svc in self.registry.iter_mut() {
            if svc.dirty && svc.state == SvcState::Done {
                svc.state = SvcState::Halted;
                svc.once = 0;
                svc.started = false;
            }
        }

        self.schedule_step();
        self.step_all();
        Ok(())
    }

    /// Marks consumers of a dirty producer's `pid/` condition dirty too,
    /// to fixpoint.
    fn propagate_dirty(&mut self) {
        loop {
            let dirty_conds: Vec<String> = self
                .registry
                .iter()
                .filter(|svc| svc.dirty)
                .map(|svc| svc.own_cond())
                .collect();
            let mut changed = false;
            for svc in self.registry.iter_mut() {
                if !svc.dirty
                    && dirty_conds.iter().any(|cond| svc.decl.cond.affects(cond))
                {
                    debug!("{} dirty via condition dependency", svc.name());
                    svc.dirty = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Enablement
    // ------------------------------------------------------------------

    fn svc_enabled(&self, id: SvcId) -> bool {
        let Some(svc) = self.registry.get(id) else {
            return false;
        };
        if svc.removed || self.halt.is_some() {
            return false;
        }
        if svc.block != SvcBlock::None {
            return false;
        }
        svc.decl.runlevels.contains(self.runlevel)
    }

    // ------------------------------------------------------------------
    // Step engine
    // ------------------------------------------------------------------

    /// Steps every service until a full pass produces no transition, then
    /// publishes the status snapshot.
    pub fn step_all(&mut self) {
        self.step_pending = false;
        loop {
            let mut passes = 0;
            loop {
                let mut changed = false;
                for id in self.registry.ids() {
                    changed |= self.step_one(id);
                }
                if !changed {
                    break;
                }
                passes += 1;
                if passes >= STEP_PASS_LIMIT {
                    error!("step loop did not quiesce after {STEP_PASS_LIMIT} passes");
                    break;
                }
            }
            self.gc_removed();
            if self.finish_teardown_if_drained() {
                // Newly enabled services may start now.
                continue;
            }
            break;
        }
        self.write_snapshot();
    }

    /// One evaluation of one service's state machine. Returns whether a
    /// transition happened.
    fn step_one(&mut self, id: SvcId) -> bool {
        let Some(svc) = self.registry.get(id) else {
            return false;
        };
        let state = svc.state;
        let enabled = self.svc_enabled(id);

        match state {
            SvcState::Halted => {
                if enabled {
                    self.set_state(id, SvcState::Ready);
                    true
                } else {
                    false
                }
            }

            SvcState::Ready => {
                if !enabled {
                    self.set_state(id, SvcState::Halted);
                    return true;
                }
                if self.teardown {
                    // Draining first; starts resume once teardown ends.
                    return false;
                }
                let svc = self.registry.get(id).expect("record");
                if svc.decl.kind.is_runtask() && svc.once > 0 {
                    // Ran in this runlevel already.
                    return false;
                }
                match self.conds.get_agg(&svc.decl.cond) {
                    CondValue::On => self.try_launch(id),
                    CondValue::Off | CondValue::Flux => false,
                }
            }

            SvcState::Running => {
                let svc = self.registry.get(id).expect("record");
                if !svc.has_child() {
                    return self.child_gone(id, enabled);
                }
                if !enabled {
                    self.stop_service(id);
                    return true;
                }
                match self.conds.get_agg(&svc.decl.cond) {
                    CondValue::Off => {
                        self.stop_service(id);
                        true
                    }
                    CondValue::Flux => {
                        let pid = svc.pid;
                        let name = svc.name();
                        debug!("{name}[{pid}] paused on condition flux");
                        let _ = kill(Pid::from_raw(pid), Signal::SIGSTOP);
                        self.set_state(id, SvcState::Waiting);
                        true
                    }
                    CondValue::On => {
                        let svc = self.registry.get(id).expect("record");
                        if svc.dirty {
                            self.restart_dirty(id);
                            true
                        } else {
                            false
                        }
                    }
                }
            }

            SvcState::Waiting => {
                let svc = self.registry.get(id).expect("record");
                if !svc.has_child() {
                    // Died while paused.
                    let own = svc.own_cond();
                    let _ = self.conds.clear(&own);
                    let svc = self.registry.get_mut(id).expect("record");
                    svc.restart_cnt =
                        (svc.restart_cnt + 1).min(crate::constants::SVC_RESPAWN_MAX);
                    self.set_state(id, SvcState::Ready);
                    return true;
                }
                let pid = svc.pid;
                if !enabled {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                    self.stop_service(id);
                    return true;
                }
                match self.conds.get_agg(&svc.decl.cond) {
                    CondValue::On => {
                        let name = svc.name();
                        let own = svc.own_cond();
                        debug!("{name}[{pid}] resumed");
                        let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                        self.set_state(id, SvcState::Running);
                        let _ = self.conds.set(&own);
                        true
                    }
                    CondValue::Off => {
                        let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                        self.stop_service(id);
                        true
                    }
                    CondValue::Flux => false,
                }
            }

            SvcState::Stopping => {
                let svc = self.registry.get(id).expect("record");
                if svc.has_child() {
                    // Kill escalation is timer-driven.
                    return false;
                }
                self.timers.cancel(id);
                let svc = self.registry.get(id).expect("record");
                let own = svc.own_cond();
                let _ = self.conds.clear(&own);
                let done = svc.decl.kind.is_runtask();
                self.set_state(id, if done { SvcState::Done } else { SvcState::Halted });
                true
            }

            // Left only via runlevel cleaning or config reload.
            SvcState::Done => false,
        }
    }

    fn set_state(&mut self, id: SvcId, to: SvcState) {
        if let Some(svc) = self.registry.get_mut(id) {
            trace!("{} {} -> {to}", svc.name(), svc.state);
            svc.state = to;
        }
    }

    /// READY with conditions ON: fork the child.
    fn try_launch(&mut self, id: SvcId) -> bool {
        let svc = self.registry.get(id).expect("record");
        let name = svc.name();
        let decl = svc.decl.clone();

        match spawn::start(&decl) {
            Ok(launched) => {
                let pid = launched.pid;
                let svc = self.registry.get_mut(id).expect("record");
                svc.pid = pid;
                svc.oldpid = 0;
                svc.start_time = Some(Instant::now());
                svc.started_at = Some(Utc::now());
                svc.launch_env = launched.env;
                svc.dirty = false;
                svc.exit_status = None;
                if decl.kind.is_runtask() {
                    svc.once += 1;
                }
                let restarted = svc.restart_cnt > 0;
                svc.state = SvcState::Running;

                info!("Starting {name}[{pid}]");
                self.console.note(Progress::Ok, &format!("Starting {name}"));

                if let Some(pidfile) = &decl.pidfile
                    && !pidfile.forking
                    && let Err(err) = spawn::write_pidfile(&pidfile.path, pid)
                {
                    warn!("{name}: failed to write pidfile: {err}");
                }
                if let Some(cgroup) = &decl.cgroup {
                    trace!("{name}: cgroup settings forwarded: {cgroup}");
                }

                // A forking daemon's own condition waits for the pidfile.
                let forking = decl.pidfile.as_ref().map(|p| p.forking).unwrap_or(false);
                if !forking {
                    let own = format!("pid/{name}");
                    let _ = self.conds.set(&own);
                }
                if restarted {
                    self.timers.arm(id, TimerKind::Stable, RESPAWN_STABLE_AFTER);
                }
                true
            }
            Err(err @ (LaunchError::MissingBinary(_) | LaunchError::MissingEnvFile(_))) => {
                warn!("{name}: {err}");
                self.console.note(Progress::Fail, &format!("Starting {name}"));
                let svc = self.registry.get_mut(id).expect("record");
                svc.block = SvcBlock::Missing;
                svc.state = SvcState::Halted;
                true
            }
            Err(err) => {
                error!("Failed to start {name}: {err}");
                self.console.note(Progress::Fail, &format!("Starting {name}"));
                if decl.kind.is_daemon() {
                    self.register_crash(id);
                } else {
                    self.set_state(id, SvcState::Halted);
                }
                true
            }
        }
    }

    /// RUNNING with pid already reaped.
    fn child_gone(&mut self, id: SvcId, enabled: bool) -> bool {
        let svc = self.registry.get(id).expect("record");
        if svc.decl.kind.is_runtask() {
            // Synthetic STOPPING; the same quiescence round turns it DONE.
            self.set_state(id, SvcState::Stopping);
            return true;
        }

        let own = svc.own_cond();
        let _ = self.conds.clear(&own);
        if enabled {
            self.register_crash(id);
        } else {
            self.timers.cancel(id);
            self.set_state(id, SvcState::Halted);
        }
        true
    }

    /// Runs the respawn controller against a crashed daemon.
    fn register_crash(&mut self, id: SvcId) {
        let svc = self.registry.get_mut(id).expect("record");
        let name = svc.name();
        match respawn::crashed(svc) {
            Verdict::Retry(delay) => {
                svc.block = SvcBlock::Restarting;
                svc.state = SvcState::Halted;
                let attempt = svc.restart_cnt;
                debug!("{name}: respawn attempt {attempt} in {delay:?}");
                if self.respawn_paused {
                    // Re-armed when respawning resumes.
                    self.timers.cancel(id);
                } else {
                    self.timers.arm(id, TimerKind::Retry, delay);
                }
            }
            Verdict::GiveUp => {
                svc.block = SvcBlock::Crashing;
                svc.state = SvcState::Halted;
                self.timers.cancel(id);
                warn!("Service {name} keeps crashing, not restarting");
                self.console
                    .note(Progress::Fail, &format!("Service {name} keeps crashing"));
            }
        }
    }

    /// Sends the halt signal and arms kill escalation.
    fn stop_service(&mut self, id: SvcId) {
        let svc = self.registry.get(id).expect("record");
        if !svc.has_child() {
            self.set_state(id, SvcState::Halted);
            return;
        }
        let name = svc.name();
        let pid = svc.pid;
        let sighalt = svc.decl.sighalt;
        let kill_delay = svc.decl.kill_delay;

        info!("Stopping {name}[{pid}], sending {}", sighalt.as_str());
        self.console.note(Progress::Ok, &format!("Stopping {name}"));
        let _ = killpg(Pid::from_raw(pid), sighalt);
        self.set_state(id, SvcState::Stopping);
        self.timers.arm(id, TimerKind::Kill, kill_delay);
    }

    /// RUNNING and dirty with conditions ON: reload the service.
    fn restart_dirty(&mut self, id: SvcId) {
        let svc = self.registry.get(id).expect("record");
        let name = svc.name();
        let pid = svc.pid;
        if svc.decl.sighup_supported {
            info!("Restarting {name}[{pid}], sending SIGHUP");
            let _ = kill(Pid::from_raw(pid), Signal::SIGHUP);
            let svc = self.registry.get_mut(id).expect("record");
            svc.dirty = false;
        } else {
            // Full stop; still enabled, so it relaunches with new fields.
            self.stop_service(id);
        }
    }

    /// Drops records whose removal is complete.
    fn gc_removed(&mut self) {
        let stale: Vec<SvcId> = self
            .registry
            .iter()
            .filter(|svc| {
                svc.removed
                    && !svc.has_child()
                    && matches!(svc.state, SvcState::Halted | SvcState::Done)
            })
            .map(|svc| svc.id)
            .collect();
        for id in stale {
            self.timers.cancel(id);
            if let Some(svc) = self.registry.remove(id) {
                debug!("unregistered {}", svc.name());
            }
        }
    }

    /// Ends the teardown phase once everything that must stop has stopped.
    fn finish_teardown_if_drained(&mut self) -> bool {
        if !self.teardown {
            return false;
        }
        let draining = self.registry.ids().into_iter().any(|id| {
            let svc = self.registry.get(id).expect("record");
            match svc.state {
                SvcState::Stopping => true,
                SvcState::Running | SvcState::Waiting => !self.svc_enabled(id),
                _ => false,
            }
        });
        if draining {
            return false;
        }
        debug!("teardown complete, runlevel {} up", runlevel_label(self.runlevel));
        self.teardown = false;
        let _ = self.conds.set_oneshot("hook/runlevel-up");
        true
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Dispatches one timer fire. The record is looked up by id; a timer
    /// outliving its service is dropped on the floor.
    pub fn on_timer(&mut self, id: SvcId, kind: TimerKind) {
        let Some(svc) = self.registry.get(id) else {
            trace!("timer {kind:?} for vanished service {id}");
            return;
        };
        match kind {
            TimerKind::Kill => {
                if svc.state == SvcState::Stopping && svc.has_child() {
                    let name = svc.name();
                    let pid = svc.pid;
                    warn!("Killing {name}[{pid}], sending SIGKILL");
                    self.console
                        .note(Progress::Warn, &format!("Killing {name}"));
                    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                }
            }
            TimerKind::Retry => {
                if svc.block == SvcBlock::Restarting && !self.respawn_paused {
                    let svc = self.registry.get_mut(id).expect("record");
                    svc.block = SvcBlock::None;
                }
            }
            TimerKind::Stable => {
                if svc.state == SvcState::Running {
                    let svc = self.registry.get_mut(id).expect("record");
                    svc.restart_cnt = 0;
                }
            }
        }
        self.schedule_step();
    }

    /// Fires every due timer.
    pub fn fire_due_timers(&mut self) {
        for (id, kind) in self.timers.pop_due(Instant::now()) {
            self.on_timer(id, kind);
        }
    }

    // ------------------------------------------------------------------
    // Runlevels
    // ------------------------------------------------------------------

    /// Switches runlevels: drain what the new level disallows, then start
    /// what it enables.
    pub fn set_runlevel(&mut self, new: u8) {
        if new == self.runlevel || new >= RUNLEVEL_S {
            return;
        }
        let prev = self.runlevel;
        info!(
            "Switching runlevel {} -> {}",
            runlevel_label(prev),
            runlevel_label(new)
        );
        let _ = self.conds.set_oneshot("hook/runlevel-change");
        self.runlevel = new;

        self.run_sysv_stops(new);
        self.runtask_clean();

        if prev == RUNLEVEL_S {
            self.clean_bootstrap();
            self.console.set_enabled(true);
            let _ = self.conds.set("hook/system-up");
        }

        // Networking follows the single-user boundary.
        let was_low = prev == RUNLEVEL_S || prev <= 1;
        if was_low && (2..=9).contains(&new) {
            let _ = self.conds.set("hook/net-up");
        } else if !was_low && new <= 1 {
            let _ = self.conds.clear("hook/net-up");
        }

        self.teardown = true;
        self.step_all();
    }

    /// Synchronous `stop` scripts for sysv records leaving their set.
    fn run_sysv_stops(&mut self, new: u8) {
        for id in self.registry.ids() {
            let svc = self.registry.get(id).expect("record");
            if svc.decl.kind != crate::service::SvcKind::Sysv
                || !svc.started
                || svc.decl.runlevels.contains(new)
            {
                continue;
            }
            let name = svc.name();
            let decl = svc.decl.clone();
            let kill_delay = decl.kill_delay;
            let svc = self.registry.get_mut(id).expect("record");
            svc.block = SvcBlock::Busy;
            info!("Stopping {name}, running stop script");
            if let Err(err) = spawn::run_sysv_stop(&decl, kill_delay) {
                warn!("{name}: stop script failed: {err}");
            }
            let svc = self.registry.get_mut(id).expect("record");
            svc.started = false;
            svc.block = SvcBlock::None;
        }
    }

    /// Resets run-once bookkeeping so runtasks run again in the new level.
    fn runtask_clean(&mut self) {
        for svc in self.registry.iter_mut() {
            if svc.decl.kind.is_runtask() {
                svc.once = 0;
                svc.started = false;
                if svc.state == SvcState::Done {
                    svc.state = SvcState::Halted;
                }
            }
        }
    }

    /// Bootstrap-only runtasks are removed once bootstrap is left.
    fn clean_bootstrap(&mut self) {
        for svc in self.registry.iter_mut() {
            if svc.decl.kind.is_runtask() && svc.decl.runlevels.is_bootstrap_only() {
                svc.removed = true;
            }
        }
    }

    /// True while the bootstrap runlevel still has pending runtasks.
    fn bootstrap_pending(&self) -> bool {
        self.registry.iter().any(|svc| {
            svc.decl.kind.is_runtask()
                && svc.decl.runlevels.contains(RUNLEVEL_S)
                && matches!(
                    svc.state,
                    SvcState::Ready | SvcState::Running | SvcState::Stopping
                )
        })
    }

    // ------------------------------------------------------------------
    // Operator commands
    // ------------------------------------------------------------------

    /// Clears operator-facing blocks and steps; the way out of `crashing`
    /// and `missing`.
    pub fn svc_start(&mut self, name: &str) -> bool {
        let Some(id) = self.registry.find_by_name(name) else {
            return false;
        };
        let svc = self.registry.get_mut(id).expect("record");
        if matches!(
            svc.block,
            SvcBlock::Manual | SvcBlock::Crashing | SvcBlock::Missing | SvcBlock::Restarting
        ) {
            svc.block = SvcBlock::None;
        }
        self.timers.cancel(id);
        self.step_all();
        true
    }

    /// Administratively stops a service until started again.
    pub fn svc_stop(&mut self, name: &str) -> bool {
        let Some(id) = self.registry.find_by_name(name) else {
            return false;
        };
        let svc = self.registry.get_mut(id).expect("record");
        svc.block = SvcBlock::Manual;
        self.step_all();
        true
    }

    /// Stop/start cycle for one service.
    pub fn svc_restart(&mut self, name: &str) -> bool {
        let Some(id) = self.registry.find_by_name(name) else {
            return false;
        };
        let svc = self.registry.get(id).expect("record");
        if svc.has_child() && svc.state == SvcState::Running {
            self.stop_service(id);
        }
        self.step_all();
        true
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Begins orderly shutdown; every service drains, then the loop exits.
    pub fn shutdown(&mut self, kind: HaltKind) {
        if self.halt.is_some() {
            return;
        }
        info!("shutting down: {kind:?}");
        let _ = self.conds.set_oneshot("hook/shutdown");
        self.halt = Some(kind);
        self.shutdown_deadline = Some(Instant::now() + SHUTDOWN_TIMEOUT);
        self.step_all();
    }

    /// True once every record is quiesced with no child attached.
    pub fn all_stopped(&self) -> bool {
        self.registry.iter().all(|svc| {
            !svc.has_child() && matches!(svc.state, SvcState::Halted | SvcState::Done)
        })
    }

    fn force_kill_survivors(&mut self) {
        for id in self.registry.ids() {
            let svc = self.registry.get(id).expect("record");
            if svc.has_child() {
                let name = svc.name();
                let pid = svc.pid;
                warn!("Killing {name}[{pid}], sending SIGKILL (shutdown deadline)");
                let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Runs the supervisor until shutdown completes: bootstrap, enter the
    /// default runlevel, then serve events.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        let pipe = SignalPipe::install().map_err(SupervisorError::Io)?;
        self.enable_conditions()?;
        self.step_all();

        loop {
            if self.runlevel == RUNLEVEL_S && !self.bootstrap_pending() {
                let target = self.default_runlevel;
                self.set_runlevel(target);
            }

            if self.halt.is_some() {
                if self.all_stopped() {
                    break;
                }
                if let Some(deadline) = self.shutdown_deadline
                    && Instant::now() >= deadline
                {
                    self.force_kill_survivors();
                    self.shutdown_deadline = Some(Instant::now() + SHUTDOWN_TIMEOUT);
                }
            }

            let timeout = self.poll_timeout();
            let mut fds = [PollFd::new(pipe.fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }

            for signal in pipe.drain() {
                self.handle_signal(signal);
            }
            self.fire_due_timers();
            if self.step_pending {
                self.step_all();
            }
        }

        info!("supervisor finished: {:?}", self.halt);
        Ok(())
    }

    fn poll_timeout(&mut self) -> PollTimeout {
        if self.step_pending {
            return PollTimeout::ZERO;
        }
        let mut target = self.timers.next_deadline();
        if self.halt.is_some() {
            let deadline = self
                .shutdown_deadline
                .unwrap_or_else(|| Instant::now() + SHUTDOWN_TIMEOUT);
            target = Some(target.map_or(deadline, |t| t.min(deadline)));
        }
        match target {
            Some(deadline) => {
                let ms = deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u128::from(u16::MAX)) as u16;
                PollTimeout::from(ms)
            }
            None => PollTimeout::NONE,
        }
    }

    /// Converts one delivered signal into supervisor work.
    pub fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::SIGCHLD => self.reap_all(),
            Signal::SIGHUP => {
                if let Err(err) = self.reload() {
                    error!("reload failed: {err}");
                }
            }
            Signal::SIGTERM | Signal::SIGINT => self.shutdown(HaltKind::PowerOff),
            Signal::SIGUSR1 => self.shutdown(HaltKind::Halt),
            Signal::SIGUSR2 => self.shutdown(HaltKind::Reboot),
            Signal::SIGTSTP => {
                info!("respawning paused");
                self.respawn_paused = true;
            }
            Signal::SIGCONT => {
                info!("respawning resumed");
                self.respawn_paused = false;
                for id in self.registry.ids() {
                    let svc = self.registry.get(id).expect("record");
                    if svc.block == SvcBlock::Restarting && !self.timers.is_armed(id) {
                        self.timers
                            .arm(id, TimerKind::Retry, crate::constants::RESPAWN_BOUNCE);
                    }
                }
                self.schedule_step();
            }
            other => trace!("ignoring signal {other}"),
        }
    }

    fn write_snapshot(&self) {
        let snapshot = status::collect(&self.registry, &runlevel_label(self.runlevel));
        if let Err(err) = status::write(&self.snapshot_path, &snapshot) {
            debug!("failed to write status snapshot: {err}");
        }
    }
}

fn runlevel_label(level: u8) -> String {
    if level == RUNLEVEL_S {
        "S".to_string()
    } else {
        level.to_string()
    }
}
