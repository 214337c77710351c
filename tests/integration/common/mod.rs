use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

use initg::status::{StatusSnapshot, SvcStatus};

/// Paths inside a scratch HOME the supervisor under test runs against.
pub struct TestHome {
    pub home: PathBuf,
    pub config_dir: PathBuf,
    pub status_path: PathBuf,
}

impl TestHome {
    pub fn new(root: &Path) -> Self {
        let home = root.join("home");
        let config_dir = home.join(".config/initg");
        fs::create_dir_all(&config_dir).expect("config dir");
        let status_path = home.join(".local/share/initg/status.json");
        TestHome {
            home,
            config_dir,
            status_path,
        }
    }

    pub fn write_config(&self, lines: &str) {
        fs::write(self.config_dir.join("base.conf"), lines).expect("write config");
    }

    pub fn cond_file(&self, name: &str) -> PathBuf {
        self.home.join(".local/share/initg/cond").join(name)
    }

    /// Spawns the supervisor in the foreground against this HOME.
    pub fn spawn_up(&self, runlevel: u8) -> Child {
        Command::new(assert_cmd::cargo::cargo_bin!("initg"))
            .arg("--log-level")
            .arg("debug")
            .arg("up")
            .arg("--runlevel")
            .arg(runlevel.to_string())
            .env("HOME", &self.home)
            .env_remove("RUST_LOG")
            .spawn()
            .expect("spawn initg")
    }

    /// Polls the status snapshot until `pred` holds.
    pub fn wait_for_status(
        &self,
        what: &str,
        pred: impl Fn(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(snapshot) = initg::status::read(&self.status_path)
                && pred(&snapshot)
            {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what} in {:?}",
                self.status_path
            );
            thread::sleep(Duration::from_millis(50));
        }
    }
}

pub fn unit<'a>(snapshot: &'a StatusSnapshot, name: &str) -> Option<&'a SvcStatus> {
    snapshot.services.iter().find(|s| s.name == name)
}

/// Signals a process by pid using kill(1), avoiding raw syscalls in tests.
pub fn signal_pid(pid: u32, signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .status()
        .expect("run kill");
    assert!(status.success(), "kill -{signal} {pid} failed");
}

/// Waits for a spawned supervisor to exit cleanly.
pub fn wait_exit(child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        match child.try_wait().expect("try_wait") {
            Some(status) => {
                assert!(status.success(), "supervisor exited with {status}");
                return;
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    panic!("supervisor did not exit in time");
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
