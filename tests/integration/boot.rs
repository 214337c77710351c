#[path = "common/mod.rs"]
mod common;

use common::{TestHome, signal_pid, unit, wait_exit};
use tempfile::tempdir;

#[test]
fn boots_runs_services_and_shuts_down_on_sigterm() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    home.write_config(
        "task [S] /bin/true -- base fs up\n\
         service /bin/sleep 300 -- long napper\n\
         task :marker /bin/true -- runlevel task\n",
    );

    let mut child = home.spawn_up(3);

    // Bootstrap completes, the daemon comes up, the runlevel task finishes.
    let snapshot = home.wait_for_status("daemon running", |snap| {
        snap.runlevel == "3"
            && unit(snap, "sleep").map(|s| s.state == "running").unwrap_or(false)
            && unit(snap, "true:marker").map(|s| s.state == "done").unwrap_or(false)
    });

    let daemon = unit(&snapshot, "sleep").expect("sleep unit");
    assert!(daemon.pid > 1);
    assert_eq!(daemon.block, "none");
    let task = unit(&snapshot, "true:marker").expect("task unit");
    assert_eq!(task.pid, 0);
    assert_eq!(task.exit_status, Some(0));

    // The bootstrap-only task was removed after running.
    assert!(unit(&snapshot, "true").is_none());

    // The service's own condition is asserted.
    assert!(home.cond_file("pid/sleep").exists());

    // SIGTERM drains everything and the supervisor exits cleanly.
    signal_pid(child.id(), "TERM");
    wait_exit(&mut child);

    let final_snap = initg::status::read(&home.status_path).expect("final snapshot");
    let daemon = unit(&final_snap, "sleep").expect("sleep unit");
    assert_eq!(daemon.state, "halted");
    assert_eq!(daemon.pid, 0);
}

#[test]
fn crashing_service_is_retried_with_backoff() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    home.write_config("service /bin/false -- always crashing\n");

    let mut child = home.spawn_up(2);

    // The crash is registered and a retry is pending.
    home.wait_for_status("restarting block", |snap| {
        unit(snap, "false")
            .map(|s| s.block == "restarting" && s.restart_cnt >= 1)
            .unwrap_or(false)
    });

    signal_pid(child.id(), "TERM");
    wait_exit(&mut child);
}

#[test]
fn sighup_reloads_configuration() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    home.write_config("service :a /bin/sleep 300 -- first\n");

    let mut child = home.spawn_up(2);
    home.wait_for_status("first service", |snap| {
        unit(snap, "sleep:a").map(|s| s.state == "running").unwrap_or(false)
    });

    // Add a second service and reload.
    home.write_config(
        "service :a /bin/sleep 300 -- first\nservice :b /bin/sleep 300 -- second\n",
    );
    signal_pid(child.id(), "HUP");

    home.wait_for_status("second service", |snap| {
        unit(snap, "sleep:b").map(|s| s.state == "running").unwrap_or(false)
    });

    // Drop the second service again; reload stops and unregisters it.
    home.write_config("service :a /bin/sleep 300 -- first\n");
    signal_pid(child.id(), "HUP");

    home.wait_for_status("second service gone", |snap| {
        unit(snap, "sleep:b").is_none()
            && unit(snap, "sleep:a").map(|s| s.state == "running").unwrap_or(false)
    });

    signal_pid(child.id(), "TERM");
    wait_exit(&mut child);
}
