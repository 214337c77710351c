#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{TestHome, signal_pid, unit, wait_exit};
use tempfile::tempdir;

#[test]
fn gated_service_waits_for_its_condition() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    home.write_config("service <net/eth0/up> /bin/sleep 300 -- gated daemon\n");

    let mut child = home.spawn_up(2);

    // Cleared to start but the gate is closed.
    home.wait_for_status("gated ready", |snap| {
        unit(snap, "sleep").map(|s| s.state == "ready").unwrap_or(false)
    });

    // Assert the condition externally, then poke the supervisor to
    // re-evaluate (SIGCONT schedules a step without other side effects).
    let cond = home.cond_file("net/eth0/up");
    fs::create_dir_all(cond.parent().unwrap()).expect("cond dir");
    fs::write(&cond, "+").expect("assert condition");
    signal_pid(child.id(), "CONT");

    let snapshot = home.wait_for_status("gated running", |snap| {
        unit(snap, "sleep").map(|s| s.state == "running").unwrap_or(false)
    });
    assert!(unit(&snapshot, "sleep").unwrap().pid > 1);
    assert!(home.cond_file("pid/sleep").exists());

    // Dropping the gate stops the service again.
    fs::remove_file(&cond).expect("clear condition");
    signal_pid(child.id(), "CONT");

    home.wait_for_status("gated stopped", |snap| {
        unit(snap, "sleep")
            .map(|s| s.state == "ready" && s.pid == 0)
            .unwrap_or(false)
    });
    assert!(!home.cond_file("pid/sleep").exists());

    signal_pid(child.id(), "TERM");
    wait_exit(&mut child);
}

#[test]
fn flux_condition_pauses_and_resumes_the_service() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    home.write_config("service <net/eth0/up> /bin/sleep 300 -- gated daemon\n");

    let cond = home.cond_file("net/eth0/up");
    fs::create_dir_all(cond.parent().unwrap()).expect("cond dir");
    fs::write(&cond, "+").expect("assert condition");

    let mut child = home.spawn_up(2);
    home.wait_for_status("running", |snap| {
        unit(snap, "sleep").map(|s| s.state == "running").unwrap_or(false)
    });

    // Reassert: the transient pauses the dependent instead of stopping it.
    fs::write(&cond, "~").expect("mark flux");
    signal_pid(child.id(), "CONT");
    home.wait_for_status("paused", |snap| {
        unit(snap, "sleep").map(|s| s.state == "waiting").unwrap_or(false)
    });

    fs::write(&cond, "+").expect("reassert on");
    signal_pid(child.id(), "CONT");
    home.wait_for_status("resumed", |snap| {
        unit(snap, "sleep").map(|s| s.state == "running").unwrap_or(false)
    });
    assert!(home.cond_file("pid/sleep").exists());

    signal_pid(child.id(), "TERM");
    wait_exit(&mut child);
}
