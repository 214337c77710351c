#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::TestHome;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("initg"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("up"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn check_accepts_a_clean_config() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    home.write_config(
        "service /usr/sbin/sshd -D -- SSH daemon\ntask [S] /bin/true -- bootstrap task\n",
    );

    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("initg"));
    cmd.arg("check")
        .arg("--config")
        .arg(home.config_dir.to_str().unwrap())
        .assert()
        .success()
        .stdout(predicate::str::contains("sshd"))
        .stdout(predicate::str::contains("2 service(s), 0 refused"));
}

#[test]
fn check_reports_refused_stanzas_and_fails() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    home.write_config("service /bin/good -- fine\nwibble /bin/bad -- nope\n");

    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("initg"));
    cmd.arg("check")
        .arg("--config")
        .arg(home.config_dir.to_str().unwrap())
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAIL"))
        .stdout(predicate::str::contains("1 refused"));
}

#[test]
fn check_fails_on_a_missing_config_dir() {
    let temp = tempdir().expect("tempdir");
    let missing = temp.path().join("nowhere");
    assert!(!missing.exists());

    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("initg"));
    cmd.arg("check")
        .arg("--config")
        .arg(missing.to_str().unwrap())
        .assert()
        .failure();
}

#[test]
fn check_parses_tty_and_sysv_stanzas() {
    let temp = tempdir().expect("tempdir");
    let home = TestHome::new(temp.path());
    fs::write(
        home.config_dir.join("extra.conf"),
        "tty [12345] /dev/tty1 38400 linux\nsysv [2345] /etc/init.d/legacy -- old style\n",
    )
    .expect("write extra conf");
    home.write_config("");

    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("initg"));
    cmd.arg("check")
        .arg("--config")
        .arg(home.config_dir.to_str().unwrap())
        .assert()
        .success()
        .stdout(predicate::str::contains("tty1"))
        .stdout(predicate::str::contains("legacy"));
}
