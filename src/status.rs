//! Status snapshot written after each quiescent step.
//!
//! The supervisor has no IPC server; external tooling observes service
//! state through a JSON snapshot in the runtime directory, replaced
//! atomically on every change.

use std::{fs, io, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    registry::Registry,
    service::ServiceRecord,
};

/// Snapshot of the whole supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// When the snapshot was generated.
    pub generated_at: DateTime<Utc>,
    /// Current runlevel; `"S"` during bootstrap.
    pub runlevel: String,
    /// One entry per registered service.
    pub services: Vec<SvcStatus>,
}

/// Snapshot of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcStatus {
    /// Display name, including the instance tag.
    pub name: String,
    /// Command path.
    pub cmd: String,
    /// Lifecycle kind.
    pub kind: String,
    /// State machine state.
    pub state: String,
    /// Block reason; `"none"` when runnable.
    pub block: String,
    /// Child pid, 0 when not running.
    pub pid: i32,
    /// Consecutive crash count.
    pub restart_cnt: u32,
    /// Wall-clock launch time of the current run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// wait(2) status of the last completed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// Free-text description from the declaration.
    pub description: String,
}

impl SvcStatus {
    fn from_record(rec: &ServiceRecord) -> Self {
        SvcStatus {
            name: rec.name(),
            cmd: rec.decl.cmd.display().to_string(),
            kind: rec.decl.kind.to_string(),
            state: rec.state.to_string(),
            block: rec.block.to_string(),
            pid: rec.pid,
            restart_cnt: rec.restart_cnt,
            started_at: rec.started_at,
            exit_status: rec.exit_status,
            description: rec.decl.description.clone(),
        }
    }
}

/// Builds a snapshot from the live registry.
pub fn collect(registry: &Registry, runlevel: &str) -> StatusSnapshot {
    let mut services: Vec<SvcStatus> =
        registry.iter().map(SvcStatus::from_record).collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));
    StatusSnapshot {
        generated_at: Utc::now(),
        runlevel: runlevel.to_string(),
        services,
    }
}

/// Writes a snapshot atomically (write-to-temp then rename).
pub fn write(path: &Path, snapshot: &StatusSnapshot) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Reads a snapshot back, for tooling and tests.
pub fn read(path: &Path) -> io::Result<StatusSnapshot> {
    let content = fs::read(path)?;
    serde_json::from_slice(&content)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceDecl, SvcKind};
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn snapshot_roundtrips_through_disk() {
        let mut registry = Registry::new();
        registry.insert_with(|id| {
            let mut decl =
                ServiceDecl::new(SvcKind::Service, PathBuf::from("/usr/sbin/sshd"));
            decl.description = "SSH".into();
            let mut rec =
                ServiceRecord::new(id, decl, "h".into(), PathBuf::from("t.conf"));
            rec.pid = 42;
            rec
        });
        registry.insert_with(|id| {
            let decl = ServiceDecl::new(SvcKind::Task, PathBuf::from("/bin/once"));
            ServiceRecord::new(id, decl, "h".into(), PathBuf::from("t.conf"))
        });

        let snapshot = collect(&registry, "3");
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        write(&path, &snapshot).expect("write");

        let restored = read(&path).expect("read");
        assert_eq!(restored.runlevel, "3");
        assert_eq!(restored.services.len(), 2);
        let sshd = restored
            .services
            .iter()
            .find(|s| s.name == "sshd")
            .expect("sshd entry");
        assert_eq!(sshd.pid, 42);
        assert_eq!(sshd.state, "halted");
        assert_eq!(sshd.kind, "service");
        assert_eq!(sshd.description, "SSH");
    }
}
