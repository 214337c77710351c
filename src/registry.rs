//! Service registry: an arena of records keyed by stable integer ids.
//!
//! Slots are reused after removal but ids handed out while a record is live
//! stay valid; lookups on a stale id return `None` rather than a different
//! service, because timers and other deferred work may outlive a record.

use std::path::Path;

use crate::service::{ServiceRecord, SvcId};

/// Arena of service records.
#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Option<ServiceRecord>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when no records are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a record built by `make` from its assigned id.
    pub fn insert_with(
        &mut self,
        make: impl FnOnce(SvcId) -> ServiceRecord,
    ) -> SvcId {
        let slot = self.slots.iter().position(|slot| slot.is_none());
        match slot {
            Some(index) => {
                let id = SvcId(index as u32);
                self.slots[index] = Some(make(id));
                id
            }
            None => {
                let id = SvcId(self.slots.len() as u32);
                self.slots.push(Some(make(id)));
                id
            }
        }
    }

    /// Immutable lookup.
    pub fn get(&self, id: SvcId) -> Option<&ServiceRecord> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, id: SvcId) -> Option<&mut ServiceRecord> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
    }

    /// Removes and returns a record, freeing its slot.
    pub fn remove(&mut self, id: SvcId) -> Option<ServiceRecord> {
        self.slots.get_mut(id.0 as usize).and_then(|slot| slot.take())
    }

    /// Snapshot of all live ids, safe to hold while mutating records.
    pub fn ids(&self) -> Vec<SvcId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| SvcId(index as u32)))
            .collect()
    }

    /// Iterates live records.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Iterates live records mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServiceRecord> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }

    /// Finds a record by its `(command, instance)` identity.
    pub fn find(&self, cmd: &Path, instance: &str) -> Option<SvcId> {
        self.iter()
            .find(|rec| rec.ident() == (cmd, instance))
            .map(|rec| rec.id)
    }

    /// Finds a record by display name, for operator commands.
    pub fn find_by_name(&self, name: &str) -> Option<SvcId> {
        self.iter().find(|rec| rec.name() == name).map(|rec| rec.id)
    }

    /// Finds the record owning `pid`, checking the previous pid of forking
    /// daemons too.
    pub fn find_by_pid(&self, pid: i32) -> Option<SvcId> {
        if pid <= 1 {
            return None;
        }
        self.iter()
            .find(|rec| rec.pid == pid || rec.oldpid == pid)
            .map(|rec| rec.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceDecl, SvcKind};
    use std::path::PathBuf;

    fn record(id: SvcId, cmd: &str, instance: &str) -> ServiceRecord {
        let mut decl = ServiceDecl::new(SvcKind::Service, PathBuf::from(cmd));
        decl.instance = instance.to_string();
        ServiceRecord::new(id, decl, "hash".into(), PathBuf::from("test.conf"))
    }

    #[test]
    fn insert_find_remove() {
        let mut reg = Registry::new();
        let a = reg.insert_with(|id| record(id, "/bin/a", ""));
        let b = reg.insert_with(|id| record(id, "/bin/a", "2"));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.find(Path::new("/bin/a"), ""), Some(a));
        assert_eq!(reg.find(Path::new("/bin/a"), "2"), Some(b));
        assert_eq!(reg.find(Path::new("/bin/a"), "3"), None);

        assert!(reg.remove(a).is_some());
        assert!(reg.get(a).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut reg = Registry::new();
        let a = reg.insert_with(|id| record(id, "/bin/a", ""));
        reg.remove(a);
        let b = reg.insert_with(|id| record(id, "/bin/b", ""));
        assert_eq!(a, b);
        assert_eq!(reg.get(b).unwrap().decl.cmd, PathBuf::from("/bin/b"));
    }

    #[test]
    fn find_by_pid_ignores_pid_one_and_checks_oldpid() {
        let mut reg = Registry::new();
        let a = reg.insert_with(|id| record(id, "/bin/a", ""));
        reg.get_mut(a).unwrap().pid = 42;
        reg.get_mut(a).unwrap().oldpid = 41;

        assert_eq!(reg.find_by_pid(42), Some(a));
        assert_eq!(reg.find_by_pid(41), Some(a));
        assert_eq!(reg.find_by_pid(1), None);
        assert_eq!(reg.find_by_pid(0), None);
    }

    #[test]
    fn ids_snapshot_allows_mutation() {
        let mut reg = Registry::new();
        for i in 0..4 {
            reg.insert_with(|id| record(id, &format!("/bin/{i}"), ""));
        }
        for id in reg.ids() {
            reg.get_mut(id).unwrap().pid = 100 + id.0 as i32;
        }
        assert_eq!(reg.find_by_pid(103).map(|id| id.0), Some(3));
    }
}
