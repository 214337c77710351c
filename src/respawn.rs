//! Respawn controller: crash counting, backoff and the crash cap.

use std::time::Duration;

use crate::{
    constants::{
        RESPAWN_BOUNCE, RESPAWN_INTERVAL_EARLY, RESPAWN_INTERVAL_LATE, SVC_RESPAWN_MAX,
    },
    service::ServiceRecord,
};

/// What the controller decided after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Retry after the given backoff.
    Retry(Duration),
    /// Cap exceeded; block the service until the operator starts it.
    GiveUp,
}

/// Backoff before retry number `restart_cnt` (1-based). The first retry
/// only bounces through the step loop; later retries slow down past half
/// the cap.
pub fn backoff(restart_cnt: u32) -> Duration {
    if restart_cnt <= 1 {
        RESPAWN_BOUNCE
    } else if restart_cnt <= SVC_RESPAWN_MAX / 2 {
        RESPAWN_INTERVAL_EARLY
    } else {
        RESPAWN_INTERVAL_LATE
    }
}

/// Registers one crash on the record. The crash counter saturates at the
/// cap; the crash after the cap gives up and resets the counter.
pub fn crashed(svc: &mut ServiceRecord) -> Verdict {
    if svc.restart_cnt >= SVC_RESPAWN_MAX {
        svc.restart_cnt = 0;
        return Verdict::GiveUp;
    }
    svc.restart_cnt += 1;
    Verdict::Retry(backoff(svc.restart_cnt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceDecl, ServiceRecord, SvcId, SvcKind};
    use std::path::PathBuf;

    fn record() -> ServiceRecord {
        let decl = ServiceDecl::new(SvcKind::Service, PathBuf::from("/bin/flaky"));
        ServiceRecord::new(SvcId(0), decl, "h".into(), PathBuf::from("t.conf"))
    }

    #[test]
    fn backoff_schedule_matches_policy() {
        assert_eq!(backoff(1), RESPAWN_BOUNCE);
        assert_eq!(backoff(2), RESPAWN_INTERVAL_EARLY);
        assert_eq!(backoff(SVC_RESPAWN_MAX / 2), RESPAWN_INTERVAL_EARLY);
        assert_eq!(backoff(SVC_RESPAWN_MAX / 2 + 1), RESPAWN_INTERVAL_LATE);
        assert_eq!(backoff(SVC_RESPAWN_MAX), RESPAWN_INTERVAL_LATE);
    }

    #[test]
    fn cap_is_reached_on_the_crash_after_max() {
        let mut svc = record();
        for _ in 0..SVC_RESPAWN_MAX {
            assert!(matches!(crashed(&mut svc), Verdict::Retry(_)));
            assert!(svc.restart_cnt <= SVC_RESPAWN_MAX);
        }
        assert_eq!(svc.restart_cnt, SVC_RESPAWN_MAX);
        assert_eq!(crashed(&mut svc), Verdict::GiveUp);
        assert_eq!(svc.restart_cnt, 0);
    }

    #[test]
    fn counter_never_exceeds_cap() {
        let mut svc = record();
        for _ in 0..50 {
            crashed(&mut svc);
            assert!(svc.restart_cnt <= SVC_RESPAWN_MAX);
        }
    }
}
