//! Save-time reconciliation between a session's working grid and what the
//! workspace last persisted for the same scope.

use crate::error::{EngineError, EngineResult};
use crate::placement::{Lock, Placement};
use crate::session::Scope;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub creates: Vec<Placement>,
    pub updates: Vec<Placement>,
    pub deletes: Vec<Placement>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "created": self.creates.len(),
            "updated": self.updates.len(),
            "deleted": self.deletes.len(),
            "unchanged": self.unchanged,
        })
    }
}

/// Diffs by placement id. An id encodes (timeslot, subject, grade), so a move
/// shows up as one delete plus one create; a room or teacher change on the
/// same cell is an update.
pub fn reconcile<'a, B, W>(baseline: B, working: W) -> ChangeSet
where
    B: IntoIterator<Item = &'a Placement>,
    W: IntoIterator<Item = &'a Placement>,
{
    let before: BTreeMap<&str, &Placement> = baseline.into_iter().map(|p| (p.id.as_str(), p)).collect();
    let after: BTreeMap<&str, &Placement> = working.into_iter().map(|p| (p.id.as_str(), p)).collect();

    let mut out = ChangeSet::default();
    for (id, now) in &after {
        match before.get(id) {
            None => out.creates.push((*now).clone()),
            Some(was) if *was != *now => out.updates.push((*now).clone()),
            Some(_) => out.unchanged += 1,
        }
    }
    for (id, was) in &before {
        if !after.contains_key(id) {
            out.deletes.push((*was).clone());
        }
    }
    out
}

/// Content hash of a scope's persisted rows, used as the optimistic
/// concurrency token. Row order does not matter.
pub fn snapshot_version<'a>(rows: impl IntoIterator<Item = &'a Placement>) -> String {
    let mut sorted: Vec<&Placement> = rows.into_iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let mut hasher = Sha256::new();
    for p in sorted {
        hasher.update(p.id.as_bytes());
        hasher.update(b"|");
        hasher.update(p.teacher_id.to_le_bytes());
        hasher.update(p.resp_id.to_le_bytes());
        match p.room_id {
            Some(r) => hasher.update(r.to_le_bytes()),
            None => hasher.update(b"-"),
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Passes `actual` through when it is the version the session loaded.
pub fn ensure_current(expected: &str, actual: String) -> EngineResult<String> {
    if actual != expected {
        return Err(EngineError::StaleSession {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}

/// The whole term as a store holds it at commit time.
#[derive(Debug, Clone, Default)]
pub struct TermSnapshot {
    pub placements: Vec<Placement>,
    pub locks: Vec<Lock>,
}

/// Where sessions load from and save to.
pub trait PlacementStore {
    /// Version of the scope's rows as they are stored right now.
    fn current_version(&self, scope: &Scope) -> EngineResult<String>;

    /// In one atomic step: confirms the scope is still at `expected`, hands
    /// the stored term to `check`, then applies `changes`. Returns the new
    /// version. An empty change-set only confirms the version.
    fn commit<F>(
        &mut self,
        scope: &Scope,
        expected: &str,
        changes: &ChangeSet,
        check: F,
    ) -> EngineResult<String>
    where
        F: FnOnce(&TermSnapshot) -> EngineResult<()>;
}

/// In-memory store for engine tests.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub rows: BTreeMap<String, Placement>,
    pub locks: Vec<Lock>,
    pub fail_next: bool,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_rows(rows: impl IntoIterator<Item = Placement>) -> Self {
        Self {
            rows: rows.into_iter().map(|p| (p.id.clone(), p)).collect(),
            locks: Vec::new(),
            fail_next: false,
        }
    }

    pub fn scoped(&self, scope: &Scope) -> Vec<Placement> {
        self.rows.values().filter(|p| scope.owns(p)).cloned().collect()
    }
}

#[cfg(test)]
impl PlacementStore for MemoryStore {
    fn current_version(&self, scope: &Scope) -> EngineResult<String> {
        Ok(snapshot_version(self.rows.values().filter(|p| scope.owns(p))))
    }

    fn commit<F>(
        &mut self,
        scope: &Scope,
        expected: &str,
        changes: &ChangeSet,
        check: F,
    ) -> EngineResult<String>
    where
        F: FnOnce(&TermSnapshot) -> EngineResult<()>,
    {
        let actual = ensure_current(expected, self.current_version(scope)?)?;
        if changes.is_empty() {
            return Ok(actual);
        }
        check(&TermSnapshot {
            placements: self.rows.values().cloned().collect(),
            locks: self.locks.clone(),
        })?;
        if self.fail_next {
            self.fail_next = false;
            return Err(EngineError::PersistenceFailure(
                "simulated write failure".to_string(),
            ));
        }
        for p in &changes.deletes {
            self.rows.remove(&p.id);
        }
        for p in changes.creates.iter().chain(&changes.updates) {
            self.rows.insert(p.id.clone(), p.clone());
        }
        self.current_version(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::placement_id;
    use crate::term::{Day, GradeId, TermId, TimeslotId};

    fn row(day: Day, period: u8, room: Option<i64>) -> Placement {
        let ts = TimeslotId::new(TermId::new(1, 2567).expect("term"), day, period);
        let grade: GradeId = "101".parse().expect("grade");
        Placement {
            id: placement_id(ts, "MA101", grade),
            timeslot: ts,
            subject_code: "MA101".to_string(),
            grade,
            teacher_id: 1,
            resp_id: 10,
            room_id: room,
        }
    }

    #[test]
    fn reconcile_splits_creates_updates_deletes() {
        let baseline = vec![row(Day::Mon, 1, Some(1)), row(Day::Mon, 2, Some(1)), row(Day::Tue, 1, None)];
        let working = vec![row(Day::Mon, 1, Some(1)), row(Day::Mon, 2, Some(2)), row(Day::Wed, 3, None)];
        let cs = reconcile(&baseline, &working);
        assert_eq!(cs.unchanged, 1);
        assert_eq!(cs.updates, vec![row(Day::Mon, 2, Some(2))]);
        assert_eq!(cs.creates, vec![row(Day::Wed, 3, None)]);
        assert_eq!(cs.deletes, vec![row(Day::Tue, 1, None)]);
        assert!(reconcile(&baseline, &baseline).is_empty());
    }

    #[test]
    fn version_ignores_order_but_not_content() {
        let a = vec![row(Day::Mon, 1, Some(1)), row(Day::Fri, 8, None)];
        let b = vec![row(Day::Fri, 8, None), row(Day::Mon, 1, Some(1))];
        assert_eq!(snapshot_version(&a), snapshot_version(&b));
        let c = vec![row(Day::Fri, 8, None), row(Day::Mon, 1, Some(2))];
        assert_ne!(snapshot_version(&a), snapshot_version(&c));
        assert_eq!(snapshot_version(&a).len(), 64);
    }
}
