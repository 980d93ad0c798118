//! Double-booking detection across a whole term.
//!
//! Every check is a linear scan over the term's scheduled and locked
//! occupants. Validations run once per user action, so no index is kept.

use crate::breaks::{self, BreakKind};
use crate::error::{EngineError, EngineResult};
use crate::grid::Timeslot;
use crate::placement::{Lock, Occupant, Placement};
use crate::term::{GradeId, TimeslotId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Declaration order is reporting priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Break,
    Locked,
    Class,
    Teacher,
    Room,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub kind: ConflictKind,
    pub timeslot: TimeslotId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<GradeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_kind: Option<BreakKind>,
    /// The existing occupant that blocks the candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_code: Option<String>,
    /// Set by term-wide scans: the second party of the clash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
}

impl Conflict {
    fn against(kind: ConflictKind, timeslot: TimeslotId, occ: &Occupant<'_>) -> Self {
        Self {
            kind,
            timeslot,
            grade: None,
            teacher_id: None,
            room_id: None,
            break_kind: None,
            occupant_id: Some(occ.id().to_string()),
            subject_code: Some(occ.subject_code().to_string()),
            candidate_id: None,
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}", self.kind, self.timeslot)?;
        if let Some(g) = self.grade {
            write!(f, " grade {}", g)?;
        }
        if let Some(t) = self.teacher_id {
            write!(f, " teacher {}", t)?;
        }
        if let Some(r) = self.room_id {
            write!(f, " room {}", r)?;
        }
        if let Some(occ) = &self.occupant_id {
            write!(f, " (held by {})", occ)?;
        }
        Ok(())
    }
}

/// Whether room double-booking rejects a placement or is only reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPolicy {
    #[default]
    Hard,
    Advisory,
}

impl RoomPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hard" => Some(Self::Hard),
            "advisory" => Some(Self::Advisory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Advisory => "advisory",
        }
    }
}

/// A proposed occupancy of one (timeslot, grade).
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub timeslot: TimeslotId,
    pub grade: GradeId,
    pub teachers: &'a [i64],
    pub room_id: Option<i64>,
    /// Occupants to skip, normally the candidate's own prior placement.
    pub ignore: &'a [&'a str],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictSet {
    pub conflicts: Vec<Conflict>,
    /// The candidate's grade and the break kind of its timeslot.
    #[serde(skip)]
    grade: GradeId,
    #[serde(skip)]
    break_kind: BreakKind,
}

impl ConflictSet {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Turns the highest-priority blocking conflict into an error. Room
    /// conflicts that the policy does not enforce come back as advisories.
    pub fn into_result(self, policy: RoomPolicy) -> EngineResult<Vec<Conflict>> {
        let ConflictSet {
            conflicts,
            grade,
            break_kind,
        } = self;
        if conflicts.is_empty() {
            return Ok(Vec::new());
        }
        let blocking = conflicts
            .iter()
            .find(|c| c.kind != ConflictKind::Room || policy == RoomPolicy::Hard)
            .map(|c| c.kind);
        let Some(kind) = blocking else {
            return Ok(conflicts);
        };
        let of_kind: Vec<Conflict> = conflicts
            .into_iter()
            .filter(|c| c.kind == kind)
            .collect();
        let first = &of_kind[0];
        Err(match kind {
            ConflictKind::Break => EngineError::BreakIncompatible {
                timeslot: first.timeslot,
                grade,
                break_kind,
            },
            ConflictKind::Locked => EngineError::Locked {
                timeslot: first.timeslot,
                lock_id: first.occupant_id.clone().unwrap_or_default(),
            },
            ConflictKind::Class => EngineError::ClassConflict { conflicts: of_kind },
            ConflictKind::Teacher => EngineError::TeacherConflict { conflicts: of_kind },
            ConflictKind::Room => EngineError::RoomConflict { conflicts: of_kind },
        })
    }
}

pub struct ConflictDetector<'a> {
    occupants: Vec<Occupant<'a>>,
    grid: Option<&'a BTreeMap<TimeslotId, Timeslot>>,
}

impl<'a> ConflictDetector<'a> {
    pub fn new<P, L>(placements: P, locks: L) -> Self
    where
        P: IntoIterator<Item = &'a Placement>,
        L: IntoIterator<Item = &'a Lock>,
    {
        let mut occupants: Vec<Occupant<'a>> =
            placements.into_iter().map(Occupant::Scheduled).collect();
        occupants.extend(locks.into_iter().map(Occupant::Locked));
        Self {
            occupants,
            grid: None,
        }
    }

    /// Enables break-time checks against the term grid.
    pub fn with_grid(mut self, grid: &'a BTreeMap<TimeslotId, Timeslot>) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn check_placement(&self, c: &Candidate<'_>) -> ConflictSet {
        let mut conflicts = Vec::new();
        let mut break_kind = BreakKind::None;

        if let Some(slot) = self.grid.and_then(|g| g.get(&c.timeslot)) {
            break_kind = slot.break_kind;
            if breaks::is_unavailable(slot.break_kind, c.grade.band()) {
                conflicts.push(Conflict {
                    kind: ConflictKind::Break,
                    timeslot: c.timeslot,
                    grade: Some(c.grade),
                    teacher_id: None,
                    room_id: None,
                    break_kind: Some(slot.break_kind),
                    occupant_id: None,
                    subject_code: None,
                    candidate_id: None,
                });
            }
        }

        for occ in &self.occupants {
            if occ.timeslot() != c.timeslot || c.ignore.contains(&occ.id()) {
                continue;
            }
            if occ.has_grade(c.grade) {
                let kind = if occ.is_locked() {
                    ConflictKind::Locked
                } else {
                    ConflictKind::Class
                };
                let mut row = Conflict::against(kind, c.timeslot, occ);
                row.grade = Some(c.grade);
                conflicts.push(row);
            }
            for &teacher in c.teachers {
                if occ.has_teacher(teacher) {
                    let mut row = Conflict::against(ConflictKind::Teacher, c.timeslot, occ);
                    row.teacher_id = Some(teacher);
                    conflicts.push(row);
                }
            }
            if let Some(room) = c.room_id {
                if occ.room_id() == Some(room) {
                    let mut row = Conflict::against(ConflictKind::Room, c.timeslot, occ);
                    row.room_id = Some(room);
                    conflicts.push(row);
                }
            }
        }

        conflicts.sort_by_key(|c| c.kind);
        ConflictSet {
            conflicts,
            grade: c.grade,
            break_kind,
        }
    }

    /// Rooms taken by any occupant at `timeslot`, minus `ignore`.
    pub fn rooms_in_use(&self, timeslot: TimeslotId, ignore: &[&str]) -> Vec<i64> {
        let mut rooms: Vec<i64> = self
            .occupants
            .iter()
            .filter(|o| o.timeslot() == timeslot && !ignore.contains(&o.id()))
            .filter_map(|o| o.room_id())
            .collect();
        rooms.sort_unstable();
        rooms.dedup();
        rooms
    }
}

/// Existing double bookings in a term: every pair of occupants sharing a
/// timeslot and a grade, a teacher or a room.
pub fn scan_term(placements: &[Placement], locks: &[Lock]) -> Vec<Conflict> {
    let mut by_slot: HashMap<TimeslotId, Vec<Occupant<'_>>> = HashMap::new();
    for p in placements {
        by_slot.entry(p.timeslot).or_default().push(Occupant::Scheduled(p));
    }
    for l in locks {
        by_slot.entry(l.timeslot).or_default().push(Occupant::Locked(l));
    }

    let mut slots: Vec<_> = by_slot.into_iter().collect();
    slots.sort_by_key(|(ts, _)| *ts);

    let mut out = Vec::new();
    for (ts, occupants) in slots {
        for (i, a) in occupants.iter().enumerate() {
            for b in &occupants[i + 1..] {
                let pair = |kind: ConflictKind| {
                    let mut row = Conflict::against(kind, ts, a);
                    row.candidate_id = Some(b.id().to_string());
                    row
                };
                if let Some(g) = shared_grade(a, b) {
                    let mut row = pair(ConflictKind::Class);
                    row.grade = Some(g);
                    out.push(row);
                }
                if let Some(t) = shared_teacher(a, b) {
                    let mut row = pair(ConflictKind::Teacher);
                    row.teacher_id = Some(t);
                    out.push(row);
                }
                if let (Some(ra), Some(rb)) = (a.room_id(), b.room_id()) {
                    if ra == rb {
                        let mut row = pair(ConflictKind::Room);
                        row.room_id = Some(ra);
                        out.push(row);
                    }
                }
            }
        }
    }
    out
}

fn grades_of(o: &Occupant<'_>) -> Vec<GradeId> {
    match o {
        Occupant::Scheduled(p) => vec![p.grade],
        Occupant::Locked(l) => l.grades.iter().copied().collect(),
    }
}

fn teachers_of(o: &Occupant<'_>) -> Vec<i64> {
    match o {
        Occupant::Scheduled(p) => vec![p.teacher_id],
        Occupant::Locked(l) => l.teachers.iter().copied().collect(),
    }
}

fn shared_grade(a: &Occupant<'_>, b: &Occupant<'_>) -> Option<GradeId> {
    grades_of(a).into_iter().find(|g| b.has_grade(*g))
}

fn shared_teacher(a: &Occupant<'_>, b: &Occupant<'_>) -> Option<i64> {
    teachers_of(a).into_iter().find(|t| b.has_teacher(*t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TermConfig;
    use crate::grid::generate_grid;
    use crate::placement::{lock_id, placement_id};
    use crate::term::{Day, TermId};
    use std::collections::BTreeSet;

    const NO_LOCKS: &[Lock] = &[];
    const NO_PLACEMENTS: &[Placement] = &[];

    fn has(set: &ConflictSet, kind: ConflictKind) -> bool {
        set.conflicts.iter().any(|c| c.kind == kind)
    }

    fn term() -> TermId {
        TermId::new(2, 2567).expect("term")
    }

    fn ts(day: Day, period: u8) -> TimeslotId {
        TimeslotId::new(term(), day, period)
    }

    fn grade(s: &str) -> GradeId {
        s.parse().expect("grade")
    }

    fn placement(slot: TimeslotId, subject: &str, g: &str, teacher: i64, room: Option<i64>) -> Placement {
        Placement {
            id: placement_id(slot, subject, grade(g)),
            timeslot: slot,
            subject_code: subject.to_string(),
            grade: grade(g),
            teacher_id: teacher,
            resp_id: teacher * 100,
            room_id: room,
        }
    }

    fn grid() -> BTreeMap<TimeslotId, Timeslot> {
        generate_grid(&TermConfig::with_defaults(term()))
            .expect("grid")
            .into_iter()
            .map(|s| (s.id, s))
            .collect()
    }

    #[test]
    fn teacher_busy_elsewhere_is_a_teacher_conflict() {
        let existing = vec![placement(ts(Day::Mon, 3), "MA101", "101", 7, Some(1))];
        let det = ConflictDetector::new(&existing, NO_LOCKS);
        let set = det.check_placement(&Candidate {
            timeslot: ts(Day::Mon, 3),
            grade: grade("102"),
            teachers: &[7],
            room_id: Some(2),
            ignore: &[],
        });
        assert!(has(&set, ConflictKind::Teacher));
        assert!(!has(&set, ConflictKind::Class));
        assert!(matches!(
            set.into_result(RoomPolicy::Hard),
            Err(EngineError::TeacherConflict { .. })
        ));
    }

    #[test]
    fn own_prior_placement_is_ignored() {
        let existing = vec![placement(ts(Day::Mon, 3), "MA101", "101", 7, Some(1))];
        let det = ConflictDetector::new(&existing, NO_LOCKS);
        let own = existing[0].id.clone();
        let ignore = [own.as_str()];
        let set = det.check_placement(&Candidate {
            timeslot: ts(Day::Mon, 3),
            grade: grade("101"),
            teachers: &[7],
            room_id: Some(1),
            ignore: &ignore,
        });
        assert!(set.is_empty());
    }

    #[test]
    fn class_conflict_outranks_teacher_conflict() {
        let existing = vec![placement(ts(Day::Tue, 1), "SC101", "101", 8, None)];
        let det = ConflictDetector::new(&existing, NO_LOCKS);
        let set = det.check_placement(&Candidate {
            timeslot: ts(Day::Tue, 1),
            grade: grade("101"),
            teachers: &[8],
            room_id: None,
            ignore: &[],
        });
        assert_eq!(set.conflicts[0].kind, ConflictKind::Class);
        assert!(matches!(
            set.into_result(RoomPolicy::Hard),
            Err(EngineError::ClassConflict { .. })
        ));
    }

    #[test]
    fn room_policy_decides_whether_room_overlap_blocks() {
        let existing = vec![placement(ts(Day::Wed, 2), "EN101", "101", 1, Some(9))];
        let det = ConflictDetector::new(&existing, NO_LOCKS);
        let candidate = Candidate {
            timeslot: ts(Day::Wed, 2),
            grade: grade("201"),
            teachers: &[2],
            room_id: Some(9),
            ignore: &[],
        };
        assert!(matches!(
            det.check_placement(&candidate).into_result(RoomPolicy::Hard),
            Err(EngineError::RoomConflict { .. })
        ));
        let advisories = det
            .check_placement(&candidate)
            .into_result(RoomPolicy::Advisory)
            .expect("advisory only");
        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].kind, ConflictKind::Room);
    }

    #[test]
    fn lock_on_grade_reports_locked_and_break_comes_first() {
        let slot = ts(Day::Thu, 4);
        let lock = Lock {
            id: lock_id(slot, "LUNCH"),
            timeslot: slot,
            subject_code: "LUNCH".to_string(),
            room_id: None,
            teachers: BTreeSet::new(),
            grades: [grade("101"), grade("102")].into_iter().collect(),
        };
        let locks = vec![lock];
        let g = grid();
        let det = ConflictDetector::new(NO_PLACEMENTS, &locks).with_grid(&g);

        let senior = det.check_placement(&Candidate {
            timeslot: ts(Day::Thu, 1),
            grade: grade("401"),
            teachers: &[1],
            room_id: None,
            ignore: &[],
        });
        assert!(senior.is_empty());

        // Period 4 is the junior break, so the break outranks the lock.
        let junior = det.check_placement(&Candidate {
            timeslot: slot,
            grade: grade("101"),
            teachers: &[1],
            room_id: None,
            ignore: &[],
        });
        assert_eq!(junior.conflicts[0].kind, ConflictKind::Break);
        assert!(has(&junior, ConflictKind::Locked));
        match junior.into_result(RoomPolicy::Hard) {
            Err(EngineError::BreakIncompatible {
                timeslot,
                grade: g,
                break_kind,
            }) => {
                assert_eq!(timeslot, slot);
                assert_eq!(g, grade("101"));
                assert_eq!(break_kind, BreakKind::Junior);
            }
            other => panic!("expected break_incompatible, got {:?}", other),
        }

        let det_no_grid = ConflictDetector::new(NO_PLACEMENTS, &locks);
        let locked = det_no_grid.check_placement(&Candidate {
            timeslot: slot,
            grade: grade("102"),
            teachers: &[1],
            room_id: None,
            ignore: &[],
        });
        assert!(matches!(
            locked.into_result(RoomPolicy::Hard),
            Err(EngineError::Locked { .. })
        ));
    }

    #[test]
    fn senior_band_may_use_junior_break_slot() {
        let g = grid();
        let det = ConflictDetector::new(NO_PLACEMENTS, NO_LOCKS).with_grid(&g);
        let set = det.check_placement(&Candidate {
            timeslot: ts(Day::Mon, 4),
            grade: grade("501"),
            teachers: &[3],
            room_id: None,
            ignore: &[],
        });
        assert!(set.is_empty());
    }

    #[test]
    fn scan_term_reports_each_double_booking() {
        let slot = ts(Day::Fri, 2);
        let placements = vec![
            placement(slot, "MA101", "101", 1, Some(5)),
            placement(slot, "SC101", "102", 1, Some(5)),
            placement(ts(Day::Fri, 3), "SC101", "102", 1, Some(5)),
        ];
        let rows = scan_term(&placements, NO_LOCKS);
        let kinds: Vec<ConflictKind> = rows.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ConflictKind::Teacher, ConflictKind::Room]);
        assert_eq!(rows[0].candidate_id.as_deref(), Some(placements[1].id.as_str()));
    }
}
