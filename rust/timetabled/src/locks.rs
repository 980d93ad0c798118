//! Administrative locks: one row per (timeslot, subject) shared by many
//! classes, plus the built-in presets that expand into lock batches.

use crate::conflict::{Candidate, Conflict, ConflictDetector, ConflictKind};
use crate::error::{EngineError, EngineResult};
use crate::grid::Timeslot;
use crate::placement::{lock_id, Lock, Placement, Room};
use crate::term::{Day, GradeBand, GradeId, TimeslotId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Lock `subject_code` for every grade at every timeslot listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub subject_code: String,
    pub teachers: BTreeSet<i64>,
    pub grades: BTreeSet<GradeId>,
    pub timeslots: Vec<TimeslotId>,
    pub room_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    locks: BTreeMap<String, Lock>,
    by_cell: HashMap<(TimeslotId, GradeId), String>,
}

impl LockRegistry {
    pub fn from_locks(locks: impl IntoIterator<Item = Lock>) -> Self {
        let mut reg = Self::default();
        for lock in locks {
            reg.insert(lock);
        }
        reg
    }

    pub fn lookup(&self, timeslot: TimeslotId, grade: GradeId) -> Option<&Lock> {
        self.by_cell
            .get(&(timeslot, grade))
            .and_then(|id| self.locks.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&Lock> {
        self.locks.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn insert(&mut self, lock: Lock) {
        if let Some(prev) = self.locks.remove(&lock.id) {
            self.unindex(&prev);
        }
        for g in &lock.grades {
            self.by_cell.insert((lock.timeslot, *g), lock.id.clone());
        }
        self.locks.insert(lock.id.clone(), lock);
    }

    fn unindex(&mut self, lock: &Lock) {
        for g in &lock.grades {
            if self.by_cell.get(&(lock.timeslot, *g)) == Some(&lock.id) {
                self.by_cell.remove(&(lock.timeslot, *g));
            }
        }
    }

    /// Validates a whole batch against `ordinary` placements and the current
    /// locks, returning the lock rows that committing it would write. Nothing
    /// is changed; every conflicting row of the batch is reported.
    pub fn plan(&self, requests: &[LockRequest], ordinary: &[Placement]) -> EngineResult<Vec<Lock>> {
        let mut staged = self.locks.clone();
        let mut touched: Vec<String> = Vec::new();
        let mut slot_rows: Vec<Conflict> = Vec::new();
        let mut teacher_rows: Vec<Conflict> = Vec::new();
        let mut room_rows: Vec<Conflict> = Vec::new();

        for req in requests {
            let teachers: Vec<i64> = req.teachers.iter().copied().collect();
            for &ts in &req.timeslots {
                let id = lock_id(ts, &req.subject_code);
                {
                    let detector = ConflictDetector::new(ordinary, staged.values());
                    let ignore = [id.as_str()];
                    for &grade in &req.grades {
                        let set = detector.check_placement(&Candidate {
                            timeslot: ts,
                            grade,
                            teachers: &teachers,
                            room_id: req.room_id,
                            ignore: &ignore,
                        });
                        for c in set.conflicts {
                            let bucket = match c.kind {
                                ConflictKind::Class | ConflictKind::Locked | ConflictKind::Break => {
                                    &mut slot_rows
                                }
                                ConflictKind::Teacher => &mut teacher_rows,
                                ConflictKind::Room => &mut room_rows,
                            };
                            if !bucket.contains(&c) {
                                bucket.push(c);
                            }
                        }
                    }
                }

                let entry = staged.entry(id.clone()).or_insert_with(|| Lock {
                    id: id.clone(),
                    timeslot: ts,
                    subject_code: req.subject_code.clone(),
                    room_id: req.room_id,
                    teachers: BTreeSet::new(),
                    grades: BTreeSet::new(),
                });
                // A merged lock keeps a single room.
                if let (Some(held), Some(wanted)) = (entry.room_id, req.room_id) {
                    if held != wanted {
                        let row = Conflict {
                            kind: ConflictKind::Room,
                            timeslot: ts,
                            grade: None,
                            teacher_id: None,
                            room_id: Some(wanted),
                            break_kind: None,
                            occupant_id: Some(id.clone()),
                            subject_code: Some(req.subject_code.clone()),
                            candidate_id: None,
                        };
                        if !room_rows.contains(&row) {
                            room_rows.push(row);
                        }
                    }
                }
                entry.grades.extend(req.grades.iter().copied());
                entry.teachers.extend(req.teachers.iter().copied());
                if entry.room_id.is_none() {
                    entry.room_id = req.room_id;
                }
                if !touched.contains(&id) {
                    touched.push(id);
                }
            }
        }

        if !slot_rows.is_empty() {
            return Err(EngineError::SlotOccupied { conflicts: slot_rows });
        }
        if !teacher_rows.is_empty() {
            return Err(EngineError::TeacherConflict {
                conflicts: teacher_rows,
            });
        }
        if !room_rows.is_empty() {
            return Err(EngineError::RoomConflict { conflicts: room_rows });
        }

        Ok(touched
            .into_iter()
            .filter_map(|id| staged.remove(&id))
            .collect())
    }

    pub fn create(&mut self, request: LockRequest, ordinary: &[Placement]) -> EngineResult<Vec<Lock>> {
        self.bulk_create(&[request], ordinary)
    }

    /// All-or-nothing: on error the registry is unchanged.
    pub fn bulk_create(&mut self, requests: &[LockRequest], ordinary: &[Placement]) -> EngineResult<Vec<Lock>> {
        let planned = match self.plan(requests, ordinary) {
            Ok(p) => p,
            Err(e) => {
                debug!(requests = requests.len(), code = e.code(), "lock batch rejected");
                return Err(e);
            }
        };
        for lock in &planned {
            self.insert(lock.clone());
        }
        info!(requests = requests.len(), locks = planned.len(), "lock batch committed");
        Ok(planned)
    }

    pub fn delete(&mut self, id: &str) -> EngineResult<Lock> {
        let lock = self
            .locks
            .remove(id)
            .ok_or_else(|| EngineError::not_found("lock", id))?;
        self.unindex(&lock);
        info!(lock = %lock.id, "lock deleted");
        Ok(lock)
    }

    /// Releases one class from a shared lock. Returns the remaining lock, or
    /// `None` when that was its last grade and the lock is gone.
    pub fn remove_grade(&mut self, id: &str, grade: GradeId) -> EngineResult<Option<Lock>> {
        let mut lock = self
            .locks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("lock", id))?;
        if !lock.grades.remove(&grade) {
            return Err(EngineError::not_found("lock grade", format!("{}/{}", id, grade)));
        }
        if lock.grades.is_empty() {
            self.delete(id)?;
            return Ok(None);
        }
        self.insert(lock.clone());
        info!(lock = %id, grade = %grade, "grade released from lock");
        Ok(Some(lock))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateCategory {
    Lunch,
    Activity,
    Assembly,
    Exam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeFilter {
    Junior,
    Senior,
    All,
    /// Grades are supplied by the caller.
    Specific,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub category: TemplateCategory,
    pub subject_code: &'static str,
    pub room_name: &'static str,
    pub grade_filter: GradeFilter,
    pub days: &'static [Day],
    pub periods: &'static [u8],
}

const WEEK: &[Day] = &Day::SCHOOL_WEEK;
const ALL_DAY: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

pub const TEMPLATES: &[LockTemplate] = &[
    LockTemplate {
        id: "lunch-junior",
        name: "Lunch Break (Junior)",
        category: TemplateCategory::Lunch,
        subject_code: "LUNCH-JR",
        room_name: "Cafeteria",
        grade_filter: GradeFilter::Junior,
        days: WEEK,
        periods: &[4],
    },
    LockTemplate {
        id: "lunch-senior",
        name: "Lunch Break (Senior)",
        category: TemplateCategory::Lunch,
        subject_code: "LUNCH-SR",
        room_name: "Cafeteria",
        grade_filter: GradeFilter::Senior,
        days: WEEK,
        periods: &[5],
    },
    LockTemplate {
        id: "activity-morning",
        name: "Morning Activities",
        category: TemplateCategory::Activity,
        subject_code: "ACT-MORNING",
        room_name: "Flagpole Court",
        grade_filter: GradeFilter::All,
        days: &[Day::Mon],
        periods: &[1],
    },
    LockTemplate {
        id: "activity-club",
        name: "Club Activities",
        category: TemplateCategory::Activity,
        subject_code: "ACT-CLUB",
        room_name: "Club Rooms",
        grade_filter: GradeFilter::All,
        days: &[Day::Fri],
        periods: &[8, 9],
    },
    LockTemplate {
        id: "activity-sport",
        name: "Sports Activities",
        category: TemplateCategory::Activity,
        subject_code: "ACT-SPORT",
        room_name: "Sports Field",
        grade_filter: GradeFilter::All,
        days: &[Day::Wed],
        periods: &[7, 8],
    },
    LockTemplate {
        id: "assembly-weekly",
        name: "Weekly Assembly",
        category: TemplateCategory::Assembly,
        subject_code: "ASSEMBLY",
        room_name: "Auditorium",
        grade_filter: GradeFilter::All,
        days: &[Day::Fri],
        periods: &[1],
    },
    LockTemplate {
        id: "exam-midterm",
        name: "Midterm Exam",
        category: TemplateCategory::Exam,
        subject_code: "EXAM-MID",
        room_name: "Exam Hall",
        grade_filter: GradeFilter::All,
        days: WEEK,
        periods: ALL_DAY,
    },
    LockTemplate {
        id: "exam-final",
        name: "Final Exam",
        category: TemplateCategory::Exam,
        subject_code: "EXAM-FINAL",
        room_name: "Exam Hall",
        grade_filter: GradeFilter::All,
        days: WEEK,
        periods: ALL_DAY,
    },
];

pub fn template(id: &str) -> Option<&'static LockTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

/// Caller-side choices when applying a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateOptions {
    /// Required for `GradeFilter::Specific`; narrows the other filters.
    pub grades: Option<BTreeSet<GradeId>>,
    pub teachers: BTreeSet<i64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub request: LockRequest,
    pub warnings: Vec<String>,
}

/// Expands a template against what the term actually has.
pub fn resolve_template(
    tpl: &LockTemplate,
    opts: &TemplateOptions,
    grid: &[Timeslot],
    grades: &[GradeId],
    rooms: &[Room],
) -> EngineResult<ResolvedTemplate> {
    let mut warnings = Vec::new();

    let matching: BTreeSet<GradeId> = grades
        .iter()
        .copied()
        .filter(|g| match tpl.grade_filter {
            GradeFilter::Junior => g.band() == GradeBand::Junior,
            GradeFilter::Senior => g.band() == GradeBand::Senior,
            GradeFilter::All | GradeFilter::Specific => true,
        })
        .filter(|g| match &opts.grades {
            Some(only) => only.contains(g),
            None => tpl.grade_filter != GradeFilter::Specific,
        })
        .collect();
    if matching.is_empty() {
        return Err(EngineError::TemplateEmpty {
            template_id: tpl.id.to_string(),
            reason: "no grade matches the template's grade filter".to_string(),
        });
    }

    let max_period = grid.iter().map(|s| s.period).max().unwrap_or(0);
    let beyond: Vec<String> = tpl
        .periods
        .iter()
        .filter(|p| **p > max_period)
        .map(|p| p.to_string())
        .collect();
    if !beyond.is_empty() {
        warnings.push(format!(
            "periods {} are beyond the term's {} periods and were skipped",
            beyond.join(", "),
            max_period
        ));
    }

    let timeslots: Vec<TimeslotId> = grid
        .iter()
        .filter(|s| tpl.days.contains(&s.day) && tpl.periods.contains(&s.period))
        .map(|s| s.id)
        .collect();
    if timeslots.is_empty() {
        return Err(EngineError::TemplateEmpty {
            template_id: tpl.id.to_string(),
            reason: "no timeslot matches the template's days and periods".to_string(),
        });
    }

    let room_id = match rooms.iter().find(|r| r.name == tpl.room_name) {
        Some(r) => Some(r.room_id),
        None => {
            warnings.push(format!(
                "room {:?} does not exist; locks were created without a room",
                tpl.room_name
            ));
            None
        }
    };

    Ok(ResolvedTemplate {
        request: LockRequest {
            subject_code: tpl.subject_code.to_string(),
            teachers: opts.teachers.clone(),
            grades: matching,
            timeslots,
            room_id,
        },
        warnings,
    })
}
