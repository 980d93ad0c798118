use crate::term::{GradeId, TimeslotId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A teacher's teaching load for one subject and one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Responsibility {
    pub resp_id: i64,
    pub subject_code: String,
    #[serde(default)]
    pub subject_name: String,
    pub teacher_id: i64,
    pub grade: GradeId,
    pub periods: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: i64,
    pub name: String,
}

/// An ordinary, mutable placement owned by one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub id: String,
    pub timeslot: TimeslotId,
    pub subject_code: String,
    pub grade: GradeId,
    pub teacher_id: i64,
    pub resp_id: i64,
    pub room_id: Option<i64>,
}

impl Placement {
    pub fn for_responsibility(resp: &Responsibility, timeslot: TimeslotId, room_id: Option<i64>) -> Self {
        Self {
            id: placement_id(timeslot, &resp.subject_code, resp.grade),
            timeslot,
            subject_code: resp.subject_code.clone(),
            grade: resp.grade,
            teacher_id: resp.teacher_id,
            resp_id: resp.resp_id,
            room_id,
        }
    }

    /// Same placement, re-keyed onto another timeslot.
    pub fn moved_to(&self, timeslot: TimeslotId) -> Self {
        Self {
            id: placement_id(timeslot, &self.subject_code, self.grade),
            timeslot,
            ..self.clone()
        }
    }
}

/// `"{timeslotId}-{subjectCode}-{gradeId}"`
pub fn placement_id(timeslot: TimeslotId, subject_code: &str, grade: GradeId) -> String {
    format!("{}-{}-{}", timeslot, subject_code, grade)
}

/// An administrative occupancy (assembly, lunch, exams) shared by many classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub id: String,
    pub timeslot: TimeslotId,
    pub subject_code: String,
    pub room_id: Option<i64>,
    pub teachers: BTreeSet<i64>,
    pub grades: BTreeSet<GradeId>,
}

/// `"{timeslotId}-{subjectCode}"`
pub fn lock_id(timeslot: TimeslotId, subject_code: &str) -> String {
    format!("{}-{}", timeslot, subject_code)
}

/// Anything that occupies a timeslot, as seen by conflict scans.
#[derive(Debug, Clone, Copy)]
pub enum Occupant<'a> {
    Scheduled(&'a Placement),
    Locked(&'a Lock),
}

impl<'a> Occupant<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            Occupant::Scheduled(p) => &p.id,
            Occupant::Locked(l) => &l.id,
        }
    }

    pub fn timeslot(&self) -> TimeslotId {
        match self {
            Occupant::Scheduled(p) => p.timeslot,
            Occupant::Locked(l) => l.timeslot,
        }
    }

    pub fn subject_code(&self) -> &'a str {
        match self {
            Occupant::Scheduled(p) => &p.subject_code,
            Occupant::Locked(l) => &l.subject_code,
        }
    }

    pub fn room_id(&self) -> Option<i64> {
        match self {
            Occupant::Scheduled(p) => p.room_id,
            Occupant::Locked(l) => l.room_id,
        }
    }

    pub fn has_grade(&self, grade: GradeId) -> bool {
        match self {
            Occupant::Scheduled(p) => p.grade == grade,
            Occupant::Locked(l) => l.grades.contains(&grade),
        }
    }

    pub fn has_teacher(&self, teacher_id: i64) -> bool {
        match self {
            Occupant::Scheduled(p) => p.teacher_id == teacher_id,
            Occupant::Locked(l) => l.teachers.contains(&teacher_id),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Occupant::Locked(_))
    }
}

/// One cell of a session's working grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Cell {
    Empty,
    Occupied(Placement),
    Locked(Lock),
    Break,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{Day, TermId};

    #[test]
    fn placement_id_follows_class_id_format() {
        let ts = TimeslotId::new(TermId::new(1, 2567).expect("term"), Day::Wed, 2);
        let grade: GradeId = "203".parse().expect("grade");
        assert_eq!(placement_id(ts, "TH21101", grade), "1-2567-WED2-TH21101-203");
        assert_eq!(lock_id(ts, "ASSEMBLY"), "1-2567-WED2-ASSEMBLY");
    }

    #[test]
    fn moved_placement_is_rekeyed() {
        let term = TermId::new(1, 2567).expect("term");
        let resp = Responsibility {
            resp_id: 7,
            subject_code: "MA101".to_string(),
            subject_name: "Math".to_string(),
            teacher_id: 3,
            grade: "101".parse().expect("grade"),
            periods: 2,
        };
        let p = Placement::for_responsibility(&resp, TimeslotId::new(term, Day::Mon, 1), Some(4));
        let q = p.moved_to(TimeslotId::new(term, Day::Tue, 6));
        assert_eq!(q.id, "1-2567-TUE6-MA101-101");
        assert_eq!((q.resp_id, q.room_id), (7, Some(4)));
    }
}
