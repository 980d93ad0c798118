use crate::breaks::BreakKind;
use crate::conflict::Conflict;
use crate::term::{GradeBand, GradeId, TimeslotId};
use serde_json::json;

pub type EngineResult<T> = Result<T, EngineError>;

/// Everything the arrangement engine can refuse. Placement-time variants leave
/// the session untouched; `PersistenceFailure` is retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("invalid config field {field}: {message}")]
    ConfigInvalid { field: String, message: String },

    #[error("slot already occupied: {}", summarize(.conflicts))]
    SlotOccupied { conflicts: Vec<Conflict> },

    #[error("teacher double-booked: {}", summarize(.conflicts))]
    TeacherConflict { conflicts: Vec<Conflict> },

    #[error("class double-booked: {}", summarize(.conflicts))]
    ClassConflict { conflicts: Vec<Conflict> },

    #[error("room double-booked: {}", summarize(.conflicts))]
    RoomConflict { conflicts: Vec<Conflict> },

    #[error("timeslot {timeslot} is a {break_kind} period and cannot host grade {grade}")]
    BreakIncompatible {
        timeslot: TimeslotId,
        grade: GradeId,
        break_kind: BreakKind,
    },

    #[error("timeslot {timeslot} is locked by {lock_id}")]
    Locked { timeslot: TimeslotId, lock_id: String },

    #[error("schedule changed since it was loaded (expected version {expected}, found {actual})")]
    StaleSession { expected: String, actual: String },

    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("select a subject or a placement first")]
    NothingSelected,

    #[error("a {pending} selection is pending; cannot select a {requested} item")]
    BandMismatch {
        pending: GradeBand,
        requested: GradeBand,
    },

    #[error("placement {0} is not editable in this session")]
    NotOwned(String),

    #[error("teacher {teacher_id} is not assigned to {subject_code} for grade {grade}")]
    NotAssigned {
        teacher_id: i64,
        subject_code: String,
        grade: GradeId,
    },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("responsibility {0} has no periods left to place")]
    ResponsibilityExhausted(i64),

    #[error("a save is already in progress")]
    SaveInProgress,

    #[error("template {template_id} matched nothing: {reason}")]
    TemplateEmpty { template_id: String, reason: String },
}

fn summarize(conflicts: &[Conflict]) -> String {
    match conflicts {
        [] => "no rows".to_string(),
        [one] => one.to_string(),
        [first, rest @ ..] => format!("{} (+{} more)", first, rest.len()),
    }
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn config(field: &str, message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Stable wire code used in the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::SlotOccupied { .. } => "slot_occupied",
            Self::TeacherConflict { .. } => "teacher_conflict",
            Self::ClassConflict { .. } => "class_conflict",
            Self::RoomConflict { .. } => "room_conflict",
            Self::BreakIncompatible { .. } => "break_incompatible",
            Self::Locked { .. } => "locked",
            Self::StaleSession { .. } => "stale_session",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::NothingSelected => "nothing_selected",
            Self::BandMismatch { .. } => "band_mismatch",
            Self::NotOwned(_) => "not_owned",
            Self::NotAssigned { .. } => "not_assigned",
            Self::NotFound { .. } => "not_found",
            Self::ResponsibilityExhausted(_) => "responsibility_exhausted",
            Self::SaveInProgress => "save_in_progress",
            Self::TemplateEmpty { .. } => "template_empty",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceFailure(_) | Self::SaveInProgress)
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ConfigInvalid { field, .. } => Some(json!({ "field": field })),
            Self::SlotOccupied { conflicts }
            | Self::TeacherConflict { conflicts }
            | Self::ClassConflict { conflicts }
            | Self::RoomConflict { conflicts } => Some(json!({
                "timeslotId": conflicts.first().map(|c| c.timeslot.to_string()),
                "conflicts": conflicts,
            })),
            Self::BreakIncompatible {
                timeslot,
                grade,
                break_kind,
            } => Some(json!({
                "timeslotId": timeslot.to_string(),
                "gradeId": grade.to_string(),
                "breakKind": break_kind.code(),
            })),
            Self::Locked { timeslot, lock_id } => Some(json!({
                "timeslotId": timeslot.to_string(),
                "lockId": lock_id,
            })),
            Self::StaleSession { expected, actual } => Some(json!({
                "expected": expected,
                "actual": actual,
            })),
            Self::PersistenceFailure(_) | Self::SaveInProgress => {
                Some(json!({ "retryable": self.is_retryable() }))
            }
            Self::BandMismatch { pending, requested } => Some(json!({
                "pending": pending.as_str(),
                "requested": requested.as_str(),
            })),
            Self::NotFound { what, id } => Some(json!({ "entity": what, "id": id })),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::PersistenceFailure(e.to_string())
    }
}
