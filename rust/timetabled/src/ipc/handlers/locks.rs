use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::session::refresh_term_sessions;
use crate::ipc::helpers::{
    get_grade, get_grade_set, get_id_set, get_optional_i64, get_required_str, get_term,
    get_timeslot_list,
};
use crate::ipc::types::{AppState, Request};
use crate::locks::{self, LockRegistry, LockRequest, TemplateOptions, TEMPLATES};
use crate::placement::{Lock, Placement};
use crate::session::AssignmentSession;
use crate::term::{GradeId, TermId, TimeslotId};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// What a lock mutation needs from the workspace: the term's registry,
/// its persisted ordinary placements, and its grid and grade catalog for
/// validating request ids.
struct TermContext {
    registry: LockRegistry,
    placements: Vec<Placement>,
    timeslots: HashSet<TimeslotId>,
    grades: HashSet<GradeId>,
}

fn load_context(conn: &Connection, term: TermId) -> Result<TermContext, HandlerErr> {
    if db::term_config_get(conn, term)
        .map_err(HandlerErr::db_query)?
        .is_none()
    {
        return Err(HandlerErr::not_found(format!("term {} not found", term)));
    }
    Ok(TermContext {
        registry: LockRegistry::from_locks(db::load_locks(conn, term).map_err(HandlerErr::db_query)?),
        placements: db::load_placements(conn, term).map_err(HandlerErr::db_query)?,
        timeslots: db::load_timeslots(conn, term)
            .map_err(HandlerErr::db_query)?
            .into_iter()
            .map(|s| s.id)
            .collect(),
        grades: db::load_grades(conn, term)
            .map_err(HandlerErr::db_query)?
            .into_iter()
            .collect(),
    })
}

fn parse_request(params: &Value) -> Result<LockRequest, HandlerErr> {
    let subject_code = get_required_str(params, "subjectCode")?;
    if subject_code.is_empty() {
        return Err(HandlerErr::bad_params("subjectCode must not be empty"));
    }
    let request = LockRequest {
        subject_code,
        teachers: get_id_set(params, "teacherIds")?,
        grades: get_grade_set(params, "gradeIds")?,
        timeslots: get_timeslot_list(params, "timeslotIds")?,
        room_id: get_optional_i64(params, "roomId")?,
    };
    if request.grades.is_empty() {
        return Err(HandlerErr::bad_params("gradeIds must not be empty"));
    }
    if request.timeslots.is_empty() {
        return Err(HandlerErr::bad_params("timeslotIds must not be empty"));
    }
    Ok(request)
}

fn check_known(ctx: &TermContext, term: TermId, request: &LockRequest) -> Result<(), HandlerErr> {
    if let Some(ts) = request
        .timeslots
        .iter()
        .find(|ts| ts.term != term || !ctx.timeslots.contains(ts))
    {
        return Err(HandlerErr::not_found(format!("timeslot {} is not in term {}", ts, term)));
    }
    if let Some(g) = request.grades.iter().find(|g| !ctx.grades.contains(g)) {
        return Err(HandlerErr::not_found(format!("grade {} is not in term {}", g, term)));
    }
    Ok(())
}

/// Writes committed locks and pushes them into the term's open sessions.
fn persist(
    conn: &Connection,
    sessions: &mut HashMap<String, AssignmentSession>,
    term: TermId,
    written: &[Lock],
) -> Result<(), HandlerErr> {
    db::upsert_locks(conn, written).map_err(HandlerErr::db_update)?;
    refresh_term_sessions(conn, sessions, term, None)?;
    Ok(())
}

/// Nothing is written unless the whole batch is free of conflicts.
fn commit_batch(
    conn: &Connection,
    sessions: &mut HashMap<String, AssignmentSession>,
    term: TermId,
    mut ctx: TermContext,
    requests: &[LockRequest],
) -> Result<Vec<Lock>, HandlerErr> {
    for r in requests {
        check_known(&ctx, term, r)?;
    }
    let written = ctx.registry.bulk_create(requests, &ctx.placements)?;
    persist(conn, sessions, term, &written)?;
    Ok(written)
}

fn locks_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term = get_term(params, "term")?;
    let ctx = load_context(conn, term)?;
    let rows: Vec<&Lock> = ctx.registry.iter().collect();
    Ok(json!({ "count": ctx.registry.len(), "locks": rows }))
}

fn locks_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let term = get_term(params, "term")?;
    let request = parse_request(params)?;
    let mut ctx = load_context(conn, term)?;
    check_known(&ctx, term, &request)?;
    let written = ctx.registry.create(request, &ctx.placements)?;
    persist(conn, sessions, term, &written)?;
    Ok(json!({ "locks": written }))
}

fn locks_bulk_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let term = get_term(params, "term")?;
    let Some(raw) = params.get("requests").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("requests must be an array"));
    };
    if raw.is_empty() {
        return Err(HandlerErr::bad_params("requests must not be empty"));
    }
    let requests = raw
        .iter()
        .enumerate()
        .map(|(i, r)| {
            parse_request(r).map_err(|e| HandlerErr {
                message: format!("requests[{}]: {}", i, e.message),
                ..e
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let ctx = load_context(conn, term)?;
    let written = commit_batch(conn, sessions, term, ctx, &requests)?;
    Ok(json!({ "requests": requests.len(), "locks": written }))
}

fn locks_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let term = get_term(params, "term")?;
    let lock_id = get_required_str(params, "lockId")?;
    let mut ctx = load_context(conn, term)?;
    let removed = ctx.registry.delete(&lock_id)?;
    db::delete_lock(conn, &removed.id).map_err(HandlerErr::db_update)?;
    refresh_term_sessions(conn, sessions, term, None)?;
    Ok(json!({ "deleted": removed }))
}

fn locks_remove_grade(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let term = get_term(params, "term")?;
    let lock_id = get_required_str(params, "lockId")?;
    let grade = get_grade(params, "gradeId")?;
    let mut ctx = load_context(conn, term)?;
    let remaining = ctx.registry.remove_grade(&lock_id, grade)?;
    let written = match &remaining {
        Some(lock) => db::upsert_locks(conn, std::slice::from_ref(lock)),
        None => db::delete_lock(conn, &lock_id).map(|_| ()),
    };
    written.map_err(HandlerErr::db_update)?;
    refresh_term_sessions(conn, sessions, term, None)?;
    Ok(json!({ "lock": remaining, "lockDeleted": remaining.is_none() }))
}

fn locks_apply_template(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let term = get_term(params, "term")?;
    let template_id = get_required_str(params, "templateId")?;
    let Some(tpl) = locks::template(&template_id) else {
        return Err(HandlerErr::not_found(format!("template {} not found", template_id)));
    };
    let opts = TemplateOptions {
        grades: match params.get("gradeIds") {
            None | Some(Value::Null) => None,
            Some(_) => Some(get_grade_set(params, "gradeIds")?),
        },
        teachers: get_id_set(params, "teacherIds")?,
    };

    let ctx = load_context(conn, term)?;
    let grid = db::load_timeslots(conn, term).map_err(HandlerErr::db_query)?;
    let mut grades: Vec<GradeId> = ctx.grades.iter().copied().collect();
    grades.sort();
    let rooms = db::load_rooms(conn).map_err(HandlerErr::db_query)?;
    let resolved = locks::resolve_template(tpl, &opts, &grid, &grades, &rooms)?;
    for w in &resolved.warnings {
        warn!(template = tpl.id, term = %term, "{}", w);
    }

    let written = commit_batch(conn, sessions, term, ctx, std::slice::from_ref(&resolved.request))?;
    info!(template = tpl.id, term = %term, locks = written.len(), "template applied");
    Ok(json!({
        "templateId": tpl.id,
        "locks": written,
        "warnings": resolved.warnings,
    }))
}

fn no_workspace() -> HandlerErr {
    HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".into(),
        details: None,
    }
}

fn handle_locks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match locks_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_locks_templates(_state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, json!({ "templates": TEMPLATES }))
}

fn handle_mutation(
    state: &mut AppState,
    req: &Request,
    f: fn(&mut AppState, &Value) -> Result<Value, HandlerErr>,
) -> serde_json::Value {
    match f(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "locks.list" => Some(handle_locks_list(state, req)),
        "locks.templates" => Some(handle_locks_templates(state, req)),
        "locks.create" => Some(handle_mutation(state, req, locks_create)),
        "locks.bulkCreate" => Some(handle_mutation(state, req, locks_bulk_create)),
        "locks.delete" => Some(handle_mutation(state, req, locks_delete)),
        "locks.removeGrade" => Some(handle_mutation(state, req, locks_remove_grade)),
        "locks.applyTemplate" => Some(handle_mutation(state, req, locks_apply_template)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_request_needs_grades_and_timeslots() {
        let good = json!({
            "subjectCode": "ASSEMBLY",
            "gradeIds": ["101", "102"],
            "timeslotIds": ["1-2567-FRI1", "1-2567-FRI1"],
        });
        let req = parse_request(&good).expect("request");
        assert_eq!(req.grades.len(), 2);
        assert_eq!(req.timeslots.len(), 1);
        assert!(req.teachers.is_empty());
        assert_eq!(req.room_id, None);

        for bad in [
            json!({ "subjectCode": "X", "gradeIds": [], "timeslotIds": ["1-2567-FRI1"] }),
            json!({ "subjectCode": "X", "gradeIds": ["101"], "timeslotIds": [] }),
            json!({ "subjectCode": "", "gradeIds": ["101"], "timeslotIds": ["1-2567-FRI1"] }),
            json!({ "gradeIds": ["101"], "timeslotIds": ["1-2567-FRI1"] }),
        ] {
            assert_eq!(parse_request(&bad).err().expect("rejected").code, "bad_params");
        }
    }
}
