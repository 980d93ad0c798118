use crate::db::{self, SqliteStore};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::setup::arrange_options;
use crate::ipc::helpers::{get_grade, get_optional_i64, get_required_str, get_term, get_timeslot};
use crate::ipc::types::{AppState, Request};
use crate::session::{AssignmentSession, Owner, Scope, Selection, SessionSeed};
use crate::sync::PlacementStore;
use crate::term::TermId;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

fn parse_scope(params: &Value) -> Result<Scope, HandlerErr> {
    let term = get_term(params, "term")?;
    let owner = match (params.get("teacherId"), params.get("gradeId")) {
        (Some(_), Some(_)) => {
            return Err(HandlerErr::bad_params(
                "pass either teacherId or gradeId, not both",
            ))
        }
        (Some(_), None) => Owner::Teacher(
            get_optional_i64(params, "teacherId")?
                .ok_or_else(|| HandlerErr::bad_params("teacherId must be integer"))?,
        ),
        (None, Some(_)) => Owner::Grade(get_grade(params, "gradeId")?),
        (None, None) => return Err(HandlerErr::bad_params("missing teacherId or gradeId")),
    };
    Ok(Scope { term, owner })
}

fn load_session(conn: &Connection, scope: Scope) -> Result<AssignmentSession, HandlerErr> {
    if db::term_config_get(conn, scope.term)
        .map_err(HandlerErr::db_query)?
        .is_none()
    {
        return Err(HandlerErr::not_found(format!("term {} not found", scope.term)));
    }
    let seed = SessionSeed {
        scope,
        grid: db::load_timeslots(conn, scope.term).map_err(HandlerErr::db_query)?,
        responsibilities: db::load_responsibilities(conn, scope.term).map_err(HandlerErr::db_query)?,
        rooms: db::load_rooms(conn).map_err(HandlerErr::db_query)?,
        placements: db::load_placements(conn, scope.term).map_err(HandlerErr::db_query)?,
        locks: db::load_locks(conn, scope.term).map_err(HandlerErr::db_query)?,
        version: SqliteStore::new(conn).current_version(&scope)?,
    };
    let options = arrange_options(conn).map_err(HandlerErr::db_query)?;
    Ok(AssignmentSession::load(seed, options)?)
}

/// Pushes the persisted term state into every open session of `term`,
/// skipping `except`.
pub fn refresh_term_sessions(
    conn: &Connection,
    sessions: &mut HashMap<String, AssignmentSession>,
    term: TermId,
    except: Option<&str>,
) -> Result<usize, HandlerErr> {
    if !sessions
        .iter()
        .any(|(id, s)| s.scope().term == term && Some(id.as_str()) != except)
    {
        return Ok(0);
    }
    let placements = db::load_placements(conn, term).map_err(HandlerErr::db_query)?;
    let locks = db::load_locks(conn, term).map_err(HandlerErr::db_query)?;
    let mut n = 0;
    for (id, s) in sessions.iter_mut() {
        if s.scope().term != term || Some(id.as_str()) == except {
            continue;
        }
        s.refresh_context(placements.clone(), locks.clone());
        n += 1;
    }
    debug!(term = %term, sessions = n, "open sessions refreshed");
    Ok(n)
}

fn session_id(params: &Value) -> Result<String, HandlerErr> {
    get_required_str(params, "sessionId")
}

fn find_session<'a>(
    sessions: &'a mut HashMap<String, AssignmentSession>,
    id: &str,
) -> Result<&'a mut AssignmentSession, HandlerErr> {
    sessions
        .get_mut(id)
        .ok_or_else(|| HandlerErr::not_found(format!("session {} is not open", id)))
}

fn session_open(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let scope = parse_scope(params)?;
    let session = load_session(conn, scope)?;
    let id = uuid::Uuid::new_v4().to_string();
    let view = session.view();
    sessions.insert(id.clone(), session);
    info!(session = %id, term = %scope.term, owner = ?scope.owner, "session opened");
    Ok(json!({ "sessionId": id, "view": view }))
}

/// Discards unsaved work and reloads the scope from the workspace.
fn session_reload(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let id = session_id(params)?;
    let scope = *find_session(sessions, &id)?.scope();
    let fresh = load_session(conn, scope)?;
    let view = fresh.view();
    sessions.insert(id.clone(), fresh);
    info!(session = %id, "session reloaded");
    Ok(json!({ "sessionId": id, "view": view }))
}

fn session_view(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let session = find_session(&mut state.sessions, &id)?;
    Ok(json!({ "view": session.view() }))
}

fn session_select(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let selection = match (get_optional_i64(params, "respId")?, params.get("placementId")) {
        (Some(_), Some(_)) => {
            return Err(HandlerErr::bad_params(
                "pass either respId or placementId, not both",
            ))
        }
        (Some(resp_id), None) => Selection::Subject(resp_id),
        (None, Some(_)) => Selection::Placement(get_required_str(params, "placementId")?),
        (None, None) => return Err(HandlerErr::bad_params("missing respId or placementId")),
    };
    let session = find_session(&mut state.sessions, &id)?;
    let outcome = session.select(selection)?;
    debug!(session = %id, mode = ?session.mode(), "selection changed");
    Ok(json!({ "outcome": outcome, "view": session.view() }))
}

fn session_target(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let timeslot = get_timeslot(params, "timeslotId")?;
    let room_id = get_optional_i64(params, "roomId")?;
    let session = find_session(&mut state.sessions, &id)?;
    let outcome = session.target_cell(timeslot, room_id)?;
    Ok(json!({ "outcome": outcome, "view": session.view() }))
}

fn session_remove(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let placement_id = get_required_str(params, "placementId")?;
    let session = find_session(&mut state.sessions, &id)?;
    let outcome = session.remove(&placement_id)?;
    Ok(json!({ "outcome": outcome, "view": session.view() }))
}

fn session_undo(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let session = find_session(&mut state.sessions, &id)?;
    let changed = session.undo()?;
    Ok(json!({ "changed": changed, "view": session.view() }))
}

fn session_redo(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let session = find_session(&mut state.sessions, &id)?;
    let changed = session.redo()?;
    Ok(json!({ "changed": changed, "view": session.view() }))
}

fn session_save(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let id = session_id(params)?;
    let session = find_session(sessions, &id)?;
    let term = session.scope().term;
    let changes = session.save(&mut SqliteStore::new(conn))?;
    let version = session.version().to_string();
    let view = session.view();

    let refreshed = if changes.is_empty() {
        0
    } else {
        refresh_term_sessions(conn, sessions, term, Some(&id))?
    };
    Ok(json!({
        "changes": changes.summary(),
        "version": version,
        "refreshedSessions": refreshed,
        "view": view,
    }))
}

fn session_close(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let Some(session) = state.sessions.remove(&id) else {
        return Err(HandlerErr::not_found(format!("session {} is not open", id)));
    };
    let discarded = session.is_dirty();
    info!(
        session = %id,
        placements = session.placements().count(),
        discarded_changes = discarded,
        "session closed"
    );
    Ok(json!({ "closed": true, "discardedChanges": discarded }))
}

fn no_workspace() -> HandlerErr {
    HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".into(),
        details: None,
    }
}

fn respond(
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
    let f: fn(&mut AppState, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "session.open" => session_open,
        "session.reload" => session_reload,
        "session.view" => session_view,
        "session.select" => session_select,
        "session.target" => session_target,
        "session.remove" => session_remove,
        "session.undo" => session_undo,
        "session.redo" => session_redo,
        "session.save" => session_save,
        "session.close" => session_close,
        _ => return None,
    };
    if state.db.is_none() {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    }
    Some(respond(state, req, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::GradeId;

    #[test]
    fn scope_needs_exactly_one_owner() {
        let teacher = parse_scope(&json!({ "term": "1-2567", "teacherId": 7 })).expect("teacher");
        assert_eq!(teacher.owner, Owner::Teacher(7));

        let grade = parse_scope(&json!({ "term": "1-2567", "gradeId": "401" })).expect("grade");
        assert_eq!(grade.owner, Owner::Grade(GradeId::new(4, 1).expect("grade")));

        for bad in [
            json!({ "term": "1-2567" }),
            json!({ "term": "1-2567", "teacherId": 7, "gradeId": "401" }),
            json!({ "term": "1-2567", "teacherId": "seven" }),
            json!({ "teacherId": 7 }),
        ] {
            let e = parse_scope(&bad).err().expect("rejected");
            assert_eq!(e.code, "bad_params");
        }
    }
}
