use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::get_term;
use crate::ipc::types::{AppState, Request};
use crate::placement::{Responsibility, Room};
use crate::term::{GradeId, TermId};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use tracing::info;

fn parse_list<T: DeserializeOwned>(params: &Value, key: &str) -> Result<Vec<T>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::bad_params(format!("{}: {}", key, e))),
    }
}

fn require_term(conn: &Connection, term: TermId) -> Result<(), HandlerErr> {
    match db::term_config_get(conn, term).map_err(HandlerErr::db_query)? {
        Some(_) => Ok(()),
        None => Err(HandlerErr::not_found(format!("term {} not found", term))),
    }
}

fn catalog_import(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term = get_term(params, "term")?;
    require_term(conn, term)?;
    let rooms: Vec<Room> = parse_list(params, "rooms")?;
    let mut grades: BTreeSet<GradeId> = parse_list::<GradeId>(params, "grades")?.into_iter().collect();
    let responsibilities: Vec<Responsibility> = parse_list(params, "responsibilities")?;

    let mut seen = HashSet::new();
    for r in &responsibilities {
        if !seen.insert(r.resp_id) {
            return Err(HandlerErr::bad_params(format!(
                "duplicate respId {} in responsibilities",
                r.resp_id
            )));
        }
        if r.subject_code.trim().is_empty() {
            return Err(HandlerErr::bad_params(format!(
                "responsibility {} has an empty subjectCode",
                r.resp_id
            )));
        }
        if r.periods == 0 {
            return Err(HandlerErr::bad_params(format!(
                "responsibility {} must carry at least one period",
                r.resp_id
            )));
        }
        grades.insert(r.grade);
    }

    let ids: Vec<i64> = responsibilities.iter().map(|r| r.resp_id).collect();
    let held = db::responsibilities_held_elsewhere(conn, term, &ids).map_err(HandlerErr::db_query)?;
    if let Some((resp_id, owner)) = held.first() {
        return Err(HandlerErr {
            details: Some(json!({
                "respIds": held.iter().map(|(id, _)| id).collect::<Vec<_>>(),
                "term": owner,
            })),
            ..HandlerErr::bad_params(format!("respId {} already belongs to term {}", resp_id, owner))
        });
    }

    let grades: Vec<GradeId> = grades.into_iter().collect();
    db::import_catalog(conn, term, &rooms, &grades, &responsibilities)
        .map_err(HandlerErr::db_update)?;
    info!(
        term = %term,
        rooms = rooms.len(),
        grades = grades.len(),
        responsibilities = responsibilities.len(),
        "catalog imported"
    );
    Ok(json!({
        "rooms": rooms.len(),
        "grades": grades.len(),
        "responsibilities": responsibilities.len(),
    }))
}

fn catalog_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term = get_term(params, "term")?;
    require_term(conn, term)?;
    let rooms = db::load_rooms(conn).map_err(HandlerErr::db_query)?;
    let grades = db::load_grades(conn, term).map_err(HandlerErr::db_query)?;
    let responsibilities = db::load_responsibilities(conn, term).map_err(HandlerErr::db_query)?;
    Ok(json!({
        "rooms": rooms,
        "grades": grades,
        "responsibilities": responsibilities,
    }))
}

fn handle_catalog_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match catalog_import(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_catalog_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match catalog_get(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "catalog.import" => Some(handle_catalog_import(state, req)),
        "catalog.get" => Some(handle_catalog_get(state, req)),
        _ => None,
    }
}
