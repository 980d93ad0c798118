use crate::config::TermConfig;
use crate::conflict;
use crate::db;
use crate::grid::{self, Timeslot};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::get_term;
use crate::ipc::types::{AppState, Request};
use crate::term::TermId;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Reads `params.config`, filling absent fields from the school defaults.
fn parse_config(params: &Value) -> Result<TermConfig, HandlerErr> {
    let Some(raw) = params.get("config").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("config must be an object"));
    };
    let term_raw = raw
        .get("term")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing config.term"))?;
    let term: TermId = term_raw
        .parse()
        .map_err(|e: String| HandlerErr::bad_params(format!("config.term: {}", e)))?;

    let mut merged = serde_json::to_value(TermConfig::with_defaults(term))
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    if let Some(obj) = merged.as_object_mut() {
        for (k, v) in raw {
            obj.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(merged).map_err(|e| HandlerErr::bad_params(format!("config: {}", e)))
}

fn grid_json(cfg: &TermConfig, slots: &[Timeslot]) -> Result<Value, HandlerErr> {
    let window = grid::mini_break_window(cfg)?.map(|(start, end)| {
        json!({
            "start": start.format("%H:%M").to_string(),
            "end": end.format("%H:%M").to_string(),
        })
    });
    Ok(json!({
        "config": cfg,
        "timeslots": slots,
        "miniBreakWindow": window,
    }))
}

fn require_config(conn: &Connection, term: TermId) -> Result<TermConfig, HandlerErr> {
    db::term_config_get(conn, term)
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::not_found(format!("term {} not found", term)))
}

fn create_term(conn: &Connection, cfg: &TermConfig) -> Result<Value, HandlerErr> {
    let slots = grid::generate_grid(cfg)?;
    if db::term_config_get(conn, cfg.term)
        .map_err(HandlerErr::db_query)?
        .is_some()
    {
        return Err(HandlerErr {
            code: "already_exists",
            message: format!("term {} already has a timeslot grid", cfg.term),
            details: Some(json!({ "term": cfg.term.to_string() })),
        });
    }
    db::insert_term(conn, cfg, &slots).map_err(HandlerErr::db_update)?;
    info!(term = %cfg.term, timeslots = slots.len(), "term created");
    Ok(json!({
        "term": cfg.term.to_string(),
        "timeslotCount": slots.len(),
    }))
}

fn term_preview_grid(params: &Value) -> Result<Value, HandlerErr> {
    let cfg = parse_config(params)?;
    let slots = grid::generate_grid(&cfg)?;
    grid_json(&cfg, &slots)
}

fn term_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term = get_term(params, "term")?;
    let cfg = require_config(conn, term)?;
    let slots = db::load_timeslots(conn, term).map_err(HandlerErr::db_query)?;
    grid_json(&cfg, &slots)
}

fn term_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let terms = db::list_terms(conn).map_err(HandlerErr::db_query)?;
    let rows: Vec<Value> = terms
        .into_iter()
        .map(|(term, created_at)| json!({ "term": term.to_string(), "createdAt": created_at }))
        .collect();
    Ok(json!({ "terms": rows }))
}

fn term_copy_config(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let from = get_term(params, "from")?;
    let to = get_term(params, "to")?;
    let mut cfg = require_config(conn, from)?;
    cfg.term = to;
    let mut out = create_term(conn, &cfg)?;
    out["copiedFrom"] = json!(from.to_string());
    Ok(out)
}

fn term_conflicts(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term = get_term(params, "term")?;
    require_config(conn, term)?;
    let placements = db::load_placements(conn, term).map_err(HandlerErr::db_query)?;
    let locks = db::load_locks(conn, term).map_err(HandlerErr::db_query)?;
    let rows = conflict::scan_term(&placements, &locks);
    if !rows.is_empty() {
        warn!(term = %term, conflicts = rows.len(), "term has double bookings");
    }
    Ok(json!({ "count": rows.len(), "conflicts": rows }))
}

fn handle_term_preview_grid(_state: &mut AppState, req: &Request) -> serde_json::Value {
    match term_preview_grid(&req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_term_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = parse_config(&req.params).and_then(|cfg| create_term(conn, &cfg));
    match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_term_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match term_get(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_term_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "terms": [] }));
    };
    match term_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_term_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let term = match get_term(&req.params, "term") {
        Ok(t) => t,
        Err(error) => return error.response(&req.id),
    };
    if let Err(error) = require_config(conn, term) {
        return error.response(&req.id);
    }
    let counts = match db::delete_term(conn, term) {
        Ok(c) => c,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "term": term.to_string() })),
            )
        }
    };
    let before = state.sessions.len();
    state.sessions.retain(|_, s| s.scope().term != term);
    info!(
        term = %term,
        timeslots = counts.timeslots,
        placements = counts.placements,
        locks = counts.locks,
        closed_sessions = before - state.sessions.len(),
        "term deleted"
    );
    ok(
        &req.id,
        json!({
            "deleted": {
                "timeslots": counts.timeslots,
                "placements": counts.placements,
                "locks": counts.locks,
            },
            "closedSessions": before - state.sessions.len(),
        }),
    )
}

fn handle_term_copy_config(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match term_copy_config(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_term_conflicts(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match term_conflicts(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "term.previewGrid" => Some(handle_term_preview_grid(state, req)),
        "term.create" => Some(handle_term_create(state, req)),
        "term.get" => Some(handle_term_get(state, req)),
        "term.list" => Some(handle_term_list(state, req)),
        "term.delete" => Some(handle_term_delete(state, req)),
        "term.copyConfig" => Some(handle_term_copy_config(state, req)),
        "term.conflicts" => Some(handle_term_conflicts(state, req)),
        _ => None,
    }
}
