use crate::ipc::error::HandlerErr;
use crate::term::{GradeId, TermId, TimeslotId};
use serde_json::Value;
use std::collections::BTreeSet;
use std::str::FromStr;

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

fn parse_id<T: FromStr<Err = String>>(raw: &str, key: &str) -> Result<T, HandlerErr> {
    raw.parse()
        .map_err(|e: String| HandlerErr::bad_params(format!("{}: {}", key, e)))
}

pub fn get_term(params: &Value, key: &str) -> Result<TermId, HandlerErr> {
    parse_id(&get_required_str(params, key)?, key)
}

pub fn get_timeslot(params: &Value, key: &str) -> Result<TimeslotId, HandlerErr> {
    parse_id(&get_required_str(params, key)?, key)
}

pub fn get_grade(params: &Value, key: &str) -> Result<GradeId, HandlerErr> {
    parse_id(&get_required_str(params, key)?, key)
}

fn get_array<'a>(params: &'a Value, key: &str) -> Result<&'a Vec<Value>, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))
}

pub fn get_grade_set(params: &Value, key: &str) -> Result<BTreeSet<GradeId>, HandlerErr> {
    get_array(params, key)?
        .iter()
        .map(|v| {
            let raw = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} entries must be strings", key)))?;
            parse_id(raw, key)
        })
        .collect()
}

pub fn get_timeslot_list(params: &Value, key: &str) -> Result<Vec<TimeslotId>, HandlerErr> {
    let mut out: Vec<TimeslotId> = Vec::new();
    for v in get_array(params, key)? {
        let raw = v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} entries must be strings", key)))?;
        let ts = parse_id(raw, key)?;
        if !out.contains(&ts) {
            out.push(ts);
        }
    }
    Ok(out)
}

/// Absent means empty.
pub fn get_id_set(params: &Value, key: &str) -> Result<BTreeSet<i64>, HandlerErr> {
    if params.get(key).map_or(true, Value::is_null) {
        return Ok(BTreeSet::new());
    }
    get_array(params, key)?
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} entries must be integers", key)))
        })
        .collect()
}
