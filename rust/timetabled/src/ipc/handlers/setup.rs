use crate::conflict::RoomPolicy;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::SessionOptions;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Arrange,
}

impl SetupSection {
    const ALL: [SetupSection; 1] = [SetupSection::Arrange];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "arrange" => Some(Self::Arrange),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Arrange => "arrange",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Arrange => "setup.arrange",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Arrange => json!({
            "roomConflictPolicy": "hard",
            "historyLimit": 50,
            "enforceAssignment": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Arrange => match k.as_str() {
                "roomConflictPolicy" => {
                    let p = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    if RoomPolicy::parse(&p).is_none() {
                        return Err("roomConflictPolicy must be one of: hard, advisory".into());
                    }
                    obj.insert(k.clone(), Value::String(p));
                }
                "historyLimit" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 200)?));
                }
                "enforceAssignment" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown arrange field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a malformed stored value falls back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Session behaviour as configured in the workspace.
pub fn arrange_options(conn: &rusqlite::Connection) -> anyhow::Result<SessionOptions> {
    let section = load_section(conn, SetupSection::Arrange)?;
    let defaults = SessionOptions::default();
    Ok(SessionOptions {
        room_policy: section
            .get("roomConflictPolicy")
            .and_then(|v| v.as_str())
            .and_then(RoomPolicy::parse)
            .unwrap_or(defaults.room_policy),
        history_limit: section
            .get("historyLimit")
            .and_then(|v| v.as_u64())
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(defaults.history_limit),
        enforce_assignment: section
            .get("enforceAssignment")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.enforce_assignment),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.name(), "setup updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
