use crate::breaks::BreakKind;
use crate::config::{hhmm, TermConfig};
use crate::error::{EngineError, EngineResult};
use crate::grid::Timeslot;
use crate::placement::{Lock, Placement, Responsibility, Room};
use crate::session::{Owner, Scope};
use crate::sync::{ensure_current, snapshot_version, ChangeSet, PlacementStore, TermSnapshot};
use crate::term::{Day, GradeId, TermId, TimeslotId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

pub const DB_FILE: &str = "timetable.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_configs(
            term_id TEXT PRIMARY KEY,
            config_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timeslots(
            id TEXT PRIMARY KEY,
            term_id TEXT NOT NULL,
            day TEXT NOT NULL,
            period INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            break_kind TEXT NOT NULL,
            FOREIGN KEY(term_id) REFERENCES term_configs(term_id),
            UNIQUE(term_id, day, period)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timeslots_term ON timeslots(term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rooms(
            room_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            term_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            PRIMARY KEY(term_id, grade_id),
            FOREIGN KEY(term_id) REFERENCES term_configs(term_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responsibilities(
            resp_id INTEGER PRIMARY KEY,
            term_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            teacher_id INTEGER NOT NULL,
            grade_id TEXT NOT NULL,
            periods INTEGER NOT NULL,
            FOREIGN KEY(term_id) REFERENCES term_configs(term_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responsibilities_term ON responsibilities(term_id)",
        [],
    )?;

    // One ordinary placement per (timeslot, grade) is also enforced here.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS placements(
            id TEXT PRIMARY KEY,
            term_id TEXT NOT NULL,
            timeslot_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            teacher_id INTEGER NOT NULL,
            resp_id INTEGER NOT NULL,
            room_id INTEGER,
            FOREIGN KEY(timeslot_id) REFERENCES timeslots(id),
            UNIQUE(timeslot_id, grade_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_placements_term_teacher ON placements(term_id, teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_placements_term_grade ON placements(term_id, grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS locks(
            id TEXT PRIMARY KEY,
            term_id TEXT NOT NULL,
            timeslot_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            room_id INTEGER,
            FOREIGN KEY(timeslot_id) REFERENCES timeslots(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_locks_term ON locks(term_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lock_grades(
            lock_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            PRIMARY KEY(lock_id, grade_id),
            FOREIGN KEY(lock_id) REFERENCES locks(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lock_teachers(
            lock_id TEXT NOT NULL,
            teacher_id INTEGER NOT NULL,
            PRIMARY KEY(lock_id, teacher_id),
            FOREIGN KEY(lock_id) REFERENCES locks(id)
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn conversion<E: Into<Box<dyn std::error::Error + Send + Sync>>>(idx: usize, e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn parse_col<T: FromStr<Err = String>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion(idx, e))
}

pub fn term_config_get(conn: &Connection, term: TermId) -> rusqlite::Result<Option<TermConfig>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT config_json FROM term_configs WHERE term_id = ?",
            [term.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion(0, e)))
        .transpose()
}

pub fn list_terms(conn: &Connection) -> rusqlite::Result<Vec<(TermId, String)>> {
    let mut stmt = conn.prepare("SELECT term_id, created_at FROM term_configs ORDER BY term_id")?;
    let rows = stmt
        .query_map([], |r| Ok((parse_col::<TermId>(r, 0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Stores the config and its generated grid in one transaction.
pub fn insert_term(conn: &Connection, cfg: &TermConfig, slots: &[Timeslot]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    let config_json = serde_json::to_string(cfg).map_err(|e| conversion(0, e))?;
    tx.execute(
        "INSERT INTO term_configs(term_id, config_json, created_at) VALUES(?, ?, ?)",
        (
            cfg.term.to_string(),
            config_json,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO timeslots(id, term_id, day, period, start_time, end_time, break_kind)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
        )?;
        for s in slots {
            stmt.execute(params![
                s.id.to_string(),
                cfg.term.to_string(),
                s.day.code(),
                s.period,
                s.start.format("%H:%M").to_string(),
                s.end.format("%H:%M").to_string(),
                s.break_kind.code(),
            ])?;
        }
    }
    tx.commit()
}

pub fn load_timeslots(conn: &Connection, term: TermId) -> rusqlite::Result<Vec<Timeslot>> {
    let mut stmt = conn.prepare(
        "SELECT id, day, period, start_time, end_time, break_kind
         FROM timeslots WHERE term_id = ?",
    )?;
    let mut slots = stmt
        .query_map([term.to_string()], |r| {
            let day_raw: String = r.get(1)?;
            let start: String = r.get(3)?;
            let end: String = r.get(4)?;
            let kind: String = r.get(5)?;
            Ok(Timeslot {
                id: parse_col(r, 0)?,
                day: Day::parse(&day_raw).ok_or_else(|| conversion(1, format!("bad day {:?}", day_raw)))?,
                period: r.get(2)?,
                start: hhmm::parse(&start).map_err(|e| conversion(3, e))?,
                end: hhmm::parse(&end).map_err(|e| conversion(4, e))?,
                break_kind: BreakKind::parse(&kind)
                    .ok_or_else(|| conversion(5, format!("bad break kind {:?}", kind)))?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    slots.sort_by_key(|s| s.id);
    Ok(slots)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeletedCounts {
    pub timeslots: usize,
    pub placements: usize,
    pub locks: usize,
}

/// Removes a term and everything hanging off it. Rooms are shared across
/// terms and are kept.
pub fn delete_term(conn: &Connection, term: TermId) -> rusqlite::Result<DeletedCounts> {
    let key = term.to_string();
    let tx = conn.unchecked_transaction()?;
    // Explicit dependency order; there is no ON DELETE CASCADE.
    tx.execute(
        "DELETE FROM lock_teachers WHERE lock_id IN (SELECT id FROM locks WHERE term_id = ?)",
        [&key],
    )?;
    tx.execute(
        "DELETE FROM lock_grades WHERE lock_id IN (SELECT id FROM locks WHERE term_id = ?)",
        [&key],
    )?;
    let locks = tx.execute("DELETE FROM locks WHERE term_id = ?", [&key])?;
    let placements = tx.execute("DELETE FROM placements WHERE term_id = ?", [&key])?;
    tx.execute("DELETE FROM responsibilities WHERE term_id = ?", [&key])?;
    tx.execute("DELETE FROM grades WHERE term_id = ?", [&key])?;
    let timeslots = tx.execute("DELETE FROM timeslots WHERE term_id = ?", [&key])?;
    tx.execute("DELETE FROM term_configs WHERE term_id = ?", [&key])?;
    tx.commit()?;
    Ok(DeletedCounts {
        timeslots,
        placements,
        locks,
    })
}

/// Replaces the term's grades and responsibilities; rooms are upserted.
pub fn import_catalog(
    conn: &Connection,
    term: TermId,
    rooms: &[Room],
    grades: &[GradeId],
    responsibilities: &[Responsibility],
) -> rusqlite::Result<()> {
    let key = term.to_string();
    let tx = conn.unchecked_transaction()?;
    for r in rooms {
        tx.execute(
            "INSERT INTO rooms(room_id, name) VALUES(?, ?)
             ON CONFLICT(room_id) DO UPDATE SET name = excluded.name",
            (r.room_id, &r.name),
        )?;
    }
    tx.execute("DELETE FROM grades WHERE term_id = ?", [&key])?;
    for g in grades {
        tx.execute(
            "INSERT OR IGNORE INTO grades(term_id, grade_id) VALUES(?, ?)",
            (&key, g.to_string()),
        )?;
    }
    tx.execute("DELETE FROM responsibilities WHERE term_id = ?", [&key])?;
    for r in responsibilities {
        tx.execute(
            "INSERT INTO responsibilities(resp_id, term_id, subject_code, subject_name, teacher_id, grade_id, periods)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            params![
                r.resp_id,
                key,
                r.subject_code,
                r.subject_name,
                r.teacher_id,
                r.grade.to_string(),
                r.periods,
            ],
        )?;
    }
    tx.commit()
}

/// Ids among `resp_ids` already held by a term other than `term`, with that term's key.
pub fn responsibilities_held_elsewhere(
    conn: &Connection,
    term: TermId,
    resp_ids: &[i64],
) -> rusqlite::Result<Vec<(i64, String)>> {
    let key = term.to_string();
    let mut stmt = conn.prepare("SELECT term_id FROM responsibilities WHERE resp_id = ? AND term_id <> ?")?;
    let mut held = Vec::new();
    for &id in resp_ids {
        let owner: Option<String> = stmt.query_row((id, &key), |r| r.get(0)).optional()?;
        if let Some(owner) = owner {
            held.push((id, owner));
        }
    }
    Ok(held)
}

pub fn load_rooms(conn: &Connection) -> rusqlite::Result<Vec<Room>> {
    let mut stmt = conn.prepare("SELECT room_id, name FROM rooms ORDER BY room_id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Room {
                room_id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_grades(conn: &Connection, term: TermId) -> rusqlite::Result<Vec<GradeId>> {
    let mut stmt = conn.prepare("SELECT grade_id FROM grades WHERE term_id = ?")?;
    let mut rows = stmt
        .query_map([term.to_string()], |r| parse_col::<GradeId>(r, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.sort();
    Ok(rows)
}

pub fn load_responsibilities(conn: &Connection, term: TermId) -> rusqlite::Result<Vec<Responsibility>> {
    let mut stmt = conn.prepare(
        "SELECT resp_id, subject_code, subject_name, teacher_id, grade_id, periods
         FROM responsibilities WHERE term_id = ? ORDER BY resp_id",
    )?;
    let rows = stmt
        .query_map([term.to_string()], |r| {
            Ok(Responsibility {
                resp_id: r.get(0)?,
                subject_code: r.get(1)?,
                subject_name: r.get(2)?,
                teacher_id: r.get(3)?,
                grade: parse_col(r, 4)?,
                periods: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const PLACEMENT_COLUMNS: &str =
    "id, timeslot_id, subject_code, grade_id, teacher_id, resp_id, room_id";

fn placement_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Placement> {
    Ok(Placement {
        id: r.get(0)?,
        timeslot: parse_col(r, 1)?,
        subject_code: r.get(2)?,
        grade: parse_col(r, 3)?,
        teacher_id: r.get(4)?,
        resp_id: r.get(5)?,
        room_id: r.get(6)?,
    })
}

pub fn load_placements(conn: &Connection, term: TermId) -> rusqlite::Result<Vec<Placement>> {
    let sql = format!(
        "SELECT {} FROM placements WHERE term_id = ? ORDER BY timeslot_id, grade_id",
        PLACEMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([term.to_string()], placement_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_scope_placements(conn: &Connection, scope: &Scope) -> rusqlite::Result<Vec<Placement>> {
    let term = scope.term.to_string();
    let rows = match scope.owner {
        Owner::Teacher(t) => {
            let sql = format!(
                "SELECT {} FROM placements WHERE term_id = ? AND teacher_id = ?",
                PLACEMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map((term, t), placement_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        Owner::Grade(g) => {
            let sql = format!(
                "SELECT {} FROM placements WHERE term_id = ? AND grade_id = ?",
                PLACEMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map((term, g.to_string()), placement_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn load_locks(conn: &Connection, term: TermId) -> rusqlite::Result<Vec<Lock>> {
    let key = term.to_string();
    let mut stmt = conn.prepare(
        "SELECT id, timeslot_id, subject_code, room_id FROM locks WHERE term_id = ? ORDER BY id",
    )?;
    let mut locks: BTreeMap<String, Lock> = stmt
        .query_map([&key], |r| {
            Ok(Lock {
                id: r.get(0)?,
                timeslot: parse_col(r, 1)?,
                subject_code: r.get(2)?,
                room_id: r.get(3)?,
                teachers: Default::default(),
                grades: Default::default(),
            })
        })?
        .map(|l| l.map(|l| (l.id.clone(), l)))
        .collect::<Result<_, _>>()?;

    let mut grade_stmt = conn.prepare(
        "SELECT lg.lock_id, lg.grade_id FROM lock_grades lg
         JOIN locks l ON l.id = lg.lock_id WHERE l.term_id = ?",
    )?;
    let grades = grade_stmt
        .query_map([&key], |r| Ok((r.get::<_, String>(0)?, parse_col::<GradeId>(r, 1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (id, g) in grades {
        if let Some(l) = locks.get_mut(&id) {
            l.grades.insert(g);
        }
    }

    let mut teacher_stmt = conn.prepare(
        "SELECT lt.lock_id, lt.teacher_id FROM lock_teachers lt
         JOIN locks l ON l.id = lt.lock_id WHERE l.term_id = ?",
    )?;
    let teachers = teacher_stmt
        .query_map([&key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (id, t) in teachers {
        if let Some(l) = locks.get_mut(&id) {
            l.teachers.insert(t);
        }
    }

    Ok(locks.into_values().collect())
}

fn delete_lock_rows(tx: &Connection, id: &str) -> rusqlite::Result<usize> {
    tx.execute("DELETE FROM lock_teachers WHERE lock_id = ?", [id])?;
    tx.execute("DELETE FROM lock_grades WHERE lock_id = ?", [id])?;
    tx.execute("DELETE FROM locks WHERE id = ?", [id])
}

/// Writes each lock in full (row, grades, teachers), replacing any earlier
/// version of the same lock. One transaction for the whole batch.
pub fn upsert_locks(conn: &Connection, locks: &[Lock]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    for l in locks {
        delete_lock_rows(&tx, &l.id)?;
        tx.execute(
            "INSERT INTO locks(id, term_id, timeslot_id, subject_code, room_id) VALUES(?, ?, ?, ?, ?)",
            params![
                l.id,
                l.timeslot.term.to_string(),
                l.timeslot.to_string(),
                l.subject_code,
                l.room_id,
            ],
        )?;
        for g in &l.grades {
            tx.execute(
                "INSERT INTO lock_grades(lock_id, grade_id) VALUES(?, ?)",
                (&l.id, g.to_string()),
            )?;
        }
        for t in &l.teachers {
            tx.execute(
                "INSERT INTO lock_teachers(lock_id, teacher_id) VALUES(?, ?)",
                (&l.id, t),
            )?;
        }
    }
    tx.commit()
}

pub fn delete_lock(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let n = delete_lock_rows(&tx, id)?;
    tx.commit()?;
    Ok(n)
}

/// Session persistence against the workspace database.
pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl PlacementStore for SqliteStore<'_> {
    fn current_version(&self, scope: &Scope) -> EngineResult<String> {
        let rows = load_scope_placements(self.conn, scope)?;
        Ok(snapshot_version(&rows))
    }

    fn commit<F>(
        &mut self,
        scope: &Scope,
        expected: &str,
        changes: &ChangeSet,
        check: F,
    ) -> EngineResult<String>
    where
        F: FnOnce(&TermSnapshot) -> EngineResult<()>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let actual = ensure_current(expected, snapshot_version(&load_scope_placements(&tx, scope)?))?;
        if changes.is_empty() {
            return Ok(actual);
        }
        check(&TermSnapshot {
            placements: load_placements(&tx, scope.term)?,
            locks: load_locks(&tx, scope.term)?,
        })?;
        for p in &changes.deletes {
            tx.execute("DELETE FROM placements WHERE id = ?", [&p.id])?;
        }
        for p in &changes.creates {
            tx.execute(
                "INSERT INTO placements(id, term_id, timeslot_id, subject_code, grade_id, teacher_id, resp_id, room_id)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    p.id,
                    p.timeslot.term.to_string(),
                    p.timeslot.to_string(),
                    p.subject_code,
                    p.grade.to_string(),
                    p.teacher_id,
                    p.resp_id,
                    p.room_id,
                ],
            )?;
        }
        for p in &changes.updates {
            let n = tx.execute(
                "UPDATE placements SET teacher_id = ?, resp_id = ?, room_id = ? WHERE id = ?",
                params![p.teacher_id, p.resp_id, p.room_id, p.id],
            )?;
            if n == 0 {
                return Err(EngineError::PersistenceFailure(format!(
                    "placement {} vanished during save",
                    p.id
                )));
            }
        }
        tx.commit()?;
        self.current_version(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::generate_grid;
    use crate::placement::{lock_id, placement_id};

    fn temp_workspace(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("timetabled-db-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn term() -> TermId {
        TermId::new(1, 2567).expect("term")
    }

    fn seeded(name: &str) -> Connection {
        let conn = open_db(&temp_workspace(name)).expect("open db");
        let cfg = TermConfig::with_defaults(term());
        let slots = generate_grid(&cfg).expect("grid");
        insert_term(&conn, &cfg, &slots).expect("insert term");
        conn
    }

    #[test]
    fn term_round_trips_config_and_grid() {
        let conn = seeded("term");
        let cfg = term_config_get(&conn, term()).expect("query").expect("config");
        assert_eq!(cfg, TermConfig::with_defaults(term()));
        let slots = load_timeslots(&conn, term()).expect("slots");
        assert_eq!(slots, generate_grid(&cfg).expect("grid"));
        assert_eq!(list_terms(&conn).expect("terms").len(), 1);
    }

    #[test]
    fn store_commits_change_sets_and_tracks_version() {
        let conn = seeded("store");
        let scope = Scope {
            term: term(),
            owner: Owner::Teacher(5),
        };
        let ts = TimeslotId::new(term(), Day::Tue, 2);
        let grade: GradeId = "101".parse().expect("grade");
        let p = Placement {
            id: placement_id(ts, "SC101", grade),
            timeslot: ts,
            subject_code: "SC101".to_string(),
            grade,
            teacher_id: 5,
            resp_id: 1,
            room_id: Some(3),
        };
        let creates = ChangeSet {
            creates: vec![p.clone()],
            ..Default::default()
        };
        let mut store = SqliteStore::new(&conn);
        let empty = store.current_version(&scope).expect("version");
        let v1 = store
            .commit(&scope, &empty, &creates, |stored| {
                assert!(stored.placements.is_empty());
                Ok(())
            })
            .expect("commit");
        assert_ne!(empty, v1);
        assert_eq!(load_scope_placements(&conn, &scope).expect("rows"), vec![p.clone()]);

        let stale = store.commit(&scope, &empty, &creates, |_| Ok(()));
        assert!(matches!(stale, Err(EngineError::StaleSession { .. })));

        let deletes = ChangeSet {
            deletes: vec![p],
            ..Default::default()
        };
        let v2 = store.commit(&scope, &v1, &deletes, |_| Ok(())).expect("delete");
        assert_eq!(v2, empty);
    }

    #[test]
    fn rejected_check_writes_nothing() {
        let conn = seeded("check");
        let scope = Scope {
            term: term(),
            owner: Owner::Teacher(5),
        };
        let ts = TimeslotId::new(term(), Day::Wed, 3);
        let grade: GradeId = "102".parse().expect("grade");
        let changes = ChangeSet {
            creates: vec![Placement {
                id: placement_id(ts, "MA102", grade),
                timeslot: ts,
                subject_code: "MA102".to_string(),
                grade,
                teacher_id: 5,
                resp_id: 2,
                room_id: None,
            }],
            ..Default::default()
        };
        let mut store = SqliteStore::new(&conn);
        let version = store.current_version(&scope).expect("version");
        let res = store.commit(&scope, &version, &changes, |_| {
            Err(EngineError::Locked {
                timeslot: ts,
                lock_id: lock_id(ts, "EXAM"),
            })
        });
        assert!(matches!(res, Err(EngineError::Locked { .. })));
        assert!(load_placements(&conn, term()).expect("rows").is_empty());
        assert_eq!(store.current_version(&scope).expect("version"), version);
    }

    #[test]
    fn resp_ids_stay_with_the_term_that_imported_them() {
        let conn = seeded("catalog");
        let other = TermId::new(2, 2567).expect("term");
        let cfg = TermConfig::with_defaults(other);
        insert_term(&conn, &cfg, &generate_grid(&cfg).expect("grid")).expect("insert term");
        let grade: GradeId = "101".parse().expect("grade");
        let resp = |subject: &str| Responsibility {
            resp_id: 7,
            subject_code: subject.to_string(),
            subject_name: String::new(),
            teacher_id: 1,
            grade,
            periods: 2,
        };

        import_catalog(&conn, term(), &[], &[grade], &[resp("MATH")]).expect("first import");
        import_catalog(&conn, term(), &[], &[grade], &[resp("ART")]).expect("reimport same term");
        assert_eq!(
            responsibilities_held_elsewhere(&conn, other, &[7, 8]).expect("query"),
            vec![(7, term().to_string())]
        );
        assert!(responsibilities_held_elsewhere(&conn, term(), &[7]).expect("query").is_empty());

        assert!(import_catalog(&conn, other, &[], &[grade], &[resp("SCI")]).is_err());
        let kept = load_responsibilities(&conn, term()).expect("rows");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].subject_code, "ART");
        assert!(load_responsibilities(&conn, other).expect("rows").is_empty());
    }

    #[test]
    fn locks_persist_with_grades_and_teachers_then_cascade_with_term() {
        let conn = seeded("locks");
        let ts = TimeslotId::new(term(), Day::Fri, 1);
        let lock = Lock {
            id: lock_id(ts, "ASSEMBLY"),
            timeslot: ts,
            subject_code: "ASSEMBLY".to_string(),
            room_id: None,
            teachers: [7, 8].into_iter().collect(),
            grades: ["101".parse().expect("grade"), "402".parse().expect("grade")]
                .into_iter()
                .collect(),
        };
        upsert_locks(&conn, std::slice::from_ref(&lock)).expect("upsert");
        upsert_locks(&conn, std::slice::from_ref(&lock)).expect("upsert twice");
        assert_eq!(load_locks(&conn, term()).expect("locks"), vec![lock]);

        let counts = delete_term(&conn, term()).expect("delete");
        assert_eq!(counts.locks, 1);
        assert_eq!(counts.timeslots, 40);
        assert!(term_config_get(&conn, term()).expect("query").is_none());
        assert!(load_locks(&conn, term()).expect("locks").is_empty());
    }
}
