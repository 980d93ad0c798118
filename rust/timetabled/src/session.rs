//! Per-teacher or per-class arrangement state.
//!
//! A session owns a working copy of its scope's placements. Every user action
//! is validated against the full term context (other scopes' placements,
//! locks, breaks) before the working copy changes; a rejected action leaves
//! the session exactly as it was.

use crate::breaks::{self, BreakKind};
use crate::conflict::{Candidate, Conflict, ConflictDetector, RoomPolicy};
use crate::error::{EngineError, EngineResult};
use crate::grid::Timeslot;
use crate::locks::LockRegistry;
use crate::placement::{Cell, Lock, Placement, Responsibility, Room};
use crate::sync::{reconcile, ChangeSet, PlacementStore, TermSnapshot};
use crate::term::{GradeBand, GradeId, TermId, TimeslotId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Owner {
    Teacher(i64),
    Grade(GradeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub term: TermId,
    pub owner: Owner,
}

impl Scope {
    pub fn owns(&self, p: &Placement) -> bool {
        p.timeslot.term == self.term
            && match self.owner {
                Owner::Teacher(t) => p.teacher_id == t,
                Owner::Grade(g) => p.grade == g,
            }
    }

    fn covers(&self, r: &Responsibility) -> bool {
        match self.owner {
            Owner::Teacher(t) => r.teacher_id == t,
            Owner::Grade(g) => r.grade == g,
        }
    }

    /// The lock shown in this scope's cell at `timeslot`, if any.
    fn visible_lock<'a>(&self, locks: &'a LockRegistry, timeslot: TimeslotId) -> Option<&'a Lock> {
        match self.owner {
            Owner::Grade(g) => locks.lookup(timeslot, g),
            Owner::Teacher(t) => locks
                .iter()
                .find(|l| l.timeslot == timeslot && l.teachers.contains(&t)),
        }
    }

    fn blocked_by_break(&self, kind: BreakKind) -> bool {
        match self.owner {
            Owner::Grade(g) => breaks::is_unavailable(kind, g.band()),
            Owner::Teacher(_) => kind == BreakKind::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub room_policy: RoomPolicy,
    pub history_limit: usize,
    pub enforce_assignment: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            room_policy: RoomPolicy::Hard,
            history_limit: 50,
            enforce_assignment: true,
        }
    }
}

/// Everything a session needs from the workspace at open time.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub scope: Scope,
    pub grid: Vec<Timeslot>,
    pub responsibilities: Vec<Responsibility>,
    pub rooms: Vec<Room>,
    /// Every ordinary placement in the term, owned or not.
    pub placements: Vec<Placement>,
    pub locks: Vec<Lock>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Mode {
    Idle,
    #[serde(rename_all = "camelCase")]
    SubjectSelected { resp_id: i64, band: GradeBand },
    #[serde(rename_all = "camelCase")]
    SwapSourceSelected {
        timeslot: TimeslotId,
        placement_id: String,
        band: GradeBand,
    },
}

impl Mode {
    fn band(&self) -> Option<GradeBand> {
        match self {
            Mode::Idle => None,
            Mode::SubjectSelected { band, .. } | Mode::SwapSourceSelected { band, .. } => Some(*band),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Subject(i64),
    Placement(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Outcome {
    Selected { mode: Mode },
    Cleared,
    #[serde(rename_all = "camelCase")]
    Placed {
        placement: Placement,
        advisories: Vec<Conflict>,
    },
    #[serde(rename_all = "camelCase")]
    Moved {
        from: TimeslotId,
        placement: Placement,
        advisories: Vec<Conflict>,
    },
    #[serde(rename_all = "camelCase")]
    Swapped {
        first: Placement,
        second: Placement,
        advisories: Vec<Conflict>,
    },
    #[serde(rename_all = "camelCase")]
    RoomRequired {
        timeslot: TimeslotId,
        free_rooms: Vec<Room>,
    },
    Removed { placement: Placement },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellView {
    pub timeslot: Timeslot,
    pub cell: Cell,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    #[serde(flatten)]
    pub responsibility: Responsibility,
    pub scheduled: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub scope: Scope,
    pub mode: Mode,
    pub version: String,
    pub dirty: bool,
    pub can_undo: bool,
    pub can_redo: bool,
    pub cells: Vec<CellView>,
    pub pool: Vec<PoolEntry>,
}

/// Change-set and version captured when a save starts.
#[derive(Debug, Clone)]
pub struct PendingSave {
    pub expected_version: String,
    pub changes: ChangeSet,
    working: BTreeMap<TimeslotId, Placement>,
}

type Grid = BTreeMap<TimeslotId, Placement>;

pub struct AssignmentSession {
    scope: Scope,
    options: SessionOptions,
    grid: BTreeMap<TimeslotId, Timeslot>,
    pool: BTreeMap<i64, Responsibility>,
    rooms: Vec<Room>,
    working: Grid,
    context: Vec<Placement>,
    locks: LockRegistry,
    baseline: Vec<Placement>,
    version: String,
    mode: Mode,
    history: Vec<Grid>,
    future: Vec<Grid>,
    saving: bool,
}

impl AssignmentSession {
    pub fn load(seed: SessionSeed, options: SessionOptions) -> EngineResult<Self> {
        let scope = seed.scope;
        let grid: BTreeMap<TimeslotId, Timeslot> =
            seed.grid.into_iter().map(|s| (s.id, s)).collect();
        let pool: BTreeMap<i64, Responsibility> = seed
            .responsibilities
            .into_iter()
            .filter(|r| scope.covers(r))
            .map(|r| (r.resp_id, r))
            .collect();

        let mut working = Grid::new();
        let mut context = Vec::new();
        for p in seed.placements {
            if p.timeslot.term != scope.term {
                continue;
            }
            if !scope.owns(&p) {
                context.push(p);
                continue;
            }
            if !grid.contains_key(&p.timeslot) {
                return Err(EngineError::not_found("timeslot", p.timeslot));
            }
            if let Some(prev) = working.insert(p.timeslot, p) {
                warn!(placement = %prev.id, "duplicate placement in scope at load; keeping the later row");
            }
        }
        let baseline: Vec<Placement> = working.values().cloned().collect();

        info!(
            term = %scope.term,
            owner = ?scope.owner,
            placements = working.len(),
            pool = pool.len(),
            room_policy = options.room_policy.as_str(),
            "session loaded"
        );
        Ok(Self {
            scope,
            options,
            grid,
            pool,
            rooms: seed.rooms,
            working,
            context,
            locks: LockRegistry::from_locks(seed.locks),
            baseline,
            version: seed.version,
            mode: Mode::Idle,
            history: Vec::new(),
            future: Vec::new(),
            saving: false,
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn placements(&self) -> impl Iterator<Item = &Placement> {
        self.working.values()
    }

    /// Picks up what other sessions and lock edits have persisted since load.
    /// The working grid and baseline are left alone.
    pub fn refresh_context(&mut self, placements: Vec<Placement>, locks: Vec<Lock>) {
        self.context = placements
            .into_iter()
            .filter(|p| p.timeslot.term == self.scope.term && !self.scope.owns(p))
            .collect();
        self.locks = LockRegistry::from_locks(locks);
        debug!(term = %self.scope.term, context = self.context.len(), "session context refreshed");
    }

    pub fn is_dirty(&self) -> bool {
        !reconcile(&self.baseline, self.working.values()).is_empty()
    }

    fn scheduled(&self, resp_id: i64) -> u32 {
        let n = self.working.values().filter(|p| p.resp_id == resp_id).count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    fn remaining(&self, resp: &Responsibility) -> u32 {
        resp.periods.saturating_sub(self.scheduled(resp.resp_id))
    }

    fn detector(&self) -> ConflictDetector<'_> {
        ConflictDetector::new(
            self.working.values().chain(self.context.iter()),
            self.locks.iter(),
        )
        .with_grid(&self.grid)
    }

    fn slot(&self, timeslot: TimeslotId) -> EngineResult<&Timeslot> {
        self.grid
            .get(&timeslot)
            .ok_or_else(|| EngineError::not_found("timeslot", timeslot))
    }

    fn find_owned(&self, id: &str) -> EngineResult<&Placement> {
        if let Some(lock) = self.locks.get(id) {
            return Err(EngineError::Locked {
                timeslot: lock.timeslot,
                lock_id: lock.id.clone(),
            });
        }
        if let Some(p) = self.working.values().find(|p| p.id == id) {
            return Ok(p);
        }
        if self.context.iter().any(|p| p.id == id) {
            return Err(EngineError::NotOwned(id.to_string()));
        }
        Err(EngineError::not_found("placement", id))
    }

    fn check_assignment(&self, p: &Placement) -> EngineResult<()> {
        if !self.options.enforce_assignment {
            return Ok(());
        }
        let assigned = self.pool.get(&p.resp_id).is_some_and(|r| {
            r.teacher_id == p.teacher_id && r.subject_code == p.subject_code && r.grade == p.grade
        });
        if assigned {
            Ok(())
        } else {
            Err(EngineError::NotAssigned {
                teacher_id: p.teacher_id,
                subject_code: p.subject_code.clone(),
                grade: p.grade,
            })
        }
    }

    fn record(&mut self) {
        self.future.clear();
        if self.options.history_limit == 0 {
            return;
        }
        self.history.push(self.working.clone());
        if self.history.len() > self.options.history_limit {
            let excess = self.history.len() - self.options.history_limit;
            self.history.drain(..excess);
        }
    }

    pub fn select(&mut self, selection: Selection) -> EngineResult<Outcome> {
        let res = match selection {
            Selection::Subject(resp_id) => self.select_subject(resp_id),
            Selection::Placement(id) => self.select_placement(&id),
        };
        if let Err(e) = &res {
            debug!(code = e.code(), "select rejected");
        }
        res
    }

    fn select_subject(&mut self, resp_id: i64) -> EngineResult<Outcome> {
        let resp = self
            .pool
            .get(&resp_id)
            .ok_or_else(|| EngineError::not_found("responsibility", resp_id))?;
        if matches!(self.mode, Mode::SubjectSelected { resp_id: r, .. } if r == resp_id) {
            self.mode = Mode::Idle;
            return Ok(Outcome::Cleared);
        }
        if self.remaining(resp) == 0 {
            return Err(EngineError::ResponsibilityExhausted(resp_id));
        }
        let band = resp.grade.band();
        if let Some(pending) = self.mode.band() {
            if pending != band {
                return Err(EngineError::BandMismatch {
                    pending,
                    requested: band,
                });
            }
        }
        self.mode = Mode::SubjectSelected { resp_id, band };
        Ok(Outcome::Selected {
            mode: self.mode.clone(),
        })
    }

    fn select_placement(&mut self, id: &str) -> EngineResult<Outcome> {
        let p = self.find_owned(id)?.clone();
        match &self.mode {
            Mode::SwapSourceSelected { placement_id, .. } if placement_id == id => {
                self.mode = Mode::Idle;
                Ok(Outcome::Cleared)
            }
            Mode::SwapSourceSelected { band, .. } => {
                let requested = p.grade.band();
                if *band != requested {
                    return Err(EngineError::BandMismatch {
                        pending: *band,
                        requested,
                    });
                }
                self.target_cell(p.timeslot, None)
            }
            pending => {
                let band = p.grade.band();
                if let Some(pending) = pending.band() {
                    if pending != band {
                        return Err(EngineError::BandMismatch {
                            pending,
                            requested: band,
                        });
                    }
                }
                self.mode = Mode::SwapSourceSelected {
                    timeslot: p.timeslot,
                    placement_id: p.id,
                    band,
                };
                Ok(Outcome::Selected {
                    mode: self.mode.clone(),
                })
            }
        }
    }

    /// Applies the pending selection to `timeslot`. `room_id` picks the room
    /// for a new placement or overrides the room of a moved one.
    pub fn target_cell(&mut self, timeslot: TimeslotId, room_id: Option<i64>) -> EngineResult<Outcome> {
        let res = match self.mode.clone() {
            Mode::Idle => Err(EngineError::NothingSelected),
            Mode::SubjectSelected { resp_id, .. } => self.place(resp_id, timeslot, room_id),
            Mode::SwapSourceSelected {
                timeslot: source, ..
            } => self.move_or_swap(source, timeslot, room_id),
        };
        if let Err(e) = &res {
            debug!(timeslot = %timeslot, code = e.code(), "target rejected");
        }
        res
    }

    fn place(&mut self, resp_id: i64, timeslot: TimeslotId, room_id: Option<i64>) -> EngineResult<Outcome> {
        self.slot(timeslot)?;
        if let Some(lock) = self.scope.visible_lock(&self.locks, timeslot) {
            return Err(EngineError::Locked {
                timeslot,
                lock_id: lock.id.clone(),
            });
        }
        let resp = self
            .pool
            .get(&resp_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("responsibility", resp_id))?;
        if self.remaining(&resp) == 0 {
            return Err(EngineError::ResponsibilityExhausted(resp_id));
        }
        if let Some(room) = room_id {
            if !self.rooms.iter().any(|r| r.room_id == room) {
                return Err(EngineError::not_found("room", room));
            }
        }

        let teachers = [resp.teacher_id];
        let advisories = {
            let detector = self.detector();
            let candidate = Candidate {
                timeslot,
                grade: resp.grade,
                teachers: &teachers,
                room_id,
                ignore: &[],
            };
            let advisories = detector
                .check_placement(&candidate)
                .into_result(self.options.room_policy)?;
            if room_id.is_none() && !self.rooms.is_empty() {
                let taken = detector.rooms_in_use(timeslot, &[]);
                let free_rooms = self
                    .rooms
                    .iter()
                    .filter(|r| !taken.contains(&r.room_id))
                    .cloned()
                    .collect();
                return Ok(Outcome::RoomRequired {
                    timeslot,
                    free_rooms,
                });
            }
            advisories
        };

        let placement = Placement::for_responsibility(&resp, timeslot, room_id);
        self.record();
        self.working.insert(timeslot, placement.clone());
        self.mode = Mode::Idle;
        info!(placement = %placement.id, room = ?room_id, "placement created");
        Ok(Outcome::Placed {
            placement,
            advisories,
        })
    }

    fn move_or_swap(
        &mut self,
        source: TimeslotId,
        target: TimeslotId,
        room_id: Option<i64>,
    ) -> EngineResult<Outcome> {
        if source == target {
            self.mode = Mode::Idle;
            return Ok(Outcome::Cleared);
        }
        self.slot(target)?;
        if let Some(lock) = self.scope.visible_lock(&self.locks, target) {
            return Err(EngineError::Locked {
                timeslot: target,
                lock_id: lock.id.clone(),
            });
        }
        let src = self
            .working
            .get(&source)
            .cloned()
            .ok_or_else(|| EngineError::not_found("placement", source))?;
        self.check_assignment(&src)?;
        if let Some(room) = room_id {
            if !self.rooms.iter().any(|r| r.room_id == room) {
                return Err(EngineError::not_found("room", room));
            }
        }

        match self.working.get(&target).cloned() {
            Some(dst) => self.swap(src, dst),
            None => {
                let mut moved = src.moved_to(target);
                if room_id.is_some() {
                    moved.room_id = room_id;
                }
                let ignore = [src.id.as_str()];
                let teachers = [moved.teacher_id];
                let advisories = self
                    .detector()
                    .check_placement(&Candidate {
                        timeslot: target,
                        grade: moved.grade,
                        teachers: &teachers,
                        room_id: moved.room_id,
                        ignore: &ignore,
                    })
                    .into_result(self.options.room_policy)?;

                self.record();
                self.working.remove(&source);
                self.working.insert(target, moved.clone());
                self.mode = Mode::Idle;
                info!(from = %src.id, to = %moved.id, "placement moved");
                Ok(Outcome::Moved {
                    from: source,
                    placement: moved,
                    advisories,
                })
            }
        }
    }

    fn swap(&mut self, a: Placement, b: Placement) -> EngineResult<Outcome> {
        self.check_assignment(&b)?;
        let a_moved = a.moved_to(b.timeslot);
        let b_moved = b.moved_to(a.timeslot);
        let ignore = [a.id.as_str(), b.id.as_str()];

        let mut advisories = Vec::new();
        {
            let detector = self.detector();
            for p in [&a_moved, &b_moved] {
                let teachers = [p.teacher_id];
                let found = detector
                    .check_placement(&Candidate {
                        timeslot: p.timeslot,
                        grade: p.grade,
                        teachers: &teachers,
                        room_id: p.room_id,
                        ignore: &ignore,
                    })
                    .into_result(self.options.room_policy)?;
                advisories.extend(found);
            }
        }

        self.record();
        self.working.insert(a_moved.timeslot, a_moved.clone());
        self.working.insert(b_moved.timeslot, b_moved.clone());
        self.mode = Mode::Idle;
        info!(first = %a.id, second = %b.id, "placements swapped");
        Ok(Outcome::Swapped {
            first: a_moved,
            second: b_moved,
            advisories,
        })
    }

    pub fn remove(&mut self, id: &str) -> EngineResult<Outcome> {
        let p = match self.find_owned(id) {
            Ok(p) => p.clone(),
            Err(e) => {
                debug!(placement = %id, code = e.code(), "remove rejected");
                return Err(e);
            }
        };
        self.record();
        self.working.remove(&p.timeslot);
        if matches!(&self.mode, Mode::SwapSourceSelected { placement_id, .. } if placement_id == id) {
            self.mode = Mode::Idle;
        }
        info!(placement = %p.id, "placement removed");
        Ok(Outcome::Removed { placement: p })
    }

    /// Returns `Ok(false)` when there is nothing to undo.
    pub fn undo(&mut self) -> EngineResult<bool> {
        let Some(prev) = self.history.pop() else {
            return Ok(false);
        };
        if let Err(e) = self.check_restore(&prev) {
            debug!(code = e.code(), "undo rejected");
            self.history.push(prev);
            return Err(e);
        }
        let current = std::mem::replace(&mut self.working, prev);
        self.future.push(current);
        self.mode = Mode::Idle;
        Ok(true)
    }

    pub fn redo(&mut self) -> EngineResult<bool> {
        let Some(next) = self.future.pop() else {
            return Ok(false);
        };
        if let Err(e) = self.check_restore(&next) {
            debug!(code = e.code(), "redo rejected");
            self.future.push(next);
            return Err(e);
        }
        let current = std::mem::replace(&mut self.working, next);
        self.history.push(current);
        self.mode = Mode::Idle;
        Ok(true)
    }

    /// A grid from the history may predate locks and placements that were
    /// persisted since; the rows it would bring back are checked again.
    fn check_restore(&self, next: &Grid) -> EngineResult<()> {
        let detector = ConflictDetector::new(next.values().chain(self.context.iter()), self.locks.iter())
            .with_grid(&self.grid);
        for p in next.values().filter(|p| self.working.get(&p.timeslot) != Some(*p)) {
            check_row(&detector, p, self.options.room_policy)?;
        }
        Ok(())
    }

    pub fn view(&self) -> SessionView {
        let cells = self
            .grid
            .values()
            .map(|slot| {
                let cell = if let Some(p) = self.working.get(&slot.id) {
                    Cell::Occupied(p.clone())
                } else if let Some(lock) = self.scope.visible_lock(&self.locks, slot.id) {
                    Cell::Locked(lock.clone())
                } else if self.scope.blocked_by_break(slot.break_kind) {
                    Cell::Break
                } else {
                    Cell::Empty
                };
                CellView {
                    timeslot: slot.clone(),
                    cell,
                }
            })
            .collect();
        let pool = self
            .pool
            .values()
            .map(|r| PoolEntry {
                scheduled: self.scheduled(r.resp_id),
                remaining: self.remaining(r),
                responsibility: r.clone(),
            })
            .collect();
        SessionView {
            scope: self.scope,
            mode: self.mode.clone(),
            version: self.version.clone(),
            dirty: self.is_dirty(),
            can_undo: !self.history.is_empty(),
            can_redo: !self.future.is_empty(),
            cells,
            pool,
        }
    }

    /// First half of a save: captures the change-set. Until
    /// `finish_save` runs, further saves are refused.
    pub fn begin_save(&mut self) -> EngineResult<PendingSave> {
        if self.saving {
            return Err(EngineError::SaveInProgress);
        }
        self.saving = true;
        Ok(PendingSave {
            expected_version: self.version.clone(),
            changes: reconcile(&self.baseline, self.working.values()),
            working: self.working.clone(),
        })
    }

    /// Second half of a save. On success the saved grid becomes the new
    /// baseline; on failure the working grid is kept for a retry.
    pub fn finish_save(&mut self, pending: PendingSave, result: EngineResult<String>) -> EngineResult<ChangeSet> {
        self.saving = false;
        match result {
            Ok(version) => {
                self.baseline = pending.working.into_values().collect();
                self.version = version;
                info!(version = %self.version, summary = %pending.changes.summary(), "session saved");
                Ok(pending.changes)
            }
            Err(e) => {
                warn!(code = e.code(), error = %e, "session save failed");
                Err(e)
            }
        }
    }

    pub fn save<S: PlacementStore>(&mut self, store: &mut S) -> EngineResult<ChangeSet> {
        let pending = self.begin_save()?;
        let result = self.write(store, &pending);
        self.finish_save(pending, result)
    }

    fn write<S: PlacementStore>(&self, store: &mut S, pending: &PendingSave) -> EngineResult<String> {
        store.commit(
            &self.scope,
            &pending.expected_version,
            &pending.changes,
            |stored| self.check_commit(pending, stored),
        )
    }

    /// Other sessions and lock edits may have committed rows this session
    /// never saw, so created and updated rows are validated against the
    /// term as stored.
    fn check_commit(&self, pending: &PendingSave, stored: &TermSnapshot) -> EngineResult<()> {
        let others = stored
            .placements
            .iter()
            .filter(|p| p.timeslot.term == self.scope.term && !self.scope.owns(p));
        let detector = ConflictDetector::new(pending.working.values().chain(others), stored.locks.iter())
            .with_grid(&self.grid);
        for p in pending.changes.creates.iter().chain(&pending.changes.updates) {
            check_row(&detector, p, self.options.room_policy)?;
        }
        Ok(())
    }
}

/// Validates an existing row as if it were placed again.
fn check_row(detector: &ConflictDetector<'_>, p: &Placement, policy: RoomPolicy) -> EngineResult<()> {
    let teachers = [p.teacher_id];
    let ignore = [p.id.as_str()];
    detector
        .check_placement(&Candidate {
            timeslot: p.timeslot,
            grade: p.grade,
            teachers: &teachers,
            room_id: p.room_id,
            ignore: &ignore,
        })
        .into_result(policy)
        .map(|_| ())
}
