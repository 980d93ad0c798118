use crate::breaks::BreakKind;
use crate::config::{hhmm, TermConfig};
use crate::error::{EngineError, EngineResult};
use crate::term::{Day, TimeslotId};
use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeslot {
    pub id: TimeslotId,
    pub day: Day,
    pub period: u8,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    pub break_kind: BreakKind,
}

struct PeriodTimes {
    period: u8,
    start: NaiveTime,
    end: NaiveTime,
    break_kind: BreakKind,
}

fn add_minutes(t: NaiveTime, minutes: u16) -> Option<NaiveTime> {
    let (out, wrapped) = t.overflowing_add_signed(Duration::minutes(i64::from(minutes)));
    if wrapped != 0 {
        None
    } else {
        Some(out)
    }
}

fn day_layout(cfg: &TermConfig) -> EngineResult<Vec<PeriodTimes>> {
    cfg.validate()?;

    let past_midnight = || EngineError::config("startTime", "school day runs past midnight");
    let mut periods = Vec::with_capacity(cfg.periods_per_day as usize);
    let mut cursor = cfg.start_time;
    for period in 1..=cfg.periods_per_day {
        if let Some(mb) = cfg.mini_break {
            if mb.slot == period {
                cursor = add_minutes(cursor, mb.minutes).ok_or_else(past_midnight)?;
            }
        }
        let break_kind = BreakKind::for_period(period, cfg.junior_break, cfg.senior_break);
        let minutes = if break_kind.is_break() {
            cfg.minutes_for_break()
        } else {
            cfg.period_minutes
        };
        let end = add_minutes(cursor, minutes).ok_or_else(past_midnight)?;
        periods.push(PeriodTimes {
            period,
            start: cursor,
            end,
            break_kind,
        });
        cursor = end;
    }
    Ok(periods)
}

/// Builds the term's full week: Monday to Friday, periods in order.
/// The same config always yields the same ids and times.
pub fn generate_grid(cfg: &TermConfig) -> EngineResult<Vec<Timeslot>> {
    let layout = day_layout(cfg)?;
    let mut slots = Vec::with_capacity(Day::SCHOOL_WEEK.len() * layout.len());
    for day in Day::SCHOOL_WEEK {
        for p in &layout {
            slots.push(Timeslot {
                id: TimeslotId::new(cfg.term, day, p.period),
                day,
                period: p.period,
                start: p.start,
                end: p.end,
                break_kind: p.break_kind,
            });
        }
    }
    Ok(slots)
}

/// The non-teaching interval inserted before the mini-break slot, if any.
pub fn mini_break_window(cfg: &TermConfig) -> EngineResult<Option<(NaiveTime, NaiveTime)>> {
    let Some(mb) = cfg.mini_break else {
        return Ok(None);
    };
    let layout = day_layout(cfg)?;
    let window = layout.iter().find(|p| p.period == mb.slot).map(|p| {
        let begins = p.start - Duration::minutes(i64::from(mb.minutes));
        (begins, p.start)
    });
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MiniBreak;
    use crate::term::TermId;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("time")
    }

    fn base() -> TermConfig {
        TermConfig::with_defaults(TermId::new(2, 2567).expect("term"))
    }

    #[test]
    fn eight_period_day_marks_junior_and_senior_breaks() {
        let cfg = base();
        let grid = generate_grid(&cfg).expect("grid");
        assert_eq!(grid.len(), 40);
        for slot in grid.iter().filter(|s| s.day == Day::Mon) {
            let expected = match slot.period {
                4 => BreakKind::Junior,
                5 => BreakKind::Senior,
                _ => BreakKind::None,
            };
            assert_eq!(slot.break_kind, expected, "period {}", slot.period);
        }
        let first = &grid[0];
        assert_eq!(first.id.to_string(), "2-2567-MON1");
        assert_eq!((first.start, first.end), (t(8, 30), t(9, 20)));
        let last_monday = &grid[7];
        assert_eq!((last_monday.start, last_monday.end), (t(14, 20), t(15, 10)));
    }

    #[test]
    fn shared_break_index_is_both() {
        let mut cfg = base();
        cfg.senior_break = 4;
        let grid = generate_grid(&cfg).expect("grid");
        assert_eq!(grid[3].break_kind, BreakKind::Both);
        assert_eq!(grid[4].break_kind, BreakKind::None);
    }

    #[test]
    fn break_minutes_shorten_break_periods_only() {
        let mut cfg = base();
        cfg.break_minutes = Some(60);
        let grid = generate_grid(&cfg).expect("grid");
        assert_eq!((grid[3].start, grid[3].end), (t(11, 0), t(12, 0)));
        assert_eq!((grid[4].start, grid[4].end), (t(12, 0), t(13, 0)));
        assert_eq!((grid[5].start, grid[5].end), (t(13, 0), t(13, 50)));
    }

    #[test]
    fn mini_break_shifts_later_periods_without_consuming_a_number() {
        let mut cfg = base();
        cfg.mini_break = Some(MiniBreak { minutes: 10, slot: 3 });
        let grid = generate_grid(&cfg).expect("grid");
        assert_eq!(grid.len(), 40);
        assert_eq!(grid[1].end, t(10, 10));
        assert_eq!((grid[2].period, grid[2].start), (3, t(10, 20)));
        assert_eq!(
            mini_break_window(&cfg).expect("window"),
            Some((t(10, 10), t(10, 20)))
        );
    }

    #[test]
    fn rejects_out_of_range_and_overflowing_days() {
        let mut cfg = base();
        cfg.junior_break = 9;
        assert!(matches!(generate_grid(&cfg), Err(EngineError::ConfigInvalid { .. })));

        let mut cfg = base();
        cfg.start_time = t(20, 0);
        cfg.periods_per_day = 12;
        cfg.period_minutes = 120;
        assert!(matches!(generate_grid(&cfg), Err(EngineError::ConfigInvalid { .. })));
    }

    proptest! {
        #[test]
        fn valid_configs_produce_unique_deterministic_grids(
            periods in 6u8..=12,
            minutes in 30u16..=60,
            junior in 1u8..=12,
            senior in 1u8..=12,
            start_hour in 6u32..=9,
        ) {
            prop_assume!(junior <= periods && senior <= periods);
            let mut cfg = base();
            cfg.periods_per_day = periods;
            cfg.period_minutes = minutes;
            cfg.junior_break = junior;
            cfg.senior_break = senior;
            cfg.start_time = t(start_hour, 0);

            let a = generate_grid(&cfg).expect("grid");
            let b = generate_grid(&cfg).expect("grid");
            prop_assert_eq!(a.len(), 5 * periods as usize);
            let ids: HashSet<_> = a.iter().map(|s| (s.day, s.period)).collect();
            prop_assert_eq!(ids.len(), a.len());
            prop_assert_eq!(a, b);
        }
    }
}
