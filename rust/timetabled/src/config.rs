use crate::error::{EngineError, EngineResult};
use crate::term::TermId;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const PERIODS_PER_DAY: RangeInclusive<u8> = 6..=12;
pub const PERIOD_MINUTES: RangeInclusive<u16> = 30..=120;
pub const BREAK_MINUTES: RangeInclusive<u16> = 5..=120;
pub const MINI_BREAK_MINUTES: RangeInclusive<u16> = 5..=30;

/// Term-scoped grid configuration. Immutable once the term's timeslots exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TermConfig {
    pub term: TermId,
    pub periods_per_day: u8,
    pub period_minutes: u16,
    /// Length of a break period; break periods use `period_minutes` when unset.
    #[serde(default)]
    pub break_minutes: Option<u16>,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    pub junior_break: u8,
    pub senior_break: u8,
    #[serde(default)]
    pub mini_break: Option<MiniBreak>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MiniBreak {
    pub minutes: u16,
    /// The short break is taken right before this period.
    pub slot: u8,
}

impl TermConfig {
    pub fn with_defaults(term: TermId) -> Self {
        Self {
            term,
            periods_per_day: 8,
            period_minutes: 50,
            break_minutes: None,
            start_time: NaiveTime::from_hms_opt(8, 30, 0).unwrap_or_default(),
            junior_break: 4,
            senior_break: 5,
            mini_break: None,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !PERIODS_PER_DAY.contains(&self.periods_per_day) {
            return Err(out_of_range(
                "periodsPerDay",
                self.periods_per_day,
                PERIODS_PER_DAY.start(),
                PERIODS_PER_DAY.end(),
            ));
        }
        if !PERIOD_MINUTES.contains(&self.period_minutes) {
            return Err(out_of_range(
                "periodMinutes",
                self.period_minutes,
                PERIOD_MINUTES.start(),
                PERIOD_MINUTES.end(),
            ));
        }
        if let Some(m) = self.break_minutes {
            if !BREAK_MINUTES.contains(&m) {
                return Err(out_of_range(
                    "breakMinutes",
                    m,
                    BREAK_MINUTES.start(),
                    BREAK_MINUTES.end(),
                ));
            }
        }
        for (field, idx) in [
            ("juniorBreak", self.junior_break),
            ("seniorBreak", self.senior_break),
        ] {
            if idx == 0 || idx > self.periods_per_day {
                return Err(out_of_range(field, idx, &1, &self.periods_per_day));
            }
        }
        if let Some(mb) = self.mini_break {
            if !MINI_BREAK_MINUTES.contains(&mb.minutes) {
                return Err(out_of_range(
                    "miniBreak.minutes",
                    mb.minutes,
                    MINI_BREAK_MINUTES.start(),
                    MINI_BREAK_MINUTES.end(),
                ));
            }
            if mb.slot == 0 || mb.slot > self.periods_per_day {
                return Err(out_of_range(
                    "miniBreak.slot",
                    mb.slot,
                    &1,
                    &self.periods_per_day,
                ));
            }
        }
        Ok(())
    }

    pub fn minutes_for_break(&self) -> u16 {
        self.break_minutes.unwrap_or(self.period_minutes)
    }
}

fn out_of_range<T: std::fmt::Display>(field: &str, value: T, min: &T, max: &T) -> EngineError {
    EngineError::config(field, format!("{} must be in {}..={}", value, min, max))
}

/// `HH:MM` wire format for times of day.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(D::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .map_err(|_| format!("time must be HH:MM, got {:?}", raw))
    }
}
