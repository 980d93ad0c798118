use crate::term::GradeBand;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakKind {
    #[serde(rename = "NOT_BREAK")]
    None,
    #[serde(rename = "BREAK_JUNIOR")]
    Junior,
    #[serde(rename = "BREAK_SENIOR")]
    Senior,
    #[serde(rename = "BREAK_BOTH")]
    Both,
}

impl BreakKind {
    pub fn for_period(period: u8, junior_break: u8, senior_break: u8) -> Self {
        match (period == junior_break, period == senior_break) {
            (true, true) => BreakKind::Both,
            (true, false) => BreakKind::Junior,
            (false, true) => BreakKind::Senior,
            (false, false) => BreakKind::None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            BreakKind::None => "NOT_BREAK",
            BreakKind::Junior => "BREAK_JUNIOR",
            BreakKind::Senior => "BREAK_SENIOR",
            BreakKind::Both => "BREAK_BOTH",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "NOT_BREAK" => Some(BreakKind::None),
            "BREAK_JUNIOR" => Some(BreakKind::Junior),
            "BREAK_SENIOR" => Some(BreakKind::Senior),
            "BREAK_BOTH" => Some(BreakKind::Both),
            _ => None,
        }
    }

    pub fn is_break(self) -> bool {
        self != BreakKind::None
    }
}

impl fmt::Display for BreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakKind::None => "teaching",
            BreakKind::Junior => "junior break",
            BreakKind::Senior => "senior break",
            BreakKind::Both => "whole-school break",
        };
        f.write_str(label)
    }
}

/// True when a slot of `kind` cannot host a class of `band`.
pub fn is_unavailable(kind: BreakKind, band: GradeBand) -> bool {
    match kind {
        BreakKind::Both => true,
        BreakKind::Junior => band == GradeBand::Junior,
        BreakKind::Senior => band == GradeBand::Senior,
        BreakKind::None => false,
    }
}
