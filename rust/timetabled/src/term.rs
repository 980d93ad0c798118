use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One (semester, academic year) pair. Key form is `"{semester}-{year}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TermId {
    pub semester: u8,
    pub academic_year: u16,
}

impl TermId {
    pub fn new(semester: u8, academic_year: u16) -> Result<Self, String> {
        if !(1..=3).contains(&semester) {
            return Err(format!("semester must be in 1..=3, got {}", semester));
        }
        if !(1000..=9999).contains(&academic_year) {
            return Err(format!(
                "academic year must have 4 digits, got {}",
                academic_year
            ));
        }
        Ok(Self {
            semester,
            academic_year,
        })
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.semester, self.academic_year)
    }
}

impl FromStr for TermId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((sem, year)) = s.split_once('-') else {
            return Err(format!("term must look like SEMESTER-YEAR, got {:?}", s));
        };
        if sem.len() != 1 || year.len() != 4 {
            return Err(format!("term must look like SEMESTER-YEAR, got {:?}", s));
        }
        let semester = sem
            .parse::<u8>()
            .map_err(|_| format!("semester must be a digit, got {:?}", sem))?;
        let academic_year = year
            .parse::<u16>()
            .map_err(|_| format!("academic year must be numeric, got {:?}", year))?;
        TermId::new(semester, academic_year)
    }
}

impl From<TermId> for String {
    fn from(t: TermId) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for TermId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Day {
    #[serde(rename = "MON")]
    Mon,
    #[serde(rename = "TUE")]
    Tue,
    #[serde(rename = "WED")]
    Wed,
    #[serde(rename = "THU")]
    Thu,
    #[serde(rename = "FRI")]
    Fri,
}

impl Day {
    pub const SCHOOL_WEEK: [Day; 5] = [Day::Mon, Day::Tue, Day::Wed, Day::Thu, Day::Fri];

    pub fn code(self) -> &'static str {
        match self {
            Day::Mon => "MON",
            Day::Tue => "TUE",
            Day::Wed => "WED",
            Day::Thu => "THU",
            Day::Fri => "FRI",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "MON" => Some(Day::Mon),
            "TUE" => Some(Day::Tue),
            "WED" => Some(Day::Wed),
            "THU" => Some(Day::Thu),
            "FRI" => Some(Day::Fri),
            _ => None,
        }
    }
}

/// Persisted timeslot key: semester digit, 4-digit year, day code and period,
/// e.g. `"1-2567-MON1"` (11 chars) or `"1-2567-MON10"` (12 chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TimeslotId {
    pub term: TermId,
    pub day: Day,
    pub period: u8,
}

impl TimeslotId {
    pub fn new(term: TermId, day: Day, period: u8) -> Self {
        Self { term, day, period }
    }
}

impl fmt::Display for TimeslotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}{}", self.term, self.day.code(), self.period)
    }
}

impl FromStr for TimeslotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.is_ascii() || s.len() < 11 {
            return Err(format!("invalid timeslot id {:?}", s));
        }
        if s.as_bytes()[6] != b'-' {
            return Err(format!("invalid timeslot id {:?}", s));
        }
        let term: TermId = s[0..6].parse()?;
        let day = Day::parse(&s[7..10]).ok_or_else(|| format!("invalid day in {:?}", s))?;
        // Period starts at offset 10; older callers wrote "MON-3".
        let mut tail = &s[10..];
        if let Some(rest) = tail.strip_prefix('-') {
            tail = rest;
        }
        if tail.is_empty() || tail.len() > 2 || !tail.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid period in {:?}", s));
        }
        let period: u8 = tail
            .parse()
            .map_err(|_| format!("invalid period in {:?}", s))?;
        if period == 0 {
            return Err(format!("period must be >= 1 in {:?}", s));
        }
        Ok(TimeslotId { term, day, period })
    }
}

impl From<TimeslotId> for String {
    fn from(t: TimeslotId) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for TimeslotId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeBand {
    Junior,
    Senior,
}

impl GradeBand {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeBand::Junior => "junior",
            GradeBand::Senior => "senior",
        }
    }
}

impl fmt::Display for GradeBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A class: study year (1..=6) plus room number within the year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct GradeId {
    pub year: u8,
    pub room: u16,
}

impl GradeId {
    pub fn new(year: u8, room: u16) -> Result<Self, String> {
        if !(1..=6).contains(&year) {
            return Err(format!("grade year must be in 1..=6, got {}", year));
        }
        if room == 0 {
            return Err("grade room number must be >= 1".to_string());
        }
        Ok(Self { year, room })
    }

    pub fn band(self) -> GradeBand {
        if self.year <= 3 {
            GradeBand::Junior
        } else {
            GradeBand::Senior
        }
    }
}

impl fmt::Display for GradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.year, self.room)
    }
}

impl FromStr for GradeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (year, room) = match s.split_once('/') {
            Some((y, r)) => (y, r),
            None if s.len() >= 2 && s.is_ascii() => (&s[0..1], &s[1..]),
            None => return Err(format!("invalid grade id {:?}", s)),
        };
        let year: u8 = year
            .parse()
            .map_err(|_| format!("invalid grade year in {:?}", s))?;
        let room: u16 = room
            .parse()
            .map_err(|_| format!("invalid grade room in {:?}", s))?;
        GradeId::new(year, room)
    }
}

impl From<GradeId> for String {
    fn from(g: GradeId) -> Self {
        g.to_string()
    }
}

impl TryFrom<String> for GradeId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term() -> TermId {
        TermId::new(2, 2567).expect("term")
    }

    #[test]
    fn timeslot_id_renders_both_widths() {
        let short = TimeslotId::new(term(), Day::Mon, 3);
        let long = TimeslotId::new(term(), Day::Fri, 11);
        assert_eq!(short.to_string(), "2-2567-MON3");
        assert_eq!(short.to_string().len(), 11);
        assert_eq!(long.to_string(), "2-2567-FRI11");
        assert_eq!(long.to_string().len(), 12);
    }

    #[test]
    fn timeslot_id_parses_trailing_period_at_either_width() {
        let a: TimeslotId = "1-2567-TUE7".parse().expect("11 chars");
        assert_eq!((a.day, a.period), (Day::Tue, 7));
        let b: TimeslotId = "1-2567-TUE12".parse().expect("12 chars");
        assert_eq!((b.day, b.period), (Day::Tue, 12));
        let c: TimeslotId = "2-2567-MON-3".parse().expect("hyphenated");
        assert_eq!(c.to_string(), "2-2567-MON3");
    }

    #[test]
    fn timeslot_id_rejects_garbage() {
        for bad in ["", "1-2567-MON", "1-2567-SAT1", "4-2567-MON1", "1-2567-MON123", "1-2567-MON0"] {
            assert!(bad.parse::<TimeslotId>().is_err(), "{} should fail", bad);
        }
    }

    #[test]
    fn grade_id_parses_year_and_room_once() {
        let g: GradeId = "101".parse().expect("grade");
        assert_eq!((g.year, g.room), (1, 1));
        assert_eq!(g.band(), GradeBand::Junior);
        let h: GradeId = "412".parse().expect("grade");
        assert_eq!((h.year, h.room), (4, 12));
        assert_eq!(h.band(), GradeBand::Senior);
        let i: GradeId = "5/3".parse().expect("slash form");
        assert_eq!(i.to_string(), "503");
        assert!("701".parse::<GradeId>().is_err());
        assert!("1".parse::<GradeId>().is_err());
    }

    #[test]
    fn ids_order_by_day_then_period() {
        let mut ids = vec![
            TimeslotId::new(term(), Day::Tue, 1),
            TimeslotId::new(term(), Day::Mon, 10),
            TimeslotId::new(term(), Day::Mon, 2),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(|t| t.to_string()).collect();
        assert_eq!(rendered, vec!["2-2567-MON2", "2-2567-MON10", "2-2567-TUE1"]);
    }
}
