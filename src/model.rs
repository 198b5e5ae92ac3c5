use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Symbols a teacher can stamp into a grade cell. A cell holds a set of
/// these (insertion-ordered), not a single value.
pub const GRADE_SYMBOLS: &[&str] = &["done", "absent", "late", "incomplete"];

pub fn is_grade_symbol(value: &str) -> bool {
    GRADE_SYMBOLS.contains(&value)
}

/// Identifies one group's synchronized dataset. Every cache key and remote
/// row key is derived from this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub teacher_id: String,
    pub group_title: String,
}

impl Scope {
    pub fn new(teacher_id: impl Into<String>, group_title: impl Into<String>) -> Self {
        Scope {
            teacher_id: teacher_id.into(),
            group_title: group_title.into(),
        }
    }

    pub fn view_key(&self) -> String {
        format!("{}::{}", self.teacher_id, self.group_title)
    }
}

/// Fixed-length slot array of tracked dates. The slot index, not the date
/// value, is what grade marks are keyed by in memory; the date value is the
/// join key against remote grade rows.
pub type TrackedDates = Vec<Option<DateTime<Utc>>>;

/// student id -> slot index -> symbol set.
pub type GradesState = BTreeMap<String, BTreeMap<usize, Vec<String>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teacher {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    #[serde(rename = "proficiencyLevel")]
    pub proficiency_level: String,
    #[serde(
        rename = "className",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub class_name: Option<String>,
}

/// One remote grade row. Keyed by calendar day, not slot index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeRow {
    pub student_id: String,
    /// Canonical day string, YYYY-MM-DD.
    pub date: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Teacher,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Teacher => "teacher",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "viewer" => Some(Role::Viewer),
            "teacher" => Some(Role::Teacher),
            _ => None,
        }
    }
}

/// Canonical day string for a tracked date; time-of-day is ignored when
/// correlating against remote grade rows.
pub fn day_key(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_key_ignores_time_of_day() {
        let morning = Utc.with_ymd_and_hms(2024, 1, 10, 8, 30, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 1, 10, 23, 59, 59).unwrap();
        assert_eq!(day_key(&morning), "2024-01-10");
        assert_eq!(day_key(&morning), day_key(&evening));
    }

    #[test]
    fn symbol_vocabulary_is_closed() {
        assert!(is_grade_symbol("done"));
        assert!(is_grade_symbol("late"));
        assert!(!is_grade_symbol("DONE"));
        assert!(!is_grade_symbol(""));
    }
}
