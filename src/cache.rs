use crate::model::{GradesState, Scope, Student, Teacher, TrackedDates};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CACHE_FILE: &str = "cache.json";
pub const DEFAULT_DATE_SLOTS: usize = 3;

/// Durable string key/value store, the localStorage analogue. Keys are the
/// string templates the app has always used (`dates_{teacher}_{group}`,
/// `grades_{teacher}_{group}`, `notes_{teacher}_{group}`,
/// `students_{teacher}`, `teachers`); values are JSON text except notes,
/// which are stored raw.
pub struct Cache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl Cache {
    pub fn open(workspace: &Path) -> anyhow::Result<Cache> {
        std::fs::create_dir_all(workspace)?;
        let path = workspace.join(CACHE_FILE);
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        Ok(Cache { path, entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: String) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value);
        self.persist()
    }

    fn persist(&self) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.writing");
        std::fs::write(&tmp, text)
            .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.to_string_lossy()))?;
        Ok(())
    }

    // Key templates.

    fn dates_key(scope: &Scope) -> String {
        format!("dates_{}_{}", scope.teacher_id, scope.group_title)
    }

    fn grades_key(scope: &Scope) -> String {
        format!("grades_{}_{}", scope.teacher_id, scope.group_title)
    }

    fn notes_key(scope: &Scope) -> String {
        format!("notes_{}_{}", scope.teacher_id, scope.group_title)
    }

    fn students_key(teacher_id: &str) -> String {
        format!("students_{}", teacher_id)
    }

    // Dates: serialized as an array of nullable RFC 3339 strings. Malformed
    // stored data falls back to the empty default rather than erroring.

    pub fn load_dates(&self, scope: &Scope) -> TrackedDates {
        let default = || vec![None; DEFAULT_DATE_SLOTS];
        let Some(raw) = self.get(&Self::dates_key(scope)) else {
            return default();
        };
        let Ok(stored) = serde_json::from_str::<Vec<Option<String>>>(raw) else {
            return default();
        };
        if stored.is_empty() {
            return default();
        }
        stored
            .into_iter()
            .map(|slot| slot.and_then(|s| parse_date(&s)))
            .collect()
    }

    pub fn save_dates(&mut self, scope: &Scope, dates: &TrackedDates) -> anyhow::Result<()> {
        let stored: Vec<Option<String>> = dates
            .iter()
            .map(|slot| slot.as_ref().map(|d| d.to_rfc3339()))
            .collect();
        self.set(&Self::dates_key(scope), serde_json::to_string(&stored)?)
    }

    // Grades: nested JSON maps. Index keys are strings on disk, numeric in
    // memory; serde_json does the coercion both ways.

    pub fn load_grades(&self, scope: &Scope) -> GradesState {
        self.get(&Self::grades_key(scope))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn save_grades(&mut self, scope: &Scope, grades: &GradesState) -> anyhow::Result<()> {
        self.set(&Self::grades_key(scope), serde_json::to_string(grades)?)
    }

    // Notes: stored as the raw string, empty when absent.

    pub fn load_notes(&self, scope: &Scope) -> String {
        self.get(&Self::notes_key(scope)).unwrap_or("").to_string()
    }

    pub fn save_notes(&mut self, scope: &Scope, notes: &str) -> anyhow::Result<()> {
        self.set(&Self::notes_key(scope), notes.to_string())
    }

    // Roster (owned by the roster handlers, persisted adjacently).

    pub fn load_teachers(&self) -> Vec<Teacher> {
        self.get("teachers")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn save_teachers(&mut self, teachers: &[Teacher]) -> anyhow::Result<()> {
        self.set("teachers", serde_json::to_string(teachers)?)
    }

    pub fn load_students(&self, teacher_id: &str) -> Vec<Student> {
        self.get(&Self::students_key(teacher_id))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn save_students(&mut self, teacher_id: &str, students: &[Student]) -> anyhow::Result<()> {
        self.set(
            &Self::students_key(teacher_id),
            serde_json::to_string(students)?,
        )
    }

    /// Remote deletes do not cascade; delete flows must clear the derived
    /// cache keys themselves.
    pub fn remove_teacher(&mut self, teacher_id: &str) -> anyhow::Result<()> {
        let prefixes = [
            format!("dates_{}_", teacher_id),
            format!("grades_{}_", teacher_id),
            format!("notes_{}_", teacher_id),
        ];
        self.entries
            .retain(|key, _| !prefixes.iter().any(|p| key.starts_with(p.as_str())));
        self.entries.remove(&Self::students_key(teacher_id));
        self.persist()
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace() -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "monitord-cache-test-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn scope() -> Scope {
        Scope::new("t1", "Grades 5-6")
    }

    #[test]
    fn dates_default_to_three_empty_slots() {
        let ws = temp_workspace();
        let cache = Cache::open(&ws).expect("open cache");
        assert_eq!(cache.load_dates(&scope()), vec![None, None, None]);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn dates_round_trip_with_mixed_slots() {
        let ws = temp_workspace();
        let mut cache = Cache::open(&ws).expect("open cache");
        let dates = vec![
            Some(Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap()),
            None,
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()),
            None,
        ];
        cache.save_dates(&scope(), &dates).expect("save dates");

        // Re-open to force the disk round trip.
        let reloaded = Cache::open(&ws).expect("reopen cache");
        assert_eq!(reloaded.load_dates(&scope()), dates);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn malformed_stored_dates_fall_back_to_default() {
        let ws = temp_workspace();
        let mut cache = Cache::open(&ws).expect("open cache");
        cache
            .set("dates_t1_Grades 5-6", "{\"not\": \"an array\"}".to_string())
            .expect("seed malformed value");
        assert_eq!(cache.load_dates(&scope()), vec![None, None, None]);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn grades_round_trip_coerces_index_keys() {
        let ws = temp_workspace();
        let mut cache = Cache::open(&ws).expect("open cache");
        let mut grades = GradesState::new();
        grades.entry("s1".to_string()).or_default().insert(
            2,
            vec!["done".to_string(), "late".to_string()],
        );
        cache.save_grades(&scope(), &grades).expect("save grades");

        let raw = cache.get("grades_t1_Grades 5-6").expect("raw entry");
        // Serialized form uses string index keys.
        assert!(raw.contains("\"2\""));

        let reloaded = Cache::open(&ws).expect("reopen cache");
        assert_eq!(reloaded.load_grades(&scope()), grades);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn notes_default_empty_and_store_raw() {
        let ws = temp_workspace();
        let mut cache = Cache::open(&ws).expect("open cache");
        assert_eq!(cache.load_notes(&scope()), "");
        cache
            .save_notes(&scope(), "bring worksheets")
            .expect("save notes");
        assert_eq!(cache.load_notes(&scope()), "bring worksheets");
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn remove_teacher_clears_all_derived_keys() {
        let ws = temp_workspace();
        let mut cache = Cache::open(&ws).expect("open cache");
        cache
            .save_notes(&Scope::new("t1", "Grades 5-6"), "a")
            .expect("notes 5-6");
        cache
            .save_notes(&Scope::new("t1", "Grades 7-8"), "b")
            .expect("notes 7-8");
        cache
            .save_notes(&Scope::new("t2", "Grades 5-6"), "keep")
            .expect("notes other teacher");
        cache
            .save_students(
                "t1",
                &[Student {
                    id: "s1".to_string(),
                    name: "A".to_string(),
                    proficiency_level: "Grades 5-6".to_string(),
                    class_name: None,
                }],
            )
            .expect("students");

        cache.remove_teacher("t1").expect("remove teacher");
        assert_eq!(cache.load_notes(&Scope::new("t1", "Grades 5-6")), "");
        assert_eq!(cache.load_notes(&Scope::new("t1", "Grades 7-8")), "");
        assert!(cache.load_students("t1").is_empty());
        assert_eq!(cache.load_notes(&Scope::new("t2", "Grades 5-6")), "keep");
        let _ = std::fs::remove_dir_all(ws);
    }
}
