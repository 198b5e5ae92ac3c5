use crate::model::{day_key, GradeRow, GradesState, TrackedDates};

/// Find the slot whose calendar day matches the given day string.
/// Time-of-day on the tracked date is ignored. The first matching slot
/// wins, mirroring the position-based lookup the grade grid uses.
pub fn slot_for_day(dates: &TrackedDates, day: &str) -> Option<usize> {
    dates
        .iter()
        .position(|slot| slot.as_ref().map(|d| day_key(d) == day).unwrap_or(false))
}

/// Convert remote grade rows into the in-memory shape. Grades are stored
/// remotely by date value but used locally by slot index, so each row is
/// joined against the tracked dates; rows whose day no longer matches any
/// slot are stale churn and are dropped silently.
pub fn correlate(dates: &TrackedDates, rows: &[GradeRow]) -> GradesState {
    let mut out = GradesState::new();
    for row in rows {
        let Some(idx) = slot_for_day(dates, &row.date) else {
            continue;
        };
        out.entry(row.student_id.clone())
            .or_default()
            .insert(idx, row.values.clone());
    }
    out
}

/// Sparse overlay merge: entries present in `incoming` overwrite per
/// (student, slot); everything else is left untouched. A pull is never a
/// wholesale replace.
pub fn overlay(state: &mut GradesState, incoming: GradesState) {
    for (student_id, slots) in incoming {
        let entry = state.entry(student_id).or_default();
        for (idx, values) in slots {
            entry.insert(idx, values);
        }
    }
}

/// Toggle one symbol for (student, slot): present -> removed, absent ->
/// appended. Insertion order is preserved and duplicates never occur.
pub fn toggle(state: &mut GradesState, student_id: &str, date_idx: usize, symbol: &str) {
    let slots = state.entry(student_id.to_string()).or_default();
    let values = slots.entry(date_idx).or_default();
    if let Some(pos) = values.iter().position(|v| v == symbol) {
        values.remove(pos);
    } else {
        values.push(symbol.to_string());
    }
}

/// Build the rows to push remotely: one per (student, slot) with a
/// non-empty symbol set and a set date, keyed by the date's canonical day
/// string. Emptied sets produce no row; there is no tombstone, so a stale
/// remote row survives until the next pull re-imports it.
pub fn push_rows(dates: &TrackedDates, grades: &GradesState) -> Vec<GradeRow> {
    let mut rows = Vec::new();
    for (student_id, slots) in grades {
        for (idx, values) in slots {
            if values.is_empty() {
                continue;
            }
            let Some(Some(date)) = dates.get(*idx) else {
                continue;
            };
            rows.push(GradeRow {
                student_id: student_id.clone(),
                date: day_key(date),
                values: values.clone(),
            });
        }
    }
    rows
}
