use crate::model::{GradeRow, Role, Scope, Student, Teacher, TrackedDates};
use crate::remote::{ChangeEvent, RemoteStore, Subscription, SubscriptionId, Table};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::cell::RefCell;
use std::path::Path;
use std::sync::mpsc::{channel, Sender};

pub const DB_FILE: &str = "monitor.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    bootstrap_schema(&conn)?;
    Ok(conn)
}

fn bootstrap_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            user_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            proficiency_level TEXT NOT NULL,
            class_name TEXT,
            teacher_id TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_teacher ON students(teacher_id)",
        [],
    )?;

    // dates is a JSON array of nullable ISO-8601 strings; one row holds the
    // whole slot array for a scope.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_dates(
            teacher_id TEXT NOT NULL,
            group_name TEXT NOT NULL,
            dates TEXT NOT NULL,
            PRIMARY KEY(teacher_id, group_name)
        )",
        [],
    )?;

    // Keyed by date value, not slot index. The correlation back to slots
    // happens client-side at merge time.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            \"values\" TEXT NOT NULL,
            PRIMARY KEY(student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_date ON grades(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_notes(
            teacher_id TEXT NOT NULL,
            group_name TEXT NOT NULL,
            notes TEXT NOT NULL,
            PRIMARY KEY(teacher_id, group_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

struct Subscriber {
    id: SubscriptionId,
    table: Table,
    teacher_filter: Option<String>,
    sender: Sender<ChangeEvent>,
}

#[derive(Default)]
struct Subscribers {
    next_id: SubscriptionId,
    items: Vec<Subscriber>,
}

/// SQLite-backed remote store. One instance is shared by every open group
/// session in the process; mutations broadcast change events to all
/// matching subscriptions, the same fan-out the hosted backend's realtime
/// channels provide.
pub struct SqliteRemote {
    conn: Connection,
    subs: RefCell<Subscribers>,
}

impl SqliteRemote {
    pub fn open(workspace: &Path) -> anyhow::Result<SqliteRemote> {
        Ok(SqliteRemote {
            conn: open_db(workspace)?,
            subs: RefCell::new(Subscribers::default()),
        })
    }

    pub fn in_memory() -> anyhow::Result<SqliteRemote> {
        let conn = Connection::open_in_memory()?;
        bootstrap_schema(&conn)?;
        Ok(SqliteRemote {
            conn,
            subs: RefCell::new(Subscribers::default()),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn notify(&self, table: Table, teacher_id: Option<&str>, group_name: Option<&str>) {
        let mut subs = self.subs.borrow_mut();
        subs.items.retain(|sub| {
            if sub.table != table {
                return true;
            }
            if let (Some(filter), Some(tid)) = (sub.teacher_filter.as_deref(), teacher_id) {
                if filter != tid {
                    return true;
                }
            }
            let event = ChangeEvent {
                table,
                teacher_id: teacher_id.map(|s| s.to_string()),
                group_name: group_name.map(|s| s.to_string()),
            };
            // A failed send means the receiver is gone; prune the channel.
            sub.sender.send(event).is_ok()
        });
    }
}

fn dates_to_json(dates: &TrackedDates) -> anyhow::Result<String> {
    let stored: Vec<Option<String>> = dates
        .iter()
        .map(|slot| slot.as_ref().map(|d| d.to_rfc3339()))
        .collect();
    Ok(serde_json::to_string(&stored)?)
}

fn dates_from_json(raw: &str) -> anyhow::Result<TrackedDates> {
    let stored: Vec<Option<String>> =
        serde_json::from_str(raw).context("class_dates.dates is not a JSON array")?;
    Ok(stored
        .into_iter()
        .map(|slot| {
            slot.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            })
        })
        .collect())
}

impl RemoteStore for SqliteRemote {
    fn fetch_dates(&self, scope: &Scope) -> anyhow::Result<Option<TrackedDates>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT dates FROM class_dates WHERE teacher_id = ? AND group_name = ?",
                (&scope.teacher_id, &scope.group_title),
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(dates_from_json(&text)?)),
            None => Ok(None),
        }
    }

    fn upsert_dates(&self, scope: &Scope, dates: &TrackedDates) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO class_dates(teacher_id, group_name, dates)
             VALUES(?, ?, ?)
             ON CONFLICT(teacher_id, group_name) DO UPDATE SET
               dates = excluded.dates",
            (&scope.teacher_id, &scope.group_title, dates_to_json(dates)?),
        )?;
        self.notify(
            Table::ClassDates,
            Some(&scope.teacher_id),
            Some(&scope.group_title),
        );
        Ok(())
    }

    fn fetch_all_grades(&self) -> anyhow::Result<Vec<GradeRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT student_id, date, \"values\" FROM grades ORDER BY date ASC")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (student_id, date, values_raw) in rows {
            let values: Vec<String> = serde_json::from_str(&values_raw)
                .with_context(|| format!("grades.values malformed for {} {}", student_id, date))?;
            out.push(GradeRow {
                student_id,
                date,
                values,
            });
        }
        Ok(out)
    }

    fn upsert_grades(&self, rows: &[GradeRow]) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for row in rows {
            tx.execute(
                "INSERT INTO grades(student_id, date, \"values\")
                 VALUES(?, ?, ?)
                 ON CONFLICT(student_id, date) DO UPDATE SET
                   \"values\" = excluded.\"values\"",
                (
                    &row.student_id,
                    &row.date,
                    serde_json::to_string(&row.values)?,
                ),
            )?;
        }
        tx.commit()?;
        self.notify(Table::Grades, None, None);
        Ok(())
    }

    fn delete_grades(&self, student_ids: &[String], dates: &[String]) -> anyhow::Result<()> {
        if student_ids.is_empty() || dates.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for student_id in student_ids {
            for date in dates {
                tx.execute(
                    "DELETE FROM grades WHERE student_id = ? AND date = ?",
                    (student_id, date),
                )?;
            }
        }
        tx.commit()?;
        self.notify(Table::Grades, None, None);
        Ok(())
    }

    fn fetch_notes(&self, scope: &Scope) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT notes FROM teacher_notes WHERE teacher_id = ? AND group_name = ?",
                (&scope.teacher_id, &scope.group_title),
                |r| r.get(0),
            )
            .optional()?)
    }

    fn upsert_notes(&self, scope: &Scope, notes: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO teacher_notes(teacher_id, group_name, notes)
             VALUES(?, ?, ?)
             ON CONFLICT(teacher_id, group_name) DO UPDATE SET
               notes = excluded.notes",
            (&scope.teacher_id, &scope.group_title, notes),
        )?;
        self.notify(
            Table::TeacherNotes,
            Some(&scope.teacher_id),
            Some(&scope.group_title),
        );
        Ok(())
    }

    fn fetch_teachers(&self) -> anyhow::Result<Vec<Teacher>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, user_id FROM teachers ORDER BY name")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Teacher {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    user_id: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_teacher(&self, teacher: &Teacher) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO teachers(id, name, user_id) VALUES(?, ?, ?)",
            (&teacher.id, &teacher.name, &teacher.user_id),
        )?;
        self.notify(Table::Teachers, Some(&teacher.id), None);
        Ok(())
    }

    fn delete_teacher(&self, teacher_id: &str) -> anyhow::Result<()> {
        // Row-level only: grade rows for this teacher's students stay put.
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM students WHERE teacher_id = ?", [teacher_id])?;
        tx.execute("DELETE FROM teachers WHERE id = ?", [teacher_id])?;
        tx.execute("DELETE FROM class_dates WHERE teacher_id = ?", [teacher_id])?;
        tx.execute(
            "DELETE FROM teacher_notes WHERE teacher_id = ?",
            [teacher_id],
        )?;
        tx.commit()?;
        self.notify(Table::Teachers, Some(teacher_id), None);
        Ok(())
    }

    fn fetch_students(&self, teacher_id: &str) -> anyhow::Result<Vec<Student>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, proficiency_level, class_name
             FROM students WHERE teacher_id = ? ORDER BY name",
        )?;
        let rows = stmt
            .query_map([teacher_id], |r| {
                Ok(Student {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    proficiency_level: r.get(2)?,
                    class_name: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn upsert_student(&self, teacher_id: &str, student: &Student) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO students(id, name, proficiency_level, class_name, teacher_id)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               proficiency_level = excluded.proficiency_level,
               class_name = excluded.class_name",
            (
                &student.id,
                &student.name,
                &student.proficiency_level,
                &student.class_name,
                teacher_id,
            ),
        )?;
        self.notify(Table::Students, Some(teacher_id), None);
        Ok(())
    }

    fn delete_student(&self, student_id: &str) -> anyhow::Result<()> {
        let teacher_id: Option<String> = self
            .conn
            .query_row(
                "SELECT teacher_id FROM students WHERE id = ?",
                [student_id],
                |r| r.get(0),
            )
            .optional()?;
        self.conn
            .execute("DELETE FROM students WHERE id = ?", [student_id])?;
        self.notify(Table::Students, teacher_id.as_deref(), None);
        Ok(())
    }

    fn fetch_role(&self, user_id: &str) -> anyhow::Result<Option<Role>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT role FROM profiles WHERE id = ?", [user_id], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(raw.as_deref().and_then(Role::parse))
    }

    fn subscribe(&self, table: Table, teacher_filter: Option<&str>) -> Subscription {
        let (sender, events) = channel();
        let mut subs = self.subs.borrow_mut();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.items.push(Subscriber {
            id,
            table,
            teacher_filter: teacher_filter.map(|s| s.to_string()),
            sender,
        });
        Subscription { id, events }
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subs.borrow_mut().items.retain(|sub| sub.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scope() -> Scope {
        Scope::new("t1", "Grades 5-6")
    }

    #[test]
    fn dates_upsert_replaces_whole_array() {
        let remote = SqliteRemote::in_memory().expect("open in-memory remote");
        let first = vec![
            Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()),
            None,
            None,
        ];
        remote.upsert_dates(&scope(), &first).expect("first upsert");
        let second = vec![
            None,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
        ];
        remote
            .upsert_dates(&scope(), &second)
            .expect("second upsert");
        assert_eq!(remote.fetch_dates(&scope()).expect("fetch"), Some(second));
    }

    #[test]
    fn grade_upsert_replaces_symbol_set_per_student_day() {
        let remote = SqliteRemote::in_memory().expect("open in-memory remote");
        let row = |values: &[&str]| GradeRow {
            student_id: "s1".to_string(),
            date: "2024-01-10".to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        };
        remote.upsert_grades(&[row(&["done"])]).expect("first");
        remote
            .upsert_grades(&[row(&["absent", "late"])])
            .expect("second");
        let all = remote.fetch_all_grades().expect("fetch");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].values, vec!["absent", "late"]);
    }

    #[test]
    fn grades_fetch_is_unscoped_and_date_ordered() {
        let remote = SqliteRemote::in_memory().expect("open in-memory remote");
        remote
            .upsert_grades(&[
                GradeRow {
                    student_id: "other-teacher-student".to_string(),
                    date: "2024-03-01".to_string(),
                    values: vec!["late".to_string()],
                },
                GradeRow {
                    student_id: "s1".to_string(),
                    date: "2024-01-10".to_string(),
                    values: vec!["done".to_string()],
                },
            ])
            .expect("upsert");
        let all = remote.fetch_all_grades().expect("fetch");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].date, "2024-01-10");
        assert_eq!(all[1].student_id, "other-teacher-student");
    }

    #[test]
    fn subscriptions_filter_by_teacher_and_unsubscribe() {
        let remote = SqliteRemote::in_memory().expect("open in-memory remote");
        let mine = remote.subscribe(Table::TeacherNotes, Some("t1"));
        let other = remote.subscribe(Table::TeacherNotes, Some("t2"));
        let grades_feed = remote.subscribe(Table::Grades, None);

        remote.upsert_notes(&scope(), "hello").expect("notes");
        assert!(mine.events.try_recv().is_ok());
        assert!(other.events.try_recv().is_err());

        remote
            .upsert_grades(&[GradeRow {
                student_id: "s1".to_string(),
                date: "2024-01-10".to_string(),
                values: vec!["done".to_string()],
            }])
            .expect("grades");
        assert!(grades_feed.events.try_recv().is_ok());

        remote.unsubscribe(mine.id);
        remote.upsert_notes(&scope(), "again").expect("notes again");
        assert!(mine.events.try_recv().is_err());
    }

    #[test]
    fn delete_teacher_removes_dependent_rows_but_not_grades() {
        let remote = SqliteRemote::in_memory().expect("open in-memory remote");
        remote
            .insert_teacher(&Teacher {
                id: "t1".to_string(),
                name: "A".to_string(),
                user_id: None,
            })
            .expect("teacher");
        remote
            .upsert_student(
                "t1",
                &Student {
                    id: "s1".to_string(),
                    name: "S".to_string(),
                    proficiency_level: "Grades 5-6".to_string(),
                    class_name: None,
                },
            )
            .expect("student");
        remote
            .upsert_grades(&[GradeRow {
                student_id: "s1".to_string(),
                date: "2024-01-10".to_string(),
                values: vec!["done".to_string()],
            }])
            .expect("grade");

        remote.delete_teacher("t1").expect("delete");
        assert!(remote.fetch_teachers().expect("teachers").is_empty());
        assert!(remote.fetch_students("t1").expect("students").is_empty());
        // Grade rows are not cascaded.
        assert_eq!(remote.fetch_all_grades().expect("grades").len(), 1);
    }
}
