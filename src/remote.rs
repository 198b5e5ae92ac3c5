use crate::model::{GradeRow, Role, Scope, Student, Teacher, TrackedDates};
use std::sync::mpsc::Receiver;

/// Tables the remote store exposes change feeds for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    ClassDates,
    Grades,
    TeacherNotes,
    Teachers,
    Students,
}

/// One insert/update/delete notification. Carries just enough for a
/// subscriber to decide whether the change concerns its scope; the payload
/// itself is re-fetched, not pushed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: Table,
    pub teacher_id: Option<String>,
    pub group_name: Option<String>,
}

pub type SubscriptionId = u64;

/// An open change feed. Events queue up until the owner drains them; when
/// the subscription is dropped without unsubscribing, the store prunes the
/// dead channel on its next broadcast.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: Receiver<ChangeEvent>,
}

/// The hosted-backend seam. All operations may fail independently; callers
/// treat failures as non-fatal and surface them as user notices. Grade rows
/// are keyed by date value, unique on `(student_id, date)`; dates and notes
/// are unique on `(teacher_id, group_name)` and upserts replace the whole
/// value for that key.
pub trait RemoteStore {
    fn fetch_dates(&self, scope: &Scope) -> anyhow::Result<Option<TrackedDates>>;
    fn upsert_dates(&self, scope: &Scope, dates: &TrackedDates) -> anyhow::Result<()>;

    /// System-wide fetch, ordered by date ascending. Scope correlation is
    /// the caller's responsibility; see the merge module.
    fn fetch_all_grades(&self) -> anyhow::Result<Vec<GradeRow>>;
    fn upsert_grades(&self, rows: &[GradeRow]) -> anyhow::Result<()>;
    /// Row-level deletes for every (student, date) combination given. Used
    /// by group reset only; individual cleared marks leave their rows.
    fn delete_grades(&self, student_ids: &[String], dates: &[String]) -> anyhow::Result<()>;

    fn fetch_notes(&self, scope: &Scope) -> anyhow::Result<Option<String>>;
    fn upsert_notes(&self, scope: &Scope, notes: &str) -> anyhow::Result<()>;

    fn fetch_teachers(&self) -> anyhow::Result<Vec<Teacher>>;
    fn insert_teacher(&self, teacher: &Teacher) -> anyhow::Result<()>;
    /// Deletes the teacher row and its student rows. Grade rows and cache
    /// keys are not cascaded; the caller cleans those up.
    fn delete_teacher(&self, teacher_id: &str) -> anyhow::Result<()>;

    fn fetch_students(&self, teacher_id: &str) -> anyhow::Result<Vec<Student>>;
    fn upsert_student(&self, teacher_id: &str, student: &Student) -> anyhow::Result<()>;
    fn delete_student(&self, student_id: &str) -> anyhow::Result<()>;

    fn fetch_role(&self, user_id: &str) -> anyhow::Result<Option<Role>>;

    /// Open a change feed. `teacher_filter` is applied server-side; the
    /// grades feed is opened without one (every grade change, any teacher,
    /// is broadcast).
    fn subscribe(&self, table: Table, teacher_filter: Option<&str>) -> Subscription;
    fn unsubscribe(&self, id: SubscriptionId);
}
