use crate::cache::Cache;
use crate::merge;
use crate::model::{day_key, GradesState, Scope, TrackedDates};
use crate::remote::{ChangeEvent, RemoteStore, Subscription, Table};
use chrono::{DateTime, Utc};

/// One open group view. Owns the in-memory state the UI renders and keeps
/// it consistent with the local cache (synchronous write-through) and the
/// remote store (one asynchronous-style push per mutation, one pull attempt
/// at mount, subscription-driven refresh afterwards).
///
/// Remote failures never block a local edit: the edit lands in memory and
/// cache, and the failure is queued as a user-facing notice. There is no
/// retry loop; the next successful push or pull reconciles, or nothing
/// does until the user acts again.
pub struct GroupSession {
    scope: Scope,
    dates: TrackedDates,
    grades: GradesState,
    notes: String,
    notices: Vec<String>,
    dates_feed: Option<Subscription>,
    grades_feed: Option<Subscription>,
    notes_feed: Option<Subscription>,
}

impl GroupSession {
    /// Mount: cache first (instant render), then a single remote pull per
    /// aspect. Each successful pull merges into memory and re-writes the
    /// cache; each failure leaves the cache values authoritative.
    pub fn open(
        scope: Scope,
        cache: &mut Cache,
        remote: &dyn RemoteStore,
    ) -> anyhow::Result<GroupSession> {
        let mut session = GroupSession {
            dates: cache.load_dates(&scope),
            grades: cache.load_grades(&scope),
            notes: cache.load_notes(&scope),
            scope,
            notices: Vec::new(),
            dates_feed: None,
            grades_feed: None,
            notes_feed: None,
        };

        match remote.fetch_dates(&session.scope) {
            Ok(Some(dates)) if !dates.is_empty() => {
                session.dates = dates;
                cache.save_dates(&session.scope, &session.dates)?;
            }
            Ok(_) => {}
            Err(_) => session.notice("Failed to fetch dates from the server"),
        }

        session.pull_grades(cache, remote)?;

        match remote.fetch_notes(&session.scope) {
            Ok(Some(notes)) => {
                session.notes = notes;
                cache.save_notes(&session.scope, &session.notes)?;
            }
            Ok(None) => {}
            Err(_) => session.notice("Failed to fetch notes from the server"),
        }

        session.dates_feed =
            Some(remote.subscribe(Table::ClassDates, Some(&session.scope.teacher_id)));
        session.notes_feed =
            Some(remote.subscribe(Table::TeacherNotes, Some(&session.scope.teacher_id)));
        // The grades feed is deliberately unfiltered; every grade change
        // system-wide triggers a full re-pull on the next poll.
        session.grades_feed = Some(remote.subscribe(Table::Grades, None));

        Ok(session)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn dates(&self) -> &TrackedDates {
        &self.dates
    }

    pub fn grades(&self) -> &GradesState {
        &self.grades
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    fn notice(&mut self, message: &str) {
        self.notices.push(message.to_string());
    }

    /// Set or clear one date slot. The slot keeps its index, so marks
    /// recorded at this index now refer to the new date; that is the
    /// documented meaning of a slot edit, not an accident.
    pub fn set_date(
        &mut self,
        idx: usize,
        value: Option<DateTime<Utc>>,
        cache: &mut Cache,
        remote: &dyn RemoteStore,
    ) -> anyhow::Result<()> {
        if idx >= self.dates.len() {
            anyhow::bail!("date slot {} out of range", idx);
        }
        self.dates[idx] = value;
        cache.save_dates(&self.scope, &self.dates)?;
        if remote.upsert_dates(&self.scope, &self.dates).is_err() {
            self.notice("Failed to sync dates with the server");
        }
        Ok(())
    }

    /// Append one empty slot. Slots are never truncated.
    pub fn add_date(&mut self, cache: &mut Cache, remote: &dyn RemoteStore) -> anyhow::Result<()> {
        self.dates.push(None);
        cache.save_dates(&self.scope, &self.dates)?;
        if remote.upsert_dates(&self.scope, &self.dates).is_err() {
            self.notice("Failed to sync dates with the server");
        }
        Ok(())
    }

    pub fn toggle_grade(
        &mut self,
        student_id: &str,
        date_idx: usize,
        symbol: &str,
        cache: &mut Cache,
        remote: &dyn RemoteStore,
    ) -> anyhow::Result<()> {
        merge::toggle(&mut self.grades, student_id, date_idx, symbol);
        cache.save_grades(&self.scope, &self.grades)?;
        self.push_grades(remote);
        Ok(())
    }

    fn push_grades(&mut self, remote: &dyn RemoteStore) {
        let rows = merge::push_rows(&self.dates, &self.grades);
        if !rows.is_empty() && remote.upsert_grades(&rows).is_err() {
            self.notice("Failed to sync grades with the server");
        }
    }

    pub fn set_notes(
        &mut self,
        notes: &str,
        cache: &mut Cache,
        remote: &dyn RemoteStore,
    ) -> anyhow::Result<()> {
        self.notes = notes.to_string();
        cache.save_notes(&self.scope, &self.notes)?;
        if remote.upsert_notes(&self.scope, &self.notes).is_err() {
            self.notice("Failed to sync notes with the server");
        }
        Ok(())
    }

    /// Clear every grade mark for the scope; dates and notes stay as they
    /// are. Remote rows for the given students and the currently tracked
    /// days are deleted explicitly so a later pull cannot resurrect them.
    pub fn reset_grades(
        &mut self,
        student_ids: &[String],
        cache: &mut Cache,
        remote: &dyn RemoteStore,
    ) -> anyhow::Result<()> {
        self.grades.clear();
        cache.save_grades(&self.scope, &self.grades)?;
        let days: Vec<String> = self
            .dates
            .iter()
            .filter_map(|slot| slot.as_ref().map(day_key))
            .collect();
        if remote.delete_grades(student_ids, &days).is_err() {
            self.notice("Failed to clear grades on the server");
        }
        Ok(())
    }

    /// Drop all local marks keyed by a deleted student. Remote grade rows
    /// are not cascaded; that cleanup is not this session's contract.
    pub fn drop_student(&mut self, student_id: &str, cache: &mut Cache) -> anyhow::Result<()> {
        self.grades.remove(student_id);
        cache.save_grades(&self.scope, &self.grades)
    }

    /// Drain pending change events and re-pull whatever they touched:
    /// dates and notes are scoped re-fetches, grades a full re-pull merged
    /// as a sparse overlay.
    pub fn poll(&mut self, cache: &mut Cache, remote: &dyn RemoteStore) -> anyhow::Result<()> {
        let mut refresh_dates = false;
        let mut refresh_notes = false;
        let mut refresh_grades = false;

        if let Some(feed) = &self.dates_feed {
            while let Ok(event) = feed.events.try_recv() {
                if self.event_matches_scope(&event, Table::ClassDates) {
                    refresh_dates = true;
                }
            }
        }
        if let Some(feed) = &self.notes_feed {
            while let Ok(event) = feed.events.try_recv() {
                if self.event_matches_scope(&event, Table::TeacherNotes) {
                    refresh_notes = true;
                }
            }
        }
        if let Some(feed) = &self.grades_feed {
            while feed.events.try_recv().is_ok() {
                refresh_grades = true;
            }
        }

        if refresh_dates {
            match remote.fetch_dates(&self.scope) {
                Ok(Some(dates)) => {
                    self.dates = dates;
                    cache.save_dates(&self.scope, &self.dates)?;
                }
                Ok(None) => {}
                Err(_) => self.notice("Failed to fetch dates from the server"),
            }
        }
        if refresh_grades {
            self.pull_grades(cache, remote)?;
        }
        if refresh_notes {
            match remote.fetch_notes(&self.scope) {
                Ok(Some(notes)) => {
                    self.notes = notes;
                    cache.save_notes(&self.scope, &self.notes)?;
                }
                Ok(None) => {}
                Err(_) => self.notice("Failed to fetch notes from the server"),
            }
        }
        Ok(())
    }

    /// The feed is already teacher-filtered at subscribe time; the check
    /// here narrows to this view's group and guards against misrouted
    /// events.
    fn event_matches_scope(&self, event: &ChangeEvent, table: Table) -> bool {
        event.table == table
            && event.teacher_id.as_deref() == Some(self.scope.teacher_id.as_str())
            && event.group_name.as_deref() == Some(self.scope.group_title.as_str())
    }

    fn pull_grades(&mut self, cache: &mut Cache, remote: &dyn RemoteStore) -> anyhow::Result<()> {
        match remote.fetch_all_grades() {
            Ok(rows) => {
                let incoming = merge::correlate(&self.dates, &rows);
                if !incoming.is_empty() {
                    merge::overlay(&mut self.grades, incoming);
                    cache.save_grades(&self.scope, &self.grades)?;
                }
                Ok(())
            }
            Err(_) => {
                self.notice("Failed to fetch grades from the server");
                Ok(())
            }
        }
    }

    /// Unmount: tear down every channel opened at mount. The session is
    /// dropped right after, so nothing can land on it afterwards.
    pub fn close(&mut self, remote: &dyn RemoteStore) {
        for feed in [
            self.dates_feed.take(),
            self.grades_feed.take(),
            self.notes_feed.take(),
        ]
        .into_iter()
        .flatten()
        {
            remote.unsubscribe(feed.id);
        }
    }
}
