use crate::cache::Cache;
use crate::db::SqliteRemote;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{is_grade_symbol, Scope};
use crate::session::SessionContext;
use crate::sync::GroupSession;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use std::collections::HashMap;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn scope_from_params(params: &serde_json::Value) -> Result<Scope, HandlerErr> {
    let teacher_id = params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing teacherId"))?;
    let group_title = params
        .get("groupTitle")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing groupTitle"))?;
    Ok(Scope::new(teacher_id, group_title))
}

/// Group mutations are rejected before any cache or remote write unless
/// the session is a teacher editing their own group.
fn require_editor(session: &SessionContext, scope: &Scope) -> Result<(), HandlerErr> {
    if !session.is_teacher() {
        return Err(HandlerErr::new("forbidden", "teacher access required"));
    }
    if session.owned_teacher_id() != Some(scope.teacher_id.as_str()) {
        return Err(HandlerErr::new(
            "forbidden",
            "you can only edit your own groups",
        ));
    }
    Ok(())
}

/// Accepts RFC 3339 or a plain `YYYY-MM-DD` (midnight UTC); null or empty
/// clears the slot.
fn parse_date_param(value: Option<&serde_json::Value>) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    let Some(value) = value else { return Ok(None) };
    if value.is_null() {
        return Ok(None);
    }
    let Some(raw) = value.as_str() else {
        return Err(HandlerErr::new("bad_params", "value must be string or null"));
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let Some(midnight) = day.and_hms_opt(0, 0, 0) else {
            return Err(HandlerErr::new("bad_params", "invalid date"));
        };
        return Ok(Some(DateTime::from_naive_utc_and_offset(midnight, Utc)));
    }
    Err(HandlerErr::new(
        "bad_params",
        "value must be RFC 3339 or YYYY-MM-DD",
    ))
}

fn view_state_json(view: &mut GroupSession) -> serde_json::Value {
    let dates: Vec<serde_json::Value> = view
        .dates()
        .iter()
        .map(|slot| match slot {
            Some(d) => json!(d.to_rfc3339()),
            None => serde_json::Value::Null,
        })
        .collect();
    let grades = serde_json::to_value(view.grades()).unwrap_or_else(|_| json!({}));
    let notes = view.notes().to_string();
    let notices = view.take_notices();
    json!({
        "dates": dates,
        "grades": grades,
        "notes": notes,
        "notices": notices
    })
}

struct GroupCtx<'a> {
    cache: &'a mut Cache,
    remote: &'a SqliteRemote,
    views: &'a mut HashMap<String, GroupSession>,
    session: &'a SessionContext,
}

fn split_state<'a>(state: &'a mut AppState, req: &Request) -> Result<GroupCtx<'a>, serde_json::Value> {
    let AppState {
        cache,
        remote,
        views,
        session,
        ..
    } = state;
    let (Some(cache), Some(remote)) = (cache.as_mut(), remote.as_ref()) else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Ok(GroupCtx {
        cache,
        remote,
        views,
        session,
    })
}

fn handle_group_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    // Re-opening tears the old view down first so its channels do not
    // leak.
    if let Some(mut old) = ctx.views.remove(&scope.view_key()) {
        old.close(ctx.remote);
    }

    let mut view = match GroupSession::open(scope.clone(), ctx.cache, ctx.remote) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "open_failed", e.to_string(), None),
    };
    let result = view_state_json(&mut view);
    ctx.views.insert(scope.view_key(), view);
    ok(&req.id, result)
}

fn handle_group_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(view) = state.views.get_mut(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };
    ok(&req.id, view_state_json(view))
}

fn handle_group_set_date(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let idx = match req.params.get("dateIdx").and_then(|v| v.as_u64()) {
        Some(v) => v as usize,
        None => return err(&req.id, "bad_params", "missing dateIdx", None),
    };
    let value = match parse_date_param(req.params.get("value")) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = require_editor(ctx.session, &scope) {
        return e.response(&req.id);
    }
    let Some(view) = ctx.views.get_mut(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };
    if idx >= view.dates().len() {
        return err(&req.id, "bad_params", "dateIdx out of range", None);
    }
    if let Err(e) = view.set_date(idx, value, ctx.cache, ctx.remote) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }
    ok(&req.id, view_state_json(view))
}

fn handle_group_add_date(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = require_editor(ctx.session, &scope) {
        return e.response(&req.id);
    }
    let Some(view) = ctx.views.get_mut(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };
    if let Err(e) = view.add_date(ctx.cache, ctx.remote) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }
    ok(&req.id, view_state_json(view))
}

fn handle_group_toggle_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let idx = match req.params.get("dateIdx").and_then(|v| v.as_u64()) {
        Some(v) => v as usize,
        None => return err(&req.id, "bad_params", "missing dateIdx", None),
    };
    let symbol = match req.params.get("value").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing value", None),
    };
    if !is_grade_symbol(&symbol) {
        return err(
            &req.id,
            "bad_params",
            format!("unknown grade symbol: {}", symbol),
            None,
        );
    }
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = require_editor(ctx.session, &scope) {
        return e.response(&req.id);
    }
    let Some(view) = ctx.views.get_mut(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };
    if idx >= view.dates().len() {
        return err(&req.id, "bad_params", "dateIdx out of range", None);
    }
    if let Err(e) = view.toggle_grade(&student_id, idx, &symbol, ctx.cache, ctx.remote) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }
    ok(&req.id, view_state_json(view))
}

fn handle_group_set_notes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let notes = match req.params.get("notes").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing notes", None),
    };
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = require_editor(ctx.session, &scope) {
        return e.response(&req.id);
    }
    let Some(view) = ctx.views.get_mut(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };
    if let Err(e) = view.set_notes(&notes, ctx.cache, ctx.remote) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }
    ok(&req.id, view_state_json(view))
}

fn handle_group_reset_grades(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = require_editor(ctx.session, &scope) {
        return e.response(&req.id);
    }
    let Some(view) = ctx.views.get_mut(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };

    // The scope's students: roster entries assigned to this group, plus
    // any id that still has marks in memory (covers a stale roster cache).
    let mut student_ids: Vec<String> = ctx
        .cache
        .load_students(&scope.teacher_id)
        .into_iter()
        .filter(|s| s.proficiency_level == scope.group_title)
        .map(|s| s.id)
        .collect();
    for id in view.grades().keys() {
        if !student_ids.contains(id) {
            student_ids.push(id.clone());
        }
    }

    if let Err(e) = view.reset_grades(&student_ids, ctx.cache, ctx.remote) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }
    ok(&req.id, view_state_json(view))
}

fn handle_group_poll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(view) = ctx.views.get_mut(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };
    if let Err(e) = view.poll(ctx.cache, ctx.remote) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }
    ok(&req.id, view_state_json(view))
}

fn handle_group_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scope = match scope_from_params(&req.params) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let ctx = match split_state(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(mut view) = ctx.views.remove(&scope.view_key()) else {
        return err(&req.id, "view_not_open", "open the group first", None);
    };
    view.close(ctx.remote);
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "group.open" => Some(handle_group_open(state, req)),
        "group.state" => Some(handle_group_state(state, req)),
        "group.setDate" => Some(handle_group_set_date(state, req)),
        "group.addDate" => Some(handle_group_add_date(state, req)),
        "group.toggleGrade" => Some(handle_group_toggle_grade(state, req)),
        "group.setNotes" => Some(handle_group_set_notes(state, req)),
        "group.resetGrades" => Some(handle_group_reset_grades(state, req)),
        "group.poll" => Some(handle_group_poll(state, req)),
        "group.close" => Some(handle_group_close(state, req)),
        _ => None,
    }
}
