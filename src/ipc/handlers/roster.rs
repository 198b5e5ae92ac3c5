use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{Student, Teacher};
use crate::remote::RemoteStore;
use crate::session::SessionContext;
use serde_json::json;
use uuid::Uuid;

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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// Roster mutations require the session to be a teacher AND to own the
/// targeted teacher record. Rejection happens before any cache or remote
/// write so there is never a partial state change.
fn require_owner(session: &SessionContext, teacher_id: &str) -> Result<(), HandlerErr> {
    if !session.is_teacher() {
        return Err(HandlerErr::new("forbidden", "teacher access required"));
    }
    if session.owned_teacher_id() != Some(teacher_id) {
        return Err(HandlerErr::new(
            "forbidden",
            "you can only edit your own teacher record",
        ));
    }
    Ok(())
}

fn teacher_json(t: &Teacher) -> serde_json::Value {
    json!({ "id": t.id, "name": t.name, "userId": t.user_id })
}

fn student_json(s: &Student) -> serde_json::Value {
    json!({
        "id": s.id,
        "name": s.name,
        "proficiencyLevel": s.proficiency_level,
        "className": s.class_name
    })
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Remote first, cache as the fallback when the fetch fails — the list
    // is also re-written to cache on every successful fetch.
    if let Some(remote) = state.remote.as_ref() {
        match remote.fetch_teachers() {
            Ok(teachers) => {
                if let Some(cache) = state.cache.as_mut() {
                    if let Err(e) = cache.save_teachers(&teachers) {
                        return err(&req.id, "cache_write_failed", e.to_string(), None);
                    }
                }
                let list: Vec<_> = teachers.iter().map(teacher_json).collect();
                return ok(&req.id, json!({ "teachers": list }));
            }
            Err(_) => {
                let cached = state
                    .cache
                    .as_ref()
                    .map(|c| c.load_teachers())
                    .unwrap_or_default();
                let list: Vec<_> = cached.iter().map(teacher_json).collect();
                return ok(
                    &req.id,
                    json!({
                        "teachers": list,
                        "notices": ["Failed to fetch teachers"]
                    }),
                );
            }
        }
    }
    let cached = state
        .cache
        .as_ref()
        .map(|c| c.load_teachers())
        .unwrap_or_default();
    let list: Vec<_> = cached.iter().map(teacher_json).collect();
    ok(&req.id, json!({ "teachers": list }))
}

fn handle_teachers_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if !state.session.is_teacher() {
        return err(
            &req.id,
            "forbidden",
            "you need teacher access to add new teachers",
            None,
        );
    }
    // Each user manages exactly one teacher record.
    if state.session.owned_teacher_id().is_some() {
        return err(
            &req.id,
            "conflict",
            "you already have a teacher record",
            None,
        );
    }

    let teacher = Teacher {
        id: Uuid::new_v4().to_string(),
        name: name.clone(),
        user_id: state.session.user().map(|u| u.id.clone()),
    };

    if let Some(remote) = state.remote.as_ref() {
        if let Err(e) = remote.insert_teacher(&teacher) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            );
        }
    }
    if let Some(cache) = state.cache.as_mut() {
        let mut teachers = cache.load_teachers();
        teachers.push(teacher.clone());
        if let Err(e) = cache.save_teachers(&teachers) {
            return err(&req.id, "cache_write_failed", e.to_string(), None);
        }
    }
    state.session.set_owned_teacher(Some(teacher.id.clone()));

    ok(&req.id, json!({ "teacherId": teacher.id, "name": name }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_owner(&state.session, &teacher_id) {
        return e.response(&req.id);
    }

    if let Some(remote) = state.remote.as_ref() {
        if let Err(e) = remote.delete_teacher(&teacher_id) {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            );
        }
    }

    // Close any views opened on this teacher before dropping their state.
    let stale_keys: Vec<String> = state
        .views
        .iter()
        .filter(|(_, view)| view.scope().teacher_id == teacher_id)
        .map(|(key, _)| key.clone())
        .collect();
    for key in stale_keys {
        if let Some(mut view) = state.views.remove(&key) {
            if let Some(remote) = state.remote.as_ref() {
                view.close(remote);
            }
        }
    }

    // Remote cascade is not promised; the derived cache keys are ours to
    // clear.
    if let Some(cache) = state.cache.as_mut() {
        let mut teachers = cache.load_teachers();
        teachers.retain(|t| t.id != teacher_id);
        if let Err(e) = cache.save_teachers(&teachers) {
            return err(&req.id, "cache_write_failed", e.to_string(), None);
        }
        if let Err(e) = cache.remove_teacher(&teacher_id) {
            return err(&req.id, "cache_write_failed", e.to_string(), None);
        }
    }
    state.session.set_owned_teacher(None);

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Some(remote) = state.remote.as_ref() {
        match remote.fetch_students(&teacher_id) {
            Ok(students) => {
                if let Some(cache) = state.cache.as_mut() {
                    if let Err(e) = cache.save_students(&teacher_id, &students) {
                        return err(&req.id, "cache_write_failed", e.to_string(), None);
                    }
                }
                let list: Vec<_> = students.iter().map(student_json).collect();
                return ok(&req.id, json!({ "students": list }));
            }
            Err(_) => {
                let cached = state
                    .cache
                    .as_ref()
                    .map(|c| c.load_students(&teacher_id))
                    .unwrap_or_default();
                let list: Vec<_> = cached.iter().map(student_json).collect();
                return ok(
                    &req.id,
                    json!({
                        "students": list,
                        "notices": ["Failed to fetch students"]
                    }),
                );
            }
        }
    }
    let cached = state
        .cache
        .as_ref()
        .map(|c| c.load_students(&teacher_id))
        .unwrap_or_default();
    let list: Vec<_> = cached.iter().map(student_json).collect();
    ok(&req.id, json!({ "students": list }))
}

fn handle_students_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let proficiency_level = match get_required_str(&req.params, "proficiencyLevel") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_name = req
        .params
        .get("className")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Err(e) = require_owner(&state.session, &teacher_id) {
        return e.response(&req.id);
    }

    let student = Student {
        id: Uuid::new_v4().to_string(),
        name,
        proficiency_level,
        class_name,
    };

    if let Some(remote) = state.remote.as_ref() {
        if let Err(e) = remote.upsert_student(&teacher_id, &student) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    }
    if let Some(cache) = state.cache.as_mut() {
        let mut students = cache.load_students(&teacher_id);
        students.push(student.clone());
        if let Err(e) = cache.save_students(&teacher_id, &students) {
            return err(&req.id, "cache_write_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "student": student_json(&student) }))
}

fn handle_students_update_name(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_owner(&state.session, &teacher_id) {
        return e.response(&req.id);
    }

    let Some(cache) = state.cache.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut students = cache.load_students(&teacher_id);
    let Some(student) = students.iter_mut().find(|s| s.id == student_id) else {
        return err(&req.id, "not_found", "student not found", None);
    };
    student.name = name;
    let updated = student.clone();

    if let Some(remote) = state.remote.as_ref() {
        if let Err(e) = remote.upsert_student(&teacher_id, &updated) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    }
    if let Err(e) = cache.save_students(&teacher_id, &students) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "student": student_json(&updated) }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_owner(&state.session, &teacher_id) {
        return e.response(&req.id);
    }

    if let Some(remote) = state.remote.as_ref() {
        if let Err(e) = remote.delete_student(&student_id) {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    }

    let Some(cache) = state.cache.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut students = cache.load_students(&teacher_id);
    students.retain(|s| s.id != student_id);
    if let Err(e) = cache.save_students(&teacher_id, &students) {
        return err(&req.id, "cache_write_failed", e.to_string(), None);
    }

    // Deleting a student drops their local marks in every open view for
    // this teacher. Remote grade rows are not cascaded.
    for view in state.views.values_mut() {
        if view.scope().teacher_id == teacher_id {
            if let Err(e) = view.drop_student(&student_id, cache) {
                return err(&req.id, "cache_write_failed", e.to_string(), None);
            }
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.add" => Some(handle_teachers_add(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.add" => Some(handle_students_add(state, req)),
        "students.updateName" => Some(handle_students_update_name(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
