use crate::cache::Cache;
use crate::db::SqliteRemote;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::remote::RemoteStore;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(_state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "name": "monitord",
            "version": env!("CARGO_PKG_VERSION")
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match req.params.get("path").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => return err(&req.id, "bad_params", "missing path", None),
    };

    let cache = match Cache::open(&path) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "cache_open_failed", e.to_string(), None),
    };
    let remote = match SqliteRemote::open(&path) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_open_failed", e.to_string(), None),
    };

    // Views belong to the previous workspace; their subscriptions die with
    // the remote they were opened on.
    state.views.clear();
    state.cache = Some(cache);
    state.remote = Some(remote);
    state.workspace = Some(path.clone());

    ok(&req.id, json!({ "path": path.to_string_lossy() }))
}

fn handle_auth_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user_id = req.params.get("userId").and_then(|v| v.as_str());
    let password = req.params.get("password").and_then(|v| v.as_str());

    let remote = state.remote.as_ref().map(|r| r as &dyn RemoteStore);
    if !state.session.login(user_id, password, remote) {
        return err(&req.id, "auth_failed", "invalid credentials", None);
    }

    // Resolve the teacher record this user manages, if any.
    if let (Some(user), Some(remote)) = (state.session.user(), state.remote.as_ref()) {
        let user_id = user.id.clone();
        if let Ok(teachers) = remote.fetch_teachers() {
            let owned = teachers
                .iter()
                .find(|t| t.user_id.as_deref() == Some(user_id.as_str()))
                .map(|t| t.id.clone());
            state.session.set_owned_teacher(owned);
        }
    }

    ok(
        &req.id,
        json!({
            "role": state.session.role().as_str(),
            "ownedTeacherId": state.session.owned_teacher_id()
        }),
    )
}

fn handle_auth_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session.logout();
    ok(&req.id, json!({ "role": state.session.role().as_str() }))
}

fn handle_auth_session(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "role": state.session.role().as_str(),
            "userId": state.session.user().map(|u| u.id.clone()),
            "ownedTeacherId": state.session.owned_teacher_id()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "auth.login" => Some(handle_auth_login(state, req)),
        "auth.logout" => Some(handle_auth_logout(state, req)),
        "auth.session" => Some(handle_auth_session(state, req)),
        _ => None,
    }
}
