use crate::backup;
use crate::cache::Cache;
use crate::db::SqliteRemote;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{day_key, Scope};
use serde_json::json;
use std::path::{Path, PathBuf};

fn get_required_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("missing {}", key))
}

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Flatten one group's tracked dates and marks into a CSV table: one row
/// per student on the cached roster, one column per date slot. Unset
/// slots get a positional header so columns stay aligned with indices.
fn handle_export_group_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let group_title = match get_required_str(&req.params, "groupTitle") {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let scope = Scope::new(teacher_id, group_title);

    let Some(cache) = state.cache.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let dates = cache.load_dates(&scope);
    let grades = cache.load_grades(&scope);
    let students: Vec<_> = cache
        .load_students(&scope.teacher_id)
        .into_iter()
        .filter(|s| s.proficiency_level == scope.group_title)
        .collect();

    let mut lines = Vec::new();
    let mut header = vec!["student".to_string()];
    for (idx, slot) in dates.iter().enumerate() {
        match slot {
            Some(d) => header.push(day_key(d)),
            None => header.push(format!("slot {}", idx + 1)),
        }
    }
    lines.push(header.join(","));

    let mut rows_exported = 0usize;
    for student in &students {
        let mut row = vec![csv_quote(&student.name)];
        let marks = grades.get(&student.id);
        for idx in 0..dates.len() {
            let cell = marks
                .and_then(|m| m.get(&idx))
                .map(|symbols| symbols.join(" "))
                .unwrap_or_default();
            row.push(csv_quote(&cell));
        }
        lines.push(row.join(","));
        rows_exported += 1;
    }

    let body = format!("{}\n", lines.join("\n"));
    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(&req.id, "export_failed", e.to_string(), None);
        }
    }
    if let Err(e) = std::fs::write(&out_path, body) {
        return err(&req.id, "export_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "rowsExported": rows_exported,
            "path": out_path.to_string_lossy()
        }),
    )
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "path": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "export_failed", e.to_string(), None),
    }
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match get_required_str(&req.params, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Drop every open handle on the workspace files before they are
    // replaced, then reopen on the imported data.
    state.views.clear();
    state.cache = None;
    state.remote = None;

    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "import_failed", e.to_string(), None),
    };

    match reopen_workspace(&workspace) {
        Ok((cache, remote)) => {
            state.cache = Some(cache);
            state.remote = Some(remote);
        }
        Err(e) => return err(&req.id, "import_failed", e.to_string(), None),
    }

    ok(
        &req.id,
        json!({ "bundleFormatDetected": summary.bundle_format_detected }),
    )
}

fn reopen_workspace(workspace: &Path) -> anyhow::Result<(Cache, SqliteRemote)> {
    let cache = Cache::open(workspace)?;
    let remote = SqliteRemote::open(workspace)?;
    Ok((cache, remote))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exchange.exportGroupCsv" => Some(handle_export_group_csv(state, req)),
        "backup.exportWorkspaceBundle" => Some(handle_export_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_bundle(state, req)),
        _ => None,
    }
}
