use crate::db;
use crate::import::schema::{schema_for, EntityKind, ImportSchema};
use crate::import::template::{export_entities, template_csv};
use crate::import::{ImportError, ImportMode, ImportSession};
use crate::ipc::error::{err, get_optional_str, get_required_str, ok, HandlerErr};
use crate::ipc::handlers::setup::import_settings;
use crate::ipc::types::{AppState, Request};
use crate::store::{Fields, RecordStore, SqliteStore};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_HISTORY_LIMIT: usize = 20;

fn import_err(e: ImportError) -> HandlerErr {
    let details = match &e {
        ImportError::InvalidTransition { from, .. } => Some(json!({ "step": from })),
        ImportError::ValidationBlocked { errors } => Some(json!({ "errorCount": errors })),
        ImportError::UnknownEntity(entity) => Some(json!({ "entityType": entity })),
        _ => None,
    };
    HandlerErr {
        code: e.code(),
        message: e.to_string(),
        details,
    }
}

fn no_workspace() -> HandlerErr {
    HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    }
}

fn no_session() -> HandlerErr {
    HandlerErr {
        code: "no_session",
        message: "open an import session first".to_string(),
        details: None,
    }
}

fn schema_param(params: &Value) -> Result<&'static ImportSchema, HandlerErr> {
    let entity_type = get_required_str(params, "entityType")?;
    schema_for(&entity_type).ok_or_else(|| import_err(ImportError::UnknownEntity(entity_type)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr {
        code: "internal",
        message: e.to_string(),
        details: None,
    })
}

fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| HandlerErr {
            code: "export_failed",
            message: e.to_string(),
            details: Some(json!({ "path": path })),
        })?;
    }
    std::fs::write(&out, contents).map_err(|e| HandlerErr {
        code: "export_failed",
        message: e.to_string(),
        details: Some(json!({ "path": path })),
    })?;
    Ok(())
}

/// Returns the CSV inline, or writes it to `outPath` when given.
fn csv_result(entity: EntityKind, suffix: &str, csv: String, params: &Value) -> Result<Value, HandlerErr> {
    let file_name = format!("{}_{}.csv", entity.as_str(), suffix);
    match get_optional_str(params, "outPath") {
        Some(out_path) => {
            write_text_file(&out_path, &csv)?;
            Ok(json!({ "fileName": file_name, "path": out_path, "bytes": csv.len() }))
        }
        None => Ok(json!({ "fileName": file_name, "csv": csv })),
    }
}

fn handle_imports_schemas(_state: &mut AppState, req: &Request) -> Value {
    let schemas = EntityKind::ALL
        .iter()
        .map(|k| to_json(k.schema()))
        .collect::<Result<Vec<_>, _>>();
    match schemas {
        Ok(schemas) => ok(&req.id, json!({ "schemas": schemas })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_imports_schema(_state: &mut AppState, req: &Request) -> Value {
    let schema = match schema_param(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match to_json(schema) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_imports_template(_state: &mut AppState, req: &Request) -> Value {
    let schema = match schema_param(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let csv = match template_csv(schema) {
        Ok(v) => v,
        Err(e) => return import_err(e).response(&req.id),
    };
    match csv_result(schema.entity, "template", csv, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_imports_export(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace().response(&req.id);
    };
    let schema = match schema_param(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let settings = match import_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let store = SqliteStore::new(conn);
    let csv = match export_entities(schema, &store, settings.options.link_separator) {
        Ok(v) => v,
        Err(e) => return import_err(e).response(&req.id),
    };
    match csv_result(schema.entity, "export", csv, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn session_response(id: &str, session: &ImportSession) -> Value {
    match to_json(&session.view()) {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

fn handle_imports_open(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace().response(&req.id);
    };
    let entity_type = match get_required_str(&req.params, "entityType") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let settings = match import_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mode = match get_optional_str(&req.params, "mode") {
        Some(raw) => match ImportMode::parse(&raw) {
            Some(m) => m,
            None => return err(&req.id, "bad_params", "mode must be one of: create, update", None),
        },
        None => settings.default_mode,
    };

    let store = SqliteStore::new(conn);
    match ImportSession::open(&entity_type, mode, settings.options, &store) {
        Ok(session) => session_response(&req.id, state.session.insert(session)),
        Err(e) => import_err(e).response(&req.id),
    }
}

fn read_source(params: &Value) -> Result<(Option<String>, Vec<u8>), HandlerErr> {
    if let Some(text) = params.get("text").and_then(|v| v.as_str()) {
        return Ok((get_optional_str(params, "fileName"), text.as_bytes().to_vec()));
    }
    let in_path = get_required_str(params, "inPath")
        .map_err(|_| HandlerErr::bad_params("missing text or inPath"))?;
    let bytes = std::fs::read(&in_path).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "path": in_path })),
    })?;
    let name = get_optional_str(params, "fileName").or_else(|| {
        Path::new(&in_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    });
    Ok((name, bytes))
}

fn handle_imports_load(state: &mut AppState, req: &Request) -> Value {
    let Some(session) = state.session.as_mut() else {
        return no_session().response(&req.id);
    };
    let (name, bytes) = match read_source(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match session.load(name.as_deref(), &bytes) {
        Ok(()) => session_response(&req.id, session),
        Err(e) => import_err(e).response(&req.id),
    }
}

fn handle_imports_discard(state: &mut AppState, req: &Request) -> Value {
    let Some(session) = state.session.as_mut() else {
        return no_session().response(&req.id);
    };
    match session.discard() {
        Ok(()) => session_response(&req.id, session),
        Err(e) => import_err(e).response(&req.id),
    }
}

fn record_run(conn: &Connection, session: &ImportSession) -> Option<String> {
    let outcome = session.outcome()?;
    let source = session.source();
    let run = db::ImportRun {
        entity_type: session.schema().entity.as_str(),
        mode: session.mode().as_str(),
        source_name: source.and_then(|s| s.name.as_deref()),
        source_sha256: source.map(|s| s.sha256.as_str()).unwrap_or_default(),
        rows_total: session.report().rows_total,
        created: outcome.created,
        updated: outcome.updated,
        skipped: outcome.skipped,
        failed: outcome.failed,
        links_created: outcome.links_created,
    };
    match db::record_import_run(conn, &run) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "import run not recorded");
            None
        }
    }
}

fn handle_imports_execute(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace().response(&req.id);
    };
    let Some(session) = state.session.as_mut() else {
        return no_session().response(&req.id);
    };

    let mut store = SqliteStore::new(conn);
    let result = session.execute(&mut store, |event| {
        debug!(
            completed = event.completed,
            total = event.total,
            percent = event.percent,
            key = %event.key,
            status = ?event.status,
            "import progress"
        );
    });
    if let Err(e) = result {
        return import_err(e).response(&req.id);
    }

    let run_id = record_run(conn, session);
    match to_json(&session.view()) {
        Ok(view) => ok(&req.id, json!({ "runId": run_id, "session": view })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_imports_status(state: &mut AppState, req: &Request) -> Value {
    match state.session.as_ref() {
        Some(session) => session_response(&req.id, session),
        None => no_session().response(&req.id),
    }
}

fn handle_imports_close(state: &mut AppState, req: &Request) -> Value {
    let closed = state.session.take().is_some();
    ok(&req.id, json!({ "closed": closed }))
}

fn handle_imports_history(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace().response(&req.id);
    };
    let entity = match get_optional_str(&req.params, "entityType") {
        Some(raw) => match EntityKind::parse(&raw) {
            Some(k) => Some(k),
            None => return import_err(ImportError::UnknownEntity(raw)).response(&req.id),
        },
        None => None,
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|n| n.clamp(1, 500) as usize)
        .unwrap_or(DEFAULT_HISTORY_LIMIT);
    match db::list_import_runs(conn, entity.map(EntityKind::as_str), limit) {
        Ok(runs) => ok(&req.id, json!({ "runs": runs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_records_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace().response(&req.id);
    };
    let schema = match schema_param(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let store = SqliteStore::new(conn);
    match store.query(schema.table, &Fields::new()) {
        Ok(records) => {
            let rows = records
                .into_iter()
                .map(|r| {
                    let mut obj = r.fields;
                    obj.insert("id".to_string(), Value::String(r.id));
                    Value::Object(obj)
                })
                .collect::<Vec<_>>();
            ok(&req.id, json!({ "entityType": schema.entity.as_str(), "records": rows }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "imports.schemas" => Some(handle_imports_schemas(state, req)),
        "imports.schema" => Some(handle_imports_schema(state, req)),
        "imports.template" => Some(handle_imports_template(state, req)),
        "imports.export" => Some(handle_imports_export(state, req)),
        "imports.open" => Some(handle_imports_open(state, req)),
        "imports.load" => Some(handle_imports_load(state, req)),
        "imports.discard" => Some(handle_imports_discard(state, req)),
        "imports.execute" => Some(handle_imports_execute(state, req)),
        "imports.status" => Some(handle_imports_status(state, req)),
        "imports.close" => Some(handle_imports_close(state, req)),
        "imports.history" => Some(handle_imports_history(state, req)),
        "records.list" => Some(handle_records_list(state, req)),
        _ => None,
    }
}
