use crate::db;
use crate::import::execute::{DEFAULT_LINK_SEPARATOR, DEFAULT_MAX_REPORTED_FAILURES};
use crate::import::{ExecutorOptions, ImportMode};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Imports,
}

impl SetupSection {
    const ALL: [SetupSection; 1] = [Self::Imports];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "imports" => Some(Self::Imports),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Imports => "imports",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Imports => "setup.imports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Imports => json!({
            "maxReportedFailures": DEFAULT_MAX_REPORTED_FAILURES,
            "linkSeparator": DEFAULT_LINK_SEPARATOR.to_string(),
            "defaultMode": ImportMode::Create.as_str()
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Imports => match k.as_str() {
                "maxReportedFailures" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 500)?));
                }
                "linkSeparator" => {
                    let s = parse_string_max(v, k, 4)?;
                    if s.chars().count() != 1 || s.starts_with(',') {
                        return Err("linkSeparator must be a single character other than ','".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "defaultMode" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(mode) = ImportMode::parse(&s) else {
                        return Err("defaultMode must be one of: create, update".into());
                    };
                    obj.insert(k.clone(), Value::String(mode.as_str().to_string()));
                }
                _ => return Err(format!("unknown {} field: {}", section.name(), k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults, key by key.
            for (k, v) in saved_obj {
                let single = Map::from_iter([(k.clone(), v.clone())]);
                let _ = merge_section_patch(section, &mut current, &single);
            }
        }
    }
    Ok(current)
}

/// Workspace import settings merged over built-in defaults.
#[derive(Debug, Clone, Copy)]
pub struct ImportSettings {
    pub options: ExecutorOptions,
    pub default_mode: ImportMode,
}

pub fn import_settings(conn: &rusqlite::Connection) -> anyhow::Result<ImportSettings> {
    let section = load_section(conn, SetupSection::Imports)?;
    let max_reported_failures = section
        .get("maxReportedFailures")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_REPORTED_FAILURES);
    let link_separator = section
        .get("linkSeparator")
        .and_then(Value::as_str)
        .and_then(|s| s.chars().next())
        .unwrap_or(DEFAULT_LINK_SEPARATOR);
    let default_mode = section
        .get("defaultMode")
        .and_then(Value::as_str)
        .and_then(ImportMode::parse)
        .unwrap_or(ImportMode::Create);
    Ok(ImportSettings {
        options: ExecutorOptions {
            max_reported_failures,
            link_separator,
        },
        default_mode,
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_are_validated_per_key() {
        let mut current = default_section(SetupSection::Imports);
        let patch = json!({ "maxReportedFailures": 50, "linkSeparator": "|", "defaultMode": "UPDATE" });
        merge_section_patch(SetupSection::Imports, &mut current, patch.as_object().expect("obj"))
            .expect("valid patch");
        assert_eq!(current["maxReportedFailures"], json!(50));
        assert_eq!(current["linkSeparator"], json!("|"));
        assert_eq!(current["defaultMode"], json!("update"));

        for bad in [
            json!({ "maxReportedFailures": 0 }),
            json!({ "linkSeparator": ";;" }),
            json!({ "linkSeparator": "," }),
            json!({ "defaultMode": "merge" }),
            json!({ "colour": "blue" }),
        ] {
            let mut c = default_section(SetupSection::Imports);
            assert!(
                merge_section_patch(SetupSection::Imports, &mut c, bad.as_object().expect("obj")).is_err(),
                "{bad}"
            );
        }
    }

    #[test]
    fn saved_settings_feed_executor_options() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("init");
        let defaults = import_settings(&conn).expect("defaults");
        assert_eq!(defaults.options, ExecutorOptions::default());
        assert_eq!(defaults.default_mode, ImportMode::Create);

        db::settings_set_json(
            &conn,
            "setup.imports",
            &json!({ "maxReportedFailures": 3, "linkSeparator": "|", "defaultMode": "bogus" }),
        )
        .expect("save");
        let saved = import_settings(&conn).expect("saved");
        assert_eq!(saved.options.max_reported_failures, 3);
        assert_eq!(saved.options.link_separator, '|');
        assert_eq!(saved.default_mode, ImportMode::Create);
    }
}
