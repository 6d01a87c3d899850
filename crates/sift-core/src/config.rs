//! Named TOML configurations and `dotted.path=value` overrides.
//!
//! A configuration is loaded into a JSON tree, overrides are written into the
//! tree, and only then is it deserialized into `RunParameters`. Normalization
//! (e.g. disabled dropout) happens later, at fingerprint time.

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use crate::domain::error::{CurationError, Result};
use crate::domain::params::RunParameters;

/// Load `<dir>/<name>.toml` as a JSON tree.
pub fn load_tree(dir: &Path, name: &str) -> Result<Value> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(CurationError::invalid("config", format!("bad config name '{name}'")));
    }
    let path = dir.join(format!("{name}.toml"));
    let text = fs::read_to_string(&path)
        .map_err(|e| CurationError::Config(format!("read {}: {e}", path.display())))?;
    parse_tree(&text)
}

/// Parse TOML text into a JSON tree.
pub fn parse_tree(text: &str) -> Result<Value> {
    let value: toml::Value = toml::from_str(text)?;
    Ok(serde_json::to_value(value)?)
}

/// One `path=value[,value...]` command-line override.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub path: String,
    pub values: Vec<Value>,
}

impl Override {
    pub fn parse(raw: &str) -> Result<Self> {
        let (path, rhs) = raw
            .split_once('=')
            .ok_or_else(|| CurationError::invalid("override", format!("expected key=value, got '{raw}'")))?;
        let path = path.trim();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(CurationError::invalid("override", format!("bad key in '{raw}'")));
        }
        let values: Vec<Value> = rhs.split(',').map(|v| parse_scalar(v.trim())).collect();
        Ok(Self {
            path: path.to_string(),
            values,
        })
    }

    /// More than one value: this override declares a sweep axis.
    pub fn is_sweep(&self) -> bool {
        self.values.len() > 1
    }
}

/// JSON scalar if `raw` parses as one, otherwise the raw string.
pub fn parse_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Null | Value::String(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

/// Write `value` at `path`, creating intermediate tables as needed.
pub fn set_path(tree: &mut Value, path: &str, value: Value) -> Result<()> {
    let mut node = tree;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        let map = match node {
            Value::Object(map) => map,
            _ => {
                return Err(CurationError::invalid(
                    "override",
                    format!("'{path}' descends into a non-table value at '{segment}'"),
                ))
            }
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        node = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(())
}

/// Deserialize a fully overridden tree.
pub fn resolve(tree: &Value) -> Result<RunParameters> {
    serde_json::from_value(tree.clone()).map_err(|e| CurationError::Config(e.to_string()))
}

/// Load `name` from `dir`, apply single-valued `overrides` and deserialize.
pub fn load(dir: &Path, name: &str, overrides: &[Override]) -> Result<RunParameters> {
    let mut tree = load_tree(dir, name)?;
    for o in overrides {
        if o.is_sweep() {
            return Err(CurationError::invalid(
                "override",
                format!("'{}' has several values; use a sweep", o.path),
            ));
        }
        set_path(&mut tree, &o.path, o.values[0].clone())?;
    }
    resolve(&tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: &str = r#"
name = "baseline"

[preproc]
dataset = "tuab"
source = "data/tuab.jsonl"

[training]
model_type = "centroid"
"#;

    #[test]
    fn test_parse_override_scalars() {
        let o = Override::parse("preproc.dropout_rate=0.5").unwrap();
        assert_eq!(o.path, "preproc.dropout_rate");
        assert_eq!(o.values, vec![json!(0.5)]);
        assert!(!o.is_sweep());

        assert_eq!(Override::parse("preproc.random_dropout=true").unwrap().values, vec![json!(true)]);
        assert_eq!(Override::parse("name=exp-1").unwrap().values, vec![json!("exp-1")]);
    }

    #[test]
    fn test_parse_sweep_axis() {
        let o = Override::parse("preproc.dropout_rate=0.3, 0.5,0.7").unwrap();
        assert!(o.is_sweep());
        assert_eq!(o.values, vec![json!(0.3), json!(0.5), json!(0.7)]);
    }

    #[test]
    fn test_bad_overrides() {
        for raw in ["no_equals", "=1", "a..b=1"] {
            assert!(matches!(
                Override::parse(raw),
                Err(CurationError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn test_set_path_creates_tables() {
        let mut tree = parse_tree(BASE).unwrap();
        set_path(&mut tree, "preproc.dropout_seed", json!(12)).unwrap();
        set_path(&mut tree, "curation.mode", json!("top_k_removed")).unwrap();
        assert_eq!(tree["preproc"]["dropout_seed"], json!(12));
        assert_eq!(tree["curation"]["mode"], json!("top_k_removed"));

        assert!(set_path(&mut tree, "name.inner", json!(1)).is_err());
    }

    #[test]
    fn test_load_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("baseline.toml"), BASE).unwrap();

        let overrides = [
            Override::parse("preproc.random_dropout=true").unwrap(),
            Override::parse("preproc.dropout_rate=0.5").unwrap(),
            Override::parse("preproc.dropout_seed=12").unwrap(),
        ];
        let params = load(dir.path(), "baseline", &overrides).unwrap();
        assert_eq!(params.name, "baseline");
        assert!(params.preproc.random_dropout);
        assert_eq!(params.preproc.dropout_rate, 0.5);
        assert_eq!(params.preproc.dropout_seed, 12);
        assert_eq!(params.scoring.passes, 10);
    }

    #[test]
    fn test_load_rejects_sweep_values_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("baseline.toml"), BASE).unwrap();
        let sweep = [Override::parse("preproc.dropout_rate=0.3,0.7").unwrap()];
        assert!(load(dir.path(), "baseline", &sweep).is_err());
        assert!(matches!(
            load(dir.path(), "missing", &[]),
            Err(CurationError::Config(_))
        ));
        assert!(load(dir.path(), "../baseline", &[]).is_err());
    }

    #[test]
    fn test_wrong_type_is_config_error() {
        let mut tree = parse_tree(BASE).unwrap();
        set_path(&mut tree, "scoring.passes", json!("many")).unwrap();
        assert!(matches!(resolve(&tree), Err(CurationError::Config(_))));
    }
}
