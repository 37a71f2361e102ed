//! Override-file loading and document merging.

use serde_yaml::Value;
use std::path::Path;

use crate::errors::ComposeError;

pub const OVERRIDE_FILE: &str = "docker-compose.override.yml";

/// Keys whose lists are concatenated (without duplicates) instead of replaced.
const APPEND_KEYS: &[&str] = &[
    "ports",
    "volumes",
    "env_file",
    "depends_on",
    "networks",
    "environment",
];

/// Read the override document next to the project, if any.
///
/// Absence is not an error; any other read failure or a parse failure is.
pub fn load_override(project_dir: &Path) -> Result<Option<Value>, ComposeError> {
    let path = project_dir.join(OVERRIDE_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ComposeError::OverrideRead { path, source }),
    };

    let value: Value = serde_yaml::from_str(&content).map_err(|source| ComposeError::Parse {
        name: OVERRIDE_FILE.to_string(),
        source,
    })?;
    Ok(match value {
        Value::Null => None,
        other => Some(other),
    })
}

/// Merge `overlay` into `base`.
///
/// Mappings merge key by key, lists under [`APPEND_KEYS`] are appended
/// without duplicates, everything else is replaced. A `null` overlay keeps
/// the base value.
pub fn merge(base: &mut Value, overlay: Value) {
    merge_at(base, overlay, None);
}

fn merge_at(base: &mut Value, overlay: Value, key: Option<&str>) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                let child_key = k.as_str().map(str::to_string);
                match base_map.get_mut(&k) {
                    Some(existing) => merge_at(existing, v, child_key.as_deref()),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq))
            if key.is_some_and(|k| APPEND_KEYS.contains(&k)) =>
        {
            for item in overlay_seq {
                if !base_seq.contains(&item) {
                    base_seq.push(item);
                }
            }
        }
        (slot, v) => *slot = v,
    }
}
