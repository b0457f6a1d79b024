use std::{
  path::{Path, PathBuf},
  sync::OnceLock,
};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use wildcard::Wildcard;

use crate::{Error, merge::merge_objects};

/// Gather config files under `dir`, recursing into
/// subdirectories. When wildcards are given, file names must match
/// one of them.
pub fn collect_config_files(
  files: &mut Vec<PathBuf>,
  dir: &Path,
  wildcards: &[Wildcard],
) {
  let Ok(entries) = std::fs::read_dir(dir) else {
    return;
  };
  for entry in entries.flatten() {
    let path = entry.path();
    if path.is_dir() {
      collect_config_files(files, &path, wildcards);
      continue;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str())
    else {
      continue;
    };
    if wildcards.is_empty()
      || wildcards.iter().any(|wc| wc.is_match(name.as_bytes()))
    {
      files.push(path);
    }
  }
}

/// Parse each file, deep merge in order, and deserialize the
/// merged object into the final config type.
pub fn load_parse_config_files<T: DeserializeOwned>(
  paths: &[PathBuf],
) -> crate::Result<T> {
  let mut merged = Map::new();
  for path in paths {
    merged = merge_objects(merged, parse_config_file(path)?)?;
  }
  serde_json::from_value(Value::Object(merged))
    .map_err(|e| Error::ParseFinalJson { e })
}

fn parse_config_file(
  path: &PathBuf,
) -> crate::Result<Map<String, Value>> {
  let contents = std::fs::read_to_string(path).map_err(|e| {
    Error::ReadFileContents {
      e,
      path: path.clone(),
    }
  })?;
  let contents = interpolate_env(&contents);
  let extension = path
    .extension()
    .and_then(|e| e.to_str())
    .unwrap_or_default();
  let parsed = match extension {
    "yaml" | "yml" => {
      serde_yaml_ng::from_str::<Value>(&contents).map_err(|e| {
        Error::ParseYaml {
          e,
          path: path.clone(),
        }
      })?
    }
    "json" => serde_json::from_str::<Value>(&contents).map_err(
      |e| Error::ParseJson {
        e,
        path: path.clone(),
      },
    )?,
    _ => {
      return Err(Error::UnsupportedFileType {
        path: path.clone(),
      });
    }
  };
  match parsed {
    Value::Object(map) => Ok(map),
    // an empty yaml file parses to null
    Value::Null => Ok(Map::new()),
    value => Err(Error::ObjectFieldTypeMismatch {
      key: path.display().to_string(),
      value,
    }),
  }
}

/// Replace `${VAR}` with the value of the environment variable.
/// Unset variables are left untouched so the parse error points at
/// the right place.
fn interpolate_env(contents: &str) -> String {
  static VAR: OnceLock<regex::Regex> = OnceLock::new();
  let re = VAR.get_or_init(|| {
    regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
      .expect("invalid env var pattern")
  });
  re.replace_all(contents, |caps: &regex::Captures| {
    std::env::var(&caps[1])
      .unwrap_or_else(|_| caps[0].to_string())
  })
  .into_owned()
}
