use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error(
    "Types on field {key} do not match | got {value:?}, expected object"
  )]
  ObjectFieldTypeMismatch {
    key: String,
    value: serde_json::Value,
  },

  #[error("Failed to read contents of file at {path} | {e:?}")]
  ReadFileContents { e: std::io::Error, path: PathBuf },

  #[error("Failed to parse yaml file at {path} | {e:?}")]
  ParseYaml {
    e: serde_yaml_ng::Error,
    path: PathBuf,
  },

  #[error("Failed to parse json file at {path} | {e:?}")]
  ParseJson { e: serde_json::Error, path: PathBuf },

  #[error("Unsupported file type at {path}")]
  UnsupportedFileType { path: PathBuf },

  #[error("Failed to parse merged config into final type | {e:?}")]
  ParseFinalJson { e: serde_json::Error },
}
