//! # Pivot Config
//!
//! Loads the core configuration from one or more YAML / JSON
//! files, interpolating `${VAR}` environment variables and deep
//! merging the files into a final configuration object.

use std::path::{Path, PathBuf};

use colored::Colorize;
use indexmap::IndexSet;
use serde::de::DeserializeOwned;

mod error;
mod load;
mod merge;

pub use error::Error;
pub use merge::merge_objects;

pub type Result<T> = ::core::result::Result<T, Error>;

/// Settings for loading config files.
pub struct ConfigLoader<'outer, 'inner> {
  /// Paths to files or directories to include in the final
  /// configuration. Paths coming later in the array override
  /// configuration in earlier paths.
  pub paths: &'outer [&'inner Path],
  /// Wildcard patterns matched against file names inside the
  /// given directories. Non-matching files are skipped.
  pub match_wildcards: &'outer [&'inner str],
  /// Print extra information on configuration load. This runs
  /// before the logger is up, so it prints directly.
  pub debug_print: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let ConfigLoader {
      paths,
      match_wildcards,
      debug_print,
    } = self;
    let mut wildcards = Vec::with_capacity(match_wildcards.len());
    for &pattern in match_wildcards {
      match wildcard::Wildcard::new(pattern.as_bytes()) {
        Ok(wc) => wildcards.push(wc),
        Err(e) => {
          eprintln!(
            "{}: Keyword '{}' is invalid wildcard | {e:?}",
            "ERROR".red(),
            pattern.bold(),
          );
        }
      }
    }
    let mut all_files = IndexSet::<PathBuf>::new();
    for &path in paths {
      let Ok(metadata) = std::fs::metadata(path) else {
        continue;
      };
      if metadata.is_dir() {
        let mut files = Vec::new();
        load::collect_config_files(&mut files, path, &wildcards);
        files.sort();
        all_files.extend(files);
      } else if metadata.is_file() {
        let path = path.to_path_buf();
        // A path repeated later keeps its higher priority.
        all_files.shift_remove(&path);
        all_files.insert(path);
      }
    }
    if debug_print {
      println!(
        "{}: {}: {all_files:?}",
        "DEBUG".cyan(),
        "Found Files".dimmed()
      );
    }
    load::load_parse_config_files(
      &all_files.into_iter().collect::<Vec<_>>(),
    )
  }
}
