use std::sync::OnceLock;

use regex::Regex;
use typeshare::typeshare;

/// Subtypes of [Agent][agent::Agent] and [Master][agent::Master].
pub mod agent;
/// Subtypes of [Appliance][appliance::Appliance].
pub mod appliance;
/// [core config][config::CoreConfig] and the backend api blocks.
pub mod config;
/// Subtypes of [Container][container::Container].
pub mod container;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// [Placement][schedule::Placement] and schedule hints.
pub mod schedule;
/// Subtypes of [Task][task::Task].
pub mod task;
/// Subtypes of [PersistentVolume][volume::PersistentVolume].
pub mod volume;

#[typeshare(serialized_as = "number")]
pub type I64 = i64;
#[typeshare(serialized_as = "number")]
pub type U64 = u64;

pub fn pivot_timestamp() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// Appliance, container and volume ids all share this alphabet.
pub const ID_PATTERN: &str = "[a-zA-Z0-9-]+";

fn id_regex() -> &'static Regex {
  static ID_REGEX: OnceLock<Regex> = OnceLock::new();
  ID_REGEX.get_or_init(|| {
    Regex::new(&format!("^{ID_PATTERN}$"))
      .expect("invalid id pattern")
  })
}

pub fn valid_id(id: &str) -> bool {
  id_regex().is_match(id)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn id_grammar() {
    assert!(valid_id("test-app-01"));
    assert!(valid_id("A"));
    assert!(!valid_id(""));
    assert!(!valid_id("has space"));
    assert!(!valid_id("under_score"));
    assert!(!valid_id("dot.ted"));
  }
}
