//! Short container references.
//!
//! `@<container-id>` inside `cmd`, `args` or `env` values resolves
//! to the container's cluster DNS name at request build time.
//! `\@` escapes a literal `@`.

use std::sync::OnceLock;

use regex::Regex;

use crate::entities::ID_PATTERN;

pub const SHORT_ID_DNS_SUFFIX: &str =
  "marathon.containerip.dcos.thisdcos.directory";

fn short_id_regex() -> &'static Regex {
  static SHORT_ID_REGEX: OnceLock<Regex> = OnceLock::new();
  SHORT_ID_REGEX.get_or_init(|| {
    Regex::new(&format!("([^@\\\\])@({ID_PATTERN})"))
      .expect("invalid short id pattern")
  })
}

/// Container ids referenced by `value`.
pub fn short_ids(value: &str) -> Vec<String> {
  // a sentinel space lets a leading `@` match without lookbehind
  let padded = format!(" {value}");
  short_id_regex()
    .captures_iter(&padded)
    .map(|caps| caps[2].to_string())
    .collect()
}

/// Rewrite every short reference to the addressable name of the
/// container inside `appliance`.
pub fn resolve_short_ids(value: &str, appliance: &str) -> String {
  let padded = format!(" {value}");
  let resolved = short_id_regex().replace_all(
    &padded,
    |caps: &regex::Captures| {
      format!(
        "{}{}-{appliance}.{SHORT_ID_DNS_SUFFIX}",
        &caps[1], &caps[2]
      )
    },
  );
  resolved.trim().replace("\\@", "@")
}

/// The control plane's own address, advertised to every service as
/// `PIVOT_URL` through the system appliance.
pub fn pivot_url() -> String {
  resolve_short_ids("@pivot", "sys")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn finds_short_ids() {
    assert_eq!(
      short_ids("http://@frontend:8080 and @db"),
      vec!["frontend".to_string(), "db".to_string()]
    );
    assert_eq!(short_ids("@leading"), vec!["leading".to_string()]);
    assert!(short_ids("escaped \\@nope").is_empty());
    assert!(short_ids("plain text").is_empty());
  }

  #[test]
  fn resolves_to_cluster_dns_names() {
    assert_eq!(
      resolve_short_ids("http://@frontend:8080", "test-app"),
      format!(
        "http://frontend-test-app.{SHORT_ID_DNS_SUFFIX}:8080"
      )
    );
    assert_eq!(
      resolve_short_ids("@db", "test-app"),
      format!("db-test-app.{SHORT_ID_DNS_SUFFIX}")
    );
    assert_eq!(
      resolve_short_ids("user\\@example.com", "test-app"),
      "user@example.com"
    );
  }
}
