use std::{fmt, str::FromStr};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::schedule::Placement;

/// Mesos master in the cluster.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Master {
  pub hostname: String,
  #[serde(default)]
  pub is_leader: bool,
}

/// An inclusive port range, rendered as `"lo-hi"`.
#[typeshare(serialized_as = "string")]
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct PortRange(pub u32, pub u32);

impl fmt::Display for PortRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.0, self.1)
  }
}

impl From<PortRange> for String {
  fn from(range: PortRange) -> String {
    range.to_string()
  }
}

impl FromStr for PortRange {
  type Err = anyhow::Error;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (lo, hi) = s
      .split_once('-')
      .with_context(|| format!("Invalid port range '{s}'"))?;
    let lo = lo
      .trim()
      .parse()
      .with_context(|| format!("Invalid port range '{s}'"))?;
    let hi = hi
      .trim()
      .parse()
      .with_context(|| format!("Invalid port range '{s}'"))?;
    if lo > hi {
      return Err(anyhow!("Invalid port range '{s}'"));
    }
    Ok(PortRange(lo, hi))
  }
}

impl TryFrom<String> for PortRange {
  type Error = anyhow::Error;
  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

/// Unreserved resources on an agent, computed by the cluster
/// monitor as total minus used, offered and reserved.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct AgentResources {
  pub cpus: f64,
  pub mem: f64,
  pub disk: f64,
  pub gpus: f64,
  #[serde(default)]
  pub port_ranges: Vec<PortRange>,
}

impl AgentResources {
  pub fn check_port_availability(&self, port: u32) -> bool {
    self
      .port_ranges
      .iter()
      .any(|range| range.0 <= port && port <= range.1)
  }
}

/// Subtract the used ranges from the advertised ranges by a single
/// interval sweep. Both inputs must be sorted by range start, as
/// the substrate reports them.
pub fn subtract_port_ranges(
  advertised: &[PortRange],
  used: &[PortRange],
) -> Vec<PortRange> {
  let mut unused = Vec::new();
  let mut u_idx = 0;
  for (i, &PortRange(lo, hi)) in advertised.iter().enumerate() {
    if u_idx == used.len() {
      unused.extend_from_slice(&advertised[i..]);
      break;
    }
    let PortRange(used_lo, used_hi) = used[u_idx];
    if hi < used_lo {
      unused.push(PortRange(lo, hi));
    } else {
      if lo < used_lo {
        unused.push(PortRange(lo, used_lo - 1));
      }
      if hi > used_hi {
        unused.push(PortRange(used_hi + 1, hi));
      }
      u_idx += 1;
    }
  }
  unused
}

/// A compute agent reporting resources to the cluster.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
  pub id: String,
  pub hostname: String,
  pub resources: AgentResources,
  #[serde(default)]
  pub public_ip: String,
  /// Locality of the agent, host always set to the hostname.
  #[serde(default)]
  pub placement: Placement,
  #[serde(default)]
  pub preemptible: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fqdn: Option<String>,
}

impl Agent {
  /// Address to advertise in endpoints: the fqdn when known, the
  /// public ip otherwise.
  pub fn address(&self) -> &str {
    self.fqdn.as_deref().unwrap_or(&self.public_ip)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ranges(specs: &[(u32, u32)]) -> Vec<PortRange> {
    specs.iter().map(|&(lo, hi)| PortRange(lo, hi)).collect()
  }

  #[test]
  fn parses_and_renders_port_ranges() {
    let range: PortRange = "1025-2180".parse().unwrap();
    assert_eq!(range, PortRange(1025, 2180));
    assert_eq!(range.to_string(), "1025-2180");
    assert!("2180-1025".parse::<PortRange>().is_err());
    assert!("oops".parse::<PortRange>().is_err());
  }

  #[test]
  fn subtracts_used_ranges() {
    let remaining = subtract_port_ranges(
      &ranges(&[(1000, 2000), (3000, 4000)]),
      &ranges(&[(1500, 1600)]),
    );
    assert_eq!(
      remaining,
      ranges(&[(1000, 1499), (1601, 2000), (3000, 4000)])
    );
  }

  #[test]
  fn fully_used_range_leaves_nothing() {
    let remaining = subtract_port_ranges(
      &ranges(&[(1000, 2000)]),
      &ranges(&[(900, 2100)]),
    );
    assert!(remaining.is_empty());
  }

  #[test]
  fn port_availability() {
    let resources = AgentResources {
      port_ranges: ranges(&[(1000, 2000)]),
      ..Default::default()
    };
    assert!(resources.check_port_availability(1000));
    assert!(resources.check_port_availability(2000));
    assert!(!resources.check_port_availability(2001));
  }
}
