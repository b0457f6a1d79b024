use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Where a task or volume runs, or where it should run.
/// Any subset of the fields may be unset.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
pub struct Placement {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cloud: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub zone: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
}

impl Placement {
  pub fn is_empty(&self) -> bool {
    self.cloud.is_none()
      && self.region.is_none()
      && self.zone.is_none()
      && self.host.is_none()
  }

  /// The most specific placement dimension that is set, as a
  /// `(dimension, value)` pair in backend constraint form.
  /// Host wins over zone over region over cloud.
  pub fn constraint(&self) -> Option<(&'static str, &str)> {
    if let Some(host) = &self.host {
      return Some(("hostname", host));
    }
    if let Some(zone) = &self.zone {
      return Some(("zone", zone));
    }
    if let Some(region) = &self.region {
      return Some(("region", region));
    }
    if let Some(cloud) = &self.cloud {
      return Some(("cloud", cloud));
    }
    None
  }

  /// Placement with the host dimension cleared. The cost-aware
  /// locality table is keyed at (cloud, region) granularity.
  pub fn without_host(&self) -> Placement {
    Placement {
      host: None,
      ..self.clone()
    }
  }
}

/// User- or scheduler-supplied placement preferences.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct ScheduleHints {
  #[serde(default)]
  pub placement: Placement,
}

/// Schedule hints for containers additionally carry preemptibility.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct ContainerScheduleHints {
  #[serde(default)]
  pub placement: Placement,
  #[serde(default)]
  pub preemptible: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn constraint_prefers_most_specific_dimension() {
    let mut placement = Placement {
      cloud: Some("aws".into()),
      region: Some("us-east-1".into()),
      zone: None,
      host: None,
    };
    assert_eq!(
      placement.constraint(),
      Some(("region", "us-east-1"))
    );
    placement.host = Some("10.52.0.1".into());
    assert_eq!(placement.constraint(), Some(("hostname", "10.52.0.1")));
    assert_eq!(Placement::default().constraint(), None);
  }
}
