//! Exhibitor adapter, used only for leader discovery.

use pivot_client::entities::agent::Master;
use serde::Deserialize;

use crate::state::{backend_addrs, http_client};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
  pub hostname: String,
  #[serde(default)]
  pub is_leader: bool,
}

pub async fn get_masters() -> serror::Result<Vec<Master>> {
  let url = format!(
    "{}/cluster/status",
    backend_addrs().load().exhibitor.base_url()
  );
  let statuses: Vec<ClusterStatus> =
    http_client().get(url).await?;
  Ok(
    statuses
      .into_iter()
      .map(|status| Master {
        hostname: status.hostname,
        is_leader: status.is_leader,
      })
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_cluster_status_payload() {
    let statuses: Vec<ClusterStatus> = serde_json::from_value(
      serde_json::json!([
        {"hostname": "zk-1.zk", "isLeader": false},
        {"hostname": "zk-2.zk", "isLeader": true}
      ]),
    )
    .unwrap();
    let leader =
      statuses.iter().find(|status| status.is_leader).unwrap();
    assert_eq!(leader.hostname, "zk-2.zk");
  }
}

