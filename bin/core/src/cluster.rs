//! Cluster snapshot: periodic poll of the substrate master for
//! agents, leader discovery, and the TTL-bounded agent cache.

use std::{
  sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
  },
  time::Duration,
};

use anyhow::Context;
use cache::CloneCache;
use mungos::mongodb::bson::doc;
use pivot_client::entities::{
  agent::{
    Agent, AgentResources, Master, PortRange,
    subtract_port_ranges,
  },
  pivot_timestamp,
  schedule::Placement,
};

use crate::{
  backends::{exhibitor, marathon, mesos},
  config::core_config,
  state::{backend_addrs, cluster, db_client},
};

pub fn spawn_cluster_monitor_loop() {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(
      core_config().cluster_poll_interval_secs,
    ));
    loop {
      interval.tick().await;
      if let Err(e) = cluster().update().await {
        error!("Failed to refresh cluster snapshot | {e:#}");
      }
    }
  });
}

#[derive(Default)]
pub struct ClusterMonitor {
  agents: CloneCache<String, Agent>,
  /// Unix ms of the last successful refresh, 0 before the first.
  last_update: AtomicI64,
}

impl ClusterMonitor {
  /// Cached agents, refreshed first when older than `ttl` seconds.
  pub async fn get_agents(&self, ttl_secs: u64) -> Vec<Agent> {
    if self.is_expired(ttl_secs)
      && let Err(e) = self.update().await
    {
      error!("Failed to refresh cluster snapshot | {e:#}");
    }
    self.agents.get_values().await
  }

  /// Look one agent up, forcing a refresh on a miss: the id may
  /// belong to an agent that joined after the last poll.
  pub async fn get_agent(&self, agent_id: &str) -> Option<Agent> {
    if let Some(agent) =
      self.agents.get(&agent_id.to_string()).await
    {
      return Some(agent);
    }
    if let Err(e) = self.update().await {
      error!("Failed to refresh cluster snapshot | {e:#}");
    }
    self.agents.get(&agent_id.to_string()).await
  }

  pub async fn update(&self) -> anyhow::Result<()> {
    self.follow_leader().await;
    self.resolve_job_backend().await;

    let slaves = mesos::get_slaves()
      .await
      .map_err(|e| e.error)
      .context("Failed to query substrate agents")?;
    let agents = slaves
      .slaves
      .iter()
      .map(agent_from_slave)
      .collect::<Vec<_>>();
    for agent in &agents {
      if let Err(e) = db_client()
        .agents
        .replace_one(doc! { "id": &agent.id }, agent)
        .upsert(true)
        .await
      {
        warn!("Failed to persist agent '{}' | {e:#}", agent.id);
      }
    }
    self
      .agents
      .set_all(
        agents
          .into_iter()
          .map(|agent| (agent.id.clone(), agent)),
      )
      .await;
    self
      .last_update
      .store(pivot_timestamp(), Ordering::Relaxed);
    Ok(())
  }

  /// Point every backend at the leading master when it moved.
  /// Exhibitor is the source of truth; when it is unreachable the
  /// service backend's own leader report stands in.
  async fn follow_leader(&self) {
    let masters = match exhibitor::get_masters().await {
      Ok(masters) => masters,
      Err(e) => {
        debug!("Leader discovery failed | {:#}", e.error);
        match marathon::get_leader().await {
          Ok(response) => {
            if let Some(host) = response.host() {
              self.point_backends_at(host.to_string());
            }
          }
          Err(e) => {
            debug!(
              "Fallback leader discovery failed | {:#}",
              e.error
            );
          }
        }
        return;
      }
    };
    for master in &masters {
      if let Err(e) = db_client()
        .masters
        .replace_one(
          doc! { "hostname": &master.hostname },
          master,
        )
        .upsert(true)
        .await
      {
        warn!(
          "Failed to persist master '{}' | {e:#}",
          master.hostname
        );
      }
    }
    let Some(Master { hostname, .. }) =
      masters.into_iter().find(|m| m.is_leader)
    else {
      warn!(
        "No leading master found, all registered masters may be down"
      );
      return;
    };
    self.point_backends_at(hostname);
  }

  fn point_backends_at(&self, hostname: String) {
    let addrs = backend_addrs().load();
    if addrs.mesos.host == hostname {
      return;
    }
    info!("Leading master moved to {hostname}");
    let mut addrs = (**addrs).clone();
    addrs.marathon.host = hostname.clone();
    addrs.chronos.host = hostname.clone();
    addrs.mesos.host = hostname.clone();
    addrs.exhibitor.host = hostname;
    backend_addrs().store(Arc::new(addrs));
  }

  /// The job backend runs as the `sys/chronos` service on the
  /// substrate; resolve its current host and port through the
  /// service backend.
  async fn resolve_job_backend(&self) {
    let response = match marathon::get_app("sys", "chronos").await
    {
      Ok(response) => response,
      Err(e) => {
        debug!(
          "Job backend resolution failed | {:#}",
          e.error
        );
        return;
      }
    };
    let Some(task) = response.app.tasks.last() else {
      return;
    };
    let Some(&port) = task.ports.first() else {
      return;
    };
    let addrs = backend_addrs().load();
    if addrs.chronos.host == task.host
      && addrs.chronos.port == port
    {
      return;
    }
    info!(
      "Job backend resolved to {}:{port}",
      task.host
    );
    let mut addrs = (**addrs).clone();
    addrs.chronos.host = task.host.clone();
    addrs.chronos.port = port;
    backend_addrs().store(Arc::new(addrs));
  }

  fn is_expired(&self, ttl_secs: u64) -> bool {
    let last_update = self.last_update.load(Ordering::Relaxed);
    last_update == 0
      || pivot_timestamp() - last_update
        > (ttl_secs * 1000) as i64
  }
}

fn agent_from_slave(slave: &mesos::Slave) -> Agent {
  let total = &slave.resources;
  let used = &slave.used_resources;
  let offered = &slave.offered_resources;
  let reserved = &slave.reserved_resources;
  let resources = AgentResources {
    cpus: total.cpus - used.cpus - offered.cpus - reserved.cpus,
    mem: total.mem - used.mem - offered.mem - reserved.mem,
    disk: total.disk - used.disk - offered.disk - reserved.disk,
    gpus: total.gpus - used.gpus - offered.gpus - reserved.gpus,
    port_ranges: subtract_port_ranges(
      &parse_port_ranges(&total.ports),
      &parse_port_ranges(&used.ports),
    ),
  };
  let attribute = |key: &str| slave.attribute(key);
  Agent {
    id: slave.id.clone(),
    hostname: slave.hostname.clone(),
    resources,
    public_ip: attribute("public_ip").unwrap_or_default(),
    placement: Placement {
      cloud: attribute("cloud"),
      region: attribute("region"),
      zone: attribute("zone"),
      host: Some(slave.hostname.clone()),
    },
    preemptible: attribute("preemptible")
      .map(|v| v == "true" || v == "1")
      .unwrap_or_default(),
    fqdn: attribute("fqdn"),
  }
}

/// Parse the substrate's `"[lo-hi, lo-hi]"` interval string,
/// sorted by range start for the subtraction sweep.
fn parse_port_ranges(ports: &str) -> Vec<PortRange> {
  let mut ranges = ports
    .trim_matches(['[', ']'])
    .split(',')
    .filter_map(|range| range.trim().parse::<PortRange>().ok())
    .collect::<Vec<_>>();
  ranges.sort_by_key(|range| range.0);
  ranges
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_substrate_port_intervals() {
    assert_eq!(
      parse_port_ranges("[1025-2180, 2182-3887]"),
      vec![PortRange(1025, 2180), PortRange(2182, 3887)]
    );
    assert!(parse_port_ranges("").is_empty());
  }

  #[test]
  fn computes_available_resources() {
    let slave = mesos::Slave {
      id: "S1".into(),
      hostname: "10.52.0.1".into(),
      resources: mesos::SlaveResources {
        cpus: 8.0,
        mem: 16384.0,
        disk: 102400.0,
        gpus: 1.0,
        ports: "[1000-2000]".into(),
      },
      used_resources: mesos::SlaveResources {
        cpus: 2.0,
        mem: 4096.0,
        disk: 0.0,
        gpus: 0.0,
        ports: "[1000-1100]".into(),
      },
      offered_resources: mesos::SlaveResources {
        cpus: 1.0,
        ..Default::default()
      },
      reserved_resources: mesos::SlaveResources {
        cpus: 1.0,
        ..Default::default()
      },
      attributes: [
        ("cloud".to_string(), serde_json::json!("aws")),
        ("region".to_string(), serde_json::json!("us-east-1")),
        ("zone".to_string(), serde_json::json!("us-east-1a")),
        ("public_ip".to_string(), serde_json::json!("1.2.3.4")),
        ("preemptible".to_string(), serde_json::json!("false")),
      ]
      .into_iter()
      .collect(),
    };
    let agent = agent_from_slave(&slave);
    assert_eq!(agent.resources.cpus, 4.0);
    assert_eq!(agent.resources.mem, 12288.0);
    assert_eq!(
      agent.resources.port_ranges,
      vec![PortRange(1101, 2000)]
    );
    assert_eq!(agent.placement.cloud.as_deref(), Some("aws"));
    assert_eq!(
      agent.placement.host.as_deref(),
      Some("10.52.0.1")
    );
    assert!(!agent.preemptible);
    assert_eq!(agent.address(), "1.2.3.4");
  }
}
