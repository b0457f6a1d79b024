//! Cost aware: group tasks around the placement of their
//! predecessors and rank agents by transfer cost against the
//! available bandwidth, from a static locality table.

use std::collections::{HashMap, VecDeque};

use futures::future::BoxFuture;
use pivot_client::entities::{
  agent::Agent, schedule::Placement,
};
use rand::seq::IndexedRandom;
use serde::Deserialize;

use super::{
  GlobalPolicy, PolicyCtor, PolicyInput, PolicyOutput,
  agent_vector, demand, fits, majority_placement, merge_waiting,
  norm, place, subtract,
};
use crate::{config::core_config, scheduler::ScheduledTask};

pub fn register(
  registry: &mut HashMap<&'static str, PolicyCtor>,
) {
  registry.insert("cost_aware", || {
    Box::new(CostAware {
      locality: LocalityTable::load(),
      wait: VecDeque::new(),
    })
  });
}

/// Pairwise `(cost, bw)` between `(cloud, region)` locations.
#[derive(Debug, Default)]
pub struct LocalityTable {
  entries: HashMap<(String, String), HashMap<(String, String), CostBw>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CostBw {
  cost: f64,
  bw: f64,
}

#[derive(Debug, Deserialize)]
struct LocalityFile {
  pairs: Vec<LocalityPair>,
}

#[derive(Debug, Deserialize)]
struct LocalityPair {
  src_cloud: String,
  src_region: String,
  dst_cloud: String,
  dst_region: String,
  cost: f64,
  bw: f64,
}

impl LocalityTable {
  fn load() -> LocalityTable {
    let path = &core_config().locality_file;
    if path.as_os_str().is_empty() {
      return LocalityTable::default();
    }
    let contents = match std::fs::read_to_string(path) {
      Ok(contents) => contents,
      Err(e) => {
        error!(
          "Failed to read locality table at {path:?} | {e}"
        );
        return LocalityTable::default();
      }
    };
    let file: LocalityFile =
      match serde_yaml_ng::from_str(&contents) {
        Ok(file) => file,
        Err(e) => {
          error!(
            "Failed to parse locality table at {path:?} | {e}"
          );
          return LocalityTable::default();
        }
      };
    let mut table = LocalityTable::default();
    for pair in file.pairs {
      table
        .entries
        .entry((pair.src_cloud, pair.src_region))
        .or_default()
        .insert(
          (pair.dst_cloud, pair.dst_region),
          CostBw {
            cost: pair.cost,
            bw: pair.bw,
          },
        );
    }
    table
  }

  fn key(placement: &Placement) -> (String, String) {
    (
      placement.cloud.clone().unwrap_or_default(),
      placement.region.clone().unwrap_or_default(),
    )
  }

  /// Round-trip cost and bandwidth between two placements,
  /// neutral when the table has no entry.
  fn between(
    &self,
    src: &Placement,
    dst: &Placement,
  ) -> (f64, f64) {
    let forward = self
      .entries
      .get(&Self::key(src))
      .and_then(|row| row.get(&Self::key(dst)));
    let backward = self
      .entries
      .get(&Self::key(dst))
      .and_then(|row| row.get(&Self::key(src)));
    match (forward, backward) {
      (Some(f), Some(b)) => (f.cost + b.cost, f.bw + b.bw),
      (Some(f), None) => (2.0 * f.cost, 2.0 * f.bw),
      (None, Some(b)) => (2.0 * b.cost, 2.0 * b.bw),
      (None, None) => (1.0, 1.0),
    }
  }
}

pub struct CostAware {
  locality: LocalityTable,
  wait: VecDeque<ScheduledTask>,
}

impl GlobalPolicy for CostAware {
  fn schedule(
    &mut self,
    input: PolicyInput,
  ) -> BoxFuture<'_, PolicyOutput> {
    Box::pin(async move {
      let PolicyInput {
        tasks,
        volumes,
        agents,
      } = input;
      let tasks = merge_waiting(&mut self.wait, tasks);
      let mut available = agents
        .iter()
        .map(|agent| (agent.id.clone(), agent_vector(agent)))
        .collect::<HashMap<_, _>>();
      let mut placed = Vec::new();
      for (anchor_placement, mut group) in group_tasks(tasks) {
        let qualified = match &anchor_placement {
          Some(placement) => {
            let matched = agents
              .iter()
              .filter(|a| {
                a.placement.without_host()
                  == placement.without_host()
              })
              .collect::<Vec<_>>();
            if matched.is_empty() {
              agents.iter().collect()
            } else {
              matched
            }
          }
          None => agents.iter().collect::<Vec<_>>(),
        };
        let Some(anchor) =
          qualified.choose(&mut rand::rng()).copied()
        else {
          self.wait.extend(group);
          continue;
        };
        // small tasks first, against the cheapest agents
        group.sort_by(|a, b| {
          norm(&demand(a.resources()))
            .total_cmp(&norm(&demand(b.resources())))
        });
        let mut ranked = agents.iter().collect::<Vec<_>>();
        ranked.sort_by(|a, b| {
          self
            .score(anchor, a, &available)
            .total_cmp(&self.score(anchor, b, &available))
        });
        for mut task in group {
          let wanted = demand(task.resources());
          let found = ranked.iter().find(|agent| {
            fits(&wanted, &available[&agent.id])
          });
          match found {
            Some(agent) => {
              place(&mut task, agent);
              subtract(
                available
                  .get_mut(&agent.id)
                  .expect("agent not indexed"),
                &wanted,
              );
              placed.push(task);
            }
            None => self.wait.push_back(task),
          }
        }
      }
      PolicyOutput {
        tasks: placed,
        volumes,
      }
    })
  }
}

impl CostAware {
  /// Lower is better: transfer cost per unit of headroom and
  /// bandwidth relative to the anchor.
  fn score(
    &self,
    anchor: &Agent,
    agent: &Agent,
    available: &HashMap<String, [f64; 4]>,
  ) -> f64 {
    let headroom = norm(&available[&agent.id]);
    let (cost, bw) = self
      .locality
      .between(&anchor.placement, &agent.placement);
    if headroom == 0.0 || bw == 0.0 {
      return f64::INFINITY;
    }
    cost / (headroom * bw)
  }
}

/// Group by the most common predecessor placement; tasks without
/// located predecessors share the anchorless group.
fn group_tasks(
  tasks: Vec<ScheduledTask>,
) -> Vec<(Option<Placement>, Vec<ScheduledTask>)> {
  let mut groups: Vec<(Option<Placement>, Vec<ScheduledTask>)> =
    Vec::new();
  for task in tasks {
    let anchor = majority_placement(&task.pred_placements);
    match groups.iter_mut().find(|(key, _)| *key == anchor) {
      Some((_, group)) => group.push(task),
      None => groups.push((anchor, vec![task])),
    }
  }
  groups
}

#[cfg(test)]
mod tests {
  use super::*;

  fn placement(cloud: &str, region: &str) -> Placement {
    Placement {
      cloud: Some(cloud.into()),
      region: Some(region.into()),
      zone: None,
      host: None,
    }
  }

  #[test]
  fn majority_placement_ignores_unlocated_predecessors() {
    let placements = vec![
      Placement::default(),
      placement("aws", "us-east-1"),
      placement("aws", "us-east-1"),
      placement("gcp", "us-central1"),
    ];
    assert_eq!(
      majority_placement(&placements),
      Some(placement("aws", "us-east-1"))
    );
    assert_eq!(majority_placement(&[]), None);
  }

  #[test]
  fn locality_lookup_sums_both_directions() {
    let mut table = LocalityTable::default();
    table.entries.entry(("aws".into(), "us-east-1".into()))
      .or_default()
      .insert(
        ("gcp".into(), "us-central1".into()),
        CostBw { cost: 2.0, bw: 5.0 },
      );
    table.entries.entry(("gcp".into(), "us-central1".into()))
      .or_default()
      .insert(
        ("aws".into(), "us-east-1".into()),
        CostBw { cost: 3.0, bw: 5.0 },
      );
    let (cost, bw) = table.between(
      &placement("aws", "us-east-1"),
      &placement("gcp", "us-central1"),
    );
    assert_eq!(cost, 5.0);
    assert_eq!(bw, 10.0);
    // unknown pairs are neutral
    let (cost, bw) = table.between(
      &placement("aws", "us-east-1"),
      &placement("azure", "eastus"),
    );
    assert_eq!((cost, bw), (1.0, 1.0));
  }
}
