//! Location aware: tasks consuming registered data objects land
//! in the region holding the largest share of their input bytes.

use std::collections::{HashMap, HashSet, VecDeque};

use futures::future::BoxFuture;
use pivot_client::entities::agent::Agent;

use super::{
  GlobalPolicy, PolicyCtor, PolicyInput, PolicyOutput,
  agent_vector, demand, fits, merge_waiting, place, subtract,
};
use crate::{
  backends::registry,
  config::core_config,
  scheduler::ScheduledTask,
};

pub fn register(
  registry: &mut HashMap<&'static str, PolicyCtor>,
) {
  registry.insert("location_aware", || {
    Box::new(LocationAware {
      scale: core_config().location_aware_scale,
      wait: VecDeque::new(),
    })
  });
}

pub struct LocationAware {
  /// Allow falling back to nearby agents when the data region is
  /// out of capacity.
  scale: bool,
  wait: VecDeque<ScheduledTask>,
}

impl GlobalPolicy for LocationAware {
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
      let region_bytes = region_bytes(&tasks).await;
      let mut available = agents
        .iter()
        .map(|agent| (agent.id.clone(), agent_vector(agent)))
        .collect::<HashMap<_, _>>();
      let mut placed = Vec::new();
      for mut task in tasks {
        let inputs = input_files(&task);
        if inputs.is_empty() {
          // no data affinity: defer to the substrate
          placed.push(task);
          continue;
        }
        let mut regions = HashMap::<String, u64>::new();
        for (region, bytes) in
          inputs.iter().filter_map(|f| region_bytes.get(f))
        {
          *regions.entry(region.clone()).or_default() += bytes;
        }
        let target = regions
          .iter()
          .max_by_key(|(_, bytes)| **bytes)
          .map(|(region, _)| region.clone());
        let Some(target) = target else {
          // inputs unknown to the object registry
          placed.push(task);
          continue;
        };
        let wanted = demand(task.resources());
        let found =
          pick_agent(&agents, &available, &wanted, &target, self.scale);
        match found {
          Some(agent_id) => {
            let agent = agents
              .iter()
              .find(|a| a.id == agent_id)
              .expect("agent not indexed");
            place(&mut task, agent);
            subtract(
              available
                .get_mut(&agent_id)
                .expect("agent not indexed"),
              &wanted,
            );
            placed.push(task);
          }
          None => {
            debug!(
              "No agent available in region '{target}' for task '{}'",
              task.task_id()
            );
            self.wait.push_back(task);
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

fn input_files(task: &ScheduledTask) -> Vec<String> {
  task
    .container
    .data
    .as_ref()
    .map(|data| data.input.clone())
    .unwrap_or_default()
}

/// Resolve every input file of the batch to `(region, size)`
/// through the object registry. Failures degrade to an empty map,
/// which makes the policy a passthrough for the affected tasks.
async fn region_bytes(
  tasks: &[ScheduledTask],
) -> HashMap<String, (String, u64)> {
  let files = tasks
    .iter()
    .flat_map(input_files)
    .collect::<HashSet<_>>();
  if files.is_empty() {
    return HashMap::new();
  }
  let objects = match registry::get_data_objects(
    files.iter().map(String::as_str),
  )
  .await
  {
    Ok(objects) => objects,
    Err(e) => {
      error!("Failed to query data objects | {:#}", e.error);
      return HashMap::new();
    }
  };
  let resource_names = objects
    .iter()
    .flat_map(|o| o.replicas.iter())
    .map(|r| r.resource_name.clone())
    .collect::<HashSet<_>>();
  let resources = match registry::get_resources_metadata(
    resource_names.iter().map(String::as_str),
  )
  .await
  {
    Ok(resources) => resources,
    Err(e) => {
      error!(
        "Failed to query resource metadata | {:#}",
        e.error
      );
      return HashMap::new();
    }
  };
  let regions = resources
    .into_iter()
    .map(|r| (r.name, r.region))
    .collect::<HashMap<_, _>>();
  objects
    .into_iter()
    .filter_map(|object| {
      let region = object
        .replicas
        .iter()
        .find_map(|r| regions.get(&r.resource_name))?;
      Some((object.path, (region.clone(), object.size)))
    })
    .collect()
}

/// An agent with capacity in the target region; with `scale`, the
/// nearest same-cloud region (longest shared region prefix) and
/// then any cross-cloud agent may stand in.
fn pick_agent(
  agents: &[Agent],
  available: &HashMap<String, [f64; 4]>,
  wanted: &[f64; 4],
  target_region: &str,
  scale: bool,
) -> Option<String> {
  let has_room = |agent: &&Agent| {
    fits(wanted, &available[&agent.id])
  };
  if let Some(agent) = agents
    .iter()
    .filter(|a| a.placement.region.as_deref() == Some(target_region))
    .find(has_room)
  {
    return Some(agent.id.clone());
  }
  if !scale {
    return None;
  }
  let target_cloud = agents
    .iter()
    .find(|a| {
      a.placement.region.as_deref() == Some(target_region)
    })
    .and_then(|a| a.placement.cloud.clone());
  // nearest region in the same cloud first
  let mut same_cloud = agents
    .iter()
    .filter(|a| {
      a.placement.cloud == target_cloud
        && a.placement.region.as_deref() != Some(target_region)
    })
    .filter(has_room)
    .collect::<Vec<_>>();
  same_cloud.sort_by_key(|a| {
    std::cmp::Reverse(shared_prefix(
      a.placement.region.as_deref().unwrap_or_default(),
      target_region,
    ))
  });
  if let Some(agent) = same_cloud.first() {
    return Some(agent.id.clone());
  }
  agents
    .iter()
    .filter(|a| a.placement.cloud != target_cloud)
    .find(has_room)
    .map(|agent| agent.id.clone())
}

fn shared_prefix(a: &str, b: &str) -> usize {
  a.chars()
    .zip(b.chars())
    .take_while(|(x, y)| x == y)
    .count()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shared_prefix_ranks_nearby_regions() {
    assert_eq!(shared_prefix("us-east-1", "us-east-2"), 8);
    assert_eq!(shared_prefix("us-east-1", "us-west-2"), 3);
    assert_eq!(shared_prefix("us-east-1", "eu-west-1"), 0);
  }

  #[test]
  fn picks_capacity_in_the_target_region() {
    use crate::scheduler::policy::test_support::agent;
    let mut east = agent("east", 4.0, 4096.0);
    east.placement.region = Some("us-east-1".into());
    let mut west = agent("west", 4.0, 4096.0);
    west.placement.region = Some("us-west-2".into());
    let agents = vec![west.clone(), east.clone()];
    let available = agents
      .iter()
      .map(|a| (a.id.clone(), agent_vector(a)))
      .collect::<HashMap<_, _>>();
    let picked = pick_agent(
      &agents,
      &available,
      &[1.0, 512.0, 0.0, 0.0],
      "us-east-1",
      false,
    );
    assert_eq!(picked.as_deref(), Some("east"));
    // region out of capacity, scale disabled: nothing
    let mut drained = available.clone();
    drained.insert("east".into(), [0.0; 4]);
    assert!(
      pick_agent(
        &agents,
        &drained,
        &[1.0, 512.0, 0.0, 0.0],
        "us-east-1",
        false
      )
      .is_none()
    );
    // with scale the same-cloud neighbor stands in
    let picked = pick_agent(
      &agents,
      &drained,
      &[1.0, 512.0, 0.0, 0.0],
      "us-east-1",
      true,
    );
    assert_eq!(picked.as_deref(), Some("west"));
  }
}
