//! Best fit: choose the agent that leaves the least headroom
//! behind, measured by the L2 norm of the remainder.

use std::collections::{HashMap, VecDeque};

use futures::future::BoxFuture;

use super::{
  GlobalPolicy, PolicyCtor, PolicyInput, PolicyOutput,
  agent_vector, demand, fits, merge_waiting, norm, place,
  subtract,
};
use crate::scheduler::ScheduledTask;

pub fn register(
  registry: &mut HashMap<&'static str, PolicyCtor>,
) {
  registry.insert("best_fit", || {
    Box::new(BestFit { decreasing: false, wait: VecDeque::new() })
  });
  registry.insert("best_fit_decreasing", || {
    Box::new(BestFit { decreasing: true, wait: VecDeque::new() })
  });
}

pub struct BestFit {
  decreasing: bool,
  wait: VecDeque<ScheduledTask>,
}

impl GlobalPolicy for BestFit {
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
      let mut tasks = merge_waiting(&mut self.wait, tasks);
      if self.decreasing {
        tasks.sort_by(|a, b| {
          norm(&demand(b.resources()))
            .total_cmp(&norm(&demand(a.resources())))
        });
      }
      let mut available = agents
        .iter()
        .map(|agent| (agent.id.clone(), agent_vector(agent)))
        .collect::<HashMap<_, _>>();
      let mut placed = Vec::new();
      for mut task in tasks {
        let wanted = demand(task.resources());
        let best = agents
          .iter()
          .filter(|agent| fits(&wanted, &available[&agent.id]))
          .min_by(|a, b| {
            residual(&available[&a.id], &wanted)
              .total_cmp(&residual(&available[&b.id], &wanted))
          });
        match best {
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
      PolicyOutput {
        tasks: placed,
        volumes,
      }
    })
  }
}

fn residual(available: &[f64; 4], wanted: &[f64; 4]) -> f64 {
  let mut remainder = *available;
  subtract(&mut remainder, wanted);
  norm(&remainder)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::policy::test_support::*;

  #[tokio::test]
  async fn picks_the_tightest_agent() {
    let mut policy = BestFit {
      decreasing: false,
      wait: VecDeque::new(),
    };
    let output = policy
      .schedule(PolicyInput {
        tasks: vec![scheduled_task("a", 2.0, 2048.0)],
        volumes: Vec::new(),
        agents: vec![
          agent("roomy", 16.0, 65536.0),
          agent("tight", 2.0, 2560.0),
        ],
      })
      .await;
    assert_eq!(
      output.tasks[0].task.schedule_hints.placement.host,
      Some("host-tight".into())
    );
  }
}
