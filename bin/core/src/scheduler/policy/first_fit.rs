//! First fit: scan the agents in order, the first one with enough
//! headroom wins. The decreasing variant packs big tasks first.

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
  registry.insert("first_fit", || {
    Box::new(FirstFit { decreasing: false, wait: VecDeque::new() })
  });
  registry.insert("first_fit_decreasing", || {
    Box::new(FirstFit { decreasing: true, wait: VecDeque::new() })
  });
}

pub struct FirstFit {
  decreasing: bool,
  wait: VecDeque<ScheduledTask>,
}

impl GlobalPolicy for FirstFit {
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
        let found = agents.iter().find(|agent| {
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
      PolicyOutput {
        tasks: placed,
        volumes,
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::policy::test_support::*;

  fn input(
    tasks: Vec<ScheduledTask>,
    agents: Vec<pivot_client::entities::agent::Agent>,
  ) -> PolicyInput {
    PolicyInput {
      tasks,
      volumes: Vec::new(),
      agents,
    }
  }

  #[tokio::test]
  async fn places_on_first_agent_with_capacity() {
    let mut policy = FirstFit {
      decreasing: false,
      wait: VecDeque::new(),
    };
    let output = policy
      .schedule(input(
        vec![
          scheduled_task("a", 2.0, 2048.0),
          scheduled_task("b", 2.0, 2048.0),
        ],
        vec![agent("small", 2.0, 2048.0), agent("big", 8.0, 8192.0)],
      ))
      .await;
    assert_eq!(output.tasks.len(), 2);
    // the first task exhausts the small agent
    assert_eq!(
      output.tasks[0].task.schedule_hints.placement.host,
      Some("host-small".into())
    );
    assert_eq!(
      output.tasks[1].task.schedule_hints.placement.host,
      Some("host-big".into())
    );
  }

  #[tokio::test]
  async fn unplaceable_tasks_wait_for_the_next_tick() {
    let mut policy = FirstFit {
      decreasing: false,
      wait: VecDeque::new(),
    };
    let output = policy
      .schedule(input(
        vec![scheduled_task("a", 16.0, 2048.0)],
        vec![agent("small", 2.0, 2048.0)],
      ))
      .await;
    assert!(output.tasks.is_empty());
    assert_eq!(policy.wait.len(), 1);
    // capacity appears: the waiting task goes out
    let output = policy
      .schedule(input(
        Vec::new(),
        vec![agent("big", 32.0, 65536.0)],
      ))
      .await;
    assert_eq!(output.tasks.len(), 1);
    assert!(policy.wait.is_empty());
  }

  #[tokio::test]
  async fn decreasing_packs_big_tasks_first() {
    let mut policy = FirstFit {
      decreasing: true,
      wait: VecDeque::new(),
    };
    let output = policy
      .schedule(input(
        vec![
          scheduled_task("small", 1.0, 512.0),
          scheduled_task("big", 4.0, 4096.0),
        ],
        vec![agent("only", 4.0, 4096.0)],
      ))
      .await;
    // the big task takes the agent; the small one waits
    assert_eq!(output.tasks.len(), 1);
    assert_eq!(output.tasks[0].container.id, "big");
    assert_eq!(policy.wait.len(), 1);
  }
}
