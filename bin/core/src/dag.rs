//! Container-level dependency graph of one appliance.
//!
//! A transient view: constructed from the container records on
//! every scheduler start and never persisted.

use std::collections::{
  HashMap, HashSet, VecDeque,
};

use anyhow::anyhow;
use pivot_client::entities::container::Container;
use reqwest::StatusCode;
use serror::AddStatusCodeError;

#[derive(Debug, Default)]
pub struct ContainerDag {
  containers: HashMap<String, Container>,
  parent_map: HashMap<String, HashSet<String>>,
  child_map: HashMap<String, HashSet<String>>,
}

impl ContainerDag {
  /// Build the graph, rejecting unknown dependencies and cycles
  /// with 422.
  pub fn construct(
    containers: impl IntoIterator<Item = Container>,
  ) -> serror::Result<ContainerDag> {
    let mut dag = ContainerDag {
      containers: containers
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect(),
      ..Default::default()
    };
    for (id, container) in &dag.containers {
      let parents = dag
        .parent_map
        .entry(id.clone())
        .or_default();
      for dep in &container.dependencies {
        if !dag.containers.contains_key(dep) {
          return Err(
            anyhow!(
              "Dependency '{dep}' of container '{id}' does not exist in this appliance"
            )
            .status_code(StatusCode::UNPROCESSABLE_ENTITY),
          );
        }
        parents.insert(dep.clone());
      }
      for dep in &container.dependencies {
        dag
          .child_map
          .entry(dep.clone())
          .or_default()
          .insert(id.clone());
      }
    }
    // direct mutual dependencies first, for a pointed error
    for (id, parents) in &dag.parent_map {
      let mutual = parents
        .iter()
        .filter(|p| {
          dag
            .parent_map
            .get(*p)
            .is_some_and(|pp| pp.contains(id))
        })
        .map(|p| format!("{id}<->{p}"))
        .collect::<Vec<_>>();
      if !mutual.is_empty() {
        return Err(
          anyhow!("Cycle(s) found: {mutual:?}")
            .status_code(StatusCode::UNPROCESSABLE_ENTITY),
        );
      }
    }
    dag.check_acyclic()?;
    Ok(dag)
  }

  /// Kahn topological sort over the whole graph; anything left
  /// unsorted sits on a cycle.
  fn check_acyclic(&self) -> serror::Result<()> {
    let mut indegree = self
      .parent_map
      .iter()
      .map(|(id, parents)| (id.as_str(), parents.len()))
      .collect::<HashMap<_, _>>();
    let mut queue = indegree
      .iter()
      .filter(|&(_, &degree)| degree == 0)
      .map(|(&id, _)| id)
      .collect::<VecDeque<_>>();
    let mut sorted = 0;
    while let Some(id) = queue.pop_front() {
      sorted += 1;
      let Some(children) = self.child_map.get(id) else {
        continue;
      };
      for child in children {
        let degree = indegree
          .get_mut(child.as_str())
          .expect("child not indexed");
        *degree -= 1;
        if *degree == 0 {
          queue.push_back(child.as_str());
        }
      }
    }
    if sorted < self.parent_map.len() {
      let cyclic = indegree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id.to_string())
        .collect::<Vec<_>>();
      return Err(
        anyhow!("Cycle(s) found among containers: {cyclic:?}")
          .status_code(StatusCode::UNPROCESSABLE_ENTITY),
      );
    }
    Ok(())
  }

  pub fn is_empty(&self) -> bool {
    self.parent_map.is_empty()
  }

  /// Containers whose dependencies are all satisfied (or removed).
  pub fn free(&self) -> Vec<&Container> {
    self
      .parent_map
      .iter()
      .filter(|(_, parents)| parents.is_empty())
      .filter_map(|(id, _)| self.containers.get(id))
      .collect()
  }

  /// Store the freshest container state.
  pub fn update_container(&mut self, container: Container) {
    self.containers.insert(container.id.clone(), container);
  }

  /// Drop a satisfied container and release its children.
  pub fn remove_container(&mut self, id: &str) {
    for child in self.child_map.remove(id).unwrap_or_default() {
      if let Some(parents) = self.parent_map.get_mut(&child) {
        parents.remove(id);
      }
    }
    self.parent_map.remove(id);
    self.containers.remove(id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pivot_client::entities::container::Resources;

  fn container(id: &str, deps: &[&str]) -> Container {
    Container {
      id: id.into(),
      appliance: "test-app".into(),
      image: "ubuntu".into(),
      resources: Resources::default(),
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
      ..Default::default()
    }
  }

  #[test]
  fn free_set_follows_removals() {
    let mut dag = ContainerDag::construct([
      container("a", &[]),
      container("b", &["a"]),
      container("c", &["a", "b"]),
    ])
    .unwrap();
    let free = dag
      .free()
      .iter()
      .map(|c| c.id.clone())
      .collect::<Vec<_>>();
    assert_eq!(free, vec!["a".to_string()]);
    dag.remove_container("a");
    let free = dag
      .free()
      .iter()
      .map(|c| c.id.clone())
      .collect::<Vec<_>>();
    assert_eq!(free, vec!["b".to_string()]);
    dag.remove_container("b");
    dag.remove_container("c");
    assert!(dag.is_empty());
  }

  #[test]
  fn rejects_unknown_dependency() {
    let err = ContainerDag::construct([container(
      "a",
      &["ghost"],
    )])
    .unwrap_err();
    assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
  }

  #[test]
  fn rejects_mutual_dependency() {
    let err = ContainerDag::construct([
      container("a", &["b"]),
      container("b", &["a"]),
    ])
    .unwrap_err();
    assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(err.error.to_string().contains("Cycle"));
  }

  #[test]
  fn rejects_longer_cycles() {
    let err = ContainerDag::construct([
      container("a", &["c"]),
      container("b", &["a"]),
      container("c", &["b"]),
    ])
    .unwrap_err();
    assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
  }
}
