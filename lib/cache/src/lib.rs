use std::{collections::HashMap, hash::Hash};

use tokio::sync::RwLock;

/// Async map handing out clones of its values. Backs the agent
/// snapshot and other read-mostly lookups in the core.
#[derive(Debug)]
pub struct CloneCache<K: PartialEq + Eq + Hash, T: Clone>(
  RwLock<HashMap<K, T>>,
);

impl<K: PartialEq + Eq + Hash, T: Clone> Default
  for CloneCache<K, T>
{
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone> CloneCache<K, T> {
  pub async fn get(&self, key: &K) -> Option<T> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn get_keys(&self) -> Vec<K> {
    self.0.read().await.keys().cloned().collect()
  }

  pub async fn get_values(&self) -> Vec<T> {
    self.0.read().await.values().cloned().collect()
  }

  pub async fn insert(&self, key: K, value: T) -> Option<T> {
    self.0.write().await.insert(key, value)
  }

  /// Replace the full contents in one write.
  pub async fn set_all(
    &self,
    entries: impl IntoIterator<Item = (K, T)>,
  ) {
    let mut cache = self.0.write().await;
    cache.clear();
    cache.extend(entries);
  }

  pub async fn remove(&self, key: &K) -> Option<T> {
    self.0.write().await.remove(key)
  }

  pub async fn len(&self) -> usize {
    self.0.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.0.read().await.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn insert_get_remove() {
    let cache = CloneCache::<String, u32>::default();
    cache.insert("a".into(), 1).await;
    assert_eq!(cache.get(&"a".into()).await, Some(1));
    cache.set_all([("b".to_string(), 2)]).await;
    assert_eq!(cache.get(&"a".into()).await, None);
    assert_eq!(cache.get(&"b".into()).await, Some(2));
    assert_eq!(cache.remove(&"b".into()).await, Some(2));
    assert!(cache.is_empty().await);
  }
}
