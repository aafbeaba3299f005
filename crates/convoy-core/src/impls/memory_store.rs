//! InMemoryGridStore - 開発用・テスト用の共有ストア
//!
//! # 学習ポイント
//! - DashMap（ロックストライプ）による並行アクセス
//! - `destroy()` でストアの破棄（シャットダウン競合）を再現できる
//!
//! 同一プロセス内の全ノードが同じインスタンスを `Arc` で共有することで
//! 「クラスタ全体から見える」ストアになる。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::ports::{GridMap, GridStore};

/// InMemoryGridStore は名前付き map の集合
#[derive(Default)]
pub struct InMemoryGridStore {
    maps: DashMap<String, Arc<MemoryMap>>,
    destroyed: Arc<AtomicBool>,
}

impl InMemoryGridStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tears the whole store down. Every map, including handles obtained
    /// earlier, stops existing.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.maps.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl GridStore for InMemoryGridStore {
    fn map(&self, name: &str) -> Arc<dyn GridMap> {
        let map = self
            .maps
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryMap {
                    name: name.to_string(),
                    entries: DashMap::new(),
                    destroyed: Arc::clone(&self.destroyed),
                })
            })
            .clone();
        map
    }
}

pub struct MemoryMap {
    name: String,
    entries: DashMap<String, serde_json::Value>,
    destroyed: Arc<AtomicBool>,
}

impl MemoryMap {
    fn alive(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GridMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> bool {
        self.alive()
    }

    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if !self.alive() {
            return None;
        }
        self.entries.get(key).map(|e| e.value().clone())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> bool {
        if !self.alive() {
            return false;
        }
        self.entries.insert(key.to_string(), value);
        true
    }

    async fn remove(&self, key: &str) -> Option<serde_json::Value> {
        if !self.alive() {
            return None;
        }
        self.entries.remove(key).map(|(_, v)| v)
    }

    async fn entries(&self) -> Vec<(String, serde_json::Value)> {
        if !self.alive() {
            return Vec::new();
        }
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    async fn clear(&self) -> bool {
        if !self.alive() {
            return false;
        }
        let had_any = !self.entries.is_empty();
        self.entries.clear();
        had_any
    }

    async fn len(&self) -> usize {
        if !self.alive() {
            return 0;
        }
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn maps_are_shared_by_name() {
        let store = InMemoryGridStore::new();
        let a = store.map("jobs");
        let b = store.map("jobs");
        a.put("k", json!(1)).await;
        assert_eq!(b.get("k").await, Some(json!(1)));
        assert!(store.map("other").get("k").await.is_none());
    }

    #[tokio::test]
    async fn clear_reports_whether_anything_was_present() {
        let store = InMemoryGridStore::new();
        let map = store.map("jobs");
        assert!(!map.clear().await);
        map.put("k", json!("v")).await;
        assert!(map.clear().await);
        assert!(map.is_empty().await);
    }

    #[tokio::test]
    async fn destroyed_store_is_a_soft_no_op() {
        let store = InMemoryGridStore::new();
        let map = store.map("jobs");
        map.put("k", json!(1)).await;

        store.destroy();

        assert!(!map.exists().await);
        assert!(map.get("k").await.is_none());
        assert!(!map.put("k", json!(2)).await);
        assert!(map.entries().await.is_empty());
        assert!(!map.clear().await);
        assert!(!store.map("fresh").exists().await);
    }
}
