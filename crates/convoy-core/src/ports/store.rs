//! GridStore port - クラスタ全体で共有される永続 KV ストア
//!
//! # 設計原則
//! - 名前付きの map（文字列キー → 小さなシリアライズ済みレコード）
//! - 全ノードから見える
//! - map は外部要因で破棄され得る（シャットダウン競合）。破棄後の操作は
//!   エラーではなく「何もしない / 空を返す」
//!
//! 値は `serde_json::Value` で保持し、型付きの読み書きは [`TypedMap`] が担う。

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::GridResult;

/// A named grid-wide map of JSON values.
///
/// Every method tolerates a destroyed map: reads return nothing, writes are
/// dropped and report `false`.
#[async_trait]
pub trait GridMap: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backing map still exists.
    async fn exists(&self) -> bool;

    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Returns `false` when the map no longer exists.
    async fn put(&self, key: &str, value: serde_json::Value) -> bool;

    async fn remove(&self, key: &str) -> Option<serde_json::Value>;

    async fn entries(&self) -> Vec<(String, serde_json::Value)>;

    /// Removes every entry. Returns whether anything was present.
    async fn clear(&self) -> bool;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn contains_key(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }
}

/// Factory of named maps.
pub trait GridStore: Send + Sync {
    fn map(&self, name: &str) -> Arc<dyn GridMap>;
}

/// Serde view over a [`GridMap`].
pub struct TypedMap<T> {
    raw: Arc<dyn GridMap>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedMap<T> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedMap<T> {
    pub fn new(raw: Arc<dyn GridMap>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> &Arc<dyn GridMap> {
        &self.raw
    }

    pub async fn exists(&self) -> bool {
        self.raw.exists().await
    }

    pub async fn get(&self, key: &str) -> GridResult<Option<T>> {
        match self.raw.get(key).await {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &T) -> GridResult<bool> {
        let v = serde_json::to_value(value)?;
        Ok(self.raw.put(key, v).await)
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.raw.remove(key).await.is_some()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.raw.contains_key(key).await
    }

    /// Entries that fail to decode are skipped.
    pub async fn entries(&self) -> Vec<(String, T)> {
        self.raw
            .entries()
            .await
            .into_iter()
            .filter_map(|(k, v)| match serde_json::from_value(v) {
                Ok(t) => Some((k, t)),
                Err(e) => {
                    tracing::warn!(map = self.raw.name(), key = %k, error = %e, "Skipping undecodable entry");
                    None
                }
            })
            .collect()
    }

    pub async fn clear(&self) -> bool {
        self.raw.clear().await
    }

    pub async fn is_empty(&self) -> bool {
        self.raw.is_empty().await
    }
}
