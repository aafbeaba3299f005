//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryGridStore**: プロセス内で共有する KV ストア
//! - **LocalCluster**: プロセス内のメンバーシップ + pub/sub + リモート呼び出し
//!
//! # 本番用実装
//! 実ネットワーク上のグループ通信や分散ストアは別クレートで ports を実装する。

pub mod local_cluster;
pub mod memory_store;

// 主要な型を再エクスポート
pub use self::local_cluster::{LocalCluster, LocalEndpoint};
pub use self::memory_store::InMemoryGridStore;
