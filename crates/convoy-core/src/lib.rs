//! convoy-core
//!
//! Cluster-wide job coordination on top of a group channel and a shared
//! key-value store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, message, errors）
//! - **ports**: 抽象化レイヤー（GroupChannel, RemoteDispatcher, GridStore, Clock）
//! - **app**: アプリケーションロジック（run policy, barrier, notifier, task loop, builder）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry）
//! - **impls**: 実装（InMemoryGridStore, LocalCluster など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{GridCompute, GridConfig, GridNode, GridNodeBuilder, Pipeline, RunPolicy, Stage};
pub use crate::domain::{GridError, GridResult, JobState, WorkError};
