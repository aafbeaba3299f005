//! Typed - 型付き Task API
//!
//! このモジュールは task_type の typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! タスクループは TaskRequest の `task_type` で DynHandler を引き、
//! payload（JSON）を渡して実行する。

pub mod handler;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::handler::{DynHandler, Handler, TaskContext, TypedHandler};
pub use self::registry::{RegistryError, TypedRegistry};
pub use self::task::Task;
