//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 調整コアが外部の協調者（グループ通信、共有 KV ストア、リモート呼び出し、
//! 時計）に求めるインターフェースだけを trait として切り出しています。
//!
//! # 設計原則
//! - 共有ストアが正本（coordinator だけがジョブの正規状態を書く）
//! - メッセージングは非保証（必要なら notifier で再送）

pub mod channel;
pub mod clock;
pub mod dispatch;
pub mod store;

// 主要な trait を再エクスポート
pub use self::channel::{Delivered, GroupChannel};
pub use self::clock::{Clock, FixedClock, MonotonicStamp, SystemClock};
pub use self::dispatch::{CommandHandler, RemoteDispatcher};
pub use self::store::{GridMap, GridStore, TypedMap};
