//! 记忆与持久化
//!
//! - **turn**: 对话数据模型（Turn / ContentBlock / Role）
//! - **ledger**: 有序对话账本，维护 tool_use / tool_result 配对不变式
//! - **store**: 按身份划分的追加式磁盘会话（history.jsonl + activity.log）

pub mod ledger;
pub mod store;
pub mod turn;

pub use ledger::HistoryLedger;
pub use store::{sanitize_identity, sweep_sessions, SessionStore};
pub use turn::{ContentBlock, Role, Turn};
