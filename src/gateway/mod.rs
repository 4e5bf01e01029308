//! 多租户网关侧：会话多路复用
//!
//! 网关桥（Telegram / WebSocket 等）把外部身份的入站消息交给 SessionMultiplexer，
//! 由它完成句柄生命周期、同身份串行与容量回收；桥自身的消息格式化不在本层。

pub mod multiplexer;

pub use multiplexer::{
    Enqueued, MultiplexerConfig, SessionFactory, SessionHandle, SessionMultiplexer,
};
