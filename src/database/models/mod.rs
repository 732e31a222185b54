// 数据库实体定义

pub mod message; // 消息实体

pub use message::{EmbeddingStatus, MessageRecord, NewMessage};
