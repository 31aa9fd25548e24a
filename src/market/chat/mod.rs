//! 聊天模块：模型、HTTP API、推送事件合并服务与监听器

pub mod api;
pub mod listener;
pub mod models;
pub mod service;

pub use api::ChatApi;
pub use listener::{ChatListener, EmptyChatListener};
pub use models::{
    Attachment, ChatMessage, Conversation, ConversationStatus, ConversationType,
    MessageReadPayload, MessageReceivedPayload, TypingPayload,
};
pub use service::ChatService;
