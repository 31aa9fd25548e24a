//! 聊天数据模型与推送事件载荷

use crate::market::serialization::{deserialize_base64, is_temp_msg_id, serialize_base64};
use serde::{Deserialize, Serialize};

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    CustomerSupplier,
    CustomerSupport,
    SupplierSupport,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    Closed,
}

/// 会话
///
/// `unread_count` 在客户端发出已读回执时本地递减，权威值以服务器重新拉取为准。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    #[serde(rename = "participantIDs", default)]
    pub participant_ids: Vec<String>,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub status: ConversationStatus,
    #[serde(default)]
    pub unread_count: i32,
    /// 最新消息摘要（服务器返回，用于列表展示）
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_message_time: i64,
}

/// 消息附件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    #[serde(default)]
    pub mime_type: String,
    /// 服务器存储地址；上传端点缺失时可能为空（功能降级，不报错）
    #[serde(default)]
    pub url: String,
    /// 内联附件数据（base64 传输）；服务器返回的附件中该字段为空
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub data: Vec<u8>,
}

/// 聊天消息
///
/// 两种来源状态：乐观占位（客户端生成 `temp-<时间戳>` 临时 ID）与
/// 服务器已确认（服务器分配的真实 ID）。不变量：每次在途发送恰好对应
/// 一条占位消息，确认或推送回声到达后被替换或移除，绝不重复。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(default)]
    pub sender_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(default)]
    pub is_read: bool,
}

impl ChatMessage {
    /// 是否为尚未被服务器确认的乐观占位消息
    pub fn is_optimistic(&self) -> bool {
        is_temp_msg_id(&self.message_id)
    }
}

// ========== 推送事件载荷 ==========

/// `chat_message_received` 事件载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceivedPayload {
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    pub message: ChatMessage,
}

/// `user_typing` / `user_stopped_typing` 事件载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

/// `chat_message_read` / `mark_message_read` 事件载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
}
