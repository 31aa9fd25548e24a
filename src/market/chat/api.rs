//! 聊天 HTTP API 客户端
//!
//! REST 侧负责会话与历史消息的拉取、会话创建与消息发送；
//! 实时事件走推送通道，断线期间以这里的拉取作为兜底补偿。

use crate::market::chat::models::{Attachment, ChatMessage, Conversation, ConversationType};
use crate::market::serialization::generate_operation_id;
use crate::market::types::{handle_http_response_data, ApiError};
use tracing::{debug, info};

/// 聊天相关的 HTTP API 客户端
pub struct ChatApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl ChatApi {
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }

    /// 拉取会话列表（GET /api/chat/conversations）
    pub async fn get_conversations(&self, token: &str) -> Result<Vec<Conversation>, ApiError> {
        let url = format!("{}/api/chat/conversations", self.api_base_url);
        debug!("[ChatAPI] 📡 拉取会话列表");
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response_data::<Vec<Conversation>>(response, "拉取会话列表").await
    }

    /// 创建会话（POST /api/chat/conversations）
    pub async fn create_conversation(
        &self,
        token: &str,
        participant_id: &str,
        conversation_type: ConversationType,
    ) -> Result<Conversation, ApiError> {
        let url = format!("{}/api/chat/conversations", self.api_base_url);
        info!("[ChatAPI] 📡 创建会话: participantID={}", participant_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .json(&serde_json::json!({
                "participantID": participant_id,
                "type": conversation_type,
            }))
            .send()
            .await?;
        handle_http_response_data::<Conversation>(response, "创建会话").await
    }

    /// 拉取会话历史消息（GET /api/chat/conversations/:id/messages）
    pub async fn get_messages(
        &self,
        token: &str,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let url = format!(
            "{}/api/chat/conversations/{}/messages",
            self.api_base_url, conversation_id
        );
        debug!("[ChatAPI] 📡 拉取消息: conversationID={}", conversation_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response_data::<Vec<ChatMessage>>(response, "拉取消息").await
    }

    /// 发送消息（POST /api/chat/conversations/:id/messages），
    /// 返回服务器确认的消息（携带真实消息 ID）
    pub async fn send_message(
        &self,
        token: &str,
        conversation_id: &str,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<ChatMessage, ApiError> {
        let url = format!(
            "{}/api/chat/conversations/{}/messages",
            self.api_base_url, conversation_id
        );
        debug!("[ChatAPI] 📡 发送消息: conversationID={}", conversation_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .json(&serde_json::json!({
                "text": text,
                "attachments": attachments,
            }))
            .send()
            .await?;
        handle_http_response_data::<ChatMessage>(response, "发送消息").await
    }
}
