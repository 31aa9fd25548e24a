//! 聊天监听器回调接口

use async_trait::async_trait;

/// 聊天监听器回调接口（宿主应用注册）
#[async_trait]
pub trait ChatListener: Send + Sync {
    /// 某会话的消息缓存发生变化（乐观追加、确认替换、推送合并、已读标记）
    async fn on_messages_changed(&self, conversation_id: String);

    /// 收到一条新的入站消息（JSON 序列化的 `ChatMessage`）
    async fn on_message_received(&self, message_json: String);

    /// 对方输入状态变化
    async fn on_typing_status_changed(&self, conversation_id: String, user_id: String, typing: bool);

    /// 某条消息被标记已读
    async fn on_message_read(&self, conversation_id: String, message_id: String);

    /// 会话列表变化（未读数、最新消息摘要等）
    async fn on_conversation_list_changed(&self, conversations_json: String);

    /// 消息发送失败，占位消息已移除；`text` 为原始输入，供宿主恢复到输入框
    async fn on_message_send_failed(
        &self,
        conversation_id: String,
        temp_id: String,
        text: String,
        reason: String,
    );

    /// 推送通道连接状态变化
    async fn on_connection_status_changed(&self, connected: bool, detail: String);
}

/// 空实现（默认监听器）
pub struct EmptyChatListener;

#[async_trait]
impl ChatListener for EmptyChatListener {
    async fn on_messages_changed(&self, _conversation_id: String) {}
    async fn on_message_received(&self, _message_json: String) {}
    async fn on_typing_status_changed(
        &self,
        _conversation_id: String,
        _user_id: String,
        _typing: bool,
    ) {
    }
    async fn on_message_read(&self, _conversation_id: String, _message_id: String) {}
    async fn on_conversation_list_changed(&self, _conversations_json: String) {}
    async fn on_message_send_failed(
        &self,
        _conversation_id: String,
        _temp_id: String,
        _text: String,
        _reason: String,
    ) {
    }
    async fn on_connection_status_changed(&self, _connected: bool, _detail: String) {}
}
