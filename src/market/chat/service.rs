//! 聊天服务层：乐观发送与推送事件合并
//!
//! 两个并发的缓存写入来源在这里汇合：用户发起的乐观变更（网络往返，
//! 完成顺序不定）与服务器推送事件（独立到达）。所有合并都通过缓存槽位的
//! 原子"读-改-写"完成，单次调用内观察不到撕裂的中间状态。
//!
//! 房间纪律："最后订阅者胜出"——同一客户端同时至多加入一个会话房间，
//! 切换会话先退出旧房间再加入新房间；断线重连后由客户端触发重新加入，
//! 并以 REST 拉取兜底补偿断线期间丢失的事件。

use crate::market::auth::SessionStore;
use crate::market::cache::{QueryCache, QueryKey, Snapshot};
use crate::market::chat::api::ChatApi;
use crate::market::chat::listener::{ChatListener, EmptyChatListener};
use crate::market::chat::models::{
    Attachment, ChatMessage, Conversation, ConversationType, MessageReadPayload,
    MessageReceivedPayload,
};
use crate::market::mutation::{MutationError, MutationTracker};
use crate::market::serialization::generate_temp_msg_id;
use crate::market::types::{event_name, PushSender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 输入指示的去抖窗口：超时未收到停止事件则自动清除
/// （容忍丢失的 user_stopped_typing）
pub const TYPING_EXPIRE: Duration = Duration::from_secs(3);

/// 聊天窗口的呈现状态（决定新消息计未读还是立即回执）
#[derive(Debug, Clone, Default)]
struct ChatWindow {
    active_conversation: Option<String>,
    open: bool,
    minimized: bool,
}

/// 推送合并结果
#[derive(Debug, PartialEq)]
enum MergeOutcome {
    /// 同 ID 消息已存在（乐观确认或重复推送），忽略
    Duplicate,
    /// 命中本端乐观占位，已原位替换为确认消息
    SwappedPlaceholder,
    /// 追加为新消息
    Appended,
}

pub struct ChatService {
    api: ChatApi,
    cache: Arc<QueryCache>,
    session: Arc<SessionStore>,
    tracker: MutationTracker,
    listener: Mutex<Arc<dyn ChatListener>>,
    push: Mutex<Option<PushSender>>,
    window: Mutex<ChatWindow>,
    /// 输入指示状态：`会话ID:用户ID` -> 代数。代数递增使过期定时器
    /// 只清除自己那一代的指示，后到的输入事件不会被旧定时器误清。
    typing: Mutex<HashMap<String, u64>>,
}

impl ChatService {
    pub fn new(api: ChatApi, cache: Arc<QueryCache>, session: Arc<SessionStore>) -> Self {
        Self {
            api,
            cache,
            session,
            tracker: MutationTracker::new(),
            listener: Mutex::new(Arc::new(EmptyChatListener)),
            push: Mutex::new(None),
            window: Mutex::new(ChatWindow::default()),
            typing: Mutex::new(HashMap::new()),
        }
    }

    /// 注册聊天监听器
    pub fn set_listener(&self, listener: Arc<dyn ChatListener>) {
        *self.listener.lock().unwrap() = listener;
    }

    fn listener(&self) -> Arc<dyn ChatListener> {
        self.listener.lock().unwrap().clone()
    }

    /// 连接建立/断开时由客户端设置或清除出站句柄
    pub fn set_push_sender(&self, sender: Option<PushSender>) {
        *self.push.lock().unwrap() = sender;
    }

    fn push_send(&self, event: &str, data: serde_json::Value) {
        let sender = self.push.lock().unwrap().clone();
        match sender {
            Some(s) => {
                s.send(event, data);
            }
            None => debug!("[Chat] 推送通道未连接，事件 {} 被丢弃", event),
        }
    }

    fn token_or_disabled(&self) -> Result<String, MutationError> {
        self.session.token().ok_or(MutationError::AuthRequired)
    }

    // ========== 查询 ==========

    /// 会话列表快照（过期且已认证时触发一次拉取）
    pub async fn conversations(&self) -> Snapshot<Vec<Conversation>> {
        if self.cache.conversations.is_stale() && self.session.is_authenticated() {
            self.refresh_conversations().await;
        }
        self.cache.conversations.snapshot()
    }

    pub async fn refresh_conversations(&self) -> Snapshot<Vec<Conversation>> {
        let Some(token) = self.session.token() else {
            debug!("[Chat] 未登录，会话查询已禁用");
            return self.cache.conversations.snapshot();
        };
        if !self.cache.conversations.try_begin_fetch() {
            return self.cache.conversations.snapshot();
        }
        let result = self
            .api
            .get_conversations(&token)
            .await
            .map_err(|e| e.to_string());
        let ok = result.is_ok();
        self.cache.conversations.complete_fetch(result);
        if ok {
            self.notify_conversations_changed().await;
        }
        self.cache.conversations.snapshot()
    }

    /// 某会话的消息快照（过期且已认证时触发一次拉取）
    pub async fn messages(&self, conversation_id: &str) -> Snapshot<Vec<ChatMessage>> {
        let slot = self.cache.messages(conversation_id);
        if slot.is_stale() && self.session.is_authenticated() {
            self.refresh_messages(conversation_id).await;
        }
        slot.snapshot()
    }

    pub async fn refresh_messages(&self, conversation_id: &str) -> Snapshot<Vec<ChatMessage>> {
        let slot = self.cache.messages(conversation_id);
        let Some(token) = self.session.token() else {
            debug!("[Chat] 未登录，消息查询已禁用");
            return slot.snapshot();
        };
        if !slot.try_begin_fetch() {
            return slot.snapshot();
        }
        let result = self
            .api
            .get_messages(&token, conversation_id)
            .await
            .map_err(|e| e.to_string());
        let ok = result.is_ok();
        slot.complete_fetch(result);
        if ok {
            self.listener()
                .on_messages_changed(conversation_id.to_string())
                .await;
        }
        slot.snapshot()
    }

    async fn notify_conversations_changed(&self) {
        if let Some(convs) = self.cache.conversations.snapshot().data {
            let json = serde_json::to_string(&convs).unwrap_or_else(|_| "[]".to_string());
            self.listener().on_conversation_list_changed(json).await;
        }
    }

    // ========== 房间管理 ==========

    /// 进入会话：退出旧房间（若有且不同）并加入新房间，窗口置为打开
    pub fn enter_conversation(&self, conversation_id: &str) {
        let previous = {
            let mut window = self.window.lock().unwrap();
            let prev = window.active_conversation.take();
            window.active_conversation = Some(conversation_id.to_string());
            window.open = true;
            window.minimized = false;
            prev
        };

        if let Some(prev) = previous {
            if prev == conversation_id {
                // 已在该房间，不重复加入
                return;
            }
            self.push_send(
                event_name::LEAVE_CONVERSATION,
                serde_json::json!({ "conversationID": prev }),
            );
        }
        self.push_send(
            event_name::JOIN_CONVERSATION,
            serde_json::json!({ "conversationID": conversation_id }),
        );
        info!("[Chat] 🚪 已进入会话房间: {}", conversation_id);
    }

    /// 离开当前会话（视图卸载时调用），退出房间并分离事件归属
    pub fn leave_active_conversation(&self) {
        let previous = {
            let mut window = self.window.lock().unwrap();
            window.open = false;
            window.active_conversation.take()
        };
        if let Some(prev) = previous {
            self.push_send(
                event_name::LEAVE_CONVERSATION,
                serde_json::json!({ "conversationID": prev }),
            );
            info!("[Chat] 🚪 已离开会话房间: {}", prev);
        }
    }

    /// 更新聊天窗口呈现状态（打开/最小化），决定新消息计未读还是立即回执
    pub fn set_window_state(&self, open: bool, minimized: bool) {
        let mut window = self.window.lock().unwrap();
        window.open = open;
        window.minimized = minimized;
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.window.lock().unwrap().active_conversation.clone()
    }

    // ========== 变更 ==========

    /// 创建会话
    pub async fn create_conversation(
        &self,
        participant_id: &str,
        conversation_type: ConversationType,
    ) -> Result<Conversation, MutationError> {
        let token = self.token_or_disabled()?;
        let conv = self
            .api
            .create_conversation(&token, participant_id, conversation_type)
            .await?;
        self.cache.invalidate(&QueryKey::Conversations);
        Ok(conv)
    }

    /// 发送消息（乐观）
    ///
    /// 立即向缓存追加一条 `temp-<时间戳>` 占位消息；服务器确认后占位被
    /// 替换为真实消息（若推送回声先一步到达，则移除占位）；失败时移除
    /// 占位并把原始输入通过监听器交还宿主。返回最终的服务器消息 ID。
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<String, MutationError> {
        let token = self.token_or_disabled()?;
        let temp_id = generate_temp_msg_id();
        // 每次发送是独立的逻辑目标（占位 ID 唯一），互不阻塞
        let _permit = self.tracker.try_acquire(&format!("message:{}", temp_id))?;

        let me = self.session.user_id().unwrap_or_default();
        let placeholder = ChatMessage {
            message_id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            sender_id: me,
            sender_type: String::new(),
            text: text.to_string(),
            attachments: attachments.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_read: false,
        };

        let slot = self.cache.messages(conversation_id);
        // 预写入：不变量——每次在途发送恰好一条占位。记录槽位在预写入前
        // 是否已有数据：从未拉取过的槽位失败后要还原为未拉取状态，
        // 而不是被回滚成一个"已确认为空"的列表
        let had_data = slot.snapshot().data.is_some();
        slot.update(|data| {
            data.get_or_insert_with(Vec::new).push(placeholder);
        });
        self.listener()
            .on_messages_changed(conversation_id.to_string())
            .await;

        match self
            .api
            .send_message(&token, conversation_id, text, &attachments)
            .await
        {
            Ok(confirmed) => {
                let confirmed_id = confirmed.message_id.clone();
                slot.update(|data| {
                    let msgs = data.get_or_insert_with(Vec::new);
                    if msgs.iter().any(|m| m.message_id == confirmed_id) {
                        // 推送回声已先到：移除占位，保留回声那一条
                        msgs.retain(|m| m.message_id != temp_id);
                    } else if let Some(pos) =
                        msgs.iter().position(|m| m.message_id == temp_id)
                    {
                        msgs[pos] = confirmed;
                    } else {
                        // 占位已不在（极端情况），直接追加确认消息
                        msgs.push(confirmed);
                    }
                });
                self.cache.invalidate(&QueryKey::Conversations);
                self.listener()
                    .on_messages_changed(conversation_id.to_string())
                    .await;
                debug!("[Chat] ✅ 消息确认: tempID={} -> messageID={}", temp_id, confirmed_id);
                Ok(confirmed_id)
            }
            Err(e) => {
                // 回滚：移除占位，缓存回到乐观写入前的状态（在途期间
                // 并发到达的推送消息保留）
                slot.update(|data| {
                    if let Some(msgs) = data {
                        msgs.retain(|m| m.message_id != temp_id);
                        if !had_data && msgs.is_empty() {
                            *data = None;
                        }
                    }
                });
                let err: MutationError = e.into();
                warn!("[Chat] ❌ 发送失败已回滚: tempID={}, err={}", temp_id, err);
                self.listener()
                    .on_messages_changed(conversation_id.to_string())
                    .await;
                self.listener()
                    .on_message_send_failed(
                        conversation_id.to_string(),
                        temp_id,
                        text.to_string(),
                        err.to_string(),
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// 把当前会话标记为已读：对每条未读的入站消息发出已读回执，
    /// 并在本地递减未读数（权威值以服务器重新拉取为准）
    pub async fn mark_conversation_read(&self, conversation_id: &str) {
        let me = self.session.user_id().unwrap_or_default();
        let slot = self.cache.messages(conversation_id);
        let newly_read: Vec<String> = slot.update(|data| {
            let mut ids = Vec::new();
            if let Some(msgs) = data {
                for m in msgs.iter_mut() {
                    if !m.is_read && m.sender_id != me {
                        m.is_read = true;
                        ids.push(m.message_id.clone());
                    }
                }
            }
            ids
        });

        if newly_read.is_empty() {
            return;
        }
        for id in &newly_read {
            self.push_send(
                event_name::MARK_MESSAGE_READ,
                serde_json::json!({
                    "conversationID": conversation_id,
                    "messageID": id,
                }),
            );
        }
        let count = newly_read.len() as i32;
        self.cache.conversations.update(|data| {
            if let Some(convs) = data {
                if let Some(c) = convs
                    .iter_mut()
                    .find(|c| c.conversation_id == conversation_id)
                {
                    c.unread_count = (c.unread_count - count).max(0);
                }
            }
        });
        self.listener()
            .on_messages_changed(conversation_id.to_string())
            .await;
        self.notify_conversations_changed().await;
    }

    // ========== 推送事件合并 ==========

    /// 处理 `chat_message_received`
    ///
    /// 按消息 ID 去重（必须：避免本端刚乐观发送、又经回声收到的消息被
    /// 重复插入）；命中本端占位时原位替换。非本端消息在窗口未打开或已
    /// 最小化时递增未读数，否则立即发出已读回执。
    pub async fn handle_message_received(&self, payload: MessageReceivedPayload) {
        let conversation_id = payload.conversation_id.clone();
        let incoming = payload.message;
        let me = self.session.user_id().unwrap_or_default();
        let from_me = incoming.sender_id == me;

        let slot = self.cache.messages(&conversation_id);
        let incoming_id = incoming.message_id.clone();
        let incoming_text = incoming.text.clone();
        let outcome = slot.update(|data| {
            let msgs = data.get_or_insert_with(Vec::new);
            if msgs.iter().any(|m| m.message_id == incoming_id) {
                return MergeOutcome::Duplicate;
            }
            if from_me {
                // 本端消息的推送回声可能先于 REST 确认到达：
                // 用它替换匹配的乐观占位，保证界面上恰好一条
                if let Some(pos) = msgs
                    .iter()
                    .position(|m| m.is_optimistic() && m.text == incoming_text)
                {
                    msgs[pos] = incoming.clone();
                    return MergeOutcome::SwappedPlaceholder;
                }
            }
            msgs.push(incoming.clone());
            MergeOutcome::Appended
        });

        if outcome == MergeOutcome::Duplicate {
            debug!("[Chat] 重复消息已忽略: messageID={}", incoming_id);
            return;
        }
        self.listener()
            .on_messages_changed(conversation_id.clone())
            .await;

        if !from_me {
            let visible = {
                let window = self.window.lock().unwrap();
                window.open
                    && !window.minimized
                    && window.active_conversation.as_deref() == Some(conversation_id.as_str())
            };
            // 列表摘要在两个分支都要刷新，未读数只在窗口不可见时递增
            let incoming_time = incoming.timestamp;
            self.cache.conversations.update(|data| {
                if let Some(convs) = data {
                    if let Some(c) = convs
                        .iter_mut()
                        .find(|c| c.conversation_id == conversation_id)
                    {
                        c.last_message = incoming_text.clone();
                        c.last_message_time = incoming_time;
                        if !visible {
                            c.unread_count += 1;
                        }
                    }
                }
            });
            self.notify_conversations_changed().await;
            if visible {
                // 正在看这个会话：立即回执，不计未读
                slot.update(|data| {
                    if let Some(msgs) = data {
                        if let Some(m) = msgs.iter_mut().find(|m| m.message_id == incoming_id) {
                            m.is_read = true;
                        }
                    }
                });
                self.push_send(
                    event_name::MARK_MESSAGE_READ,
                    serde_json::json!({
                        "conversationID": conversation_id,
                        "messageID": incoming_id,
                    }),
                );
            }
        }

        let json = serde_json::to_string(&MessageReceivedPayload {
            conversation_id,
            message: incoming,
        })
        .unwrap_or_else(|_| "{}".to_string());
        self.listener().on_message_received(json).await;
    }

    /// 处理 `user_typing` / `user_stopped_typing`
    ///
    /// 纯呈现态，不进缓存。开始事件启动一个去抖定时器，窗口内未收到
    /// 停止事件则自动清除（容忍丢失的停止事件）。
    pub async fn handle_typing(
        self: &Arc<Self>,
        conversation_id: &str,
        user_id: &str,
        started: bool,
    ) {
        let key = format!("{}:{}", conversation_id, user_id);

        if !started {
            let was_present = self.typing.lock().unwrap().remove(&key).is_some();
            if was_present {
                self.listener()
                    .on_typing_status_changed(
                        conversation_id.to_string(),
                        user_id.to_string(),
                        false,
                    )
                    .await;
            }
            return;
        }

        let generation = {
            let mut typing = self.typing.lock().unwrap();
            let gen = typing.values().max().copied().unwrap_or(0) + 1;
            typing.insert(key.clone(), gen);
            gen
        };
        self.listener()
            .on_typing_status_changed(conversation_id.to_string(), user_id.to_string(), true)
            .await;

        // 去抖定时器：只清除自己那一代的指示
        let service = Arc::clone(self);
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(TYPING_EXPIRE).await;
            let expired = {
                let mut typing = service.typing.lock().unwrap();
                if typing.get(&key) == Some(&generation) {
                    typing.remove(&key);
                    true
                } else {
                    false
                }
            };
            if expired {
                debug!("[Chat] ⌨️ 输入指示超时自动清除: {}", key);
                service
                    .listener()
                    .on_typing_status_changed(conversation_id, user_id, false)
                    .await;
            }
        });
    }

    /// 广播本端输入状态（宿主在输入框聚焦输入/停止时调用）
    pub fn notify_typing(&self, conversation_id: &str, typing: bool) {
        let me = self.session.user_id().unwrap_or_default();
        let event = if typing {
            event_name::USER_TYPING
        } else {
            event_name::USER_STOPPED_TYPING
        };
        self.push_send(
            event,
            serde_json::json!({
                "conversationID": conversation_id,
                "userID": me,
            }),
        );
    }

    /// 对方是否正在输入
    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.typing
            .lock()
            .unwrap()
            .contains_key(&format!("{}:{}", conversation_id, user_id))
    }

    /// 处理 `chat_message_read`（幂等）
    pub async fn handle_message_read(&self, payload: MessageReadPayload) {
        let slot = self.cache.messages(&payload.conversation_id);
        let changed = slot.update(|data| {
            if let Some(msgs) = data {
                if let Some(m) = msgs
                    .iter_mut()
                    .find(|m| m.message_id == payload.message_id)
                {
                    if !m.is_read {
                        m.is_read = true;
                        return true;
                    }
                }
            }
            false
        });
        if changed {
            self.listener()
                .on_messages_changed(payload.conversation_id.clone())
                .await;
            self.listener()
                .on_message_read(payload.conversation_id, payload.message_id)
                .await;
        }
    }

    // ========== 连接生命周期 ==========

    /// 传输层断开：清除出站句柄并通知宿主
    pub async fn handle_disconnected(&self, detail: &str) {
        self.set_push_sender(None);
        self.listener()
            .on_connection_status_changed(false, detail.to_string())
            .await;
    }

    /// 重连成功：服务器侧房间成员关系不跨传输层存活，必须重新加入；
    /// 同时使相关缓存失效，以 REST 拉取兜底补偿断线期间丢失的事件
    pub async fn handle_reconnected(&self, sender: PushSender) {
        self.set_push_sender(Some(sender));
        if let Some(active) = self.active_conversation() {
            self.push_send(
                event_name::JOIN_CONVERSATION,
                serde_json::json!({ "conversationID": active }),
            );
            self.cache.invalidate(&QueryKey::Messages(active.clone()));
            info!("[Chat] 🔄 重连后重新加入房间: {}", active);
        }
        self.cache.invalidate(&QueryKey::Conversations);
        self.listener()
            .on_connection_status_changed(true, "重连成功".to_string())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::chat::models::ConversationStatus;
    use crate::market::types::Role;
    use tokio::sync::mpsc;

    fn offline_service() -> (Arc<ChatService>, Arc<QueryCache>, Arc<SessionStore>) {
        let cache = Arc::new(QueryCache::new());
        let session = Arc::new(SessionStore::new());
        session.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        let http = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let api = ChatApi::new(http, "http://127.0.0.1:1".to_string());
        let svc = Arc::new(ChatService::new(api, cache.clone(), session.clone()));
        (svc, cache, session)
    }

    fn inbound(conv: &str, id: &str, sender: &str, text: &str) -> MessageReceivedPayload {
        MessageReceivedPayload {
            conversation_id: conv.to_string(),
            message: ChatMessage {
                message_id: id.to_string(),
                conversation_id: conv.to_string(),
                sender_id: sender.to_string(),
                sender_type: "customer".to_string(),
                text: text.to_string(),
                attachments: vec![],
                timestamp: 1700000000000,
                is_read: false,
            },
        }
    }

    fn seed_conversation(cache: &QueryCache, conv: &str) {
        cache.conversations.accept_server(vec![Conversation {
            conversation_id: conv.to_string(),
            participant_ids: vec!["u-1".to_string(), "u-2".to_string()],
            conversation_type: ConversationType::CustomerSupplier,
            status: ConversationStatus::Active,
            unread_count: 0,
            last_message: String::new(),
            last_message_time: 0,
        }]);
    }

    #[tokio::test]
    async fn test_echo_after_optimistic_send_yields_single_message() {
        let (svc, cache, _s) = offline_service();
        let slot = cache.messages("conv-1");

        // 模拟乐观占位已写入（REST 确认尚未返回）
        let temp_id = generate_temp_msg_id();
        slot.update(|data| {
            data.get_or_insert_with(Vec::new).push(ChatMessage {
                message_id: temp_id.clone(),
                conversation_id: "conv-1".to_string(),
                sender_id: "u-1".to_string(),
                sender_type: String::new(),
                text: "你好".to_string(),
                attachments: vec![],
                timestamp: 1700000000000,
                is_read: false,
            });
        });

        // 推送回声先到：占位被原位替换
        svc.handle_message_received(inbound("conv-1", "msg-1", "u-1", "你好"))
            .await;
        let msgs = slot.snapshot().data.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_id, "msg-1");
        assert!(!msgs[0].is_optimistic());

        // 同一消息的重复推送被忽略
        svc.handle_message_received(inbound("conv-1", "msg-1", "u-1", "你好"))
            .await;
        assert_eq!(slot.snapshot().data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_increments_unread_when_window_closed() {
        let (svc, cache, _s) = offline_service();
        seed_conversation(&cache, "conv-1");

        svc.handle_message_received(inbound("conv-1", "msg-2", "u-2", "在吗"))
            .await;
        let convs = cache.conversations.snapshot().data.unwrap();
        assert_eq!(convs[0].unread_count, 1);
        assert_eq!(convs[0].last_message, "在吗");
        assert_eq!(convs[0].last_message_time, 1700000000000);
        // 消息本体已入缓存且未读
        let msgs = cache.messages("conv-1").snapshot().data.unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(!msgs[0].is_read);
    }

    #[tokio::test]
    async fn test_inbound_visible_window_emits_receipt_not_unread() {
        let (svc, cache, _s) = offline_service();
        seed_conversation(&cache, "conv-1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.set_push_sender(Some(PushSender::new(tx)));
        svc.enter_conversation("conv-1");
        // 消费掉 join 事件
        let join = rx.recv().await.unwrap();
        assert_eq!(join.event, event_name::JOIN_CONVERSATION);

        svc.handle_message_received(inbound("conv-1", "msg-3", "u-2", "在吗"))
            .await;
        // 未读数不变，但列表摘要立即刷新（不依赖周期性重拉）
        let convs = cache.conversations.snapshot().data.unwrap();
        assert_eq!(convs[0].unread_count, 0);
        assert_eq!(convs[0].last_message, "在吗");
        assert_eq!(convs[0].last_message_time, 1700000000000);
        // 本地标记已读并发出回执
        let msgs = cache.messages("conv-1").snapshot().data.unwrap();
        assert!(msgs[0].is_read);
        let receipt = rx.recv().await.unwrap();
        assert_eq!(receipt.event, event_name::MARK_MESSAGE_READ);
        assert_eq!(receipt.data["messageID"], "msg-3");
    }

    #[tokio::test]
    async fn test_room_switch_leaves_then_joins_exactly_once() {
        let (svc, _c, _s) = offline_service();
        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.set_push_sender(Some(PushSender::new(tx)));

        svc.enter_conversation("conv-a");
        let e1 = rx.recv().await.unwrap();
        assert_eq!(e1.event, event_name::JOIN_CONVERSATION);
        assert_eq!(e1.data["conversationID"], "conv-a");

        svc.enter_conversation("conv-b");
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e2.event, event_name::LEAVE_CONVERSATION);
        assert_eq!(e2.data["conversationID"], "conv-a");
        let e3 = rx.recv().await.unwrap();
        assert_eq!(e3.event, event_name::JOIN_CONVERSATION);
        assert_eq!(e3.data["conversationID"], "conv-b");

        // 重复进入同一会话不重复加入
        svc.enter_conversation("conv-b");
        assert!(rx.try_recv().is_err());

        // 卸载视图：退出当前房间
        svc.leave_active_conversation();
        let e4 = rx.recv().await.unwrap();
        assert_eq!(e4.event, event_name::LEAVE_CONVERSATION);
        assert_eq!(e4.data["conversationID"], "conv-b");
        assert!(svc.active_conversation().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_auto_expires_without_stop_event() {
        let (svc, _c, _s) = offline_service();
        svc.handle_typing("conv-1", "u-2", true).await;
        assert!(svc.is_typing("conv-1", "u-2"));

        // 超过去抖窗口后自动清除（容忍丢失的停止事件）
        tokio::time::sleep(TYPING_EXPIRE + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(!svc.is_typing("conv-1", "u-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_refresh_outlives_old_timer() {
        let (svc, _c, _s) = offline_service();
        svc.handle_typing("conv-1", "u-2", true).await;
        // 2 秒后再次收到输入事件：代数刷新
        tokio::time::sleep(Duration::from_secs(2)).await;
        svc.handle_typing("conv-1", "u-2", true).await;
        // 又过 2 秒：旧定时器到期但代数不匹配，指示仍然存在
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(svc.is_typing("conv-1", "u-2"));
        // 再过去抖窗口：新定时器清除
        tokio::time::sleep(TYPING_EXPIRE).await;
        tokio::task::yield_now().await;
        assert!(!svc.is_typing("conv-1", "u-2"));
    }

    #[tokio::test]
    async fn test_notify_typing_emits_start_and_stop() {
        let (svc, _c, _s) = offline_service();
        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.set_push_sender(Some(PushSender::new(tx)));

        svc.notify_typing("conv-1", true);
        let e1 = rx.recv().await.unwrap();
        assert_eq!(e1.event, event_name::USER_TYPING);
        assert_eq!(e1.data["conversationID"], "conv-1");
        assert_eq!(e1.data["userID"], "u-1");

        svc.notify_typing("conv-1", false);
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e2.event, event_name::USER_STOPPED_TYPING);
    }

    #[tokio::test]
    async fn test_stop_event_clears_immediately() {
        let (svc, _c, _s) = offline_service();
        svc.handle_typing("conv-1", "u-2", true).await;
        assert!(svc.is_typing("conv-1", "u-2"));
        svc.handle_typing("conv-1", "u-2", false).await;
        assert!(!svc.is_typing("conv-1", "u-2"));
    }

    #[tokio::test]
    async fn test_message_read_idempotent() {
        let (svc, cache, _s) = offline_service();
        svc.handle_message_received(inbound("conv-1", "msg-9", "u-2", "早"))
            .await;
        let payload = MessageReadPayload {
            conversation_id: "conv-1".to_string(),
            message_id: "msg-9".to_string(),
        };
        svc.handle_message_read(payload.clone()).await;
        svc.handle_message_read(payload).await;
        let msgs = cache.messages("conv-1").snapshot().data.unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_read);
    }

    #[tokio::test]
    async fn test_send_failure_removes_placeholder() {
        let (svc, cache, _s) = offline_service();
        let slot = cache.messages("conv-1");
        slot.accept_server(vec![]);
        let before = slot.snapshot().data.unwrap();

        let err = svc
            .send_message("conv-1", "发不出去的消息", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Transient(_)));
        // 完整回滚：缓存与乐观写入前一致
        assert_eq!(slot.snapshot().data.unwrap(), before);
    }

    #[tokio::test]
    async fn test_send_failure_on_unfetched_slot_restores_unfetched_state() {
        let (svc, cache, _s) = offline_service();
        let slot = cache.messages("conv-1");
        assert!(slot.snapshot().data.is_none());

        let err = svc
            .send_message("conv-1", "发不出去的消息", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Transient(_)));
        // 从未拉取过的槽位回滚后仍是未拉取状态，而不是"确认为空"的列表
        assert!(slot.snapshot().data.is_none());
    }

    #[tokio::test]
    async fn test_mark_conversation_read_emits_receipts_and_decrements() {
        let (svc, cache, _s) = offline_service();
        seed_conversation(&cache, "conv-1");
        svc.handle_message_received(inbound("conv-1", "msg-10", "u-2", "一"))
            .await;
        svc.handle_message_received(inbound("conv-1", "msg-11", "u-2", "二"))
            .await;
        assert_eq!(cache.conversations.snapshot().data.unwrap()[0].unread_count, 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.set_push_sender(Some(PushSender::new(tx)));
        svc.mark_conversation_read("conv-1").await;

        let r1 = rx.recv().await.unwrap();
        let r2 = rx.recv().await.unwrap();
        assert_eq!(r1.event, event_name::MARK_MESSAGE_READ);
        assert_eq!(r2.event, event_name::MARK_MESSAGE_READ);
        assert_eq!(cache.conversations.snapshot().data.unwrap()[0].unread_count, 0);
        // 幂等：再次调用不再发回执
        svc.mark_conversation_read("conv-1").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_and_invalidates() {
        let (svc, cache, _s) = offline_service();
        {
            let (tx, _rx) = mpsc::unbounded_channel();
            svc.set_push_sender(Some(PushSender::new(tx)));
        }
        svc.enter_conversation("conv-1");
        cache.messages("conv-1").accept_server(vec![]);
        cache.conversations.accept_server(vec![]);
        assert!(!cache.conversations.is_stale());

        svc.handle_disconnected("传输层断开").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.handle_reconnected(PushSender::new(tx)).await;
        // 房间重新加入（服务器侧成员关系不跨连接存活）
        let rejoin = rx.recv().await.unwrap();
        assert_eq!(rejoin.event, event_name::JOIN_CONVERSATION);
        assert_eq!(rejoin.data["conversationID"], "conv-1");
        // REST 兜底：缓存被标记过期，触发重新拉取
        assert!(cache.messages("conv-1").is_stale());
        assert!(cache.conversations.is_stale());
    }
}
