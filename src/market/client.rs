//! 市场客户端核心实现模块
//!
//! 组装认证、缓存与各业务服务，并管理推送通道（WebSocket）的生命周期：
//! 连接鉴权、心跳、出站事件转发、入站事件分发、断线重连与兜底失效。

use crate::market::auth::{AuthService, LoginData, SessionStore};
use crate::market::cache::QueryCache;
use crate::market::cart::{CartApi, CartService};
use crate::market::chat::models::{MessageReadPayload, MessageReceivedPayload, TypingPayload};
use crate::market::chat::{ChatApi, ChatService};
use crate::market::guard::{evaluate_path, RouteDecision, RouteRule};
use crate::market::projects::{ProjectsApi, ProjectsService};
use crate::market::serialization::generate_operation_id;
use crate::market::types::{event_name, ApiError, PushSender, SocketConnectResp, SocketEnvelope, SocketRequest};
use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 重连退避的上限
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// HTTP API 基础地址
    pub api_base_url: String,
    /// WebSocket 服务器 URL
    pub ws_url: String,
    /// 凭证持久化使用的本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://credentials.db?mode=rwc`
    pub credential_db_url: String,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self {
            api_base_url: "http://localhost:10002".to_string(),
            ws_url: "ws://localhost:10001".to_string(),
            credential_db_url: "sqlite://credentials.db?mode=rwc".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 市场客户端
///
/// 所有业务服务共享同一份会话状态与查询缓存
pub struct MarketClient {
    config: ClientConfig,
    session: Arc<SessionStore>,
    auth: Arc<AuthService>,
    cache: Arc<QueryCache>,
    cart: Arc<CartService>,
    chat: Arc<ChatService>,
    projects: Arc<ProjectsService>,
}

impl MarketClient {
    /// 创建新的客户端
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let session = Arc::new(SessionStore::new());
        let auth = Arc::new(
            AuthService::new(
                config.api_base_url.clone(),
                session.clone(),
                &config.credential_db_url,
            )
            .await?,
        );
        let http = auth.http_client();
        let cache = Arc::new(QueryCache::new());

        let cart = Arc::new(CartService::new(
            CartApi::new(http.clone(), config.api_base_url.clone()),
            cache.clone(),
            session.clone(),
        ));
        let chat = Arc::new(ChatService::new(
            ChatApi::new(http.clone(), config.api_base_url.clone()),
            cache.clone(),
            session.clone(),
        ));
        let projects = Arc::new(ProjectsService::new(
            ProjectsApi::new(http, config.api_base_url.clone()),
            cache.clone(),
            session.clone(),
        ));

        Ok(Self {
            config,
            session,
            auth,
            cache,
            cart,
            chat,
            projects,
        })
    }

    pub fn session(&self) -> Arc<SessionStore> {
        self.session.clone()
    }

    pub fn cache(&self) -> Arc<QueryCache> {
        self.cache.clone()
    }

    pub fn auth(&self) -> Arc<AuthService> {
        self.auth.clone()
    }

    pub fn cart(&self) -> Arc<CartService> {
        self.cart.clone()
    }

    pub fn chat(&self) -> Arc<ChatService> {
        self.chat.clone()
    }

    pub fn projects(&self) -> Arc<ProjectsService> {
        self.projects.clone()
    }

    /// 按路由表对路径求值（宿主应用在每次导航时调用）
    pub fn route_decision(&self, rules: &[RouteRule], path: &str) -> RouteDecision {
        evaluate_path(rules, &self.session.view(), path)
    }

    /// 启动时执行一次：尝试从持久化凭证静默恢复会话（永不失败）
    pub async fn initialize(&self) {
        self.auth.initialize().await;
    }

    /// 登录并持久化凭证
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginData, ApiError> {
        self.auth.login(email, password).await
    }

    /// 登出：销毁会话、清除持久化凭证并清空全部缓存
    ///
    /// 会话清除后重连循环检测不到凭证，推送连接自然终止。
    pub async fn logout(&self) {
        self.auth.logout().await;
        self.cache.clear_all();
    }

    /// 构建 WebSocket 连接 URL（token 经查询参数鉴权）
    fn build_ws_url(&self, token: &str) -> String {
        format!(
            "{}/?token={}&operationID={}",
            self.config.ws_url,
            token,
            generate_operation_id()
        )
    }

    /// 建立推送连接：连接、鉴权、启动心跳与出站转发
    ///
    /// 返回出站发送句柄与入站读取端，由调用方接管事件循环。
    async fn establish(&self, token: &str) -> Result<(PushSender, WsReader)> {
        let url = self.build_ws_url(token);
        info!("[Client] 🔗 连接推送服务器: {}", self.config.ws_url);

        let (ws_stream, response) = connect_async(&url).await?;
        info!("[Client] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (write, mut read) = ws_stream.split();
        let writer = Arc::new(Mutex::new(write));

        // 等待连接鉴权响应
        if let Some(Ok(WsMessage::Text(text))) = read.next().await {
            debug!("[Client] 📥 WebSocket 连接响应: {}", text);
            let resp: SocketConnectResp = serde_json::from_str(&text)
                .with_context(|| format!("WebSocket 响应解析失败, 原始响应: {}", text))?;
            if resp.err_code != 0 {
                error!(
                    "[Client] ❌ WebSocket 连接鉴权失败，错误码: {}, 错误信息: {}",
                    resp.err_code, resp.err_msg
                );
                anyhow::bail!(
                    "WebSocket 连接鉴权失败，错误码: {}, 错误信息: {}",
                    resp.err_code,
                    resp.err_msg
                );
            }
            info!("[Client] ✅ 服务器连接鉴权成功");
        } else {
            error!("[Client] ❌ 未收到 WebSocket 连接响应");
            anyhow::bail!("未收到 WebSocket 连接响应");
        }

        // 出站转发：服务层经 PushSender 投递的事件序列化为文本帧发出
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SocketRequest>();
        let writer_for_outbound = writer.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let json = match serde_json::to_string(&req) {
                    Ok(j) => j,
                    Err(e) => {
                        error!("[Client] 出站事件序列化失败: {}", e);
                        continue;
                    }
                };
                let mut w = writer_for_outbound.lock().await;
                if w.send(WsMessage::Text(json)).await.is_err() {
                    warn!("[Client] 出站通道写入失败，转发任务退出");
                    break;
                }
            }
        });

        // 启动心跳
        info!("[Client] 💓 启动心跳");
        let writer_for_heartbeat = writer.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(25));
            loop {
                ticker.tick().await;
                let mut w = writer_for_heartbeat.lock().await;
                if w.send(WsMessage::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        Ok((PushSender::new(tx), read))
    }

    /// 连接推送服务器并在内部启动事件循环（含断线重连）
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let token = self
            .session
            .token()
            .ok_or_else(|| anyhow::anyhow!("未登录，无法建立推送连接"))?;

        let (sender, read) = self.establish(&token).await?;
        self.chat.set_push_sender(Some(sender));

        info!("[Client] 📥 开始监听服务器事件");
        let client = self.clone();
        tokio::spawn(async move {
            client.run_event_loop(read).await;
        });

        Ok(())
    }

    /// 事件循环：读到连接终止后进入重连，凭证不存在（已登出）时停止
    async fn run_event_loop(self: Arc<Self>, mut read: WsReader) {
        loop {
            self.handle_messages(&mut read).await;
            self.chat.handle_disconnected("连接断开").await;

            let mut backoff = Duration::from_secs(1);
            let reconnected = loop {
                let Some(token) = self.session.token() else {
                    break None;
                };
                warn!("[Client] 🔄 {}秒后尝试重连", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                match self.establish(&token).await {
                    Ok(pair) => break Some(pair),
                    Err(e) => {
                        warn!("[Client] 重连失败: {}", e);
                        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
                    }
                }
            };

            match reconnected {
                Some((sender, new_read)) => {
                    self.chat.handle_reconnected(sender).await;
                    read = new_read;
                }
                None => {
                    info!("[Client] 👋 已登出，停止重连");
                    return;
                }
            }
        }
    }

    /// 处理接收事件（单次连接的读取循环）
    async fn handle_messages(&self, read: &mut WsReader) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => {
                    self.dispatch_event(&text).await;
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    warn!("[Client] 👋 连接关闭: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("[Client] WebSocket 错误: {}", e);
                    break;
                }
                _ => {}
            }
        }
    }

    /// 按事件名分发入站事件；载荷非法时记录并丢弃，不中断事件循环
    async fn dispatch_event(&self, text: &str) {
        let envelope = match serde_json::from_str::<SocketEnvelope>(text) {
            Ok(e) => e,
            Err(e) => {
                warn!("[Client] ⚠️ 入站事件解析失败: {}, 原始数据: {}", e, text);
                return;
            }
        };

        match envelope.event.as_str() {
            event_name::CHAT_MESSAGE_RECEIVED => {
                match serde_json::from_value::<MessageReceivedPayload>(envelope.data) {
                    Ok(payload) => self.chat.handle_message_received(payload).await,
                    Err(e) => warn!("[Client] ⚠️ 消息事件载荷非法: {}", e),
                }
            }
            event_name::USER_TYPING => {
                match serde_json::from_value::<TypingPayload>(envelope.data) {
                    Ok(p) => {
                        self.chat
                            .handle_typing(&p.conversation_id, &p.user_id, true)
                            .await
                    }
                    Err(e) => warn!("[Client] ⚠️ 输入事件载荷非法: {}", e),
                }
            }
            event_name::USER_STOPPED_TYPING => {
                match serde_json::from_value::<TypingPayload>(envelope.data) {
                    Ok(p) => {
                        self.chat
                            .handle_typing(&p.conversation_id, &p.user_id, false)
                            .await
                    }
                    Err(e) => warn!("[Client] ⚠️ 输入事件载荷非法: {}", e),
                }
            }
            event_name::CHAT_MESSAGE_READ => {
                match serde_json::from_value::<MessageReadPayload>(envelope.data) {
                    Ok(payload) => self.chat.handle_message_read(payload).await,
                    Err(e) => warn!("[Client] ⚠️ 已读事件载荷非法: {}", e),
                }
            }
            other => {
                debug!("[Client] 未知事件类型: {}", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Role;

    async fn offline_client() -> Arc<MarketClient> {
        let config = ClientConfig {
            api_base_url: "http://127.0.0.1:1".to_string(),
            ws_url: "ws://127.0.0.1:1".to_string(),
            credential_db_url: "sqlite::memory:".to_string(),
        };
        Arc::new(MarketClient::new(config).await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_requires_session() {
        let client = offline_client().await;
        // 未登录：连接被拒绝而不是用空 token 连接
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_tolerates_malformed_payload() {
        let client = offline_client().await;
        // 非法 JSON 与载荷缺字段都只记录日志，不 panic、不中断
        client.dispatch_event("not-json").await;
        client
            .dispatch_event(r#"{"event":"chat_message_received","data":{"bogus":1}}"#)
            .await;
        client
            .dispatch_event(r#"{"event":"something_unknown"}"#)
            .await;
    }

    #[tokio::test]
    async fn test_dispatch_routes_message_event_to_cache() {
        let client = offline_client().await;
        client.session.set_session(
            "u-1".to_string(),
            Role::Customer,
            "tok".to_string(),
        );
        let event = serde_json::json!({
            "event": "chat_message_received",
            "data": {
                "conversationID": "conv-1",
                "message": {
                    "messageID": "msg-1",
                    "conversationID": "conv-1",
                    "senderID": "u-2",
                    "timestamp": 1700000000000_i64,
                }
            }
        });
        client.dispatch_event(&event.to_string()).await;
        let msgs = client.cache.messages("conv-1").snapshot().data.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_id, "msg-1");
    }

    #[tokio::test]
    async fn test_logout_clears_session_and_cache() {
        let client = offline_client().await;
        client.session.set_session(
            "u-1".to_string(),
            Role::Customer,
            "tok".to_string(),
        );
        client.cache.conversations.accept_server(vec![]);
        assert!(client.cache.conversations.snapshot().data.is_some());

        client.logout().await;
        assert!(!client.session.is_authenticated());
        assert!(client.cache.conversations.snapshot().data.is_none());
    }

    /// 需要一个运行中的市场服务器（默认 localhost），默认跳过
    #[tokio::test]
    #[ignore]
    async fn test_connect_against_live_server() {
        let client = Arc::new(MarketClient::new(ClientConfig::new()).await.unwrap());
        client.initialize().await;
        client
            .login("customer@example.com", "password123")
            .await
            .unwrap();
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let convs = client.chat().conversations().await;
        assert!(convs.data.is_some());
    }
}
