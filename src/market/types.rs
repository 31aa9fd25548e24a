//! 公共类型定义
//!
//! 包含角色、统一 API 响应包装、API 错误类型以及推送通道的事件封装。

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// 用户角色
///
/// `Guest` 表示未登录的访客；其余三种角色在登录后由服务器下发。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Guest,
    Customer,
    Supplier,
    Admin,
}

impl Role {
    /// 各角色的首页路由（用于角色不匹配时的重定向目标）
    ///
    /// 注意：每个角色的首页路由只要求该角色本身（或不要求角色），
    /// 因此重定向不会产生循环。
    pub fn home_route(&self) -> &'static str {
        match self {
            Role::Customer => "/dashboard",
            Role::Supplier => "/supplier/dashboard",
            Role::Admin => "/admin",
            Role::Guest => "/",
        }
    }
}

/// 推送通道事件名称常量
pub mod event_name {
    // 客户端 -> 服务器
    pub const JOIN_CONVERSATION: &str = "join_conversation";
    pub const LEAVE_CONVERSATION: &str = "leave_conversation";
    pub const USER_TYPING: &str = "user_typing";
    pub const USER_STOPPED_TYPING: &str = "user_stopped_typing";
    pub const MARK_MESSAGE_READ: &str = "mark_message_read";

    // 服务器 -> 客户端
    pub const CHAT_MESSAGE_RECEIVED: &str = "chat_message_received";
    pub const CHAT_MESSAGE_READ: &str = "chat_message_read";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
}

/// 推送通道出站事件（客户端 -> 服务器，JSON 文本帧）
#[derive(Debug, Clone, Serialize)]
pub struct SocketRequest {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SocketRequest {
    pub fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

/// 推送通道出站发送句柄
///
/// 连接建立后由客户端创建并分发给各服务；连接断开后发送会失败，
/// 事件被丢弃并记录日志（功能降级，不报错）。
#[derive(Clone)]
pub struct PushSender {
    tx: tokio::sync::mpsc::UnboundedSender<SocketRequest>,
}

impl PushSender {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<SocketRequest>) -> Self {
        Self { tx }
    }

    /// 发送一个出站事件；通道已关闭时返回 false
    pub fn send(&self, event: &str, data: serde_json::Value) -> bool {
        let ok = self.tx.send(SocketRequest::new(event, data)).is_ok();
        if !ok {
            debug!("[Push] 通道已关闭，事件 {} 被丢弃", event);
        }
        ok
    }
}

/// 推送通道入站事件封装（服务器 -> 客户端）
///
/// `data` 字段可能为 null 或缺失，由各事件处理器自行反序列化为具体载荷。
#[derive(Debug, Clone, Deserialize)]
pub struct SocketEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// WebSocket 连接鉴权响应（连接建立后的第一条文本帧）
#[derive(Debug, Deserialize)]
pub struct SocketConnectResp {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
}

/// 统一的 API 响应包装结构体（包含 errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 服务器业务错误码
pub mod err_code {
    pub const OK: i32 = 0;
    pub const AUTH_REQUIRED: i32 = 1001;
    pub const VALIDATION: i32 = 1002;
    pub const NOT_FOUND: i32 = 1004;
}

/// API 调用错误
///
/// 与 `MutationError` 的区别：`ApiError` 描述一次 HTTP 调用本身的失败，
/// `MutationError` 是变更边界上对外暴露的分类结果。
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP 错误 {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("服务器错误 {code}: {msg}")]
    Server { code: i32, msg: String },
    #[error("反序列化响应失败: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("响应中缺少 data 字段")]
    MissingData,
}

/// 通用 HTTP 响应处理函数：直接反序列化为统一的响应结构体
/// 返回 `ApiResponse<T>`，调用方可以根据需要处理 `data` 字段（可能为 None）
/// 所有 API 都可以共用此方法
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<ApiResponse<T>, ApiError> {
    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response.bytes().await?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(ApiError::Http {
            status,
            body: body_str.to_string(),
        });
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    // 从 bytes 反序列化（body 已经被消费了）
    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        ApiError::Decode(e)
    })?;

    // 检查错误码
    if api_resp.err_code != err_code::OK {
        info!(
            "[HTTP] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(ApiError::Server {
            code: api_resp.err_code,
            msg: api_resp.err_msg,
        });
    }

    Ok(api_resp)
}

/// 与 `handle_http_response` 相同，但要求 data 字段必须存在
pub async fn handle_http_response_data<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<T, ApiError> {
    let resp = handle_http_response::<T>(response, operation_name).await?;
    resp.data.ok_or(ApiError::MissingData)
}
