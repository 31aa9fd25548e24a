//! 认证与会话状态
//!
//! 进程级会话存储，持有当前用户身份、角色与 Bearer 凭证，生命周期从应用
//! 启动到登出。对外暴露按字段独立订阅的只读访问器：订阅"是否已认证"的
//! 消费者不会因无关字段变化而被唤醒。
//!
//! 凭证通过本地 SQLite（sqlx）持久化，`initialize` 在启动时静默恢复会话。

use crate::market::types::{handle_http_response_data, ApiError, Role};
use crate::market::serialization::generate_operation_id;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 会话只读视图（路由守卫等消费方使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionView {
    pub loading: bool,
    pub is_authenticated: bool,
    /// 仅当 `is_authenticated = true` 时有意义
    pub role: Role,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    user_id: Option<String>,
    role: Role,
    token: Option<String>,
    loading: bool,
}

/// 进程级会话存储
///
/// 只能由登录 / 登出 / 凭证恢复路径修改；登出或凭证过期时销毁。
pub struct SessionStore {
    state: Mutex<SessionState>,
    authed_tx: watch::Sender<bool>,
    role_tx: watch::Sender<Role>,
    loading_tx: watch::Sender<bool>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (authed_tx, _) = watch::channel(false);
        let (role_tx, _) = watch::channel(Role::Guest);
        let (loading_tx, _) = watch::channel(true);
        Self {
            state: Mutex::new(SessionState {
                loading: true,
                ..Default::default()
            }),
            authed_tx,
            role_tx,
            loading_tx,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().unwrap().token.is_some()
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    pub fn token(&self) -> Option<String> {
        self.state.lock().unwrap().token.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().unwrap().user_id.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().unwrap().loading
    }

    pub fn view(&self) -> SessionView {
        let s = self.state.lock().unwrap();
        SessionView {
            loading: s.loading,
            is_authenticated: s.token.is_some(),
            role: s.role,
        }
    }

    // 按字段订阅；watch 通道只在值实际变化时唤醒订阅方
    pub fn watch_authenticated(&self) -> watch::Receiver<bool> {
        self.authed_tx.subscribe()
    }

    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn watch_loading(&self) -> watch::Receiver<bool> {
        self.loading_tx.subscribe()
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        {
            let mut s = self.state.lock().unwrap();
            s.loading = loading;
        }
        self.loading_tx.send_if_modified(|v| {
            if *v != loading {
                *v = loading;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn set_session(&self, user_id: String, role: Role, token: String) {
        {
            let mut s = self.state.lock().unwrap();
            s.user_id = Some(user_id);
            s.role = role;
            s.token = Some(token);
        }
        self.authed_tx.send_if_modified(|v| {
            if !*v {
                *v = true;
                true
            } else {
                false
            }
        });
        self.role_tx.send_if_modified(|v| {
            if *v != role {
                *v = role;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn clear(&self) {
        {
            let mut s = self.state.lock().unwrap();
            *s = SessionState::default();
        }
        self.authed_tx.send_if_modified(|v| {
            if *v {
                *v = false;
                true
            } else {
                false
            }
        });
        self.role_tx.send_if_modified(|v| {
            if *v != Role::Guest {
                *v = Role::Guest;
                true
            } else {
                false
            }
        });
        self.loading_tx.send_if_modified(|v| {
            if *v {
                *v = false;
                true
            } else {
                false
            }
        });
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ========== 凭证持久化 ==========

/// 本地凭证存储（SQLite）
///
/// 单行表：最近一次登录成功的 {user_id, token}，用于启动时静默恢复。
pub struct CredentialStore {
    pool: Pool<Sqlite>,
}

impl CredentialStore {
    pub async fn new(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(db_url)
            .await
            .context(format!("连接SQLite数据库失败: {}", db_url))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_credential (
                user_id   TEXT PRIMARY KEY,
                token     TEXT NOT NULL,
                saved_at  INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn save(&self, user_id: &str, token: &str) -> Result<()> {
        // 单行语义：先清空再写入
        sqlx::query("DELETE FROM local_credential;")
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO local_credential (user_id, token, saved_at) VALUES (?,?,?);")
            .bind(user_id)
            .bind(token)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<(String, String)>> {
        let row = sqlx::query("SELECT user_id, token FROM local_credential LIMIT 1;")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get::<String, _>("user_id"), r.get::<String, _>("token"))))
    }

    pub async fn wipe(&self) -> Result<()> {
        sqlx::query("DELETE FROM local_credential;")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ========== 登录 API ==========

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub role: Role,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeData {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub role: Role,
}

/// 登录（POST /api/auth/login）
pub async fn login_async(
    http: &reqwest::Client,
    api_base_url: &str,
    email: &str,
    password: &str,
) -> Result<LoginData, ApiError> {
    let url = format!("{}/api/auth/login", api_base_url);
    let operation_id = generate_operation_id();

    info!("🔐 正在登录...");
    debug!("   URL: {}", url);
    debug!("   邮箱: {}", email);
    debug!("   OperationID: {}", operation_id);

    let response = http
        .post(&url)
        .header("Content-Type", "application/json")
        .header("operationID", &operation_id)
        .json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })
        .send()
        .await?;

    handle_http_response_data::<LoginData>(response, "登录").await
}

/// 校验已持久化凭证（GET /api/auth/me）
async fn fetch_me(
    http: &reqwest::Client,
    api_base_url: &str,
    token: &str,
) -> Result<MeData, ApiError> {
    let url = format!("{}/api/auth/me", api_base_url);
    let response = http
        .get(&url)
        .bearer_auth(token)
        .header("operationID", generate_operation_id())
        .send()
        .await?;
    handle_http_response_data::<MeData>(response, "会话校验").await
}

/// 判定一次会话校验失败是否意味着凭证本身被服务器拒绝。
///
/// 业务错误码（统一响应包装）与裸 HTTP 401 都视为拒绝，持久化凭证
/// 应当清除；其余情况视为瞬时故障，凭证保留待下次启动重试。
fn credential_rejected(err: &ApiError) -> bool {
    match err {
        ApiError::Server { .. } => true,
        ApiError::Http { status, .. } => *status == reqwest::StatusCode::UNAUTHORIZED,
        _ => false,
    }
}

// ========== 认证服务 ==========

/// 认证服务：登录 / 登出 / 启动时静默恢复
pub struct AuthService {
    api_base_url: String,
    http: reqwest::Client,
    session: Arc<SessionStore>,
    credentials: CredentialStore,
}

impl AuthService {
    pub async fn new(
        api_base_url: String,
        session: Arc<SessionStore>,
        credential_db_url: &str,
    ) -> Result<Self> {
        // 客户端级超时：挂死的请求最终会失败并触发回滚，而不是无限等待
        let http = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()
            .context("创建 HTTP 客户端失败")?;
        let credentials = CredentialStore::new(credential_db_url).await?;
        Ok(Self {
            api_base_url,
            http,
            session,
            credentials,
        })
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// 启动时执行一次：尝试从持久化凭证静默恢复会话
    ///
    /// 约定：永不失败。任何一步出错都只是保持未认证状态；
    /// `loading` 在解析完成前为 true。恢复成功后，依赖会话的查询
    /// （购物车、会话列表）自动变为"启用"——启用条件由各服务从
    /// 会话状态推导，无需额外标记。
    pub async fn initialize(&self) {
        self.session.set_loading(true);

        let stored = match self.credentials.load().await {
            Ok(s) => s,
            Err(e) => {
                warn!("[Auth] 读取持久化凭证失败: {}", e);
                None
            }
        };

        if let Some((_user_id, token)) = stored {
            match fetch_me(&self.http, &self.api_base_url, &token).await {
                Ok(me) => {
                    info!("[Auth] ✅ 会话静默恢复成功: userID={}", me.user_id);
                    self.session.set_session(me.user_id, me.role, token);
                }
                Err(e) if credential_rejected(&e) => {
                    // 凭证已失效：清除持久化凭证，保持未认证
                    info!("[Auth] 持久化凭证已失效（{}），已清除", e);
                    if let Err(e) = self.credentials.wipe().await {
                        warn!("[Auth] 清除失效凭证失败: {}", e);
                    }
                }
                Err(e) => {
                    // 瞬时网络错误：保留凭证，本次以未认证状态启动
                    warn!("[Auth] 会话恢复失败（网络原因，凭证保留）: {}", e);
                }
            }
        } else {
            debug!("[Auth] 无持久化凭证，跳过静默恢复");
        }

        self.session.set_loading(false);
    }

    /// 登录并持久化凭证
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginData, ApiError> {
        let data = login_async(&self.http, &self.api_base_url, email, password).await?;
        self.session
            .set_session(data.user_id.clone(), data.role, data.token.clone());
        if let Err(e) = self.credentials.save(&data.user_id, &data.token).await {
            // 持久化失败不影响本次会话，只影响下次静默恢复
            warn!("[Auth] 持久化凭证失败: {}", e);
        }
        info!("[Auth] ✅ 登录成功: userID={}, role={:?}", data.user_id, data.role);
        Ok(data)
    }

    /// 登出：销毁会话并清除持久化凭证
    pub async fn logout(&self) {
        self.session.clear();
        if let Err(e) = self.credentials.wipe().await {
            warn!("[Auth] 清除持久化凭证失败: {}", e);
        }
        info!("[Auth] 👋 已登出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_store_defaults() {
        let store = SessionStore::new();
        assert!(store.is_loading());
        assert!(!store.is_authenticated());
        assert_eq!(store.role(), Role::Guest);
        assert!(store.token().is_none());
    }

    #[test]
    fn test_per_field_subscription() {
        let store = SessionStore::new();
        let mut authed_rx = store.watch_authenticated();
        let mut role_rx = store.watch_role();
        let mut loading_rx = store.watch_loading();
        authed_rx.borrow_and_update();
        role_rx.borrow_and_update();
        loading_rx.borrow_and_update();

        // 只改 loading：认证与角色订阅方不应被唤醒
        store.set_loading(false);
        assert!(loading_rx.has_changed().unwrap());
        assert!(!authed_rx.has_changed().unwrap());
        assert!(!role_rx.has_changed().unwrap());
        loading_rx.borrow_and_update();

        // 登录：认证与角色订阅方被唤醒
        store.set_session("u-1".to_string(), Role::Supplier, "tok".to_string());
        assert!(authed_rx.has_changed().unwrap());
        assert!(role_rx.has_changed().unwrap());
        assert_eq!(*role_rx.borrow_and_update(), Role::Supplier);

        // 重复设置相同角色不应重复唤醒
        store.set_session("u-1".to_string(), Role::Supplier, "tok2".to_string());
        assert!(!role_rx.has_changed().unwrap());
    }

    #[test]
    fn test_clear_destroys_session() {
        let store = SessionStore::new();
        store.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        assert!(store.is_authenticated());
        store.clear();
        assert!(!store.is_authenticated());
        assert_eq!(store.role(), Role::Guest);
        assert!(store.user_id().is_none());
    }

    #[tokio::test]
    async fn test_credential_store_roundtrip() {
        let store = CredentialStore::new("sqlite::memory:").await.unwrap();
        assert!(store.load().await.unwrap().is_none());

        store.save("u-1", "tok-1").await.unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            Some(("u-1".to_string(), "tok-1".to_string()))
        );

        // 单行语义：新凭证覆盖旧凭证
        store.save("u-2", "tok-2").await.unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            Some(("u-2".to_string(), "tok-2".to_string()))
        );

        store.wipe().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_never_fails_without_server() {
        // 无持久化凭证 + 服务器不可达：恢复流程安静结束，保持未认证
        let session = Arc::new(SessionStore::new());
        let auth = AuthService::new(
            "http://127.0.0.1:1".to_string(),
            session.clone(),
            "sqlite::memory:",
        )
        .await
        .unwrap();
        auth.initialize().await;
        assert!(!session.is_loading());
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_credential_rejected_classification() {
        // 业务错误码与裸 HTTP 401 都意味着凭证被拒绝，应清除
        assert!(credential_rejected(&ApiError::Server {
            code: 1001,
            msg: "token 已过期".to_string(),
        }));
        assert!(credential_rejected(&ApiError::Http {
            status: reqwest::StatusCode::UNAUTHORIZED,
            body: String::new(),
        }));
        // 服务器故障与响应缺陷是瞬时情况，凭证保留
        assert!(!credential_rejected(&ApiError::Http {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: String::new(),
        }));
        assert!(!credential_rejected(&ApiError::MissingData));
    }
}
