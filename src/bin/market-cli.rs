//! 市场 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示市场客户端功能
//! 启动时通过命令行参数指定账号，自动登录连接，展示购物车、会话与推送事件

use anyhow::Result;
use clap::Parser;
use market_sdk_core_rust::market::cart::CartListener;
use market_sdk_core_rust::market::chat::ChatListener;
use market_sdk_core_rust::market::client::{ClientConfig, MarketClient};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// 市场 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "market-cli")]
#[command(about = "市场 CLI 客户端 - 用于测试和展示客户端功能", long_about = None)]
struct Args {
    /// 登录邮箱
    #[arg(short, long, default_value = "customer@example.com")]
    email: String,

    /// 登录密码
    #[arg(short, long, default_value = "password123")]
    password: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:10002")]
    api_base: String,

    /// WebSocket 服务器地址
    #[arg(long, default_value = "ws://localhost:10001")]
    ws_url: String,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,market_sdk_core_rust=debug）
    #[arg(long, default_value = "info,market_sdk_core_rust=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码（文件不需要颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 截取展示摘要的前若干个字符（按字符计数，避免切断多字节汉字）
fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// 设置监听器（输出所有接收到的信息）
fn setup_listeners(client: &MarketClient) {
    // 购物车监听器
    struct CliCartListener;
    #[async_trait::async_trait]
    impl CartListener for CliCartListener {
        async fn on_cart_changed(&self, cart_json: String) {
            info!("[CLI/Cart] 🛒 购物车变更: {}", cart_json);
        }

        async fn on_mini_cart_requested(&self) {
            info!("[CLI/Cart] 🛒 请求打开迷你购物车");
        }

        async fn on_mutation_failed(&self, target: String, reason: String) {
            error!("[CLI/Cart] ❌ 变更失败: target={}, reason={}", target, reason);
        }
    }
    client.cart().set_listener(Arc::new(CliCartListener));

    // 聊天监听器
    struct CliChatListener;
    #[async_trait::async_trait]
    impl ChatListener for CliChatListener {
        async fn on_messages_changed(&self, conversation_id: String) {
            info!("[CLI/Chat] 🔄 消息缓存变更: conversationID={}", conversation_id);
        }

        async fn on_message_received(&self, message_json: String) {
            info!("[CLI/Chat] 📨 收到新消息: {}", message_json);
        }

        async fn on_typing_status_changed(
            &self,
            conversation_id: String,
            user_id: String,
            typing: bool,
        ) {
            info!(
                "[CLI/Chat] ⌨️ 输入状态: conversationID={}, userID={}, typing={}",
                conversation_id, user_id, typing
            );
        }

        async fn on_message_read(&self, conversation_id: String, message_id: String) {
            info!(
                "[CLI/Chat] 📖 消息已读: conversationID={}, messageID={}",
                conversation_id, message_id
            );
        }

        async fn on_conversation_list_changed(&self, conversations_json: String) {
            info!("[CLI/Chat] 📋 会话列表变更: {}", conversations_json);
        }

        async fn on_message_send_failed(
            &self,
            conversation_id: String,
            temp_id: String,
            text: String,
            reason: String,
        ) {
            error!(
                "[CLI/Chat] ❌ 发送失败: conversationID={}, tempID={}, text={}, reason={}",
                conversation_id, temp_id, text, reason
            );
        }

        async fn on_connection_status_changed(&self, connected: bool, detail: String) {
            if connected {
                info!("[CLI/Chat] 🔗 已连接: {}", detail);
            } else {
                error!("[CLI/Chat] 🔗 断开连接: {}", detail);
            }
        }
    }
    client.chat().set_listener(Arc::new(CliChatListener));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    init_logger(&args.log_level);

    info!("[CLI] 🚀 市场 CLI 客户端（测试模式）");
    info!("[CLI] 📧 邮箱: {}", args.email);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    // 创建客户端
    let config = ClientConfig {
        api_base_url: args.api_base.clone(),
        ws_url: args.ws_url.clone(),
        credential_db_url: "sqlite://credentials.db?mode=rwc".to_string(),
    };
    let client = Arc::new(MarketClient::new(config).await?);

    // 设置监听器
    setup_listeners(&client);

    // 启动时静默恢复会话；失败则用命令行账号登录
    client.initialize().await;
    if !client.session().is_authenticated() {
        info!("[CLI] 🔐 正在登录...");
        let data = client
            .login(&args.email, &args.password)
            .await
            .map_err(|e| anyhow::anyhow!("登录失败: {}", e))?;
        info!("[CLI] ✅ 登录成功！用户ID: {}, 角色: {:?}", data.user_id, data.role);
    } else {
        info!(
            "[CLI] ✅ 会话已恢复！用户ID: {}",
            client.session().user_id().unwrap_or_default()
        );
    }

    // 连接推送服务器
    info!("[CLI] 🔗 正在连接推送服务器...");
    client
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("连接失败: {}", e))?;
    info!("[CLI] ✅ 连接成功！");

    // 显示初始信息
    let cart = client.cart().cart().await;
    if let Some(cart) = cart.data {
        info!(
            "[CLI] 🛒 购物车（共 {} 件）: 小计 {} 分, 总计 {} 分",
            cart.items.len(),
            cart.subtotal_cents(),
            cart.total_cents()
        );
    }

    let convs = client.chat().conversations().await;
    if let Some(conversations) = convs.data {
        info!("[CLI] 📋 会话列表（共 {} 个）:", conversations.len());
        for conv in conversations.iter().take(5) {
            info!(
                "[CLI]   - {} | 未读: {} | 最新: {}",
                conv.conversation_id,
                conv.unread_count,
                preview(&conv.last_message, 30)
            );
        }
    }

    let projects = client.projects().projects().await;
    if let Some(projects) = projects.data {
        info!("[CLI] 📁 项目列表（共 {} 个）", projects.len());
    }

    info!("[CLI] 📥 开始监听推送事件...");
    info!("[CLI] 💡 提示：程序将持续运行并显示接收到的所有事件");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
        info!("[CLI] 👋 程序退出");
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        // 持续运行直到被中断
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    Ok(())
}
