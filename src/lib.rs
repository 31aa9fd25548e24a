pub mod market;

// 重新导出常用类型和函数，方便外部使用
pub use market::{
    auth::{AuthService, SessionStore, SessionView},
    cart::{Cart, CartItem, CartListener, CartService, Promotion},
    chat::{ChatListener, ChatMessage, ChatService, Conversation},
    client::{ClientConfig, MarketClient},
    guard::{RouteDecision, RouteRule},
    login_async,
    projects::{Project, ProjectsService, Review},
    types::Role,
    QueryCache, QueryKey, Snapshot,
};
