pub mod auth;
pub mod cache;
pub mod cart;
pub mod chat;
pub mod client;
pub mod guard;
pub mod mutation;
pub mod projects;
pub mod serialization;
pub mod types;

// 重新导出认证相关函数
pub use auth::login_async;

// 重新导出缓存与守卫相关类型
pub use cache::{QueryCache, QueryKey, Snapshot};
pub use guard::{evaluate as evaluate_route, RouteDecision, RouteRule};
pub use mutation::{MutationError, MutationPhase};
