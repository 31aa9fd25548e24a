//! 项目与评价模块：模型、HTTP API 与乐观变更服务

pub mod api;
pub mod models;
pub mod service;

pub use api::ProjectsApi;
pub use models::{Project, Review};
pub use service::ProjectsService;
