//! 购物车模块：模型、HTTP API、乐观变更服务与监听器

pub mod api;
pub mod listener;
pub mod models;
pub mod service;

pub use api::CartApi;
pub use listener::{CartListener, EmptyCartListener};
pub use models::{Cart, CartItem, Promotion};
pub use service::CartService;
