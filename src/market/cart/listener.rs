//! 购物车监听器回调接口

use async_trait::async_trait;

/// 购物车监听器回调接口
///
/// `on_mini_cart_requested` 是跨组件信号的显式通道：
/// 任何想要打开迷你购物车抽屉的一方都通过服务调用触发本回调，
/// 由注册方（抽屉组件的宿主）统一响应，不使用隐式全局事件总线。
#[async_trait]
pub trait CartListener: Send + Sync {
    /// 购物车内容变化（乐观写入、服务器确认、回滚都会触发）
    async fn on_cart_changed(&self, cart_json: String);

    /// 请求打开迷你购物车抽屉
    async fn on_mini_cart_requested(&self);

    /// 变更失败并已回滚；`reason` 为可向用户展示的恢复提示
    async fn on_mutation_failed(&self, target: String, reason: String);
}

/// 空实现（默认监听器）
pub struct EmptyCartListener;

#[async_trait]
impl CartListener for EmptyCartListener {
    async fn on_cart_changed(&self, _cart_json: String) {}
    async fn on_mini_cart_requested(&self) {}
    async fn on_mutation_failed(&self, _target: String, _reason: String) {}
}
