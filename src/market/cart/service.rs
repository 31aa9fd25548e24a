//! 购物车服务层：乐观变更执行器
//!
//! 每个变更操作遵循统一生命周期：
//! 1. 预写入：把预期的变更结果立即写入缓存（界面先行反映成功）；
//! 2. 远程调用：携带当前凭证请求服务器；
//! 3. 成功：用服务器规范化数据替换乐观数据，并使依赖缓存失效；
//! 4. 失败：回滚到预写入前的快照，并通过监听器暴露可恢复错误。
//!
//! 并发策略：同一购物车条目同时只允许一个在途变更，第二个请求
//! 返回 `Busy` 由调用方重试，更新不会被静默吞掉。

use crate::market::auth::SessionStore;
use crate::market::cache::{QueryCache, QueryKey, Snapshot};
use crate::market::cart::api::CartApi;
use crate::market::cart::listener::{CartListener, EmptyCartListener};
use crate::market::cart::models::{Cart, Promotion};
use crate::market::mutation::{MutationError, MutationPhase, MutationTracker};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct CartService {
    api: CartApi,
    cache: Arc<QueryCache>,
    session: Arc<SessionStore>,
    tracker: MutationTracker,
    listener: Mutex<Arc<dyn CartListener>>,
}

impl CartService {
    pub fn new(api: CartApi, cache: Arc<QueryCache>, session: Arc<SessionStore>) -> Self {
        Self {
            api,
            cache,
            session,
            tracker: MutationTracker::new(),
            listener: Mutex::new(Arc::new(EmptyCartListener)),
        }
    }

    /// 注册购物车监听器
    pub fn set_listener(&self, listener: Arc<dyn CartListener>) {
        *self.listener.lock().unwrap() = listener;
    }

    fn listener(&self) -> Arc<dyn CartListener> {
        self.listener.lock().unwrap().clone()
    }

    /// 凭证检查：无凭证时变更被禁用
    fn token_or_disabled(&self) -> Result<String, MutationError> {
        self.session.token().ok_or(MutationError::AuthRequired)
    }

    async fn notify_cart_changed(&self) {
        if let Some(cart) = self.cache.cart.snapshot().data {
            let json = serde_json::to_string(&cart).unwrap_or_else(|_| "{}".to_string());
            self.listener().on_cart_changed(json).await;
        }
    }

    /// 读取当前快照；数据过期且查询已启用（已认证）时触发一次拉取
    pub async fn cart(&self) -> Snapshot<Cart> {
        if self.cache.cart.is_stale() && self.session.is_authenticated() {
            self.refresh().await;
        }
        self.cache.cart.snapshot()
    }

    /// 强制刷新购物车（无凭证或已有在途拉取时静默跳过）
    pub async fn refresh(&self) -> Snapshot<Cart> {
        let Some(token) = self.session.token() else {
            debug!("[Cart] 未登录，购物车查询已禁用");
            return self.cache.cart.snapshot();
        };
        if !self.cache.cart.try_begin_fetch() {
            return self.cache.cart.snapshot();
        }
        let result = self.api.get_cart(&token).await.map_err(|e| e.to_string());
        let ok = result.is_ok();
        self.cache.cart.complete_fetch(result);
        if ok {
            self.notify_cart_changed().await;
        }
        self.cache.cart.snapshot()
    }

    /// 修改条目数量（收敛到 [1, 库存]）
    pub async fn change_quantity(&self, item_id: &str, desired: i64) -> Result<(), MutationError> {
        let token = self.token_or_disabled()?;
        let target = format!("cart-item:{}", item_id);
        let _permit = self.tracker.try_acquire(&target)?;

        // 乐观写入前的完整快照，失败时按字节恢复
        let prev = self.cache.cart.snapshot().data;
        let Some(prev_cart) = prev.clone() else {
            // 本地尚无快照：无可展示的乐观状态，直接走服务器
            let server_cart = self
                .api
                .update_item_quantity(&token, item_id, desired.max(1))
                .await?;
            self.cache.cart.accept_server(server_cart);
            self.cache.invalidate(&QueryKey::Projects);
            self.notify_cart_changed().await;
            return Ok(());
        };

        let Some(item) = prev_cart.item(item_id) else {
            // 本地引用已过期：清除并提示重新拉取
            warn!("[Cart] 条目 {} 不在本地快照中，标记购物车过期", item_id);
            self.cache.cart.invalidate();
            return Err(MutationError::NotFound(format!("条目 {} 不存在", item_id)));
        };
        let clamped = item.clamp_quantity(desired);
        if clamped == item.quantity {
            debug!("[Cart] 数量未变化（{}），跳过", clamped);
            return Ok(());
        }

        // 预写入
        self.cache.cart.update(|data| {
            if let Some(cart) = data {
                if let Some(i) = cart.item_mut(item_id) {
                    i.quantity = clamped;
                }
            }
        });
        let mut phase = MutationPhase::OptimisticApplied;
        debug!("[Cart] 乐观写入: itemID={}, quantity={}, phase={:?}", item_id, clamped, phase);
        self.notify_cart_changed().await;

        match self.api.update_item_quantity(&token, item_id, clamped).await {
            Ok(server_cart) => {
                phase = MutationPhase::Confirmed;
                self.cache.cart.accept_server(server_cart);
                // 购物车变更会影响汇总它的项目/订单视图
                self.cache.invalidate(&QueryKey::Projects);
                self.notify_cart_changed().await;
                debug!("[Cart] ✅ 数量变更确认: itemID={}, phase={:?}", item_id, phase);
                Ok(())
            }
            Err(e) => {
                phase = MutationPhase::RolledBack;
                self.cache.cart.update(|data| *data = prev);
                self.notify_cart_changed().await;
                let err: MutationError = e.into();
                warn!(
                    "[Cart] ❌ 数量变更失败已回滚: itemID={}, phase={:?}, err={}",
                    item_id, phase, err
                );
                self.listener()
                    .on_mutation_failed(target, err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// 数量加一（到达库存上限时为空操作）
    pub async fn increment_quantity(&self, item_id: &str) -> Result<(), MutationError> {
        let current = self
            .cache
            .cart
            .snapshot()
            .data
            .and_then(|c| c.item(item_id).map(|i| i.quantity));
        match current {
            Some(q) => self.change_quantity(item_id, q + 1).await,
            None => self.change_quantity(item_id, 1).await,
        }
    }

    /// 数量减一（下限为 1；移除条目是独立操作）
    pub async fn decrement_quantity(&self, item_id: &str) -> Result<(), MutationError> {
        let current = self
            .cache
            .cart
            .snapshot()
            .data
            .and_then(|c| c.item(item_id).map(|i| i.quantity));
        match current {
            Some(q) => self.change_quantity(item_id, q - 1).await,
            None => Err(MutationError::NotFound(format!("条目 {} 不存在", item_id))),
        }
    }

    /// 移除条目
    pub async fn remove_item(&self, item_id: &str) -> Result<(), MutationError> {
        let token = self.token_or_disabled()?;
        let target = format!("cart-item:{}", item_id);
        let _permit = self.tracker.try_acquire(&target)?;

        let prev = self.cache.cart.snapshot().data;

        // 预写入：立即从本地快照移除
        self.cache.cart.update(|data| {
            if let Some(cart) = data {
                cart.items.retain(|i| i.item_id != item_id);
            }
        });
        self.notify_cart_changed().await;

        match self.api.remove_item(&token, item_id).await {
            Ok(server_cart) => {
                self.cache.cart.accept_server(server_cart);
                self.cache.invalidate(&QueryKey::Projects);
                self.notify_cart_changed().await;
                info!("[Cart] ✅ 条目已移除: itemID={}", item_id);
                Ok(())
            }
            Err(e) => {
                self.cache.cart.update(|data| *data = prev);
                self.notify_cart_changed().await;
                let err: MutationError = e.into();
                warn!("[Cart] ❌ 移除失败已回滚: itemID={}, err={}", item_id, err);
                self.listener()
                    .on_mutation_failed(target, err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// 应用促销码
    ///
    /// 促销码在被信任前必须经过服务器校验，因此这里没有可合成的乐观状态：
    /// 校验通过后才写入缓存。校验失败时原始输入由调用方保留供用户修正。
    pub async fn apply_promotion(&self, code: &str) -> Result<Promotion, MutationError> {
        let token = self.token_or_disabled()?;
        let _permit = self.tracker.try_acquire("promotion")?;

        let subtotal = self
            .cache
            .cart
            .snapshot()
            .data
            .map(|c| c.subtotal_cents())
            .unwrap_or(0);

        match self.api.validate_promotion(&token, code, subtotal).await {
            Ok(promo) => {
                self.cache.cart.update(|data| {
                    if let Some(cart) = data {
                        cart.promotion = Some(promo.clone());
                    }
                });
                self.notify_cart_changed().await;
                info!(
                    "[Cart] ✅ 促销码已应用: code={}, 折扣={}分",
                    promo.code, promo.discount_cents
                );
                Ok(promo)
            }
            Err(e) => {
                let err: MutationError = e.into();
                self.listener()
                    .on_mutation_failed("promotion".to_string(), err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// 移除促销码（纯客户端状态，总额精确恢复到小计）
    pub async fn remove_promotion(&self) {
        self.cache.cart.update(|data| {
            if let Some(cart) = data {
                cart.promotion = None;
            }
        });
        self.notify_cart_changed().await;
        info!("[Cart] 促销码已移除");
    }

    /// 请求打开迷你购物车抽屉（跨组件信号的显式通道）
    pub async fn request_mini_cart(&self) {
        self.listener().on_mini_cart_requested().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::cart::models::CartItem;
    use crate::market::types::Role;

    /// 指向不可达地址的服务，用于确定性地触发网络失败路径
    fn offline_service() -> (CartService, Arc<QueryCache>, Arc<SessionStore>) {
        let cache = Arc::new(QueryCache::new());
        let session = Arc::new(SessionStore::new());
        let http = reqwest::ClientBuilder::new()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap();
        let api = CartApi::new(http, "http://127.0.0.1:1".to_string());
        let svc = CartService::new(api, cache.clone(), session.clone());
        (svc, cache, session)
    }

    fn seed_cart(cache: &QueryCache) -> Cart {
        let cart = Cart {
            items: vec![CartItem {
                item_id: "item-1".to_string(),
                product_id: "prod-1".to_string(),
                supplier_id: "sup-1".to_string(),
                product_name: "螺丝刀".to_string(),
                quantity: 2,
                stock_quantity: 5,
                unit_price_cents: 1000,
            }],
            promotion: None,
        };
        cache.cart.accept_server(cart.clone());
        cart
    }

    #[tokio::test]
    async fn test_mutation_without_token_is_disabled() {
        let (svc, cache, _session) = offline_service();
        let prev = seed_cart(&cache);
        let err = svc.change_quantity("item-1", 3).await.unwrap_err();
        assert!(matches!(err, MutationError::AuthRequired));
        // 缓存未被触碰
        assert_eq!(cache.cart.snapshot().data, Some(prev));
    }

    #[tokio::test]
    async fn test_failed_mutation_rolls_back_exactly() {
        let (svc, cache, session) = offline_service();
        session.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        let prev = seed_cart(&cache);

        let err = svc.change_quantity("item-1", 3).await.unwrap_err();
        assert!(matches!(err, MutationError::Transient(_)));
        // 回滚后与乐观写入前完全一致
        assert_eq!(cache.cart.snapshot().data, Some(prev));
    }

    #[tokio::test]
    async fn test_remove_item_rolls_back_on_failure() {
        let (svc, cache, session) = offline_service();
        session.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        let prev = seed_cart(&cache);

        let err = svc.remove_item("item-1").await.unwrap_err();
        assert!(matches!(err, MutationError::Transient(_)));
        assert_eq!(cache.cart.snapshot().data, Some(prev));
    }

    #[tokio::test]
    async fn test_concurrent_mutation_same_target_rejected() {
        let (svc, cache, session) = offline_service();
        session.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        seed_cart(&cache);

        // 模拟第一个变更在途：占用该条目的目标
        let _held = svc.tracker.try_acquire("cart-item:item-1").unwrap();
        // 第二个请求被拒绝而不是静默丢失
        let err = svc.increment_quantity("item-1").await.unwrap_err();
        assert!(matches!(err, MutationError::Busy { .. }));
        // 显示数量未被第二个请求篡改
        assert_eq!(
            cache.cart.snapshot().data.unwrap().item("item-1").unwrap().quantity,
            2
        );
    }

    #[tokio::test]
    async fn test_stale_item_reference_clears_and_invalidates() {
        let (svc, cache, session) = offline_service();
        session.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        seed_cart(&cache);

        let err = svc.change_quantity("ghost-item", 3).await.unwrap_err();
        assert!(matches!(err, MutationError::NotFound(_)));
        // 本地快照被标记过期，下一次读取触发重新拉取
        assert!(cache.cart.is_stale());
    }

    #[tokio::test]
    async fn test_quantity_clamped_noop_skips_network() {
        let (svc, cache, session) = offline_service();
        session.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        seed_cart(&cache);

        // 库存 5，请求 99 收敛到 5；请求 0 收敛到 1
        // 当前数量 2，收敛后不等于当前值才会走网络；
        // 这里请求 2（收敛后仍为 2），应当直接成功且不触网
        svc.change_quantity("item-1", 2).await.unwrap();
        assert_eq!(
            cache.cart.snapshot().data.unwrap().item("item-1").unwrap().quantity,
            2
        );
    }

    #[tokio::test]
    async fn test_remove_promotion_restores_subtotal() {
        let (svc, cache, session) = offline_service();
        session.set_session("u-1".to_string(), Role::Customer, "tok".to_string());
        let mut cart = seed_cart(&cache);
        cart.promotion = Some(Promotion {
            promotion_id: "promo-1".to_string(),
            code: "SAVE10".to_string(),
            discount_cents: 200,
        });
        cache.cart.accept_server(cart);
        assert_eq!(cache.cart.snapshot().data.unwrap().total_cents(), 1800);

        svc.remove_promotion().await;
        assert_eq!(cache.cart.snapshot().data.unwrap().total_cents(), 2000);
    }
}
