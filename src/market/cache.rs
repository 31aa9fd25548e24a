//! 远程查询缓存
//!
//! 以查询键为地址缓存服务器资源快照（购物车、会话列表、消息、评价、项目）。
//! 每个槽位记录：数据、错误、在途拉取标记、最近拉取时间与过期窗口。
//!
//! 并发约定：槽位内部用互斥锁保证单次调用内"读-改-写"的原子性；
//! 变更成功回调与推送事件处理器都可以安全地调用 `invalidate`，
//! 同一键同时只允许一次在途拉取（在途拉取的结果即最终状态，
//! 期间不会再发起冗余拉取）。

use crate::market::cart::models::Cart;
use crate::market::chat::models::{ChatMessage, Conversation};
use crate::market::projects::models::{Project, Review};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// 各资源的过期窗口
pub mod stale_after {
    use std::time::Duration;

    pub const CART: Duration = Duration::from_secs(30);
    pub const CONVERSATIONS: Duration = Duration::from_secs(30);
    pub const MESSAGES: Duration = Duration::from_secs(10);
    pub const REVIEWS: Duration = Duration::from_secs(300);
    pub const PROJECTS: Duration = Duration::from_secs(60);
}

/// 查询键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Cart,
    Conversations,
    /// 按会话 ID 区分的消息列表
    Messages(String),
    Reviews,
    Projects,
}

/// 槽位快照（对外只读视图）
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub data: Option<T>,
    pub error: Option<String>,
    pub is_stale: bool,
    pub is_fetching: bool,
}

struct SlotInner<T> {
    data: Option<T>,
    error: Option<String>,
    fetching: bool,
    fetched_at: Option<Instant>,
    /// 被 invalidate 后强制视为过期，直到下一次拉取完成
    invalidated: bool,
}

/// 单个查询槽位
///
/// `version` 是细粒度订阅通道：只有本槽位变化时订阅方才会被唤醒，
/// 订阅"购物车"的消费者不会因会话列表变化而收到通知。
pub struct QuerySlot<T: Clone> {
    inner: Mutex<SlotInner<T>>,
    stale_window: Duration,
    version: watch::Sender<u64>,
}

impl<T: Clone> QuerySlot<T> {
    pub fn new(stale_window: Duration) -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self {
            inner: Mutex::new(SlotInner {
                data: None,
                error: None,
                fetching: false,
                fetched_at: None,
                invalidated: false,
            }),
            stale_window,
            version: tx,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// 订阅本槽位的版本号；版本变化表示快照内容发生了变化
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// 读取当前快照与过期标记
    pub fn snapshot(&self) -> Snapshot<T> {
        let inner = self.inner.lock().unwrap();
        Snapshot {
            data: inner.data.clone(),
            error: inner.error.clone(),
            is_stale: Self::stale_locked(&inner, self.stale_window),
            is_fetching: inner.fetching,
        }
    }

    fn stale_locked(inner: &SlotInner<T>, window: Duration) -> bool {
        if inner.invalidated {
            return true;
        }
        match inner.fetched_at {
            Some(at) => at.elapsed() >= window,
            None => true,
        }
    }

    pub fn is_stale(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        Self::stale_locked(&inner, self.stale_window)
    }

    /// 尝试开始一次拉取
    ///
    /// 返回 `false` 表示已有在途拉取，调用方不应重复发起；
    /// 返回 `true` 表示本次调用获得了拉取权，必须以 `complete_fetch` 收尾。
    pub fn try_begin_fetch(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.fetching {
            debug!("[Cache] 已有在途拉取，跳过");
            return false;
        }
        inner.fetching = true;
        true
    }

    /// 完成拉取：写入结果并刷新时间戳
    pub fn complete_fetch(&self, result: Result<T, String>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.fetching = false;
            match result {
                Ok(data) => {
                    inner.data = Some(data);
                    inner.error = None;
                    inner.fetched_at = Some(Instant::now());
                    inner.invalidated = false;
                }
                Err(e) => {
                    // 保留最后一次已知数据，仅记录错误
                    inner.error = Some(e);
                }
            }
        }
        self.bump();
    }

    /// 直接写入数据（乐观更新 / 推送合并），不刷新过期时间戳：
    /// 服务器权威性的判断仍以最近一次真实拉取为准
    pub fn set(&self, data: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.data = Some(data);
            inner.error = None;
        }
        self.bump();
    }

    /// 写入服务器确认的数据（变更成功回调使用）：刷新过期时间戳，
    /// 但不触碰在途拉取标记——若有并发拉取在途，其完成结果仍是最终状态
    pub fn accept_server(&self, data: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.data = Some(data);
            inner.error = None;
            inner.fetched_at = Some(Instant::now());
            inner.invalidated = false;
        }
        self.bump();
    }

    /// 原子"读-改-写"：闭包在持锁状态下执行，单次调用内不可能观察到
    /// 撕裂的中间状态
    pub fn update<R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        let r = {
            let mut inner = self.inner.lock().unwrap();
            f(&mut inner.data)
        };
        self.bump();
        r
    }

    /// 标记为过期：下一次读取视数据为陈旧并触发重新拉取
    pub fn invalidate(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.invalidated = true;
        }
        self.bump();
    }

    /// 清空槽位（登出时使用）
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.data = None;
            inner.error = None;
            inner.fetched_at = None;
            inner.fetching = false;
            inner.invalidated = false;
        }
        self.bump();
    }
}

/// 进程级查询缓存：所有视图共享同一份
///
/// 所有权模型：缓存独占持有内存中的权威副本，视图只拿只读快照。
pub struct QueryCache {
    pub cart: QuerySlot<Cart>,
    pub conversations: QuerySlot<Vec<Conversation>>,
    messages: Mutex<HashMap<String, Arc<QuerySlot<Vec<ChatMessage>>>>>,
    pub reviews: QuerySlot<Vec<Review>>,
    pub projects: QuerySlot<Vec<Project>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            cart: QuerySlot::new(stale_after::CART),
            conversations: QuerySlot::new(stale_after::CONVERSATIONS),
            messages: Mutex::new(HashMap::new()),
            reviews: QuerySlot::new(stale_after::REVIEWS),
            projects: QuerySlot::new(stale_after::PROJECTS),
        }
    }

    /// 获取（或创建）指定会话的消息槽位
    pub fn messages(&self, conversation_id: &str) -> Arc<QuerySlot<Vec<ChatMessage>>> {
        let mut map = self.messages.lock().unwrap();
        map.entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(QuerySlot::new(stale_after::MESSAGES)))
            .clone()
    }

    /// 按键失效
    pub fn invalidate(&self, key: &QueryKey) {
        match key {
            QueryKey::Cart => self.cart.invalidate(),
            QueryKey::Conversations => self.conversations.invalidate(),
            QueryKey::Messages(id) => self.messages(id).invalidate(),
            QueryKey::Reviews => self.reviews.invalidate(),
            QueryKey::Projects => self.projects.invalidate(),
        }
    }

    /// 登出时清空全部缓存
    pub fn clear_all(&self) {
        self.cart.clear();
        self.conversations.clear();
        self.reviews.clear();
        self.projects.clear();
        let map = self.messages.lock().unwrap();
        for slot in map.values() {
            slot.clear();
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot_is_stale() {
        let slot: QuerySlot<i32> = QuerySlot::new(Duration::from_secs(30));
        assert!(slot.is_stale());
        assert!(slot.snapshot().data.is_none());
    }

    #[test]
    fn test_fetch_guard_single_in_flight() {
        let slot: QuerySlot<i32> = QuerySlot::new(Duration::from_secs(30));
        assert!(slot.try_begin_fetch());
        // 在途期间不允许发起第二次拉取
        assert!(!slot.try_begin_fetch());
        slot.complete_fetch(Ok(7));
        assert_eq!(slot.snapshot().data, Some(7));
        assert!(!slot.is_stale());
        // 完成后可以再次拉取
        assert!(slot.try_begin_fetch());
        slot.complete_fetch(Err("网络错误".to_string()));
        // 失败保留最后一次已知数据
        let snap = slot.snapshot();
        assert_eq!(snap.data, Some(7));
        assert_eq!(snap.error.as_deref(), Some("网络错误"));
    }

    #[test]
    fn test_invalidate_forces_stale() {
        let slot: QuerySlot<i32> = QuerySlot::new(Duration::from_secs(3600));
        assert!(slot.try_begin_fetch());
        slot.complete_fetch(Ok(1));
        assert!(!slot.is_stale());
        slot.invalidate();
        assert!(slot.is_stale());
        // 重新拉取完成后过期标记解除
        assert!(slot.try_begin_fetch());
        slot.complete_fetch(Ok(2));
        assert!(!slot.is_stale());
    }

    #[test]
    fn test_optimistic_set_does_not_refresh_staleness() {
        let slot: QuerySlot<i32> = QuerySlot::new(Duration::from_secs(3600));
        slot.set(5);
        // 乐观写入不等于服务器确认，槽位仍视为过期
        assert!(slot.is_stale());
        assert_eq!(slot.snapshot().data, Some(5));
    }

    #[test]
    fn test_subscribe_notified_on_change() {
        let slot: QuerySlot<i32> = QuerySlot::new(Duration::from_secs(30));
        let mut rx = slot.subscribe();
        let before = *rx.borrow_and_update();
        slot.set(1);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update() > before);
    }

    #[test]
    fn test_messages_slot_per_conversation() {
        let cache = QueryCache::new();
        let a = cache.messages("conv-a");
        let b = cache.messages("conv-b");
        a.set(vec![]);
        // 不同会话互不影响
        assert!(b.snapshot().data.is_none());
        // 同一会话返回同一槽位
        let a2 = cache.messages("conv-a");
        assert!(a2.snapshot().data.is_some());
    }
}
