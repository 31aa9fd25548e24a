//! 项目与评价服务层：乐观删除与整单载入
//!
//! 删除类操作的乐观形态是"立即从列表移除"，失败时恢复被移除的条目；
//! 评分编辑同理，失败时恢复修改前的评价内容。项目载入购物车没有可
//! 合成的乐观状态（条目由服务器按库存规范化），成功后直接接受服务器
//! 返回的购物车并使项目视图失效。

use crate::market::auth::SessionStore;
use crate::market::cache::{QueryCache, QueryKey, Snapshot};
use crate::market::mutation::{MutationError, MutationTracker};
use crate::market::projects::api::ProjectsApi;
use crate::market::projects::models::{Project, Review};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ProjectsService {
    api: ProjectsApi,
    cache: Arc<QueryCache>,
    session: Arc<SessionStore>,
    tracker: MutationTracker,
}

impl ProjectsService {
    pub fn new(api: ProjectsApi, cache: Arc<QueryCache>, session: Arc<SessionStore>) -> Self {
        Self {
            api,
            cache,
            session,
            tracker: MutationTracker::new(),
        }
    }

    fn token_or_disabled(&self) -> Result<String, MutationError> {
        self.session.token().ok_or(MutationError::AuthRequired)
    }

    // ========== 查询 ==========

    /// 项目列表快照（过期且已认证时触发一次拉取）
    pub async fn projects(&self) -> Snapshot<Vec<Project>> {
        if self.cache.projects.is_stale() && self.session.is_authenticated() {
            self.refresh_projects().await;
        }
        self.cache.projects.snapshot()
    }

    pub async fn refresh_projects(&self) -> Snapshot<Vec<Project>> {
        let Some(token) = self.session.token() else {
            debug!("[Projects] 未登录，项目查询已禁用");
            return self.cache.projects.snapshot();
        };
        if !self.cache.projects.try_begin_fetch() {
            return self.cache.projects.snapshot();
        }
        let result = self
            .api
            .get_projects(&token)
            .await
            .map_err(|e| e.to_string());
        self.cache.projects.complete_fetch(result);
        self.cache.projects.snapshot()
    }

    /// 商品评价快照；评价按商品查询，简单起见共享同一个槽位，
    /// 切换商品时先失效再拉取
    pub async fn reviews(&self, product_id: &str) -> Snapshot<Vec<Review>> {
        if self.cache.reviews.is_stale() && self.session.is_authenticated() {
            self.refresh_reviews(product_id).await;
        }
        self.cache.reviews.snapshot()
    }

    pub async fn refresh_reviews(&self, product_id: &str) -> Snapshot<Vec<Review>> {
        let Some(token) = self.session.token() else {
            debug!("[Projects] 未登录，评价查询已禁用");
            return self.cache.reviews.snapshot();
        };
        if !self.cache.reviews.try_begin_fetch() {
            return self.cache.reviews.snapshot();
        }
        let result = self
            .api
            .get_reviews(&token, product_id)
            .await
            .map_err(|e| e.to_string());
        self.cache.reviews.complete_fetch(result);
        self.cache.reviews.snapshot()
    }

    // ========== 项目变更 ==========

    /// 创建项目
    pub async fn create_project(&self, name: &str) -> Result<Project, MutationError> {
        let token = self.token_or_disabled()?;
        let project = self.api.create_project(&token, name).await?;
        self.cache.invalidate(&QueryKey::Projects);
        Ok(project)
    }

    /// 删除项目（乐观）
    pub async fn delete_project(&self, project_id: &str) -> Result<(), MutationError> {
        let token = self.token_or_disabled()?;
        let target = format!("project:{}", project_id);
        let _permit = self.tracker.try_acquire(&target)?;

        // 乐观写入前的完整快照，失败时按字节恢复
        let prev = self.cache.projects.snapshot().data;
        self.cache.projects.update(|data| {
            if let Some(projects) = data {
                projects.retain(|p| p.project_id != project_id);
            }
        });

        match self.api.delete_project(&token, project_id).await {
            Ok(()) => {
                self.cache.invalidate(&QueryKey::Projects);
                info!("[Projects] ✅ 项目已删除: projectID={}", project_id);
                Ok(())
            }
            Err(e) => {
                self.cache.projects.update(|data| *data = prev);
                let err: MutationError = e.into();
                warn!(
                    "[Projects] ❌ 删除失败已回滚: projectID={}, err={}",
                    project_id, err
                );
                Err(err)
            }
        }
    }

    /// 把项目整单载入购物车
    ///
    /// 服务器按当前库存规范化数量后返回完整购物车，客户端直接接受；
    /// 购物车与项目视图（item_count 汇总）同时受影响。
    pub async fn load_to_cart(&self, project_id: &str) -> Result<(), MutationError> {
        let token = self.token_or_disabled()?;
        let target = format!("project:{}", project_id);
        let _permit = self.tracker.try_acquire(&target)?;

        let cart = self.api.load_to_cart(&token, project_id).await?;
        self.cache.cart.accept_server(cart);
        self.cache.invalidate(&QueryKey::Projects);
        info!("[Projects] ✅ 项目已载入购物车: projectID={}", project_id);
        Ok(())
    }

    // ========== 评价变更 ==========

    /// 编辑评价（乐观）
    pub async fn edit_review(
        &self,
        review_id: &str,
        rating: i32,
        text: &str,
    ) -> Result<(), MutationError> {
        if !(1..=5).contains(&rating) {
            return Err(MutationError::Validation(format!(
                "评分必须在 1~5 之间: {}",
                rating
            )));
        }
        let token = self.token_or_disabled()?;
        let target = format!("review:{}", review_id);
        let _permit = self.tracker.try_acquire(&target)?;

        let prev = self.cache.reviews.snapshot().data;

        // 预写入：本地直接改写评分与内容
        self.cache.reviews.update(|data| {
            if let Some(reviews) = data {
                if let Some(r) = reviews.iter_mut().find(|r| r.review_id == review_id) {
                    r.rating = rating;
                    r.text = text.to_string();
                }
            }
        });

        match self.api.update_review(&token, review_id, rating, text).await {
            Ok(confirmed) => {
                // 用服务器确认的数据替换乐观数据
                self.cache.reviews.update(|data| {
                    if let Some(reviews) = data {
                        if let Some(r) = reviews.iter_mut().find(|r| r.review_id == review_id) {
                            *r = confirmed;
                        }
                    }
                });
                debug!("[Projects] ✅ 评价已更新: reviewID={}", review_id);
                Ok(())
            }
            Err(e) => {
                self.cache.reviews.update(|data| *data = prev);
                let err: MutationError = e.into();
                warn!(
                    "[Projects] ❌ 评价更新失败已回滚: reviewID={}, err={}",
                    review_id, err
                );
                Err(err)
            }
        }
    }

    /// 删除评价（乐观）
    pub async fn delete_review(&self, review_id: &str) -> Result<(), MutationError> {
        let token = self.token_or_disabled()?;
        let target = format!("review:{}", review_id);
        let _permit = self.tracker.try_acquire(&target)?;

        let prev = self.cache.reviews.snapshot().data;
        self.cache.reviews.update(|data| {
            if let Some(reviews) = data {
                reviews.retain(|r| r.review_id != review_id);
            }
        });

        match self.api.delete_review(&token, review_id).await {
            Ok(()) => {
                self.cache.invalidate(&QueryKey::Reviews);
                info!("[Projects] ✅ 评价已删除: reviewID={}", review_id);
                Ok(())
            }
            Err(e) => {
                self.cache.reviews.update(|data| *data = prev);
                let err: MutationError = e.into();
                warn!(
                    "[Projects] ❌ 评价删除失败已回滚: reviewID={}, err={}",
                    review_id, err
                );
                Err(err)
            }
        }
    }
}
