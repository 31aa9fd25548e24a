//! 项目与评价 HTTP API 客户端

use crate::market::cart::models::Cart;
use crate::market::projects::models::{Project, Review};
use crate::market::serialization::generate_operation_id;
use crate::market::types::{handle_http_response, handle_http_response_data, ApiError};
use tracing::{debug, info};

/// 项目（已保存清单）与商品评价的 HTTP API 客户端
pub struct ProjectsApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl ProjectsApi {
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }

    /// 拉取项目列表（GET /api/projects）
    pub async fn get_projects(&self, token: &str) -> Result<Vec<Project>, ApiError> {
        let url = format!("{}/api/projects", self.api_base_url);
        debug!("[ProjectsAPI] 📡 拉取项目列表");
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response_data::<Vec<Project>>(response, "拉取项目列表").await
    }

    /// 创建项目（POST /api/projects）
    pub async fn create_project(&self, token: &str, name: &str) -> Result<Project, ApiError> {
        let url = format!("{}/api/projects", self.api_base_url);
        info!("[ProjectsAPI] 📡 创建项目: name={}", name);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        handle_http_response_data::<Project>(response, "创建项目").await
    }

    /// 删除项目（DELETE /api/projects/:id），成功时 data 可为空
    pub async fn delete_project(&self, token: &str, project_id: &str) -> Result<(), ApiError> {
        let url = format!("{}/api/projects/{}", self.api_base_url, project_id);
        info!("[ProjectsAPI] 📡 删除项目: projectID={}", project_id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response::<serde_json::Value>(response, "删除项目").await?;
        Ok(())
    }

    /// 把项目整单载入购物车（POST /api/projects/:id/load-to-cart），
    /// 返回服务器规范化后的购物车
    pub async fn load_to_cart(&self, token: &str, project_id: &str) -> Result<Cart, ApiError> {
        let url = format!(
            "{}/api/projects/{}/load-to-cart",
            self.api_base_url, project_id
        );
        info!("[ProjectsAPI] 📡 项目载入购物车: projectID={}", project_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response_data::<Cart>(response, "项目载入购物车").await
    }

    /// 拉取某商品的评价列表（GET /api/reviews?productID=...）
    pub async fn get_reviews(
        &self,
        token: &str,
        product_id: &str,
    ) -> Result<Vec<Review>, ApiError> {
        let url = format!("{}/api/reviews", self.api_base_url);
        debug!("[ProjectsAPI] 📡 拉取评价: productID={}", product_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .query(&[("productID", product_id)])
            .send()
            .await?;
        handle_http_response_data::<Vec<Review>>(response, "拉取评价").await
    }

    /// 编辑评价（PATCH /api/reviews/:id），返回服务器确认后的评价
    pub async fn update_review(
        &self,
        token: &str,
        review_id: &str,
        rating: i32,
        text: &str,
    ) -> Result<Review, ApiError> {
        let url = format!("{}/api/reviews/{}", self.api_base_url, review_id);
        info!("[ProjectsAPI] 📡 编辑评价: reviewID={}", review_id);
        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .json(&serde_json::json!({ "rating": rating, "text": text }))
            .send()
            .await?;
        handle_http_response_data::<Review>(response, "编辑评价").await
    }

    /// 删除评价（DELETE /api/reviews/:id）
    pub async fn delete_review(&self, token: &str, review_id: &str) -> Result<(), ApiError> {
        let url = format!("{}/api/reviews/{}", self.api_base_url, review_id);
        info!("[ProjectsAPI] 📡 删除评价: reviewID={}", review_id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response::<serde_json::Value>(response, "删除评价").await?;
        Ok(())
    }
}
