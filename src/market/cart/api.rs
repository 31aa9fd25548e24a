//! 购物车 HTTP API 客户端
//!
//! 负责所有购物车相关的 HTTP 请求。所有请求携带 Bearer 凭证；
//! 凭证由服务层在调用前检查，缺失时整个查询/变更被禁用而不是报错。

use crate::market::cart::models::{Cart, Promotion};
use crate::market::serialization::generate_operation_id;
use crate::market::types::{handle_http_response_data, ApiError};
use tracing::{debug, info};

/// 购物车相关的 HTTP API 客户端
pub struct CartApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl CartApi {
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }

    /// 拉取购物车快照（GET /api/cart）
    pub async fn get_cart(&self, token: &str) -> Result<Cart, ApiError> {
        let url = format!("{}/api/cart", self.api_base_url);
        debug!("[CartAPI] 📡 拉取购物车: {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response_data::<Cart>(response, "拉取购物车").await
    }

    /// 更新条目数量（PATCH /api/cart/items/:id），返回服务器规范化后的购物车
    pub async fn update_item_quantity(
        &self,
        token: &str,
        item_id: &str,
        quantity: i64,
    ) -> Result<Cart, ApiError> {
        let url = format!("{}/api/cart/items/{}", self.api_base_url, item_id);
        info!("[CartAPI] 📡 更新数量: itemID={}, quantity={}", item_id, quantity);
        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .json(&serde_json::json!({ "quantity": quantity }))
            .send()
            .await?;
        handle_http_response_data::<Cart>(response, "更新数量").await
    }

    /// 移除条目（DELETE /api/cart/items/:id），返回服务器规范化后的购物车
    pub async fn remove_item(&self, token: &str, item_id: &str) -> Result<Cart, ApiError> {
        let url = format!("{}/api/cart/items/{}", self.api_base_url, item_id);
        info!("[CartAPI] 📡 移除条目: itemID={}", item_id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .send()
            .await?;
        handle_http_response_data::<Cart>(response, "移除条目").await
    }

    /// 校验促销码（POST /api/promotions/validate）
    ///
    /// 服务器依据当前小计返回折扣金额；无效码返回校验错误。
    pub async fn validate_promotion(
        &self,
        token: &str,
        code: &str,
        subtotal_cents: i64,
    ) -> Result<Promotion, ApiError> {
        let url = format!("{}/api/promotions/validate", self.api_base_url);
        info!("[CartAPI] 📡 校验促销码: code={}", code);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("operationID", generate_operation_id())
            .json(&serde_json::json!({
                "code": code,
                "subtotalCents": subtotal_cents,
            }))
            .send()
            .await?;
        handle_http_response_data::<Promotion>(response, "校验促销码").await
    }
}
