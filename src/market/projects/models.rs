//! 项目（已保存清单）与商品评价数据模型

use serde::{Deserialize, Serialize};

/// 已保存项目（一份可整单载入购物车的商品清单）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub item_count: i32,
    #[serde(default)]
    pub created_at: i64,
}

/// 商品评价
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    #[serde(rename = "reviewID")]
    pub review_id: String,
    #[serde(rename = "productID")]
    pub product_id: String,
    #[serde(rename = "authorID", default)]
    pub author_id: String,
    /// 1~5 星
    pub rating: i32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: i64,
}
