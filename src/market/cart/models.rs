//! 购物车数据模型
//!
//! 所有结构都是服务器数据的本地缓存投影，服务器是唯一权威数据源。
//! 金额统一使用整数分（cents）表示，保证促销折扣运算精确无误差。

use serde::{Deserialize, Serialize};

/// 购物车条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    #[serde(rename = "itemID")]
    pub item_id: String,
    #[serde(rename = "productID")]
    pub product_id: String,
    #[serde(rename = "supplierID", default)]
    pub supplier_id: String,
    /// 商品名称（服务器返回，用于展示）
    #[serde(default)]
    pub product_name: String,
    /// 数量，客户端保证在 [1, stock_quantity] 区间内（仅为交互保护，
    /// 最终以服务器确认为准）
    pub quantity: i64,
    /// 最近一次已知库存
    #[serde(default)]
    pub stock_quantity: i64,
    /// 单价（分）
    pub unit_price_cents: i64,
}

impl CartItem {
    /// 将目标数量收敛到合法区间 [1, stock_quantity]
    pub fn clamp_quantity(&self, desired: i64) -> i64 {
        desired.max(1).min(self.stock_quantity.max(1))
    }

    pub fn line_total_cents(&self) -> i64 {
        self.quantity * self.unit_price_cents
    }
}

/// 促销/折扣码
///
/// 仅在会话内生效的客户端状态，信任前必须经过服务器校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    #[serde(rename = "promotionID")]
    pub promotion_id: String,
    pub code: String,
    /// 折扣金额（分）
    pub discount_cents: i64,
}

/// 购物车快照
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    #[serde(default)]
    pub items: Vec<CartItem>,
    /// 当前已应用的促销码（可能为空）
    #[serde(default)]
    pub promotion: Option<Promotion>,
}

impl Cart {
    /// 商品小计（分）
    pub fn subtotal_cents(&self) -> i64 {
        self.items.iter().map(|i| i.line_total_cents()).sum()
    }

    /// 折扣金额（分），无促销时为 0
    pub fn discount_cents(&self) -> i64 {
        self.promotion.as_ref().map(|p| p.discount_cents).unwrap_or(0)
    }

    /// 应付总额（分），不会为负
    pub fn total_cents(&self) -> i64 {
        (self.subtotal_cents() - self.discount_cents()).max(0)
    }

    pub fn item(&self, item_id: &str) -> Option<&CartItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    pub fn item_mut(&mut self, item_id: &str) -> Option<&mut CartItem> {
        self.items.iter_mut().find(|i| i.item_id == item_id)
    }
}
