//! 基于角色的路由守卫
//!
//! 纯函数状态机：{加载中, 未认证, 已认证角色不符, 已认证已授权}。
//! 每次导航时根据会话状态与路由声明的角色要求求值，除返回重定向目标外
//! 无任何副作用，幂等；重定向目标本身不要求求值者缺少的角色，
//! 因此不会产生重定向循环。

use crate::market::auth::SessionView;
use crate::market::types::Role;

/// 路由求值结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// 会话仍在恢复中：渲染占位，不重定向
    Loading,
    /// 未认证访问受保护路由：跳转登录页
    RedirectToLogin,
    /// 已认证但角色不符：跳转该角色的首页路由
    Redirect(&'static str),
    /// 渲染目标视图
    Render,
}

/// 对单条路由求值
///
/// - `required_role` 为 `None` 表示公开路由，任何会话都可渲染。
pub fn evaluate(session: &SessionView, required_role: Option<Role>) -> RouteDecision {
    if session.loading {
        return RouteDecision::Loading;
    }

    let required = match required_role {
        None => return RouteDecision::Render,
        Some(r) => r,
    };

    if !session.is_authenticated {
        return RouteDecision::RedirectToLogin;
    }

    if session.role == required {
        RouteDecision::Render
    } else {
        RouteDecision::Redirect(session.role.home_route())
    }
}

/// 路由表条目（宿主应用声明）
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub path: &'static str,
    pub required_role: Option<Role>,
}

/// 按路径求值；未声明的路径视为公开路由
pub fn evaluate_path(
    rules: &[RouteRule],
    session: &SessionView,
    path: &str,
) -> RouteDecision {
    let required = rules
        .iter()
        .find(|r| r.path == path)
        .and_then(|r| r.required_role);
    evaluate(session, required)
}
