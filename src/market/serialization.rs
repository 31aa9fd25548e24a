//! 序列化与 ID 生成工具

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Base64 反序列化函数（支持 null 值）
pub fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use base64::Engine;
    // 先尝试反序列化为 Option<String>，以支持 null 值
    let opt_s: Option<String> = Deserialize::deserialize(deserializer)?;
    let s = match opt_s {
        Some(s) => s,
        None => return Ok(Vec::new()), // null 或缺失时返回空 Vec
    };
    if s.is_empty() {
        return Ok(Vec::new());
    }
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(serde::de::Error::custom)
}

/// Base64 序列化函数（用于附件内联数据上传）
pub fn serialize_base64<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use base64::Engine;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

static TEMP_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// 生成乐观消息占位 ID
///
/// 格式：`temp-<毫秒时间戳>-<进程内序号>`。序号保证同一毫秒内的多次发送
/// 不会生成重复 ID；服务器确认后占位 ID 会被真实 ID 替换。
pub fn generate_temp_msg_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = TEMP_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("temp-{}-{}", millis, seq)
}

/// 判断消息 ID 是否为乐观占位 ID
pub fn is_temp_msg_id(id: &str) -> bool {
    id.starts_with("temp-")
}

/// 生成操作 ID（用于 HTTP 请求头，便于服务端链路追踪）
pub fn generate_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_msg_id_unique() {
        // 同一毫秒内连续生成也不应重复
        let ids: Vec<String> = (0..100).map(|_| generate_temp_msg_id()).collect();
        let set: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(set.len(), ids.len());
        assert!(ids.iter().all(|id| is_temp_msg_id(id)));
    }

    #[test]
    fn test_is_temp_msg_id() {
        assert!(is_temp_msg_id("temp-1700000000000-1"));
        assert!(!is_temp_msg_id("msg_8f3d09"));
    }
}
