//! 事件流数据模型

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 事件流中的一条记录，按追加顺序保存在存储列表中。
///
/// `id` 用于 sync 快照与实时推送之间的去重；早期写入的记录可能没有该字段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamLogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub user_data: Value,
}

impl StreamLogEntry {
    /// 创建带新 id 的记录
    pub fn new(
        resource: impl Into<String>,
        action: impl Into<String>,
        value: Value,
        user_data: Value,
    ) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            resource: resource.into(),
            action: action.into(),
            value,
            user_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_without_id_is_readable() {
        let entry: StreamLogEntry = serde_json::from_value(json!({
            "resource": "ticket/1",
            "action": "open",
            "value": {"state": "new"},
            "userData": {"name": "tester"}
        }))
        .unwrap();

        assert!(entry.id.is_none());
        assert_eq!(entry.action, "open");

        let encoded = serde_json::to_value(&entry).unwrap();
        assert!(encoded.get("id").is_none());
    }
}
