use serde::{Deserialize, Serialize};

/// 作用域的保留策略。
///
/// - `max_persistence`: 作用域键的 TTL（秒）
/// - `max_count` / `max_age_seconds`: 有序集合按排名、按分数（毫秒时间戳）裁剪
/// - `max_length`: 事件流列表的最大长度
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_persistence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
}

impl RetentionPolicy {
    pub fn with_max_persistence(mut self, seconds: u64) -> Self {
        self.max_persistence = Some(seconds);
        self
    }

    pub fn with_max_length(mut self, length: u64) -> Self {
        self.max_length = Some(length);
        self
    }

    pub fn with_max_count(mut self, count: u64) -> Self {
        self.max_count = Some(count);
        self
    }

    pub fn with_max_age_seconds(mut self, seconds: u64) -> Self {
        self.max_age_seconds = Some(seconds);
        self
    }

    /// 用 `other` 中设置了的字段覆盖当前策略
    pub fn merged_with(&self, other: &RetentionPolicy) -> RetentionPolicy {
        RetentionPolicy {
            max_persistence: other.max_persistence.or(self.max_persistence),
            max_count: other.max_count.or(self.max_count),
            max_age_seconds: other.max_age_seconds.or(self.max_age_seconds),
            max_length: other.max_length.or(self.max_length),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_options_use_wire_names() {
        let policy: RetentionPolicy = serde_json::from_str(
            r#"{"maxPersistence": 60, "maxCount": 10, "maxAgeSeconds": 30, "maxLength": 5}"#,
        )
        .unwrap();
        assert_eq!(policy.max_persistence, Some(60));
        assert_eq!(policy.max_count, Some(10));
        assert_eq!(policy.max_age_seconds, Some(30));
        assert_eq!(policy.max_length, Some(5));
    }

    #[test]
    fn test_merge_prefers_explicit_values() {
        let defaults = RetentionPolicy::default()
            .with_max_persistence(604_800)
            .with_max_length(100_000);
        let custom = RetentionPolicy::default().with_max_length(10);

        let merged = defaults.merged_with(&custom);
        assert_eq!(merged.max_persistence, Some(604_800));
        assert_eq!(merged.max_length, Some(10));
    }
}
