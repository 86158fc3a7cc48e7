//! 在线状态数据模型
//!
//! 包含存储中的在线记录 `PresenceRecord`，以及每个作用域在本进程内维护的
//! 成员表 `ScopeMembership`。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value_objects::{ClientId, Millis, UserId};

/// 用户类型，按客户端上报的原样保存（数字或字符串）。
pub type UserType = Value;

/// 客户端附带的用户数据。
pub type UserData = Value;

/// 存储与发布频道中使用的在线记录。
///
/// 哈希字段键为 `"<userId>.<clientId>"`，值为本结构的 JSON。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    #[serde(default)]
    pub user_type: UserType,
    pub client_id: ClientId,
    #[serde(default)]
    pub user_data: UserData,
    pub online: bool,
    #[serde(default)]
    pub hard: bool,
    pub at: Millis,
}

impl PresenceRecord {
    pub fn online(
        user_id: UserId,
        client_id: ClientId,
        user_type: UserType,
        user_data: UserData,
        at: Millis,
    ) -> Self {
        Self {
            user_id,
            user_type,
            client_id,
            user_data,
            online: true,
            hard: false,
            at,
        }
    }

    pub fn offline(
        user_id: UserId,
        client_id: ClientId,
        user_type: UserType,
        user_data: UserData,
        hard: bool,
        at: Millis,
    ) -> Self {
        Self {
            user_id,
            user_type,
            client_id,
            user_data,
            online: false,
            hard,
            at,
        }
    }

    /// 哈希字段键
    pub fn field_key(&self) -> String {
        Self::field_key_for(&self.user_id, &self.client_id)
    }

    pub fn field_key_for(user_id: &UserId, client_id: &ClientId) -> String {
        format!("{}.{}", user_id, client_id)
    }

    /// 记录时间早于 `now - window_ms`（含）即视为过期
    pub fn is_stale(&self, now: Millis, window_ms: Millis) -> bool {
        self.at <= now - window_ms
    }
}

/// 单个用户在某个作用域内的在线条目。
///
/// 客户端数量总是由 `clients` 推导，因此与客户端映射保持一致。
#[derive(Debug, Clone, PartialEq)]
pub struct UserPresenceEntry {
    pub user_type: UserType,
    pub last_touch: Millis,
    clients: BTreeMap<ClientId, UserData>,
}

impl UserPresenceEntry {
    fn new(user_type: UserType, last_touch: Millis) -> Self {
        Self {
            user_type,
            last_touch,
            clients: BTreeMap::new(),
        }
    }

    pub fn clients_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> &BTreeMap<ClientId, UserData> {
        &self.clients
    }

    pub fn has_client(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }
}

/// v2 视图中的单个用户
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub user_type: UserType,
    pub clients: BTreeMap<ClientId, UserData>,
}

/// 作用域成员表：userId → 在线条目
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeMembership {
    users: BTreeMap<UserId, UserPresenceEntry>,
}

impl ScopeMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册客户端；同一客户端重复注册只会刷新数据和触达时间
    pub fn add(
        &mut self,
        user_id: &UserId,
        client_id: &ClientId,
        user_type: UserType,
        user_data: UserData,
        now: Millis,
    ) {
        let entry = self
            .users
            .entry(user_id.clone())
            .or_insert_with(|| UserPresenceEntry::new(user_type.clone(), now));
        entry.last_touch = now;
        entry.user_type = user_type;
        let user_data = if user_data.is_null() {
            Value::Object(Default::default())
        } else {
            user_data
        };
        entry.clients.insert(client_id.clone(), user_data);
    }

    /// 移除客户端，返回该客户端此前是否存在
    pub fn remove(&mut self, user_id: &UserId, client_id: &ClientId, now: Millis) -> bool {
        match self.users.get_mut(user_id) {
            Some(entry) => {
                let removed = entry.clients.remove(client_id).is_some();
                if removed {
                    entry.last_touch = now;
                }
                removed
            }
            None => false,
        }
    }

    pub fn remove_user(&mut self, user_id: &UserId) -> Option<UserPresenceEntry> {
        self.users.remove(user_id)
    }

    pub fn user_exists(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn is_user_connected(&self, user_id: &UserId) -> bool {
        self.users
            .get(user_id)
            .map(|entry| entry.clients_count() > 0)
            .unwrap_or(false)
    }

    pub fn exists(&self, user_id: &UserId, client_id: &ClientId) -> bool {
        self.users
            .get(user_id)
            .map(|entry| entry.has_client(client_id))
            .unwrap_or(false)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&UserPresenceEntry> {
        self.users.get(user_id)
    }

    /// 整体替换某个用户的条目（用于全量读取后回放本地较新的状态）
    pub fn restore(&mut self, user_id: UserId, entry: UserPresenceEntry) {
        self.users.insert(user_id, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &UserPresenceEntry)> {
        self.users.iter()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// v1 视图：userId → userType
    pub fn to_v1(&self) -> BTreeMap<UserId, UserType> {
        self.users
            .iter()
            .map(|(user_id, entry)| (user_id.clone(), entry.user_type.clone()))
            .collect()
    }

    /// v2 视图：userId → {userType, clients}
    pub fn to_v2(&self) -> BTreeMap<UserId, UserView> {
        self.users
            .iter()
            .map(|(user_id, entry)| {
                (
                    user_id.clone(),
                    UserView {
                        user_type: entry.user_type.clone(),
                        clients: entry.clients.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(user: &str, client: &str) -> (UserId, ClientId) {
        (UserId::from(user), ClientId::from(client))
    }

    #[test]
    fn test_clients_count_tracks_distinct_clients() {
        let mut membership = ScopeMembership::new();
        let (user, c1) = ids("u1", "c1");
        let c2 = ClientId::from("c2");

        membership.add(&user, &c1, json!("person"), json!({}), 1);
        membership.add(&user, &c1, json!("person"), json!({}), 2);
        membership.add(&user, &c2, json!("person"), json!({"name": "x"}), 3);

        let entry = membership.get(&user).unwrap();
        assert_eq!(entry.clients_count(), 2);
        assert_eq!(entry.last_touch, 3);

        assert!(membership.remove(&user, &c1, 4));
        assert!(!membership.remove(&user, &c1, 5));
        assert!(membership.is_user_connected(&user));

        assert!(membership.remove(&user, &c2, 6));
        assert!(!membership.is_user_connected(&user));
        assert!(membership.user_exists(&user));
    }

    #[test]
    fn test_missing_user_data_becomes_empty_object() {
        let mut membership = ScopeMembership::new();
        let (user, client) = ids("u1", "c1");
        membership.add(&user, &client, json!(0), Value::Null, 1);

        let v2 = serde_json::to_value(membership.to_v2()).unwrap();
        assert_eq!(v2, json!({"u1": {"userType": 0, "clients": {"c1": {}}}}));
    }

    #[test]
    fn test_views() {
        let mut membership = ScopeMembership::new();
        let (u1, c1) = ids("u1", "c1");
        let (u2, c2) = ids("u2", "c2");
        membership.add(&u1, &c1, json!("person"), json!({"name": "a"}), 1);
        membership.add(&u2, &c2, json!("agent"), json!({}), 1);

        let v1 = serde_json::to_value(membership.to_v1()).unwrap();
        assert_eq!(v1, json!({"u1": "person", "u2": "agent"}));
    }

    #[test]
    fn test_record_wire_format() {
        let record = PresenceRecord::online(
            UserId::from("u1"),
            ClientId::from("c1"),
            json!("person"),
            json!({}),
            1000,
        );
        assert_eq!(record.field_key(), "u1.c1");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "userId": "u1",
                "userType": "person",
                "clientId": "c1",
                "userData": {},
                "online": true,
                "hard": false,
                "at": 1000
            })
        );

        assert!(!record.is_stale(1000 + 49_999, 50_000));
        assert!(record.is_stale(1000 + 50_000, 50_000));
    }
}
