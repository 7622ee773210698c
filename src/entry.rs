/// entry records: the in-memory state of one setting
///
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;

use crate::registry::{ProviderKind, ResourceType, SettingDescriptor};

/// a resolved setting value, shaped by the descriptor's resource type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StaticValue {
    #[default]
    Empty,
    Ids(Vec<i64>),
    Strings(Vec<String>),
    Records(Vec<Map<String, Value>>),
    Map(Map<String, Value>),
    Document(Value),
}

impl StaticValue {
    /// decode a raw payload into the variant that matches the resource type
    pub fn decode(resource_type: ResourceType, payload: &[u8]) -> serde_json::Result<StaticValue> {
        let value = match resource_type {
            ResourceType::IdList => StaticValue::Ids(serde_json::from_slice(payload)?),
            ResourceType::StringList => StaticValue::Strings(serde_json::from_slice(payload)?),
            ResourceType::Records => StaticValue::Records(serde_json::from_slice(payload)?),
            ResourceType::Map => StaticValue::Map(serde_json::from_slice(payload)?),
            ResourceType::Document => StaticValue::Document(serde_json::from_slice(payload)?),
        };

        Ok(value)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StaticValue::Empty => true,
            StaticValue::Ids(v) => v.is_empty(),
            StaticValue::Strings(v) => v.is_empty(),
            StaticValue::Records(v) => v.is_empty(),
            StaticValue::Map(m) => m.is_empty(),
            StaticValue::Document(Value::Null) => true,
            StaticValue::Document(_) => false,
        }
    }

    /// the keys a dependent setting substitutes into its path template
    pub fn keys(&self) -> Vec<String> {
        match self {
            StaticValue::Ids(ids) => ids.iter().map(|id| id.to_string()).collect(),
            StaticValue::Strings(list) => list.clone(),
            StaticValue::Records(rows) => rows.iter().filter_map(|r| r.get("id")).filter_map(key_of).collect(),
            StaticValue::Map(m) => m.keys().cloned().collect(),
            StaticValue::Document(Value::Array(items)) => items.iter().filter_map(key_of).collect(),
            _ => vec![],
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StaticValue::Empty => Value::Null,
            StaticValue::Document(v) => v.clone(),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StaticValue::Empty => 0,
            StaticValue::Ids(v) => v.len(),
            StaticValue::Strings(v) => v.len(),
            StaticValue::Records(v) => v.len(),
            StaticValue::Map(m) => m.len(),
            StaticValue::Document(Value::Array(items)) => items.len(),
            StaticValue::Document(Value::Null) => 0,
            StaticValue::Document(_) => 1,
        }
    }
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj.get("id").and_then(key_of),
        _ => None,
    }
}

/// the tracked state of one setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    /// the concrete key (path or object name) used on the last fetch
    pub setting_key: String,
    pub provider: ProviderKind,
    pub resource_type: ResourceType,
    #[serde(skip)]
    pub raw_payload: Option<Vec<u8>>,
    pub value: StaticValue,
    pub error: bool,
    /// a failed refresh left the previous good value in place
    pub stale: bool,
    pub message: String,
    pub resolved_at: Option<SystemTime>,
}

impl Entry {
    /// an unresolved entry for the descriptor
    pub fn new(descriptor: &SettingDescriptor) -> Entry {
        Entry {
            name: descriptor.name.clone(),
            setting_key: descriptor.path.clone(),
            provider: descriptor.provider,
            resource_type: descriptor.resource_type,
            raw_payload: None,
            value: StaticValue::Empty,
            error: false,
            stale: false,
            message: String::new(),
            resolved_at: None,
        }
    }

    /// true once any resolution attempt has completed
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// resolved, not in error, and holding data
    pub fn has_value(&self) -> bool {
        !self.error && !self.value.is_empty()
    }

    /// record a successful fetch
    pub fn succeed(&mut self, setting_key: String, payload: Vec<u8>, value: StaticValue) {
        self.setting_key = setting_key;
        self.raw_payload = Some(payload);
        self.value = value;
        self.error = false;
        self.stale = false;
        self.message = String::from("ok");
        self.resolved_at = Some(SystemTime::now());
    }

    /// record a failure; a previous good value is kept and marked stale
    pub fn fail(&mut self, setting_key: String, message: String) {
        self.setting_key = setting_key;
        if self.has_value() {
            self.stale = true;
        } else {
            self.value = StaticValue::Empty;
            self.raw_payload = None;
            self.error = true;
            self.stale = false;
        }
        self.message = message;
        self.resolved_at = Some(SystemTime::now());
    }

    /// convert the value into a caller type, falling back to the default
    pub fn value_as<T: DeserializeOwned + Default>(&self) -> T {
        if self.error {
            return T::default();
        }
        serde_json::from_value(self.value.to_json()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_by_resource_type() {
        let ids = StaticValue::decode(ResourceType::IdList, b"[1,2,3]").expect("ids");
        assert_eq!(ids, StaticValue::Ids(vec![1, 2, 3]));
        assert_eq!(ids.keys(), vec!["1", "2", "3"]);

        let rows = StaticValue::decode(ResourceType::Records, br#"[{"id":7,"n":"a"},{"id":"x"}]"#)
            .expect("records");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.keys(), vec!["7", "x"]);

        assert!(StaticValue::decode(ResourceType::IdList, br#"{"a":1}"#).is_err());
        assert!(StaticValue::decode(ResourceType::Map, b"{}").expect("map").is_empty());
        assert!(StaticValue::decode(ResourceType::Document, b"null").expect("doc").is_empty());
    }

    #[test]
    fn fail_keeps_a_good_value() {
        let d = SettingDescriptor::new("Hotels", ProviderKind::Pms, "/hotels")
            .with_resource_type(ResourceType::IdList);
        let mut entry = Entry::new(&d);
        assert!(!entry.is_resolved());

        entry.fail("/hotels".to_string(), "down".to_string());
        assert!(entry.error);
        assert_eq!(entry.value, StaticValue::Empty);

        entry.succeed("/hotels".to_string(), b"[4]".to_vec(), StaticValue::Ids(vec![4]));
        assert!(entry.has_value());

        entry.fail("/hotels".to_string(), "down again".to_string());
        assert!(!entry.error);
        assert!(entry.stale);
        assert_eq!(entry.value, StaticValue::Ids(vec![4]));
        assert_eq!(entry.message, "down again");
    }

    #[test]
    fn value_as() {
        let d = SettingDescriptor::new("Hotels", ProviderKind::Pms, "/hotels");
        let mut entry = Entry::new(&d);
        entry.succeed("/hotels".to_string(), b"[1,2]".to_vec(), StaticValue::Ids(vec![1, 2]));

        let ids: Vec<u32> = entry.value_as();
        assert_eq!(ids, vec![1, 2]);

        let wrong: hashbrown::HashMap<String, String> = entry.value_as();
        assert!(wrong.is_empty());
    }
}
