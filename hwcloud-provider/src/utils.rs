//! Conversions between engine values and API JSON, plus attribute getters

use std::collections::{BTreeMap, HashMap};

use hwcloud_core::resource::Value;
use hwcloud_sdk::json::path_search;

pub type Attributes = HashMap<String, Value>;

/// Convert API JSON into an engine value; `null` has no counterpart.
/// Numbers that are not integers are kept as their decimal string.
pub fn json_to_value(value: &serde_json::Value) -> Option<Value> {
    match value {
        serde_json::Value::String(s) => Some(Value::String(s.clone())),
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Value::Int(i)),
            None => Some(Value::String(n.to_string())),
        },
        serde_json::Value::Array(arr) => {
            let items: Vec<Value> = arr.iter().filter_map(json_to_value).collect();
            Some(Value::List(items))
        }
        serde_json::Value::Object(obj) => {
            let map: HashMap<String, Value> = obj
                .iter()
                .filter_map(|(k, v)| json_to_value(v).map(|v| (k.clone(), v)))
                .collect();
            Some(Value::Map(map))
        }
        serde_json::Value::Null => None,
    }
}

/// Convert an engine value into request JSON; unresolved references are dropped
pub fn value_to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::String(s) => Some(serde_json::json!(s)),
        Value::Bool(b) => Some(serde_json::json!(b)),
        Value::Int(i) => Some(serde_json::json!(i)),
        Value::List(items) => {
            let arr: Vec<serde_json::Value> = items.iter().filter_map(value_to_json).collect();
            Some(serde_json::Value::Array(arr))
        }
        Value::Map(map) => {
            let obj: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .filter_map(|(k, v)| value_to_json(v).map(|v| (k.clone(), v)))
                .collect();
            Some(serde_json::Value::Object(obj))
        }
        Value::ResourceRef(_, _) => None,
    }
}

// =============================================================================
// Attribute getters
// =============================================================================

/// Non-empty string attribute
pub fn get_str<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a str> {
    attrs
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// String attribute, empty when unset
pub fn get_string(attrs: &Attributes, name: &str) -> String {
    get_str(attrs, name).unwrap_or_default().to_string()
}

pub fn get_int(attrs: &Attributes, name: &str) -> Option<i64> {
    attrs.get(name).and_then(Value::as_int)
}

pub fn get_bool(attrs: &Attributes, name: &str) -> Option<bool> {
    attrs.get(name).and_then(Value::as_bool)
}

pub fn get_string_list(attrs: &Attributes, name: &str) -> Vec<String> {
    attrs
        .get(name)
        .and_then(Value::as_list)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Nested blocks such as `port_mapping` or `data_disks`
pub fn get_blocks<'a>(attrs: &'a Attributes, name: &str) -> Vec<&'a HashMap<String, Value>> {
    attrs
        .get(name)
        .and_then(Value::as_list)
        .map(|items| items.iter().filter_map(Value::as_map).collect())
        .unwrap_or_default()
}

pub fn get_tags(attrs: &Attributes) -> BTreeMap<String, String> {
    attrs
        .get("tags")
        .and_then(Value::as_map)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub fn tags_to_value(tags: &BTreeMap<String, String>) -> Value {
    Value::Map(
        tags.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// `prePaid` resources are billed through BSS orders
pub fn is_prepaid(attrs: &Attributes) -> bool {
    get_str(attrs, "charging_mode") == Some("prePaid")
}

/// Auto-pay defaults to on; only an explicit `"false"` disables it
pub fn auto_pay(attrs: &Attributes) -> bool {
    get_str(attrs, "auto_pay") != Some("false")
}

// =============================================================================
// State setters
// =============================================================================

/// Store the value found at `expr` in `body` as attribute `name`
pub fn set_from(attrs: &mut Attributes, name: &str, expr: &str, body: &serde_json::Value) {
    if let Some(value) = path_search(expr, body).as_ref().and_then(json_to_value) {
        attrs.insert(name.to_string(), value);
    }
}

pub fn set_str(attrs: &mut Attributes, name: &str, value: impl Into<String>) {
    attrs.insert(name.to_string(), Value::String(value.into()));
}

/// Items of `new` that are not in `old`
pub fn string_difference(new: &[String], old: &[String]) -> Vec<String> {
    new.iter().filter(|s| !old.contains(s)).cloned().collect()
}

/// True if any of `names` is in the changed-attribute list
pub fn has_change(changed: &[String], names: &[&str]) -> bool {
    changed.iter().any(|c| names.contains(&c.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_objects_become_maps_without_nulls() {
        let value = json_to_value(&json!({
            "name": "web",
            "size": 40,
            "ratio": 2.7,
            "gone": null,
            "ids": ["a", null, "b"]
        }))
        .unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map["name"], Value::string("web"));
        assert_eq!(map["size"], Value::Int(40));
        assert_eq!(map["ratio"], Value::string("2.7"));
        assert!(!map.contains_key("gone"));
        assert_eq!(
            map["ids"],
            Value::List(vec![Value::string("a"), Value::string("b")])
        );
    }

    #[test]
    fn fractional_numbers_are_not_truncated() {
        assert_eq!(json_to_value(&json!(2.7)), Some(Value::string("2.7")));
        assert_eq!(json_to_value(&json!(40)), Some(Value::Int(40)));
    }

    #[test]
    fn references_are_not_sent() {
        let value = Value::List(vec![
            Value::string("sg-1"),
            Value::ResourceRef("sg".into(), "id".into()),
        ]);
        assert_eq!(value_to_json(&value), Some(json!(["sg-1"])));
    }

    #[test]
    fn empty_strings_read_as_unset() {
        let mut attrs = Attributes::new();
        attrs.insert("description".into(), Value::string(""));
        attrs.insert("name".into(), Value::string("web"));
        assert_eq!(get_str(&attrs, "description"), None);
        assert_eq!(get_str(&attrs, "name"), Some("web"));
        assert_eq!(get_string(&attrs, "missing"), "");
    }

    #[test]
    fn tags_round_trip_through_attributes() {
        let tags: BTreeMap<String, String> = [("env".to_string(), "prod".to_string())].into();
        let mut attrs = Attributes::new();
        attrs.insert("tags".into(), tags_to_value(&tags));
        assert_eq!(get_tags(&attrs), tags);
    }

    #[test]
    fn auto_pay_defaults_on() {
        let mut attrs = Attributes::new();
        assert!(auto_pay(&attrs));
        attrs.insert("auto_pay".into(), Value::string("false"));
        assert!(!auto_pay(&attrs));
    }

    #[test]
    fn set_from_follows_paths() {
        let body = json!({"loadbalancer": {"eips": [{"eip_id": "eip-1"}]}});
        let mut attrs = Attributes::new();
        set_from(&mut attrs, "ipv4_eip_id", "loadbalancer.eips[0].eip_id", &body);
        set_from(&mut attrs, "missing", "loadbalancer.nope", &body);
        assert_eq!(attrs["ipv4_eip_id"], Value::string("eip-1"));
        assert!(!attrs.contains_key("missing"));
    }

    #[test]
    fn string_difference_keeps_order() {
        let new = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let old = vec!["b".to_string()];
        assert_eq!(string_difference(&new, &old), vec!["a", "c"]);
    }
}
