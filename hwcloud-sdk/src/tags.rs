//! Resource tags: request bodies, response flattening and the
//! `tags/action` batch API shared by VPC, ELB and EVS.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::client::ServiceClient;
use crate::error::SdkResult;

/// `[{key, value}]`, sorted by key
pub fn expand_resource_tags(tags: &BTreeMap<String, String>) -> Value {
    Value::Array(
        tags.iter()
            .map(|(k, v)| json!({"key": k, "value": v}))
            .collect(),
    )
}

/// Accepts `[{key, value}]` arrays as well as plain `{key: value}` objects
pub fn flatten_tags_to_map(tags: &Value) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    match tags {
        Value::Array(items) => {
            for item in items {
                if let Some(key) = item.get("key").and_then(Value::as_str) {
                    let value = item.get("value").and_then(Value::as_str).unwrap_or_default();
                    map.insert(key.to_string(), value.to_string());
                }
            }
        }
        Value::Object(obj) => {
            for (k, v) in obj {
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                map.insert(k.clone(), value);
            }
        }
        _ => {}
    }
    map
}

/// Tags to remove and tags to (re)create when moving from `old` to `new`.
/// A changed value appears in both.
fn tag_changes(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let removed = old
        .iter()
        .filter(|(k, v)| new.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let added = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (removed, added)
}

/// Apply a tag diff through `POST {path}/tags/action`.
///
/// `path` is the tagged object, e.g. `v2.0/{project_id}/vpcs/{id}`.
pub async fn update_resource_tags(
    client: &ServiceClient,
    path: &str,
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> SdkResult<()> {
    let (removed, added) = tag_changes(old, new);
    let url = client.url(&format!("{}/tags/action", path.trim_end_matches('/')));

    if !removed.is_empty() {
        log::debug!("removing tags {:?} from {}", removed.keys(), path);
        let body = json!({"action": "delete", "tags": expand_resource_tags(&removed)});
        client.post(&url, body).await?;
    }
    if !added.is_empty() {
        log::debug!("adding tags {:?} to {}", added.keys(), path);
        let body = json!({"action": "create", "tags": expand_resource_tags(&added)});
        client.post(&url, body).await?;
    }
    Ok(())
}
