//! Security group: `v3/{project_id}/vpc/security-groups`
//!
//! Rules are managed elsewhere; this resource only reports them.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use hwcloud_sdk::json::{path_search, path_search_array, path_search_str, remove_nil};
use hwcloud_sdk::tags::update_resource_tags;
use hwcloud_sdk::{WaitConf, wait_for_state};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value as Json, json};

use super::{
    ResourceContext, ResourceHandler, enterprise_project_attribute, fetch_tags, region_attribute,
    tags_attribute,
};
use crate::error::{HandlerError, HandlerResult};
use crate::utils::{Attributes, get_bool, get_str, get_string, get_tags, has_change, set_from, tags_to_value};

const TAGS_PATH: &str = "v2.0/{project_id}/security-groups/{id}";

pub struct SecurityGroup;

/// Rule as returned by the v3 API
#[derive(Debug, Deserialize)]
struct SecurityGroupRule {
    id: String,
    #[serde(default)]
    direction: String,
    #[serde(default)]
    ethertype: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    multiport: Option<String>,
    #[serde(default)]
    remote_ip_prefix: Option<String>,
    #[serde(default)]
    remote_group_id: Option<String>,
    #[serde(default)]
    remote_address_group_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
}

fn tags_path(id: &str) -> String {
    TAGS_PATH.replace("{id}", id)
}

/// `"80"` or `"8000-8080"`; lists such as `"22,80"` have no single range
fn parse_port_range(ports: &str) -> Option<(i64, i64)> {
    let re = Regex::new(r"^(\d+)(?:-(\d+))?$").ok()?;
    let caps = re.captures(ports)?;
    let min: i64 = caps.get(1)?.as_str().parse().ok()?;
    let max = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => min,
    };
    Some((min, max))
}

fn flatten_rule(rule: SecurityGroupRule) -> Value {
    let mut map: HashMap<String, Value> = HashMap::new();
    map.insert("id".into(), Value::String(rule.id));
    map.insert("direction".into(), Value::String(rule.direction));
    map.insert("ethertype".into(), Value::String(rule.ethertype));
    for (name, value) in [
        ("protocol", rule.protocol),
        ("remote_ip_prefix", rule.remote_ip_prefix),
        ("remote_group_id", rule.remote_group_id),
        ("remote_address_group_id", rule.remote_address_group_id),
        ("description", rule.description),
        ("action", rule.action),
    ] {
        map.insert(name.into(), Value::String(value.unwrap_or_default()));
    }
    if let Some(priority) = rule.priority {
        map.insert("priority".into(), Value::Int(priority));
    }
    if let Some(ports) = rule.multiport.filter(|p| !p.is_empty()) {
        if let Some((min, max)) = parse_port_range(&ports) {
            map.insert("port_range_min".into(), Value::Int(min));
            map.insert("port_range_max".into(), Value::Int(max));
        }
        map.insert("ports".into(), Value::String(ports));
    }
    Value::Map(map)
}

fn flatten_rules(rules: &Json) -> HandlerResult<Value> {
    let rules: Vec<SecurityGroupRule> =
        serde_json::from_value(rules.clone()).map_err(|source| HandlerError::Decode {
            what: "security group rules".to_string(),
            source,
        })?;
    Ok(Value::List(rules.into_iter().map(flatten_rule).collect()))
}

fn flatten(body: &Json) -> HandlerResult<Attributes> {
    let mut attrs = Attributes::new();
    set_from(&mut attrs, "name", "security_group.name", body);
    set_from(&mut attrs, "description", "security_group.description", body);
    set_from(&mut attrs, "enterprise_project_id", "security_group.enterprise_project_id", body);
    set_from(&mut attrs, "created_at", "security_group.created_at", body);
    set_from(&mut attrs, "updated_at", "security_group.updated_at", body);
    let rules = path_search("security_group.security_group_rules", body).unwrap_or(json!([]));
    attrs.insert("rules".to_string(), flatten_rules(&rules)?);
    Ok(attrs)
}

#[async_trait]
impl ResourceHandler for SecurityGroup {
    fn type_name(&self) -> &'static str {
        "networking_secgroup"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("networking_secgroup")
            .with_description("Security group")
            .attribute(region_attribute())
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(enterprise_project_attribute())
            .attribute(
                AttributeSchema::new("delete_default_rules", AttributeType::Bool)
                    .force_new()
                    .with_description("Remove the rules HuaweiCloud adds to every new group"),
            )
            .attribute(tags_attribute())
            .attribute(
                AttributeSchema::new("rules", AttributeType::List(Box::new(AttributeType::Block))).computed(),
            )
            .attribute(AttributeSchema::new("created_at", AttributeType::String).computed())
            .attribute(AttributeSchema::new("updated_at", AttributeType::String).computed())
    }

    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
        let client = ctx.service("vpcv3").await?;
        let body = remove_nil(json!({
            "security_group": {
                "name": get_str(attrs, "name"),
                "enterprise_project_id": ctx.enterprise_project_id,
            }
        }));
        let resp = client
            .post(&client.url("v3/{project_id}/vpc/security-groups"), body)
            .await?;
        let id = path_search_str("security_group.id", &resp)
            .ok_or_else(|| HandlerError::missing("security_group.id"))?;
        log::info!("security group ID: {}", id);

        if let Some(description) = get_str(attrs, "description") {
            let url = client.build_path("v3/{project_id}/vpc/security-groups/{id}", &[("id", &id)]);
            client
                .put(&url, json!({"security_group": {"description": description}}))
                .await?;
        }

        if get_bool(attrs, "delete_default_rules") == Some(true) {
            let rules = path_search_array("security_group.security_group_rules", &resp);
            for rule in rules {
                let Some(rule_id) = rule["id"].as_str() else {
                    continue;
                };
                let url = client.build_path(
                    "v3/{project_id}/vpc/security-group-rules/{rule_id}",
                    &[("rule_id", rule_id)],
                );
                client.delete(&url).await?;
                log::debug!("deleted default rule {} of security group {}", rule_id, id);
            }
        }

        let tags = get_tags(attrs);
        if !tags.is_empty() {
            let tag_client = ctx.service("networkv2").await?;
            update_resource_tags(&tag_client, &tags_path(&id), &BTreeMap::new(), &tags).await?;
        }
        Ok(id)
    }

    async fn read(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        _attrs: &Attributes,
    ) -> HandlerResult<Option<Attributes>> {
        let client = ctx.service("vpcv3").await?;
        let body = client
            .get(&client.build_path("v3/{project_id}/vpc/security-groups/{id}", &[("id", id)]))
            .await?;
        let mut state = flatten(&body)?;

        let tag_client = ctx.service("networkv2").await?;
        if let Some(tags) = fetch_tags(&tag_client, &tags_path(id)).await {
            state.insert("tags".to_string(), tags_to_value(&tags));
        }
        Ok(Some(state))
    }

    async fn update(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        from: &Attributes,
        to: &Attributes,
        changed: &[String],
    ) -> HandlerResult<()> {
        if has_change(changed, &["name", "description"]) {
            let client = ctx.service("vpcv3").await?;
            let url = client.build_path("v3/{project_id}/vpc/security-groups/{id}", &[("id", id)]);
            let body = json!({
                "security_group": {
                    "name": get_string(to, "name"),
                    "description": get_string(to, "description"),
                }
            });
            client.put(&url, body).await?;
        }
        if has_change(changed, &["tags"]) {
            let tag_client = ctx.service("networkv2").await?;
            update_resource_tags(&tag_client, &tags_path(id), &get_tags(from), &get_tags(to)).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, _attrs: &Attributes) -> HandlerResult<()> {
        let client = ctx.service("security_group").await?;
        let url = client.build_path("v1/{project_id}/security-groups/{id}", &[("id", id)]);
        let conf = ctx.wait(
            WaitConf::new(&["ACTIVE"], &["DELETED"], Duration::from_secs(600))
                .delay(Duration::from_secs(5))
                .poll_interval(Duration::from_secs(3)),
        );

        let (client, url) = (&client, &url);
        wait_for_state(&conf, || async move {
            let current = match client.get(url).await {
                Ok(body) => body,
                Err(e) if e.is_not_found() => {
                    log::info!("successfully deleted security group {}", id);
                    return Ok((Json::Null, "DELETED".to_string()));
                }
                Err(e) => return Err(e),
            };
            match client.delete(url).await {
                Ok(_) => Ok((current, "ACTIVE".to_string())),
                Err(e) if e.is_not_found() => Ok((current, "DELETED".to_string())),
                // still referenced by ports or other groups
                Err(e) if e.status() == Some(409) => {
                    log::debug!("security group {} is in use, retrying", id);
                    Ok((current, "ACTIVE".to_string()))
                }
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }
}
