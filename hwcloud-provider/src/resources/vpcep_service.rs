//! VPC endpoint service: `v1/{project_id}/vpc-endpoint-services`
//!
//! Whitelist permissions are kept in step through the
//! `permissions/action` API after create and update.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use hwcloud_sdk::json::{path_search_str, remove_nil};
use hwcloud_sdk::tags::{expand_resource_tags, flatten_tags_to_map, update_resource_tags};
use hwcloud_sdk::{ListOpts, SdkError, ServiceClient, WaitConf, list_all_items, wait_for_state};
use serde::Deserialize;
use serde_json::{Value as Json, json};

use super::{ResourceContext, ResourceHandler, region_attribute, tags_attribute};
use crate::error::{HandlerError, HandlerResult};
use crate::utils::{
    Attributes, get_blocks, get_bool, get_str, get_string, get_string_list, get_tags, has_change,
    set_from, set_str, string_difference, tags_to_value,
};

const PERMISSION_DOMAIN: &str = "domainId";
const PERMISSION_ORG: &str = "orgPath";

pub struct VpcepService;

#[derive(Debug, Deserialize)]
struct PortMapping {
    #[serde(default)]
    protocol: String,
    server_port: i64,
    client_port: i64,
}

#[derive(Debug, Deserialize)]
struct Connection {
    #[serde(default)]
    id: String,
    #[serde(default)]
    marker_id: i64,
    #[serde(default)]
    domain_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct Permission {
    permission: String,
    #[serde(default)]
    permission_type: String,
}

fn service_path(id: &str) -> String {
    format!("v1/{{project_id}}/vpc-endpoint-services/{}", id)
}

fn decode<T: for<'de> Deserialize<'de>>(what: &str, value: Json) -> HandlerResult<T> {
    serde_json::from_value(value).map_err(|source| HandlerError::Decode {
        what: what.to_string(),
        source,
    })
}

/// `port_mapping` blocks in API form; `protocol` defaults to TCP
fn build_ports(attrs: &Attributes) -> Vec<Json> {
    get_blocks(attrs, "port_mapping")
        .into_iter()
        .map(|port| {
            let protocol = port
                .get("protocol")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("TCP");
            json!({
                "protocol": protocol,
                "server_port": port.get("service_port").and_then(Value::as_int),
                "client_port": port.get("terminal_port").and_then(Value::as_int),
            })
        })
        .collect()
}

fn build_create_body(attrs: &Attributes) -> Json {
    let mut body = json!({
        "vpc_id": get_str(attrs, "vpc_id"),
        "port_id": get_str(attrs, "port_id"),
        "server_type": get_str(attrs, "server_type"),
        "service_name": get_str(attrs, "name"),
        "service_type": get_str(attrs, "service_type"),
        "description": get_str(attrs, "description"),
        "tcp_proxy": get_str(attrs, "tcp_proxy"),
        "ip_version": get_str(attrs, "ip_version"),
        "snat_network_id": get_str(attrs, "snat_network_id"),
        "ip": get_str(attrs, "ip_address"),
        "pool_id": get_str(attrs, "pool_id"),
        "approval_enabled": get_bool(attrs, "approval").unwrap_or(false),
        "ports": build_ports(attrs),
        "tags": expand_resource_tags(&get_tags(attrs)),
    });
    // Not every region accepts the field, so it is only sent when enabled
    if get_bool(attrs, "enable_policy") == Some(true) {
        body["enable_policy"] = json!(true);
    }
    remove_nil(body)
}

fn build_update_body(to: &Attributes, changed: &[String]) -> Json {
    let mut body = json!({
        "service_name": get_str(to, "name"),
        "description": get_string(to, "description"),
    });
    if has_change(changed, &["approval"]) {
        body["approval_enabled"] = json!(get_bool(to, "approval").unwrap_or(false));
    }
    if has_change(changed, &["port_id"]) {
        body["port_id"] = json!(get_str(to, "port_id"));
    }
    if has_change(changed, &["port_mapping"]) {
        body["ports"] = json!(build_ports(to));
    }
    if has_change(changed, &["tcp_proxy"]) {
        body["tcp_proxy"] = json!(get_str(to, "tcp_proxy"));
    }
    if has_change(changed, &["ip_address"]) {
        body["ip"] = json!(get_str(to, "ip_address"));
    }
    remove_nil(body)
}

fn flatten_ports(ports: Vec<PortMapping>) -> Value {
    Value::List(
        ports
            .into_iter()
            .map(|p| {
                let mut map = HashMap::new();
                map.insert("protocol".to_string(), Value::String(p.protocol));
                map.insert("service_port".to_string(), Value::Int(p.server_port));
                map.insert("terminal_port".to_string(), Value::Int(p.client_port));
                Value::Map(map)
            })
            .collect(),
    )
}

fn flatten(body: &Json) -> HandlerResult<Attributes> {
    let mut attrs = Attributes::new();
    for (name, expr) in [
        ("status", "status"),
        ("service_name", "service_name"),
        ("vpc_id", "vpc_id"),
        ("port_id", "port_id"),
        ("approval", "approval_enabled"),
        ("server_type", "server_type"),
        ("service_type", "service_type"),
        ("description", "description"),
        ("tcp_proxy", "tcp_proxy"),
        ("enable_policy", "enable_policy"),
        ("ip_version", "ip_version"),
        ("snat_network_id", "snat_network_id"),
        ("ip_address", "ip"),
        ("pool_id", "pool_id"),
    ] {
        set_from(&mut attrs, name, expr, body);
    }

    // service_name is "{region}.{name}.{id}"
    if let Some(service_name) = path_search_str("service_name", body) {
        let parts: Vec<&str> = service_name.split('.').collect();
        if parts.len() > 2 {
            set_str(&mut attrs, "name", parts[1]);
        }
    }

    let ports: Vec<PortMapping> = decode("port mappings", body.get("ports").cloned().unwrap_or(json!([])))?;
    attrs.insert("port_mapping".to_string(), flatten_ports(ports));

    let tags = body.get("tags").cloned().unwrap_or(Json::Null);
    attrs.insert("tags".to_string(), tags_to_value(&flatten_tags_to_map(&tags)));
    Ok(attrs)
}

fn flatten_connections(items: Vec<Json>) -> HandlerResult<Value> {
    let connections: Vec<Connection> = decode("connections", Json::Array(items))?;
    Ok(Value::List(
        connections
            .into_iter()
            .map(|c| {
                let mut map = HashMap::new();
                map.insert("endpoint_id".to_string(), Value::String(c.id));
                map.insert("packet_id".to_string(), Value::Int(c.marker_id));
                map.insert("domain_id".to_string(), Value::String(c.domain_id));
                map.insert("status".to_string(), Value::String(c.status));
                map.insert("description".to_string(), Value::String(c.description));
                Value::Map(map)
            })
            .collect(),
    ))
}

/// Split whitelist entries into domain and organization permissions
fn split_permissions(items: Vec<Json>) -> HandlerResult<(Vec<String>, Vec<String>)> {
    let permissions: Vec<Permission> = decode("permissions", Json::Array(items))?;
    let mut domains = Vec::new();
    let mut orgs = Vec::new();
    for p in permissions {
        match p.permission_type.as_str() {
            PERMISSION_DOMAIN => domains.push(p.permission),
            PERMISSION_ORG => orgs.push(p.permission),
            _ => {}
        }
    }
    Ok((domains, orgs))
}

fn string_list(items: Vec<String>) -> Value {
    Value::List(items.into_iter().map(Value::String).collect())
}

async fn permission_action(
    client: &ServiceClient,
    id: &str,
    action: &str,
    permission_type: &str,
    permissions: Vec<String>,
) -> HandlerResult<()> {
    if permissions.is_empty() {
        return Ok(());
    }
    log::debug!("{} {} permissions {:?} on endpoint service {}", action, permission_type, permissions, id);
    let url = client.url(&format!("{}/permissions/action", service_path(id)));
    let body = json!({
        "action": action,
        "permissions": permissions,
        "permission_type": permission_type,
    });
    client.post(&url, body).await?;
    Ok(())
}

async fn update_permissions(
    client: &ServiceClient,
    id: &str,
    from: &Attributes,
    to: &Attributes,
) -> HandlerResult<()> {
    for (name, permission_type) in [("permissions", PERMISSION_DOMAIN), ("organization_permissions", PERMISSION_ORG)] {
        let old = get_string_list(from, name);
        let new = get_string_list(to, name);
        permission_action(client, id, "add", permission_type, string_difference(&new, &old)).await?;
        permission_action(client, id, "remove", permission_type, string_difference(&old, &new)).await?;
    }
    Ok(())
}

async fn wait_for_status(
    ctx: &ResourceContext<'_>,
    client: &ServiceClient,
    id: &str,
    pending: &[&str],
    target: &str,
) -> HandlerResult<()> {
    let url = client.url(&service_path(id));
    let conf = ctx.wait(
        WaitConf::new(pending, &[target], Duration::from_secs(600))
            .delay(Duration::from_secs(5))
            .poll_interval(Duration::from_secs(3)),
    );
    let url = &url;
    wait_for_state(&conf, || async move {
        match client.get(url).await {
            Ok(body) => {
                let status = path_search_str("status", &body).unwrap_or_default();
                Ok((body, status))
            }
            Err(e) if e.is_not_found() => {
                log::info!("successfully deleted VPC endpoint service {}", id);
                Ok((Json::Null, "deleted".to_string()))
            }
            Err(e) => Err::<_, SdkError>(e),
        }
    })
    .await?;
    Ok(())
}

#[async_trait]
impl ResourceHandler for VpcepService {
    fn type_name(&self) -> &'static str {
        "vpcep_service"
    }

    fn schema(&self) -> ResourceSchema {
        let string_set = || AttributeType::Set(Box::new(AttributeType::String));
        let blocks = || AttributeType::List(Box::new(AttributeType::Block));
        ResourceSchema::new("vpcep_service")
            .with_description("VPC endpoint service")
            .attribute(region_attribute())
            .attribute(
                AttributeSchema::new(
                    "server_type",
                    AttributeType::Enum(vec!["VM".to_string(), "LB".to_string(), "VIP".to_string()]),
                )
                .required()
                .force_new(),
            )
            .attribute(AttributeSchema::new("vpc_id", AttributeType::String).required().force_new())
            .attribute(AttributeSchema::new("port_id", AttributeType::String).required())
            .attribute(
                AttributeSchema::new("port_mapping", blocks())
                    .required()
                    .with_description("{protocol, service_port, terminal_port} blocks"),
            )
            .attribute(AttributeSchema::new("name", AttributeType::String).optional_computed())
            .attribute(
                AttributeSchema::new("service_type", AttributeType::String)
                    .force_new()
                    .with_default(Value::string("interface")),
            )
            .attribute(AttributeSchema::new("approval", AttributeType::Bool).optional_computed())
            .attribute(AttributeSchema::new("permissions", string_set()).optional_computed())
            .attribute(AttributeSchema::new("organization_permissions", string_set()).optional_computed())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("enable_policy", AttributeType::Bool).optional_computed().force_new())
            .attribute(
                AttributeSchema::new(
                    "tcp_proxy",
                    AttributeType::Enum(
                        ["close", "toa_open", "proxy_open", "open", "proxy_vni"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    ),
                )
                .optional_computed(),
            )
            .attribute(AttributeSchema::new("ip_version", AttributeType::String).optional_computed().force_new())
            .attribute(AttributeSchema::new("snat_network_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("ip_address", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("pool_id", AttributeType::String).force_new())
            .attribute(tags_attribute())
            .attribute(AttributeSchema::new("service_name", AttributeType::String).computed())
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(AttributeSchema::new("connections", blocks()).computed())
    }

    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
        let client = ctx.service("vpcep").await?;
        let resp = client
            .post(&client.url("v1/{project_id}/vpc-endpoint-services"), build_create_body(attrs))
            .await?;
        let id = path_search_str("id", &resp).ok_or_else(|| HandlerError::missing("id"))?;
        log::info!("waiting for VPC endpoint service {} to become available", id);

        wait_for_status(ctx, &client, &id, &["creating"], "available").await?;
        update_permissions(&client, &id, &Attributes::new(), attrs).await?;
        Ok(id)
    }

    async fn read(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        _attrs: &Attributes,
    ) -> HandlerResult<Option<Attributes>> {
        let client = ctx.service("vpcep").await?;
        let path = service_path(id);
        let body = client.get(&client.url(&path)).await?;
        let mut state = flatten(&body)?;

        let opts = ListOpts::offset().items_key("connections").limit(500);
        match list_all_items(&client, &client.url(&format!("{}/connections", path)), &opts).await {
            Ok(items) => {
                state.insert("connections".to_string(), flatten_connections(items)?);
            }
            Err(e) => log::warn!("error querying connections of VPC endpoint service {}: {}", id, e),
        }

        let opts = ListOpts::offset().items_key("permissions").limit(500);
        match list_all_items(&client, &client.url(&format!("{}/permissions", path)), &opts).await {
            Ok(items) => {
                let (domains, orgs) = split_permissions(items)?;
                state.insert("permissions".to_string(), string_list(domains));
                state.insert("organization_permissions".to_string(), string_list(orgs));
            }
            Err(e) => log::warn!("error querying permissions of VPC endpoint service {}: {}", id, e),
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
        let client = ctx.service("vpcep").await?;
        let updatable = [
            "name",
            "approval",
            "port_id",
            "port_mapping",
            "description",
            "tcp_proxy",
            "ip_address",
        ];
        if has_change(changed, &updatable) {
            client
                .put(&client.url(&service_path(id)), build_update_body(to, changed))
                .await?;
        }
        if has_change(changed, &["tags"]) {
            let path = format!("v1/{{project_id}}/endpoint_service/{}", id);
            update_resource_tags(&client, &path, &get_tags(from), &get_tags(to)).await?;
        }
        if has_change(changed, &["permissions", "organization_permissions"]) {
            update_permissions(&client, id, from, to).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, _attrs: &Attributes) -> HandlerResult<()> {
        let client = ctx.service("vpcep").await?;
        client.delete(&client.url(&service_path(id))).await?;
        wait_for_status(ctx, &client, id, &["available", "deleting"], "deleted").await
    }
}
