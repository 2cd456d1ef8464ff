//! VPC subnet: `v1/{project_id}/subnets`
//!
//! Updates and deletes address the subnet through its VPC
//! (`v1/{project_id}/vpcs/{vpc_id}/subnets/{id}`). Deletion is retried until
//! the subnet reads back as 404 because ports may still be draining.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use hwcloud_sdk::json::{path_search_array, path_search_str, remove_nil};
use hwcloud_sdk::tags::update_resource_tags;
use hwcloud_sdk::{SdkError, WaitConf, wait_for_state};
use serde_json::{Value as Json, json};

use super::{ResourceContext, ResourceHandler, fetch_tags, region_attribute, tags_attribute};
use crate::error::{HandlerError, HandlerResult};
use crate::utils::{
    Attributes, get_bool, get_str, get_string, get_string_list, get_tags, has_change, set_from,
    set_str, tags_to_value,
};

const TAGS_PATH: &str = "v2.0/{project_id}/subnets/{id}";

/// Private DNS servers used when neither `dns_list` nor `primary_dns` is set
const DEFAULT_DNS: &[(&str, &[&str])] = &[
    ("cn-north-1", &["100.125.1.250", "100.125.21.250"]),
    ("cn-north-4", &["100.125.1.250", "100.125.129.250"]),
    ("cn-north-9", &["100.125.1.250", "100.125.107.250"]),
    ("cn-east-2", &["100.125.17.29", "100.125.135.29"]),
    ("cn-east-3", &["100.125.1.250", "100.125.64.250"]),
    ("cn-south-1", &["100.125.1.250", "100.125.136.29"]),
    ("cn-south-4", &["100.125.0.167"]),
    ("cn-southwest-2", &["100.125.1.250", "100.125.129.250"]),
    ("ap-southeast-1", &["100.125.1.250", "100.125.3.250"]),
    ("ap-southeast-2", &["100.125.1.250", "100.125.1.251"]),
    ("ap-southeast-3", &["100.125.1.250", "100.125.128.250"]),
    ("af-south-1", &["100.125.1.250", "100.125.1.14"]),
    ("tr-west-1", &["100.125.2.250", "100.125.2.251"]),
    ("sa-brazil-1", &["100.125.1.22", "100.125.1.90"]),
    ("na-mexico-1", &["100.125.1.22", "100.125.1.90"]),
    ("la-north-2", &["100.125.1.250", "100.125.1.242"]),
    ("la-south-2", &["100.125.1.250", "100.125.0.250"]),
    ("sa-chile-1", &["100.125.1.250", "100.125.0.250"]),
];

/// DHCP extra option name -> attribute
const DHCP_OPTIONS: &[(&str, &str)] = &[
    ("addresstime", "dhcp_lease_time"),
    ("ipv6_addresstime", "dhcp_ipv6_lease_time"),
    ("ntp", "ntp_server_address"),
    ("domainname", "dhcp_domain_name"),
];

pub struct VpcSubnet;

fn tags_path(id: &str) -> String {
    TAGS_PATH.replace("{id}", id)
}

fn dns_list(attrs: &Attributes, region: &str) -> Option<Vec<String>> {
    let configured = get_string_list(attrs, "dns_list");
    if !configured.is_empty() {
        return Some(configured);
    }
    if get_str(attrs, "primary_dns").is_some() {
        return None;
    }
    DEFAULT_DNS
        .iter()
        .find(|(r, _)| *r == region)
        .map(|(_, servers)| servers.iter().map(|s| s.to_string()).collect())
}

/// On update an unset `ntp` or `domainname` is sent without a value to clear it
fn build_dhcp_opts(attrs: &Attributes, update: bool) -> Vec<Json> {
    let mut opts = Vec::new();
    for (opt_name, attr) in DHCP_OPTIONS {
        match get_str(attrs, attr) {
            Some(value) => opts.push(json!({"opt_name": opt_name, "opt_value": value})),
            None if update && matches!(*opt_name, "ntp" | "domainname") => {
                opts.push(json!({"opt_name": opt_name}))
            }
            None => {}
        }
    }
    opts
}

fn build_create_body(attrs: &Attributes, region: &str) -> Json {
    let dhcp_opts = build_dhcp_opts(attrs, false);
    remove_nil(json!({
        "subnet": {
            "name": get_str(attrs, "name"),
            "cidr": get_str(attrs, "cidr"),
            "gateway_ip": get_str(attrs, "gateway_ip"),
            "vpc_id": get_str(attrs, "vpc_id"),
            "availability_zone": get_str(attrs, "availability_zone"),
            "description": get_str(attrs, "description"),
            "ipv6_enable": get_bool(attrs, "ipv6_enable").unwrap_or(false),
            "dhcp_enable": get_bool(attrs, "dhcp_enable").unwrap_or(true),
            "primary_dns": get_str(attrs, "primary_dns"),
            "secondary_dns": get_str(attrs, "secondary_dns"),
            "dnsList": dns_list(attrs, region),
            "extra_dhcp_opts": if dhcp_opts.is_empty() { None } else { Some(dhcp_opts) },
        }
    }))
}

fn build_update_body(to: &Attributes, changed: &[String]) -> HandlerResult<Json> {
    let mut subnet = serde_json::Map::new();
    subnet.insert("name".into(), json!(get_string(to, "name")));
    subnet.insert(
        "dhcp_enable".into(),
        json!(get_bool(to, "dhcp_enable").unwrap_or(true)),
    );

    if has_change(changed, &["ipv6_enable"]) {
        if get_bool(to, "ipv6_enable") == Some(true) {
            subnet.insert("ipv6_enable".into(), json!(true));
        } else {
            return Err(HandlerError::invalid(
                "parameter cannot be disabled after IPv6 enable",
            ));
        }
    }
    if has_change(changed, &["description"]) {
        subnet.insert("description".into(), json!(get_string(to, "description")));
    }
    if has_change(changed, &["primary_dns"]) {
        subnet.insert("primary_dns".into(), json!(get_string(to, "primary_dns")));
    }
    if has_change(changed, &["secondary_dns"]) {
        subnet.insert("secondary_dns".into(), json!(get_string(to, "secondary_dns")));
    }
    if has_change(changed, &["dns_list"]) {
        subnet.insert("dnsList".into(), json!(get_string_list(to, "dns_list")));
    }
    if has_change(
        changed,
        &["dhcp_lease_time", "ntp_server_address", "dhcp_ipv6_lease_time", "dhcp_domain_name"],
    ) {
        subnet.insert("extra_dhcp_opts".into(), json!(build_dhcp_opts(to, true)));
    }
    Ok(json!({ "subnet": subnet }))
}

fn flatten(body: &Json) -> Attributes {
    let mut attrs = Attributes::new();
    for (name, field) in [
        ("name", "name"),
        ("description", "description"),
        ("cidr", "cidr"),
        ("gateway_ip", "gateway_ip"),
        ("ipv6_enable", "ipv6_enable"),
        ("dhcp_enable", "dhcp_enable"),
        ("primary_dns", "primary_dns"),
        ("secondary_dns", "secondary_dns"),
        ("dns_list", "dnsList"),
        ("availability_zone", "availability_zone"),
        ("vpc_id", "vpc_id"),
        ("subnet_id", "neutron_subnet_id"),
        ("ipv4_subnet_id", "neutron_subnet_id"),
        ("ipv6_subnet_id", "neutron_subnet_id_v6"),
        ("ipv6_cidr", "cidr_v6"),
        ("ipv6_gateway", "gateway_ip_v6"),
        ("status", "status"),
    ] {
        set_from(&mut attrs, name, &format!("subnet.{}", field), body);
    }

    for opt in path_search_array("subnet.extra_dhcp_opts", body) {
        let name = opt["opt_name"].as_str().unwrap_or_default();
        if let Some((_, attr)) = DHCP_OPTIONS.iter().find(|(n, _)| *n == name)
            && let Some(value) = opt["opt_value"].as_str()
        {
            set_str(&mut attrs, attr, value);
        }
    }
    attrs
}

/// Refresh step while waiting for a new subnet
fn subnet_state(body: &Json) -> Result<String, SdkError> {
    let status = path_search_str("subnet.status", body).unwrap_or_default();
    match status.as_str() {
        "ACTIVE" => Ok(status),
        "DOWN" | "ERROR" => Err(SdkError::UnexpectedState {
            state: status,
            target: "ACTIVE".to_string(),
        }),
        _ => Ok("UNKNOWN".to_string()),
    }
}

#[async_trait]
impl ResourceHandler for VpcSubnet {
    fn type_name(&self) -> &'static str {
        "vpc_subnet"
    }

    fn schema(&self) -> ResourceSchema {
        let string = || AttributeType::String;
        ResourceSchema::new("vpc_subnet")
            .with_description("Subnet of a VPC")
            .attribute(region_attribute())
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(AttributeSchema::new("cidr", types::cidr()).required().force_new())
            .attribute(
                AttributeSchema::new("gateway_ip", types::ipv4_address())
                    .required()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("vpc_id", string()).required().force_new())
            .attribute(
                AttributeSchema::new("availability_zone", string())
                    .optional_computed()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("description", string()))
            .attribute(AttributeSchema::new("ipv6_enable", AttributeType::Bool).optional_computed())
            .attribute(
                AttributeSchema::new("dhcp_enable", AttributeType::Bool)
                    .with_default(Value::Bool(true)),
            )
            .attribute(AttributeSchema::new("primary_dns", types::ipv4_address()).optional_computed())
            .attribute(
                AttributeSchema::new("secondary_dns", types::ipv4_address()).optional_computed(),
            )
            .attribute(
                AttributeSchema::new("dns_list", AttributeType::List(Box::new(string())))
                    .optional_computed(),
            )
            .attribute(AttributeSchema::new("ntp_server_address", string()))
            .attribute(AttributeSchema::new("dhcp_lease_time", string()).optional_computed())
            .attribute(AttributeSchema::new("dhcp_ipv6_lease_time", string()).optional_computed())
            .attribute(AttributeSchema::new("dhcp_domain_name", string()).optional_computed())
            .attribute(tags_attribute())
            .attribute(AttributeSchema::new("subnet_id", string()).computed())
            .attribute(AttributeSchema::new("ipv4_subnet_id", string()).computed())
            .attribute(AttributeSchema::new("ipv6_subnet_id", string()).computed())
            .attribute(AttributeSchema::new("ipv6_cidr", string()).computed())
            .attribute(AttributeSchema::new("ipv6_gateway", string()).computed())
            .attribute(AttributeSchema::new("status", string()).computed())
    }

    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
        let client = ctx.service("vpc").await?;
        let body = build_create_body(attrs, &ctx.region);
        log::debug!("create VPC subnet options: {}", body);
        let resp = client.post(&client.url("v1/{project_id}/subnets"), body).await?;
        let id = path_search_str("subnet.id", &resp)
            .ok_or_else(|| HandlerError::missing("subnet.id"))?;
        log::info!("VPC subnet ID: {}", id);

        let url = client.build_path("v1/{project_id}/subnets/{id}", &[("id", &id)]);
        let conf = ctx.wait(
            WaitConf::new(&["UNKNOWN"], &["ACTIVE"], Duration::from_secs(300))
                .delay(Duration::from_secs(5))
                .poll_interval(Duration::from_secs(5)),
        );
        let (client_ref, url_ref) = (&client, &url);
        wait_for_state(&conf, || async move {
            let body = client_ref.get(url_ref).await?;
            let state = subnet_state(&body)?;
            Ok::<_, SdkError>((body, state))
        })
        .await?;

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
        let client = ctx.service("vpc").await?;
        let body = client
            .get(&client.build_path("v1/{project_id}/subnets/{id}", &[("id", id)]))
            .await?;
        let mut state = flatten(&body);

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
        if has_change(
            changed,
            &[
                "name",
                "description",
                "dhcp_enable",
                "primary_dns",
                "secondary_dns",
                "dns_list",
                "ipv6_enable",
                "dhcp_lease_time",
                "ntp_server_address",
                "dhcp_ipv6_lease_time",
                "dhcp_domain_name",
            ],
        ) {
            let body = build_update_body(to, changed)?;
            log::debug!("update VPC subnet options: {}", body);
            let client = ctx.service("vpc").await?;
            let url = client.build_path(
                "v1/{project_id}/vpcs/{vpc_id}/subnets/{id}",
                &[("vpc_id", &get_string(to, "vpc_id")), ("id", id)],
            );
            client.put(&url, body).await?;
        }

        if has_change(changed, &["tags"]) {
            let tag_client = ctx.service("networkv2").await?;
            update_resource_tags(&tag_client, &tags_path(id), &get_tags(from), &get_tags(to)).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, attrs: &Attributes) -> HandlerResult<()> {
        let client = ctx.service("vpc").await?;
        let get_url = client.build_path("v1/{project_id}/subnets/{id}", &[("id", id)]);
        let delete_url = client.build_path(
            "v1/{project_id}/vpcs/{vpc_id}/subnets/{id}",
            &[("vpc_id", &get_string(attrs, "vpc_id")), ("id", id)],
        );

        let conf = ctx.wait(
            WaitConf::new(&["ACTIVE"], &["DELETED"], Duration::from_secs(600))
                .delay(Duration::from_secs(5))
                .poll_interval(Duration::from_secs(5)),
        );
        let (client, get_url, delete_url) = (&client, &get_url, &delete_url);
        wait_for_state(&conf, || async move {
            let current = match client.get(get_url).await {
                Ok(body) => body,
                Err(e) if e.is_not_found() => {
                    log::info!("successfully deleted subnet {}", id);
                    return Ok((Json::Null, "DELETED".to_string()));
                }
                // throttling on the API server, or a transient 403 under enterprise project permissions
                Err(e) if matches!(e.status(), Some(500) | Some(403)) => {
                    log::debug!("got {:?} reading subnet {}, retrying", e.status(), id);
                    return Ok((Json::Null, "ACTIVE".to_string()));
                }
                Err(e) => return Err(e),
            };

            match client.delete(delete_url).await {
                Ok(_) => Ok((current, "ACTIVE".to_string())),
                Err(e) if matches!(e.status(), Some(404) | Some(400)) => {
                    log::info!("successfully deleted subnet {}", id);
                    Ok((current, "DELETED".to_string()))
                }
                Err(e) if matches!(e.status(), Some(500) | Some(409)) => {
                    log::debug!("subnet {} is still in use ({:?}), retrying", id, e.status());
                    Ok((current, "ACTIVE".to_string()))
                }
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }
}
