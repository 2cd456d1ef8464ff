//! Dedicated load balancer: `v3/{project_id}/elb/loadbalancers`

use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use hwcloud_sdk::bss::{unsubscribe_prepaid_resources, wait_order_complete};
use hwcloud_sdk::json::{path_search, path_search_array, path_search_i64, path_search_str, remove_nil};
use hwcloud_sdk::tags::{expand_resource_tags, flatten_tags_to_map, update_resource_tags};
use hwcloud_sdk::{SdkError, ServiceClient, WaitConf, wait_for_state};
use serde_json::{Value as Json, json};

use super::{
    ResourceContext, ResourceHandler, charging_attributes, enterprise_project_attribute,
    region_attribute, tags_attribute,
};
use crate::error::{HandlerError, HandlerResult};
use crate::utils::{
    Attributes, auto_pay, get_bool, get_int, get_str, get_string, get_string_list, get_tags,
    has_change, is_prepaid, set_from, set_str, string_difference, tags_to_value,
};

/// Attributes sent by the in-place `PUT`
const UPDATABLE: &[&str] = &[
    "name",
    "description",
    "cross_vpc_backend",
    "ipv4_subnet_id",
    "ipv6_network_id",
    "ipv4_address",
    "ipv6_address",
    "l4_flavor_id",
    "l7_flavor_id",
    "protection_status",
    "protection_reason",
    "deletion_protection_enable",
];

pub struct LoadBalancer;

fn lb_path(id: &str) -> String {
    format!("v3/{{project_id}}/elb/loadbalancers/{}", id)
}

fn build_publicip(attrs: &Attributes) -> Json {
    let Some(iptype) = get_str(attrs, "iptype") else {
        return Json::Null;
    };
    json!({
        "ip_version": 4,
        "network_type": iptype,
        "bandwidth": {
            "id": get_str(attrs, "bandwidth_id"),
            "name": get_str(attrs, "name"),
            "size": get_int(attrs, "bandwidth_size"),
            "charge_mode": get_str(attrs, "bandwidth_charge_mode"),
            "share_type": get_str(attrs, "sharetype"),
        }
    })
}

fn build_prepaid_options(attrs: &Attributes) -> Json {
    if !is_prepaid(attrs) {
        return Json::Null;
    }
    let mut options = json!({
        "period_type": get_str(attrs, "period_unit"),
        "period_num": get_int(attrs, "period"),
    });
    if get_str(attrs, "auto_renew") == Some("true") {
        options["auto_renew"] = json!(true);
    }
    if auto_pay(attrs) {
        options["auto_pay"] = json!(true);
    }
    options
}

fn build_create_body(attrs: &Attributes, enterprise_project_id: Option<&str>) -> Json {
    let backend_subnets = get_string_list(attrs, "backend_subnets");
    let mut loadbalancer = json!({
        "name": get_str(attrs, "name"),
        "availability_zone_list": get_string_list(attrs, "availability_zone"),
        "vpc_id": get_str(attrs, "vpc_id"),
        "vip_subnet_cidr_id": get_str(attrs, "ipv4_subnet_id"),
        "ipv6_vip_virsubnet_id": get_str(attrs, "ipv6_network_id"),
        "vip_address": get_str(attrs, "ipv4_address"),
        "ipv6_vip_address": get_str(attrs, "ipv6_address"),
        "l4_flavor_id": get_str(attrs, "l4_flavor_id"),
        "l7_flavor_id": get_str(attrs, "l7_flavor_id"),
        "protection_status": get_str(attrs, "protection_status"),
        "protection_reason": get_str(attrs, "protection_reason"),
        "loadbalancer_type": get_str(attrs, "loadbalancer_type"),
        "description": get_str(attrs, "description"),
        "enterprise_project_id": enterprise_project_id,
        "elb_virsubnet_ids": if backend_subnets.is_empty() { Json::Null } else { json!(backend_subnets) },
        "ipv6_bandwidth": get_str(attrs, "ipv6_bandwidth_id").map(|id| json!({"id": id})),
        "publicip": build_publicip(attrs),
        "prepaid_options": build_prepaid_options(attrs),
        "tags": expand_resource_tags(&get_tags(attrs)),
    });
    if get_bool(attrs, "cross_vpc_backend") == Some(true) {
        loadbalancer["ip_target_enable"] = json!(true);
    }
    if get_bool(attrs, "deletion_protection_enable") == Some(true) {
        loadbalancer["deletion_protection_enable"] = json!(true);
    }
    if let Some(eip_id) = get_str(attrs, "ipv4_eip_id") {
        loadbalancer["publicip_ids"] = json!([eip_id]);
    }
    remove_nil(json!({"loadbalancer": loadbalancer}))
}

fn build_update_body(to: &Attributes, changed: &[String]) -> Json {
    let mut params = json!({
        "name": get_str(to, "name"),
        "description": get_string(to, "description"),
        "protection_status": get_str(to, "protection_status"),
        "protection_reason": get_string(to, "protection_reason"),
        "ipv6_vip_virsubnet_id": get_str(to, "ipv6_network_id"),
        "vip_subnet_cidr_id": get_str(to, "ipv4_subnet_id"),
    });
    for (name, api_name) in [
        ("l4_flavor_id", "l4_flavor_id"),
        ("l7_flavor_id", "l7_flavor_id"),
        ("ipv4_address", "vip_address"),
        ("ipv6_address", "ipv6_vip_address"),
    ] {
        if has_change(changed, &[name]) {
            params[api_name] = json!(get_string(to, name));
        }
    }
    for (name, api_name) in [
        ("cross_vpc_backend", "ip_target_enable"),
        ("deletion_protection_enable", "deletion_protection_enable"),
    ] {
        if has_change(changed, &[name]) {
            params[api_name] = json!(get_bool(to, name).unwrap_or(false));
        }
    }
    // flavor changes of a yearly/monthly load balancer create an order
    if is_prepaid(to) && has_change(changed, &["l4_flavor_id", "l7_flavor_id"]) {
        let mut prepaid = json!({
            "change_mode": "immediate",
            "period_type": get_str(to, "period_unit"),
            "period_num": get_int(to, "period"),
        });
        if auto_pay(to) {
            prepaid["auto_pay"] = json!(true);
        }
        params["prepaid_options"] = prepaid;
    }
    remove_nil(json!({"loadbalancer": params}))
}

pub(crate) fn flatten(body: &Json) -> Attributes {
    let mut attrs = Attributes::new();
    for (name, expr) in [
        ("name", "loadbalancer.name"),
        ("loadbalancer_type", "loadbalancer.loadbalancer_type"),
        ("description", "loadbalancer.description"),
        ("availability_zone", "loadbalancer.availability_zone_list"),
        ("vpc_id", "loadbalancer.vpc_id"),
        ("ipv4_subnet_id", "loadbalancer.vip_subnet_cidr_id"),
        ("ipv6_network_id", "loadbalancer.ipv6_vip_virsubnet_id"),
        ("ipv4_address", "loadbalancer.vip_address"),
        ("ipv4_port_id", "loadbalancer.vip_port_id"),
        ("ipv6_address", "loadbalancer.ipv6_vip_address"),
        ("l4_flavor_id", "loadbalancer.l4_flavor_id"),
        ("l7_flavor_id", "loadbalancer.l7_flavor_id"),
        ("enterprise_project_id", "loadbalancer.enterprise_project_id"),
        ("backend_subnets", "loadbalancer.elb_virsubnet_ids"),
        ("protection_status", "loadbalancer.protection_status"),
        ("protection_reason", "loadbalancer.protection_reason"),
        ("charge_mode", "loadbalancer.charge_mode"),
        ("operating_status", "loadbalancer.operating_status"),
        ("created_at", "loadbalancer.created_at"),
        ("updated_at", "loadbalancer.updated_at"),
    ] {
        set_from(&mut attrs, name, expr, body);
    }
    for (name, expr) in [
        ("cross_vpc_backend", "loadbalancer.ip_target_enable"),
        ("deletion_protection_enable", "loadbalancer.deletion_protection_enable"),
    ] {
        let flag = path_search(expr, body).and_then(|v| v.as_bool()).unwrap_or(false);
        attrs.insert(name.to_string(), Value::Bool(flag));
    }

    for eip in path_search_array("loadbalancer.eips", body) {
        let prefix = match path_search_i64("ip_version", &eip) {
            Some(4) => "ipv4",
            Some(6) => "ipv6",
            _ => continue,
        };
        set_from(&mut attrs, &format!("{}_eip_id", prefix), "eip_id", &eip);
        set_from(&mut attrs, &format!("{}_eip", prefix), "eip_address", &eip);
    }

    let tags = path_search("loadbalancer.tags", body).unwrap_or(Json::Null);
    attrs.insert("tags".to_string(), tags_to_value(&flatten_tags_to_map(&tags)));

    let billed = path_search_str("loadbalancer.billing_info", body).is_some_and(|s| !s.is_empty());
    set_str(&mut attrs, "charging_mode", if billed { "prePaid" } else { "postPaid" });
    attrs
}

/// Poll `provisioning_status` until `target`; a 404 reads as `DELETED`
async fn wait_for_load_balancer(
    ctx: &ResourceContext<'_>,
    client: &ServiceClient,
    id: &str,
    target: &str,
    timeout: Duration,
) -> HandlerResult<()> {
    log::debug!("waiting for load balancer {} to become {}", id, target);
    let url = client.url(&lb_path(id));
    let conf = ctx.wait(
        WaitConf::new(&[], &[target], timeout)
            .delay(Duration::from_secs(5))
            .poll_interval(Duration::from_secs(1)),
    );
    let url = &url;
    wait_for_state(&conf, || async move {
        match client.get(url).await {
            Ok(body) => {
                let status = path_search_str("loadbalancer.provisioning_status", &body).unwrap_or_default();
                if status == "ERROR" {
                    return Err(SdkError::UnexpectedState {
                        state: status,
                        target: target.to_string(),
                    });
                }
                Ok((body, status))
            }
            Err(e) if e.is_not_found() => Ok((Json::Null, "DELETED".to_string())),
            Err(e) => Err(e),
        }
    })
    .await?;
    Ok(())
}

async fn wait_order(ctx: &ResourceContext<'_>, order_id: &str) -> HandlerResult<()> {
    let bss = ctx.service("bss").await?;
    let conf = ctx.wait(
        WaitConf::new(&[], &[], Duration::from_secs(600))
            .delay(Duration::from_secs(5))
            .poll_interval(Duration::from_secs(5)),
    );
    wait_order_complete(&bss, order_id, &conf).await?;
    Ok(())
}

/// Batch-add or batch-remove availability zones; prepaid changes create orders
async fn change_availability_zones(
    ctx: &ResourceContext<'_>,
    client: &ServiceClient,
    id: &str,
    action: &str,
    zones: Vec<String>,
    prepaid: bool,
) -> HandlerResult<()> {
    if zones.is_empty() {
        return Ok(());
    }
    let url = client.url(&format!("{}/availability-zone/{}", lb_path(id), action));
    log::info!("{} availability zones {:?} on load balancer {}", action, zones, id);
    let resp = client.post(&url, json!({"availability_zone_list": zones})).await?;
    if prepaid {
        let order_id = path_search_str("order_id", &resp).ok_or_else(|| HandlerError::missing("order_id"))?;
        wait_order(ctx, &order_id).await?;
        wait_for_load_balancer(ctx, client, id, "ACTIVE", Duration::from_secs(600)).await?;
    }
    Ok(())
}

#[async_trait]
impl ResourceHandler for LoadBalancer {
    fn type_name(&self) -> &'static str {
        "elb_loadbalancer"
    }

    fn schema(&self) -> ResourceSchema {
        let string_set = || AttributeType::Set(Box::new(AttributeType::String));
        let schema = ResourceSchema::new("elb_loadbalancer")
            .with_description("Dedicated Elastic Load Balancer")
            .attribute(region_attribute())
            .attribute(AttributeSchema::new("name", AttributeType::String).required())
            .attribute(AttributeSchema::new("availability_zone", string_set()).required())
            .attribute(
                AttributeSchema::new(
                    "loadbalancer_type",
                    AttributeType::Enum(vec!["public".to_string(), "private".to_string(), "gateway".to_string()]),
                )
                .optional_computed()
                .force_new(),
            )
            .attribute(AttributeSchema::new("cross_vpc_backend", AttributeType::Bool).optional_computed())
            .attribute(AttributeSchema::new("vpc_id", AttributeType::String).optional_computed().force_new())
            .attribute(AttributeSchema::new("ipv4_subnet_id", AttributeType::String))
            .attribute(AttributeSchema::new("ipv6_network_id", AttributeType::String))
            .attribute(AttributeSchema::new("ipv6_bandwidth_id", AttributeType::String))
            .attribute(AttributeSchema::new("ipv4_address", types::ipv4_address()).optional_computed())
            .attribute(AttributeSchema::new("ipv6_address", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("ipv4_eip_id", AttributeType::String).optional_computed().force_new())
            .attribute(AttributeSchema::new("iptype", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("bandwidth_charge_mode", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("sharetype", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("bandwidth_size", types::positive_int()).force_new())
            .attribute(AttributeSchema::new("bandwidth_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("l4_flavor_id", AttributeType::String))
            .attribute(AttributeSchema::new("l7_flavor_id", AttributeType::String))
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("backend_subnets", string_set()).optional_computed())
            .attribute(AttributeSchema::new("protection_status", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("protection_reason", AttributeType::String))
            .attribute(enterprise_project_attribute())
            .attribute(AttributeSchema::new("deletion_protection_enable", AttributeType::Bool))
            .attribute(
                AttributeSchema::new("force_delete", AttributeType::Bool)
                    .with_default(Value::Bool(false))
                    .with_description("Delete the load balancer together with its listeners and pools"),
            )
            .attribute(tags_attribute());
        charging_attributes(schema)
            .attribute(AttributeSchema::new("ipv4_port_id", AttributeType::String).computed())
            .attribute(AttributeSchema::new("ipv4_eip", AttributeType::String).computed())
            .attribute(AttributeSchema::new("ipv6_eip", AttributeType::String).computed())
            .attribute(AttributeSchema::new("ipv6_eip_id", AttributeType::String).computed())
            .attribute(AttributeSchema::new("charge_mode", AttributeType::String).computed())
            .attribute(AttributeSchema::new("operating_status", AttributeType::String).computed())
            .attribute(AttributeSchema::new("created_at", AttributeType::String).computed())
            .attribute(AttributeSchema::new("updated_at", AttributeType::String).computed())
    }

    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
        let client = ctx.service("elb").await?;
        let body = build_create_body(attrs, ctx.enterprise_project_id.as_deref());
        let resp = client
            .post(&client.url("v3/{project_id}/elb/loadbalancers"), body)
            .await?;

        let id = if is_prepaid(attrs) {
            let id = path_search_str("loadbalancer_id", &resp)
                .ok_or_else(|| HandlerError::missing("loadbalancer_id"))?;
            let order_id = path_search_str("order_id", &resp).ok_or_else(|| HandlerError::missing("order_id"))?;
            wait_order(ctx, &order_id).await?;
            id
        } else {
            path_search_str("loadbalancer.id", &resp).ok_or_else(|| HandlerError::missing("loadbalancer.id"))?
        };
        log::info!("ELB load balancer ID: {}", id);

        wait_for_load_balancer(ctx, &client, &id, "ACTIVE", Duration::from_secs(600)).await?;
        Ok(id)
    }

    async fn read(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        _attrs: &Attributes,
    ) -> HandlerResult<Option<Attributes>> {
        let client = ctx.service("elb").await?;
        let body = client.get(&client.url(&lb_path(id))).await?;
        Ok(Some(flatten(&body)))
    }

    async fn update(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        from: &Attributes,
        to: &Attributes,
        changed: &[String],
    ) -> HandlerResult<()> {
        let client = ctx.service("elb").await?;
        if has_change(changed, UPDATABLE) {
            let resp = client.put(&client.url(&lb_path(id)), build_update_body(to, changed)).await?;
            if let Some(order_id) = path_search_str("order_id", &resp) {
                wait_order(ctx, &order_id).await?;
            }
            wait_for_load_balancer(ctx, &client, id, "ACTIVE", Duration::from_secs(600)).await?;
        }

        if has_change(changed, &["ipv6_bandwidth_id"]) {
            let bandwidth = match get_str(to, "ipv6_bandwidth_id") {
                Some(bandwidth_id) => json!({"id": bandwidth_id}),
                None => Json::Null,
            };
            let url = client.url(&lb_path(id));
            client
                .put(&url, json!({"loadbalancer": {"ipv6_bandwidth": bandwidth}}))
                .await?;
        }

        if has_change(changed, &["backend_subnets"]) {
            let url = client.url(&lb_path(id));
            let subnets = get_string_list(to, "backend_subnets");
            client
                .put(&url, json!({"loadbalancer": {"elb_virsubnet_ids": subnets}}))
                .await?;
        }

        if has_change(changed, &["tags"]) {
            let tag_client = ctx.service("elbv2").await?;
            let path = format!("v2.0/{{project_id}}/loadbalancers/{}", id);
            update_resource_tags(&tag_client, &path, &get_tags(from), &get_tags(to)).await?;
        }

        if has_change(changed, &["availability_zone"]) {
            let old = get_string_list(from, "availability_zone");
            let new = get_string_list(to, "availability_zone");
            let prepaid = is_prepaid(to);
            change_availability_zones(ctx, &client, id, "batch-add", string_difference(&new, &old), prepaid)
                .await?;
            change_availability_zones(ctx, &client, id, "batch-remove", string_difference(&old, &new), prepaid)
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, attrs: &Attributes) -> HandlerResult<()> {
        let client = ctx.service("elb").await?;
        if is_prepaid(attrs) {
            let bss = ctx.service("bss").await?;
            unsubscribe_prepaid_resources(&bss, &[id.to_string()]).await?;
        } else {
            let url = if get_bool(attrs, "force_delete") == Some(true) {
                client.url(&format!("{}/force-elb", lb_path(id)))
            } else {
                client.url(&lb_path(id))
            };
            client.delete(&url).await?;
        }

        wait_for_load_balancer(ctx, &client, id, "DELETED", Duration::from_secs(300)).await?;

        // An EIP created along with the load balancer is not released with it
        if get_str(attrs, "iptype").is_some()
            && let Some(eip_id) = get_str(attrs, "ipv4_eip_id")
        {
            let vpc = ctx.service("vpc").await?;
            let url = vpc.build_path("v1/{project_id}/publicips/{publicip_id}", &[("publicip_id", eip_id)]);
            match vpc.delete(&url).await {
                Ok(_) => log::info!("deleted EIP {} of load balancer {}", eip_id, id),
                Err(e) if e.is_not_found() => {}
                Err(e) => log::warn!("failed to delete EIP {}: {}", eip_id, e),
            }
        }
        Ok(())
    }
}
