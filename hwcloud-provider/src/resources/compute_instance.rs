//! ECS instance: created through `v1.1/{project_id}/cloudservers`,
//! managed through the v1 API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use hwcloud_sdk::bss::{unsubscribe_prepaid_resources, wait_order_complete};
use hwcloud_sdk::json::{path_search, path_search_array, path_search_str, remove_nil};
use hwcloud_sdk::tags::update_resource_tags;
use hwcloud_sdk::{SdkError, ServiceClient, WaitConf, wait_for_job, wait_for_state};
use serde_json::{Value as Json, json};

use super::{
    ResourceContext, ResourceHandler, charging_attributes, enterprise_project_attribute,
    evs_volume, region_attribute, tags_attribute,
};
use crate::error::{HandlerError, HandlerResult};
use crate::utils::{
    Attributes, auto_pay, get_blocks, get_bool, get_int, get_str, get_string, get_string_list,
    get_tags, has_change, is_prepaid, set_from, set_str, string_difference, tags_to_value,
};

pub struct ComputeInstance;

fn server_path(id: &str) -> String {
    format!("v1/{{project_id}}/cloudservers/{}", id)
}

/// User data must reach the API base64-encoded; encoded input is passed through
fn encode_user_data(data: &str) -> String {
    if STANDARD.decode(data).is_ok() {
        data.to_string()
    } else {
        STANDARD.encode(data)
    }
}

fn block_str(block: &HashMap<String, Value>, key: &str) -> Option<String> {
    block
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn build_extendparam(attrs: &Attributes, enterprise_project_id: Option<&str>) -> Json {
    let mut extend = json!({
        "chargingMode": if is_prepaid(attrs) { "prePaid" } else { "postPaid" },
        "enterprise_project_id": enterprise_project_id,
    });
    if is_prepaid(attrs) {
        extend["periodType"] = json!(get_str(attrs, "period_unit"));
        extend["periodNum"] = json!(get_int(attrs, "period"));
        extend["isAutoRenew"] = json!(get_str(attrs, "auto_renew"));
        extend["isAutoPay"] = json!(auto_pay(attrs).to_string());
    }
    extend
}

fn build_create_body(attrs: &Attributes, vpc_id: &str, enterprise_project_id: Option<&str>) -> Json {
    let nics: Vec<Json> = get_blocks(attrs, "network")
        .into_iter()
        .map(|nic| {
            json!({
                "subnet_id": block_str(nic, "uuid"),
                "ip_address": block_str(nic, "fixed_ip_v4"),
            })
        })
        .collect();
    let security_groups: Vec<Json> = get_string_list(attrs, "security_group_ids")
        .into_iter()
        .map(|id| json!({"id": id}))
        .collect();
    let data_volumes: Vec<Json> = get_blocks(attrs, "data_disks")
        .into_iter()
        .map(|disk| {
            json!({
                "volumetype": block_str(disk, "type"),
                "size": disk.get("size").and_then(Value::as_int),
                "snapshotId": block_str(disk, "snapshot_id"),
            })
        })
        .collect();
    let server_tags: Vec<Json> = get_tags(attrs)
        .into_iter()
        .map(|(key, value)| json!({"key": key, "value": value}))
        .collect();

    remove_nil(json!({
        "server": {
            "imageRef": get_str(attrs, "image_id"),
            "flavorRef": get_str(attrs, "flavor_id"),
            "name": get_str(attrs, "name"),
            "description": get_str(attrs, "description"),
            "user_data": get_str(attrs, "user_data").map(encode_user_data),
            "adminPass": get_str(attrs, "admin_pass"),
            "key_name": get_str(attrs, "key_pair"),
            "vpcid": vpc_id,
            "nics": nics,
            "security_groups": if security_groups.is_empty() { Json::Null } else { json!(security_groups) },
            "availability_zone": get_str(attrs, "availability_zone"),
            "root_volume": {
                "volumetype": get_str(attrs, "system_disk_type"),
                "size": get_int(attrs, "system_disk_size"),
            },
            "data_volumes": if data_volumes.is_empty() { Json::Null } else { json!(data_volumes) },
            "extendparam": build_extendparam(attrs, enterprise_project_id),
            "server_tags": if server_tags.is_empty() { Json::Null } else { json!(server_tags) },
        }
    }))
}

/// The volume attached with boot index 0
fn system_disk_id(body: &Json) -> Option<String> {
    path_search_array("server.\"os-extended-volumes:volumes_attached\"", body)
        .iter()
        .find(|volume| match &volume["bootIndex"] {
            Json::String(index) => index == "0",
            Json::Number(index) => index.as_i64() == Some(0),
            _ => false,
        })
        .and_then(|volume| volume["id"].as_str())
        .map(str::to_string)
}

/// ECS reports tags as `key=value` strings
fn flatten_server_tags(tags: &[Json]) -> Value {
    let map = tags
        .iter()
        .filter_map(Json::as_str)
        .map(|tag| match tag.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (tag.to_string(), String::new()),
        })
        .collect();
    tags_to_value(&map)
}

fn flatten(body: &Json) -> Attributes {
    let mut attrs = Attributes::new();
    for (name, expr) in [
        ("name", "server.name"),
        ("description", "server.description"),
        ("status", "server.status"),
        ("flavor_id", "server.flavor.id"),
        ("flavor_name", "server.flavor.name"),
        ("image_id", "server.image.id"),
        ("availability_zone", "server.\"OS-EXT-AZ:availability_zone\""),
        ("hostname", "server.\"OS-EXT-SRV-ATTR:hostname\""),
        ("key_pair", "server.key_name"),
        ("enterprise_project_id", "server.enterprise_project_id"),
        ("created_at", "server.created"),
        ("updated_at", "server.updated"),
        ("security_group_ids", "server.security_groups[*].id"),
        ("security_groups", "server.security_groups[*].name"),
    ] {
        set_from(&mut attrs, name, expr, body);
    }

    if let Some(disk_id) = system_disk_id(body) {
        set_str(&mut attrs, "system_disk_id", &disk_id);
    }

    let prepaid = path_search_str("server.metadata.charging_mode", body).as_deref() == Some("1");
    set_str(&mut attrs, "charging_mode", if prepaid { "prePaid" } else { "postPaid" });

    // First fixed IPv4 address across all networks
    if let Some(Json::Object(networks)) = path_search("server.addresses", body) {
        let fixed = networks
            .values()
            .filter_map(Json::as_array)
            .flatten()
            .find(|addr| {
                addr["version"] == json!(4) && addr["OS-EXT-IPS:type"].as_str() != Some("floating")
            })
            .and_then(|addr| addr["addr"].as_str());
        if let Some(ip) = fixed {
            set_str(&mut attrs, "access_ip_v4", ip);
        }
    }

    attrs.insert(
        "tags".to_string(),
        flatten_server_tags(&path_search_array("server.tags", body)),
    );
    attrs
}

fn server_state(body: &Json) -> Result<String, SdkError> {
    let status = path_search_str("server.status", body).unwrap_or_default();
    if status == "ERROR" {
        let message = path_search_str("server.fault.message", body).unwrap_or_default();
        return Err(SdkError::UnexpectedState {
            state: format!("ERROR ({})", message),
            target: "ACTIVE".to_string(),
        });
    }
    Ok(status)
}

async fn wait_for_server(
    ctx: &ResourceContext<'_>,
    client: &ServiceClient,
    id: &str,
    pending: &[&str],
    target: &[&str],
) -> HandlerResult<()> {
    let url = client.url(&server_path(id));
    let conf = ctx.wait(
        WaitConf::new(pending, target, Duration::from_secs(1800))
            .delay(Duration::from_secs(5))
            .poll_interval(Duration::from_secs(5)),
    );
    let url = &url;
    wait_for_state(&conf, || async move {
        match client.get(url).await {
            Ok(body) => {
                let state = server_state(&body)?;
                Ok::<_, SdkError>((body, state))
            }
            Err(e) if e.is_not_found() => Ok((Json::Null, "DELETED".to_string())),
            Err(e) => Err(e),
        }
    })
    .await?;
    Ok(())
}

fn job_conf(ctx: &ResourceContext<'_>) -> WaitConf {
    ctx.wait(
        WaitConf::new(&[], &[], Duration::from_secs(1800))
            .delay(Duration::from_secs(10))
            .poll_interval(Duration::from_secs(10)),
    )
}

/// Size and type of the system disk live on the EVS volume
async fn read_system_disk(
    ctx: &ResourceContext<'_>,
    disk_id: &str,
    attrs: &mut Attributes,
) -> HandlerResult<()> {
    let evs = ctx.service("evs").await?;
    let url = evs.build_path("v2/{project_id}/cloudvolumes/{id}", &[("id", disk_id)]);
    match evs.get(&url).await {
        Ok(body) => {
            set_from(attrs, "system_disk_size", "volume.size", &body);
            set_from(attrs, "system_disk_type", "volume.volume_type", &body);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            log::warn!("system disk {} not found", disk_id);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn extend_system_disk(
    ctx: &ResourceContext<'_>,
    ecs: &ServiceClient,
    id: &str,
    from: &Attributes,
    to: &Attributes,
) -> HandlerResult<()> {
    let new_size = get_int(to, "system_disk_size")
        .ok_or_else(|| HandlerError::invalid("system_disk_size must be set to extend the system disk"))?;
    let disk_id = match get_str(from, "system_disk_id").filter(|s| !s.is_empty()) {
        Some(disk_id) => disk_id.to_string(),
        None => {
            let body = ecs.get(&ecs.url(&server_path(id))).await?;
            system_disk_id(&body).ok_or_else(|| HandlerError::missing("system disk of the instance"))?
        }
    };
    log::info!("extending system disk {} of instance {}", disk_id, id);
    evs_volume::extend_size(ctx, &disk_id, new_size, to).await
}

/// The instance creation request needs the VPC of the first NIC's subnet
async fn lookup_vpc_id(ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
    let subnet_id = get_blocks(attrs, "network")
        .first()
        .and_then(|nic| block_str(nic, "uuid"))
        .ok_or_else(|| HandlerError::invalid("at least one network with a uuid is required"))?;
    let vpc = ctx.service("vpc").await?;
    let body = vpc
        .get(&vpc.build_path("v1/{project_id}/subnets/{id}", &[("id", &subnet_id)]))
        .await?;
    path_search_str("subnet.vpc_id", &body).ok_or_else(|| HandlerError::missing("subnet.vpc_id"))
}

async fn update_security_groups(
    client: &ServiceClient,
    id: &str,
    from: &Attributes,
    to: &Attributes,
) -> HandlerResult<()> {
    let old = get_string_list(from, "security_group_ids");
    let new = get_string_list(to, "security_group_ids");
    let url = client.build_path("v2.1/{project_id}/servers/{id}/action", &[("id", id)]);
    for sg in string_difference(&new, &old) {
        log::debug!("adding security group {} to instance {}", sg, id);
        client.post(&url, json!({"addSecurityGroup": {"name": sg}})).await?;
    }
    for sg in string_difference(&old, &new) {
        log::debug!("removing security group {} from instance {}", sg, id);
        client.post(&url, json!({"removeSecurityGroup": {"name": sg}})).await?;
    }
    Ok(())
}

#[async_trait]
impl ResourceHandler for ComputeInstance {
    fn type_name(&self) -> &'static str {
        "compute_instance"
    }

    fn schema(&self) -> ResourceSchema {
        let network = AttributeType::List(Box::new(AttributeType::Block));
        let data_disks = AttributeType::List(Box::new(AttributeType::Block));
        let schema = ResourceSchema::new("compute_instance")
            .with_description("Elastic Cloud Server")
            .attribute(region_attribute())
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("image_id", AttributeType::String).required().force_new())
            .attribute(AttributeSchema::new("flavor_id", AttributeType::String).required())
            .attribute(AttributeSchema::new("availability_zone", AttributeType::String).required().force_new())
            .attribute(
                AttributeSchema::new("network", network)
                    .required()
                    .force_new()
                    .with_description("NICs as {uuid = subnet ID, fixed_ip_v4}"),
            )
            .attribute(
                AttributeSchema::new("security_group_ids", AttributeType::Set(Box::new(AttributeType::String)))
                    .optional_computed(),
            )
            .attribute(AttributeSchema::new("key_pair", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("admin_pass", AttributeType::String).sensitive())
            .attribute(AttributeSchema::new("system_disk_type", AttributeType::String).optional_computed().force_new())
            .attribute(AttributeSchema::new("system_disk_size", types::positive_int()).optional_computed())
            .attribute(AttributeSchema::new("data_disks", data_disks).force_new())
            .attribute(AttributeSchema::new("user_data", AttributeType::String).force_new())
            .attribute(enterprise_project_attribute())
            .attribute(AttributeSchema::new("delete_disks_on_termination", AttributeType::Bool))
            .attribute(
                AttributeSchema::new("delete_eip_on_termination", AttributeType::Bool)
                    .with_default(Value::Bool(true)),
            )
            .attribute(tags_attribute());
        charging_attributes(schema)
            .attribute(AttributeSchema::new("system_disk_id", AttributeType::String).computed())
            .attribute(AttributeSchema::new("flavor_name", AttributeType::String).computed())
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(AttributeSchema::new("hostname", AttributeType::String).computed())
            .attribute(AttributeSchema::new("access_ip_v4", AttributeType::String).computed())
            .attribute(
                AttributeSchema::new("security_groups", AttributeType::List(Box::new(AttributeType::String)))
                    .computed(),
            )
            .attribute(AttributeSchema::new("created_at", AttributeType::String).computed())
            .attribute(AttributeSchema::new("updated_at", AttributeType::String).computed())
    }

    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
        let vpc_id = lookup_vpc_id(ctx, attrs).await?;
        let body = build_create_body(attrs, &vpc_id, ctx.enterprise_project_id.as_deref());
        let client = ctx.service("ecsv11").await?;
        let resp = client.post(&client.url("v1.1/{project_id}/cloudservers"), body).await?;

        let ecs = ctx.service("ecs").await?;
        let id = if is_prepaid(attrs) {
            let order_id = path_search_str("order_id", &resp).ok_or_else(|| HandlerError::missing("order_id"))?;
            let bss = ctx.service("bss").await?;
            wait_order_complete(&bss, &order_id, &job_conf(ctx)).await?;
            path_search_str("serverIds|[0]", &resp).ok_or_else(|| HandlerError::missing("serverIds"))?
        } else {
            let job_id = path_search_str("job_id", &resp).ok_or_else(|| HandlerError::missing("job_id"))?;
            let job = wait_for_job(&ecs, &job_id, &job_conf(ctx)).await?;
            path_search_str("entities.sub_jobs[0].entities.server_id", &job)
                .or_else(|| path_search_str("serverIds|[0]", &resp))
                .ok_or_else(|| HandlerError::missing("server_id"))?
        };
        log::info!("ECS instance ID: {}", id);

        wait_for_server(ctx, &ecs, &id, &["BUILD"], &["ACTIVE"]).await?;
        Ok(id)
    }

    async fn read(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        _attrs: &Attributes,
    ) -> HandlerResult<Option<Attributes>> {
        let client = ctx.service("ecs").await?;
        let body = client.get(&client.url(&server_path(id))).await?;
        // Deleted servers stay visible for a while
        if path_search_str("server.status", &body).as_deref() == Some("DELETED") {
            return Ok(None);
        }
        let mut attrs = flatten(&body);
        if let Some(disk_id) = system_disk_id(&body) {
            read_system_disk(ctx, &disk_id, &mut attrs).await?;
        }
        Ok(Some(attrs))
    }

    async fn update(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        from: &Attributes,
        to: &Attributes,
        changed: &[String],
    ) -> HandlerResult<()> {
        let ecs = ctx.service("ecs").await?;
        if has_change(changed, &["name", "description"]) {
            let body = json!({
                "server": {
                    "name": get_string(to, "name"),
                    "description": get_string(to, "description"),
                }
            });
            ecs.put(&ecs.url(&server_path(id)), body).await?;
        }

        if has_change(changed, &["security_group_ids"]) {
            update_security_groups(&ecs, id, from, to).await?;
        }

        if has_change(changed, &["flavor_id"]) {
            let client = ctx.service("ecsv11").await?;
            let url = client.build_path("v1.1/{project_id}/cloudservers/{id}/resize", &[("id", id)]);
            let mut resize = json!({
                "flavorRef": get_string(to, "flavor_id"),
                "mode": "withStopServer",
            });
            if is_prepaid(to) {
                resize["extendparam"] = json!({"isAutoPay": auto_pay(to).to_string()});
            }
            let resp = client.post(&url, json!({"resize": resize})).await?;
            log::info!("resizing ECS instance {} to {}", id, get_string(to, "flavor_id"));

            if let Some(order_id) = path_search_str("order_id", &resp) {
                let bss = ctx.service("bss").await?;
                wait_order_complete(&bss, &order_id, &job_conf(ctx)).await?;
            }
            if let Some(job_id) = path_search_str("job_id", &resp) {
                wait_for_job(&ecs, &job_id, &job_conf(ctx)).await?;
            }
            wait_for_server(ctx, &ecs, id, &["RESIZE", "VERIFY_RESIZE", "SHUTOFF"], &["ACTIVE"]).await?;
        }

        if has_change(changed, &["system_disk_size"]) {
            extend_system_disk(ctx, &ecs, id, from, to).await?;
        }

        if has_change(changed, &["tags"]) {
            update_resource_tags(&ecs, &server_path(id), &get_tags(from), &get_tags(to)).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, attrs: &Attributes) -> HandlerResult<()> {
        let ecs = ctx.service("ecs").await?;
        if is_prepaid(attrs) {
            let bss = ctx.service("bss").await?;
            unsubscribe_prepaid_resources(&bss, &[id.to_string()]).await?;
        } else {
            let body = json!({
                "servers": [{"id": id}],
                "delete_volume": get_bool(attrs, "delete_disks_on_termination").unwrap_or(false),
                "delete_publicip": get_bool(attrs, "delete_eip_on_termination").unwrap_or(true),
            });
            let resp = ecs.post(&ecs.url("v1/{project_id}/cloudservers/delete"), body).await?;
            let job_id = path_search_str("job_id", &resp).ok_or_else(|| HandlerError::missing("job_id"))?;
            wait_for_job(&ecs, &job_id, &job_conf(ctx)).await?;
        }

        // The server may still be listed after the job or order completes
        wait_for_server(ctx, &ecs, id, &["ACTIVE", "SHUTOFF"], &["DELETED", "SOFT_DELETED"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(subnet: &str) -> Value {
        let mut map = HashMap::new();
        map.insert("uuid".to_string(), Value::string(subnet));
        Value::Map(map)
    }

    fn base_attrs() -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::string("web-01"));
        attrs.insert("image_id".into(), Value::string("img-1"));
        attrs.insert("flavor_id".into(), Value::string("s6.small.1"));
        attrs.insert("availability_zone".into(), Value::string("cn-north-4a"));
        attrs.insert("network".into(), Value::List(vec![nic("subnet-1")]));
        attrs
    }

    #[test]
    fn user_data_is_encoded_once() {
        assert_eq!(encode_user_data("#!/bin/sh\necho hi"), STANDARD.encode("#!/bin/sh\necho hi"));
        let encoded = STANDARD.encode("echo hi");
        assert_eq!(encode_user_data(&encoded), encoded);
    }

    #[test]
    fn postpaid_create_body() {
        let mut attrs = base_attrs();
        attrs.insert("system_disk_type".into(), Value::string("SSD"));
        attrs.insert(
            "security_group_ids".into(),
            Value::List(vec![Value::string("sg-1")]),
        );
        let body = build_create_body(&attrs, "vpc-1", Some("0"));
        let server = &body["server"];
        assert_eq!(server["vpcid"], "vpc-1");
        assert_eq!(server["nics"], json!([{"subnet_id": "subnet-1"}]));
        assert_eq!(server["security_groups"], json!([{"id": "sg-1"}]));
        assert_eq!(server["root_volume"], json!({"volumetype": "SSD"}));
        assert_eq!(
            server["extendparam"],
            json!({"chargingMode": "postPaid", "enterprise_project_id": "0"})
        );
        assert!(server.get("data_volumes").is_none());
        assert!(server.get("server_tags").is_none());
    }

    #[test]
    fn prepaid_create_body() {
        let mut attrs = base_attrs();
        attrs.insert("charging_mode".into(), Value::string("prePaid"));
        attrs.insert("period_unit".into(), Value::string("year"));
        attrs.insert("period".into(), Value::Int(1));
        let body = build_create_body(&attrs, "vpc-1", None);
        assert_eq!(
            body["server"]["extendparam"],
            json!({"chargingMode": "prePaid", "periodType": "year", "periodNum": 1, "isAutoPay": "true"})
        );
    }

    #[test]
    fn flatten_server_detail() {
        let attrs = flatten(&json!({
            "server": {
                "id": "srv-1",
                "name": "web-01",
                "status": "ACTIVE",
                "flavor": {"id": "s6.small.1", "name": "s6.small.1"},
                "image": {"id": "img-1"},
                "OS-EXT-AZ:availability_zone": "cn-north-4a",
                "metadata": {"charging_mode": "0"},
                "security_groups": [{"id": "sg-1", "name": "default"}],
                "addresses": {
                    "vpc-1": [
                        {"addr": "192.168.0.10", "version": 4, "OS-EXT-IPS:type": "fixed"},
                        {"addr": "1.2.3.4", "version": 4, "OS-EXT-IPS:type": "floating"}
                    ]
                },
                "tags": ["env=prod", "solo"]
            }
        }));
        assert_eq!(attrs["availability_zone"], Value::string("cn-north-4a"));
        assert_eq!(attrs["charging_mode"], Value::string("postPaid"));
        assert_eq!(attrs["access_ip_v4"], Value::string("192.168.0.10"));
        assert_eq!(attrs["security_group_ids"], Value::List(vec![Value::string("sg-1")]));
        let tags = attrs["tags"].as_map().unwrap();
        assert_eq!(tags["env"], Value::string("prod"));
        assert_eq!(tags["solo"], Value::string(""));
    }

    #[test]
    fn system_disk_is_the_boot_volume() {
        let body = json!({
            "server": {
                "os-extended-volumes:volumes_attached": [
                    {"id": "vol-data", "bootIndex": "1"},
                    {"id": "vol-sys", "bootIndex": "0"}
                ]
            }
        });
        assert_eq!(system_disk_id(&body).as_deref(), Some("vol-sys"));
        assert_eq!(flatten(&body)["system_disk_id"], Value::string("vol-sys"));
        assert!(system_disk_id(&json!({"server": {}})).is_none());
    }

    #[test]
    fn error_status_fails_the_wait() {
        let err = server_state(&json!({"server": {"status": "ERROR", "fault": {"message": "no host"}}}))
            .unwrap_err();
        assert!(err.to_string().contains("no host"));
        assert_eq!(
            server_state(&json!({"server": {"status": "BUILD"}})).unwrap(),
            "BUILD"
        );
    }
}
