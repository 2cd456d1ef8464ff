//! EVS volume: created through `v2.1/{project_id}/cloudvolumes`, read and
//! deleted through the v2 API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use hwcloud_sdk::bss::{unsubscribe_prepaid_resources, wait_order_complete};
use hwcloud_sdk::json::{path_search_array, path_search_str, remove_nil};
use hwcloud_sdk::tags::update_resource_tags;
use hwcloud_sdk::{SdkError, ServiceClient, WaitConf, wait_for_job, wait_for_state, with_query};
use serde_json::{Value as Json, json};

use super::{
    ResourceContext, ResourceHandler, charging_attributes, enterprise_project_attribute,
    region_attribute, tags_attribute,
};
use crate::error::{HandlerError, HandlerResult};
use crate::utils::{
    Attributes, auto_pay, get_bool, get_int, get_str, get_string, get_tags, has_change, is_prepaid,
    set_from, set_str,
};

const ERROR_STATUSES: &[&str] = &[
    "error",
    "error_restoring",
    "error_extending",
    "error_deleting",
    "error_rollbacking",
];

pub struct EvsVolume;

fn volume_path(id: &str) -> String {
    format!("v2/{{project_id}}/cloudvolumes/{}", id)
}

fn build_metadata(attrs: &Attributes) -> Json {
    let mut metadata = json!({"create_for_volume_id": "true"});
    if let Some(kms_id) = get_str(attrs, "kms_id") {
        metadata["__system__cmkid"] = json!(kms_id);
        metadata["__system__encrypted"] = json!("1");
    }
    if get_str(attrs, "device_type") == Some("SCSI") {
        metadata["hw:passthrough"] = json!("true");
    }
    metadata
}

fn build_bss_param(attrs: &Attributes) -> Json {
    if !is_prepaid(attrs) {
        return Json::Null;
    }
    json!({
        "chargingMode": "prePaid",
        "periodType": get_str(attrs, "period_unit"),
        "periodNum": get_int(attrs, "period"),
        "isAutoRenew": get_str(attrs, "auto_renew"),
        "isAutoPay": auto_pay(attrs).to_string(),
    })
}

fn build_create_body(attrs: &Attributes, enterprise_project_id: Option<&str>) -> Json {
    let tags = get_tags(attrs);
    let mut volume = json!({
        "availability_zone": get_str(attrs, "availability_zone"),
        "volume_type": get_str(attrs, "volume_type"),
        "name": get_str(attrs, "name"),
        "description": get_str(attrs, "description"),
        "size": get_int(attrs, "size"),
        "backup_id": get_str(attrs, "backup_id"),
        "snapshot_id": get_str(attrs, "snapshot_id"),
        "imageRef": get_str(attrs, "image_id"),
        "iops": get_int(attrs, "iops"),
        "throughput": get_int(attrs, "throughput"),
        "enterprise_project_id": enterprise_project_id,
        "tags": if tags.is_empty() { Json::Null } else { json!(tags) },
        "metadata": build_metadata(attrs),
    });
    if get_bool(attrs, "multiattach") == Some(true) {
        volume["multiattach"] = json!(true);
    }

    remove_nil(json!({
        "volume": volume,
        "server_id": get_str(attrs, "server_id"),
        "bssParam": build_bss_param(attrs),
        "OS-SCH-HNT:scheduler_hints": get_str(attrs, "dedicated_storage_id")
            .map(|id| json!({"dedicated_storage_id": id})),
    }))
}

fn flatten_attachments(body: &Json) -> Value {
    let items = path_search_array("volume.attachments", body)
        .iter()
        .map(|attachment| {
            let mut map = HashMap::new();
            for (name, expr) in [("id", "attachment_id"), ("instance_id", "server_id"), ("device", "device")] {
                if let Some(v) = path_search_str(expr, attachment) {
                    map.insert(name.to_string(), Value::String(v));
                }
            }
            Value::Map(map)
        })
        .collect();
    Value::List(items)
}

pub(crate) fn flatten(body: &Json) -> Attributes {
    let mut attrs = Attributes::new();
    for (name, expr) in [
        ("name", "volume.name"),
        ("size", "volume.size"),
        ("description", "volume.description"),
        ("availability_zone", "volume.availability_zone"),
        ("snapshot_id", "volume.snapshot_id"),
        ("volume_type", "volume.volume_type"),
        ("iops", "volume.iops.total_val"),
        ("throughput", "volume.throughput.total_val"),
        ("enterprise_project_id", "volume.enterprise_project_id"),
        ("wwn", "volume.wwn"),
        ("multiattach", "volume.multiattach"),
        ("tags", "volume.tags"),
        ("dedicated_storage_id", "volume.dedicated_storage_id"),
        ("dedicated_storage_name", "volume.dedicated_storage_name"),
        ("status", "volume.status"),
        ("image_id", "volume.volume_image_metadata.image_id"),
    ] {
        set_from(&mut attrs, name, expr, body);
    }

    if path_search_str("volume.metadata.orderID", body).is_some_and(|s| !s.is_empty()) {
        set_str(&mut attrs, "charging_mode", "prePaid");
    }
    let passthrough = path_search_str("volume.metadata.\"hw:passthrough\"", body);
    let device_type = if passthrough.as_deref() == Some("true") { "SCSI" } else { "VBD" };
    set_str(&mut attrs, "device_type", device_type);
    attrs.insert("attachment".to_string(), flatten_attachments(body));
    attrs
}

/// Map a volume status onto `PENDING` / `COMPLETED`; error statuses fail the wait
fn volume_state(body: &Json) -> Result<String, SdkError> {
    let status = path_search_str("volume.status", body)
        .ok_or_else(|| SdkError::MissingField { field: "volume.status".to_string() })?;
    if ERROR_STATUSES.contains(&status.as_str()) {
        return Err(SdkError::UnexpectedState {
            state: status,
            target: "available, in-use".to_string(),
        });
    }
    if status == "available" || status == "in-use" {
        Ok("COMPLETED".to_string())
    } else {
        Ok("PENDING".to_string())
    }
}

async fn wait_volume_ready(
    ctx: &ResourceContext<'_>,
    client: &ServiceClient,
    id: &str,
    continuous: u32,
) -> HandlerResult<()> {
    let url = client.url(&volume_path(id));
    let conf = ctx.wait(
        WaitConf::new(&["PENDING"], &["COMPLETED"], Duration::from_secs(600))
            .delay(Duration::from_secs(10))
            .poll_interval(Duration::from_secs(5))
            .continuous_target_occurrence(continuous),
    );
    let url = &url;
    wait_for_state(&conf, || async move {
        let body = client.get(url).await?;
        let state = volume_state(&body)?;
        Ok::<_, SdkError>((body, state))
    })
    .await?;
    Ok(())
}

/// Wait for the BSS order or EVS job a volume request returned
async fn wait_order_or_job(
    ctx: &ResourceContext<'_>,
    client: &ServiceClient,
    resp: &Json,
) -> HandlerResult<()> {
    let conf = ctx.wait(
        WaitConf::new(&[], &[], Duration::from_secs(600))
            .delay(Duration::from_secs(5))
            .poll_interval(Duration::from_secs(10)),
    );
    if let Some(order_id) = path_search_str("order_id", resp).filter(|s| !s.is_empty()) {
        let bss = ctx.service("bss").await?;
        wait_order_complete(&bss, &order_id, &conf).await?;
    }
    if let Some(job_id) = path_search_str("job_id", resp).filter(|s| !s.is_empty()) {
        wait_for_job(client, &job_id, &conf).await?;
    }
    Ok(())
}

/// Grow volume `id` to `new_size` GB; `billing` carries the charging attributes
pub(crate) async fn extend_size(
    ctx: &ResourceContext<'_>,
    id: &str,
    new_size: i64,
    billing: &Attributes,
) -> HandlerResult<()> {
    let client = ctx.service("evsv21").await?;
    let mut body = json!({"os-extend": {"new_size": new_size}});
    if is_prepaid(billing) {
        body["bssParam"] = json!({"isAutoPay": auto_pay(billing).to_string()});
    }
    let url = client.url(&format!("v2.1/{{project_id}}/cloudvolumes/{}/action", id));
    let resp = client.post(&url, body).await?;
    log::info!("extending EVS volume {} to {} GB", id, new_size);

    wait_order_or_job(ctx, &client, &resp).await?;
    wait_volume_ready(ctx, &client, id, 1).await
}

/// Detach every server first; the job wait tolerates a vanished job
async fn detach_all(ctx: &ResourceContext<'_>, volume_id: &str, body: &Json) -> HandlerResult<()> {
    let attachments = path_search_array("volume.attachments", body);
    if attachments.is_empty() {
        return Ok(());
    }
    let ecs = ctx.service("ecs").await?;
    let conf = ctx.wait(
        WaitConf::new(&[], &[], Duration::from_secs(600))
            .delay(Duration::from_secs(10))
            .poll_interval(Duration::from_secs(3)),
    );
    for attachment in attachments {
        let Some(server_id) = path_search_str("server_id", &attachment) else {
            continue;
        };
        log::debug!("detaching volume {} from server {}", volume_id, server_id);
        let url = ecs.build_path(
            "v1/{project_id}/cloudservers/{server_id}/detachvolume/{volume_id}",
            &[("server_id", &server_id), ("volume_id", volume_id)],
        );
        let resp = ecs.delete(&url).await?;
        if let Some(job_id) = path_search_str("job_id", &resp) {
            match wait_for_job(&ecs, &job_id, &conf).await {
                Err(e) if e.is_not_found() => {}
                other => {
                    other?;
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ResourceHandler for EvsVolume {
    fn type_name(&self) -> &'static str {
        "evs_volume"
    }

    fn schema(&self) -> ResourceSchema {
        let schema = ResourceSchema::new("evs_volume")
            .with_description("Elastic Volume Service disk")
            .attribute(region_attribute())
            .attribute(AttributeSchema::new("availability_zone", AttributeType::String).required().force_new())
            .attribute(AttributeSchema::new("volume_type", AttributeType::String).required())
            .attribute(AttributeSchema::new("server_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("iops", AttributeType::Int).optional_computed())
            .attribute(AttributeSchema::new("throughput", AttributeType::Int).optional_computed())
            .attribute(
                AttributeSchema::new(
                    "device_type",
                    AttributeType::Enum(vec!["VBD".to_string(), "SCSI".to_string()]),
                )
                .force_new()
                .with_default(Value::string("VBD")),
            )
            .attribute(AttributeSchema::new("name", AttributeType::String))
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("size", types::positive_int()).optional_computed())
            .attribute(AttributeSchema::new("backup_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("image_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("snapshot_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("kms_id", AttributeType::String).force_new())
            .attribute(
                AttributeSchema::new("multiattach", AttributeType::Bool)
                    .force_new()
                    .with_default(Value::Bool(false)),
            )
            .attribute(AttributeSchema::new("dedicated_storage_id", AttributeType::String).force_new())
            .attribute(enterprise_project_attribute())
            .attribute(
                AttributeSchema::new("cascade", AttributeType::Bool)
                    .with_default(Value::Bool(false))
                    .with_description("Delete the volume's snapshots with it"),
            )
            .attribute(tags_attribute());
        charging_attributes(schema)
            .attribute(
                AttributeSchema::new(
                    "attachment",
                    AttributeType::List(Box::new(AttributeType::Map(Box::new(AttributeType::String)))),
                )
                .computed(),
            )
            .attribute(AttributeSchema::new("wwn", AttributeType::String).computed())
            .attribute(AttributeSchema::new("dedicated_storage_name", AttributeType::String).computed())
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
    }

    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
        let client = ctx.service("evsv21").await?;
        let body = build_create_body(attrs, ctx.enterprise_project_id.as_deref());
        let resp = client.post(&client.url("v2.1/{project_id}/cloudvolumes"), body).await?;
        let id = path_search_str("volume_ids|[0]", &resp)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerError::missing("volume_ids"))?;
        log::info!("EVS volume ID: {}", id);

        wait_order_or_job(ctx, &client, &resp).await?;
        wait_volume_ready(ctx, &client, &id, 2).await?;
        Ok(id)
    }

    async fn read(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        _attrs: &Attributes,
    ) -> HandlerResult<Option<Attributes>> {
        let client = ctx.service("evs").await?;
        let body = client.get(&client.url(&volume_path(id))).await?;
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
        let client = ctx.service("evs").await?;
        if has_change(changed, &["name", "description"]) {
            let body = json!({
                "volume": {
                    "name": get_string(to, "name"),
                    "description": get_string(to, "description"),
                }
            });
            client.put(&client.url(&volume_path(id)), body).await?;
        }
        if has_change(changed, &["tags"]) {
            update_resource_tags(&client, &volume_path(id), &get_tags(from), &get_tags(to)).await?;
        }
        if has_change(changed, &["size"]) {
            let new_size = get_int(to, "size")
                .ok_or_else(|| HandlerError::invalid("size must be set to extend a volume"))?;
            extend_size(ctx, id, new_size, to).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, attrs: &Attributes) -> HandlerResult<()> {
        let client = ctx.service("evs").await?;
        let url = client.url(&volume_path(id));
        let body = match client.get(&url).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                log::info!("EVS volume {} is already gone", id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        detach_all(ctx, id, &body).await?;

        if is_prepaid(attrs) {
            let bss = ctx.service("bss").await?;
            unsubscribe_prepaid_resources(&bss, &[id.to_string()]).await?;
        } else if path_search_str("volume.status", &body).as_deref() != Some("deleting") {
            // A boot volume may already be deleting after its server was terminated
            let cascade = get_bool(attrs, "cascade").unwrap_or(false);
            let delete_url = with_query(&url, &[("cascade", cascade.to_string())]);
            match client.delete(&delete_url).await {
                Err(e) if e.is_not_found() => return Ok(()),
                other => {
                    other?;
                }
            }
        }

        let conf = ctx.wait(
            WaitConf::new(&["PENDING"], &["COMPLETED"], Duration::from_secs(180))
                .delay(Duration::from_secs(10))
                .poll_interval(Duration::from_secs(5)),
        );
        let (client, url) = (&client, &url);
        wait_for_state(&conf, || async move {
            match client.get(url).await {
                Ok(body) => Ok((body, "PENDING".to_string())),
                Err(e) if e.is_not_found() => Ok((Json::Null, "COMPLETED".to_string())),
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }
}
