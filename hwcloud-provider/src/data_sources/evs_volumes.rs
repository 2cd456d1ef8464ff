//! EVS volume list: `v2/{project_id}/cloudvolumes/detail`

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use hwcloud_sdk::{ListOpts, list_all_items, with_query};
use serde_json::{Value as Json, json};

use super::DataSourceHandler;
use crate::error::HandlerResult;
use crate::resources::{ResourceContext, evs_volume};
use crate::utils::{Attributes, get_str, get_string, set_from};

pub struct Volumes;

fn flatten_item(item: &Json) -> Value {
    let body = json!({ "volume": item });
    let mut attrs = evs_volume::flatten(&body);
    set_from(&mut attrs, "id", "volume.id", &body);
    set_from(&mut attrs, "bootable", "volume.bootable", &body);
    set_from(&mut attrs, "created_at", "volume.created_at", &body);
    Value::Map(attrs)
}

/// The list API filters a single server through `server_id` only
fn attached_to(item: &Json, server_id: Option<&str>) -> bool {
    let Some(server_id) = server_id else {
        return true;
    };
    item.get("attachments")
        .and_then(Json::as_array)
        .is_some_and(|attachments| {
            attachments
                .iter()
                .any(|a| a.get("server_id").and_then(Json::as_str) == Some(server_id))
        })
}

#[async_trait]
impl DataSourceHandler for Volumes {
    fn type_name(&self) -> &'static str {
        "evs_volumes"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("evs_volumes")
            .with_description("EVS volumes matching the filters")
            .attribute(AttributeSchema::new("region", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("volume_id", AttributeType::String))
            .attribute(AttributeSchema::new("name", AttributeType::String))
            .attribute(AttributeSchema::new("availability_zone", AttributeType::String))
            .attribute(AttributeSchema::new("status", AttributeType::String))
            .attribute(AttributeSchema::new("volume_type_id", AttributeType::String))
            .attribute(AttributeSchema::new("dedicated_storage_id", AttributeType::String))
            .attribute(AttributeSchema::new("enterprise_project_id", AttributeType::String))
            .attribute(AttributeSchema::new("server_id", AttributeType::String))
            .attribute(
                AttributeSchema::new(
                    "volumes",
                    AttributeType::List(Box::new(AttributeType::Map(Box::new(AttributeType::String)))),
                )
                .computed(),
            )
    }

    async fn read(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<Attributes> {
        let client = ctx.service("evs").await?;
        let url = with_query(
            &client.url("v2/{project_id}/cloudvolumes/detail"),
            &[
                ("id", get_string(attrs, "volume_id")),
                ("name", get_string(attrs, "name")),
                ("availability_zone", get_string(attrs, "availability_zone")),
                ("status", get_string(attrs, "status")),
                ("volume_type_id", get_string(attrs, "volume_type_id")),
                ("dedicated_storage_id", get_string(attrs, "dedicated_storage_id")),
                ("enterprise_project_id", get_string(attrs, "enterprise_project_id")),
            ],
        );

        let items = list_all_items(&client, &url, &ListOpts::offset().items_key("volumes")).await?;
        let server_id = get_str(attrs, "server_id");
        let volumes: Vec<Value> = items
            .iter()
            .filter(|item| attached_to(item, server_id))
            .map(flatten_item)
            .collect();
        log::debug!("found {} volumes", volumes.len());

        let mut result = attrs.clone();
        result.insert("volumes".to_string(), Value::List(volumes));
        Ok(result)
    }
}
