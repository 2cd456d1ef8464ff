//! VPC list: `v3/{project_id}/vpc/vpcs`

use std::collections::HashMap;

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use hwcloud_sdk::json::path_search_str;
use hwcloud_sdk::tags::flatten_tags_to_map;
use hwcloud_sdk::{ListOpts, list_all_items, with_query};
use serde_json::Value as Json;

use super::DataSourceHandler;
use crate::error::HandlerResult;
use crate::resources::ResourceContext;
use crate::utils::{Attributes, get_str, get_string, json_to_value, tags_to_value};

pub struct Vpcs;

fn flatten_vpc(vpc: &Json) -> Value {
    let mut map = HashMap::new();
    for key in ["id", "name", "cidr", "description", "status", "enterprise_project_id"] {
        map.insert(
            key.to_string(),
            Value::String(path_search_str(key, vpc).unwrap_or_default()),
        );
    }
    if let Some(cidrs) = vpc.get("extend_cidrs").and_then(json_to_value) {
        map.insert("secondary_cidrs".to_string(), cidrs);
    }
    let tags = vpc.get("tags").cloned().unwrap_or(Json::Null);
    map.insert("tags".to_string(), tags_to_value(&flatten_tags_to_map(&tags)));
    Value::Map(map)
}

/// Status is not a server-side filter of the v3 API
fn matches_status(vpc: &Json, status: Option<&str>) -> bool {
    status.is_none_or(|want| path_search_str("status", vpc).as_deref() == Some(want))
}

#[async_trait]
impl DataSourceHandler for Vpcs {
    fn type_name(&self) -> &'static str {
        "vpcs"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("vpcs")
            .with_description("VPCs matching the filters")
            .attribute(AttributeSchema::new("region", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("id", AttributeType::String))
            .attribute(AttributeSchema::new("name", AttributeType::String))
            .attribute(AttributeSchema::new("cidr", AttributeType::String))
            .attribute(AttributeSchema::new(
                "status",
                AttributeType::Enum(vec!["CREATING".to_string(), "OK".to_string()]),
            ))
            .attribute(AttributeSchema::new("enterprise_project_id", AttributeType::String))
            .attribute(
                AttributeSchema::new(
                    "vpcs",
                    AttributeType::List(Box::new(AttributeType::Map(Box::new(AttributeType::String)))),
                )
                .computed(),
            )
    }

    async fn read(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<Attributes> {
        let client = ctx.service("vpcv3").await?;
        let url = with_query(
            &client.url("v3/{project_id}/vpc/vpcs"),
            &[
                ("id", get_string(attrs, "id")),
                ("name", get_string(attrs, "name")),
                ("cidr", get_string(attrs, "cidr")),
                ("enterprise_project_id", get_string(attrs, "enterprise_project_id")),
            ],
        );
        let items = list_all_items(&client, &url, &ListOpts::marker().items_key("vpcs")).await?;
        let status = get_str(attrs, "status");
        let vpcs: Vec<Value> = items
            .iter()
            .filter(|vpc| matches_status(vpc, status))
            .map(flatten_vpc)
            .collect();
        log::debug!("found {} VPCs", vpcs.len());

        let mut result = attrs.clone();
        result.insert("vpcs".to_string(), Value::List(vpcs));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_vpc_item() {
        let vpc = json!({
            "id": "vpc-1",
            "name": "main",
            "cidr": "192.168.0.0/16",
            "status": "OK",
            "extend_cidrs": ["10.0.0.0/16"],
            "tags": [{"key": "env", "value": "prod"}]
        });
        let value = flatten_vpc(&vpc);
        let map = value.as_map().unwrap();
        assert_eq!(map["id"], Value::string("vpc-1"));
        assert_eq!(map["description"], Value::string(""));
        assert_eq!(map["secondary_cidrs"], Value::List(vec![Value::string("10.0.0.0/16")]));
        assert_eq!(map["tags"].as_map().unwrap()["env"], Value::string("prod"));
    }

    #[test]
    fn status_filter_is_client_side() {
        let vpc = json!({"id": "vpc-1", "status": "CREATING"});
        assert!(matches_status(&vpc, None));
        assert!(matches_status(&vpc, Some("CREATING")));
        assert!(!matches_status(&vpc, Some("OK")));
    }
}
