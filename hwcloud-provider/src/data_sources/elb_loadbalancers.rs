//! Dedicated load balancer list: `v3/{project_id}/elb/loadbalancers`

use async_trait::async_trait;
use hwcloud_core::resource::Value;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use hwcloud_sdk::{ListOpts, list_all_items, with_query};
use serde_json::{Value as Json, json};

use super::DataSourceHandler;
use crate::error::HandlerResult;
use crate::resources::{ResourceContext, elb_loadbalancer};
use crate::utils::{Attributes, get_string, set_from};

/// Filter attribute and the query parameter it is sent as
const FILTERS: &[(&str, &str)] = &[
    ("loadbalancer_id", "id"),
    ("name", "name"),
    ("description", "description"),
    ("vpc_id", "vpc_id"),
    ("ipv4_subnet_id", "vip_subnet_cidr_id"),
    ("ipv6_network_id", "ipv6_vip_virsubnet_id"),
    ("ipv4_address", "vip_address"),
    ("l4_flavor_id", "l4_flavor_id"),
    ("l7_flavor_id", "l7_flavor_id"),
    ("enterprise_project_id", "enterprise_project_id"),
];

pub struct LoadBalancers;

fn flatten_item(item: &Json) -> Value {
    let body = json!({ "loadbalancer": item });
    let mut attrs = elb_loadbalancer::flatten(&body);
    set_from(&mut attrs, "id", "loadbalancer.id", &body);
    Value::Map(attrs)
}

#[async_trait]
impl DataSourceHandler for LoadBalancers {
    fn type_name(&self) -> &'static str {
        "elb_loadbalancers"
    }

    fn schema(&self) -> ResourceSchema {
        let mut schema = ResourceSchema::new("elb_loadbalancers")
            .with_description("Dedicated load balancers matching the filters")
            .attribute(AttributeSchema::new("region", AttributeType::String).optional_computed());
        for (name, _) in FILTERS {
            schema = schema.attribute(AttributeSchema::new(*name, AttributeType::String));
        }
        schema.attribute(
            AttributeSchema::new(
                "loadbalancers",
                AttributeType::List(Box::new(AttributeType::Map(Box::new(AttributeType::String)))),
            )
            .computed(),
        )
    }

    async fn read(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<Attributes> {
        let client = ctx.service("elb").await?;
        let params: Vec<(&str, String)> = FILTERS
            .iter()
            .map(|(name, param)| (*param, get_string(attrs, name)))
            .collect();
        let url = with_query(&client.url("v3/{project_id}/elb/loadbalancers"), &params);

        let items = list_all_items(&client, &url, &ListOpts::marker().items_key("loadbalancers")).await?;
        let loadbalancers: Vec<Value> = items.iter().map(flatten_item).collect();
        log::debug!("found {} load balancers", loadbalancers.len());

        let mut result = attrs.clone();
        result.insert("loadbalancers".to_string(), Value::List(loadbalancers));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_reuse_resource_flattening() {
        let value = flatten_item(&json!({
            "id": "lb-1",
            "name": "web",
            "vip_address": "192.168.0.10",
            "availability_zone_list": ["az1"],
            "eips": [{"eip_id": "eip-1", "eip_address": "1.2.3.4", "ip_version": 4}]
        }));
        let map = value.as_map().unwrap();
        assert_eq!(map["id"], Value::string("lb-1"));
        assert_eq!(map["ipv4_address"], Value::string("192.168.0.10"));
        assert_eq!(map["ipv4_eip"], Value::string("1.2.3.4"));
        assert_eq!(map["charging_mode"], Value::string("postPaid"));
    }
}
