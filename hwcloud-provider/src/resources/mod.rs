//! Managed resource handlers
//!
//! Each handler owns one resource type: its schema, the request bodies it
//! sends and the flattening of responses back into attributes. The
//! provider takes care of validation, region resolution and re-reads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use hwcloud_sdk::tags::flatten_tags_to_map;
use hwcloud_sdk::{ProviderClient, ServiceClient, WaitConf};

use crate::error::HandlerResult;
use crate::provider::WaitSettings;
use crate::utils::Attributes;

pub mod compute_instance;
pub mod elb_loadbalancer;
pub mod evs_volume;
pub mod networking_secgroup;
pub mod vpc;
pub mod vpc_subnet;
pub mod vpcep_service;

/// Everything a handler needs to address the cloud for one operation
pub struct ResourceContext<'a> {
    pub client: &'a ProviderClient,
    pub region: String,
    /// Resource attribute, else the provider default
    pub enterprise_project_id: Option<String>,
    pub waits: &'a WaitSettings,
}

impl ResourceContext<'_> {
    /// Client for a catalog service in the resource's region
    pub async fn service(&self, name: &str) -> HandlerResult<ServiceClient> {
        Ok(self.client.service_client(name, &self.region).await?)
    }

    /// Apply the provider's wait overrides to a handler's polling settings
    pub fn wait(&self, conf: WaitConf) -> WaitConf {
        self.waits.apply(conf)
    }
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Resource type name (e.g., "vpc_subnet")
    fn type_name(&self) -> &'static str;

    fn schema(&self) -> ResourceSchema;

    /// Create the object and wait until it is usable; returns its ID
    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String>;

    /// Fetch the object. `Ok(None)` when the cloud reports it gone without a 404.
    async fn read(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        attrs: &Attributes,
    ) -> HandlerResult<Option<Attributes>>;

    /// Apply `changed` attributes in place
    async fn update(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        from: &Attributes,
        to: &Attributes,
        changed: &[String],
    ) -> HandlerResult<()>;

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, attrs: &Attributes) -> HandlerResult<()>;
}

/// `GET {path}/tags`; a failure only loses the tags
pub(crate) async fn fetch_tags(client: &ServiceClient, path: &str) -> Option<BTreeMap<String, String>> {
    let url = client.url(&format!("{}/tags", path));
    match client.get(&url).await {
        Ok(body) => Some(flatten_tags_to_map(&body["tags"])),
        Err(e) => {
            log::warn!("error fetching tags of {}: {}", path, e);
            None
        }
    }
}

// =============================================================================
// Shared schema pieces
// =============================================================================

pub(crate) fn region_attribute() -> AttributeSchema {
    AttributeSchema::new("region", AttributeType::String)
        .optional_computed()
        .force_new()
}

pub(crate) fn tags_attribute() -> AttributeSchema {
    AttributeSchema::new("tags", AttributeType::Map(Box::new(AttributeType::String)))
}

pub(crate) fn enterprise_project_attribute() -> AttributeSchema {
    AttributeSchema::new("enterprise_project_id", AttributeType::String)
        .optional_computed()
        .force_new()
}

/// `charging_mode`, `period_unit`, `period`, `auto_renew` and `auto_pay`
pub(crate) fn charging_attributes(schema: ResourceSchema) -> ResourceSchema {
    let flag = || AttributeType::Enum(vec!["true".to_string(), "false".to_string()]);
    schema
        .attribute(
            AttributeSchema::new(
                "charging_mode",
                AttributeType::Enum(vec!["prePaid".to_string(), "postPaid".to_string()]),
            )
            .optional_computed()
            .force_new(),
        )
        .attribute(
            AttributeSchema::new(
                "period_unit",
                AttributeType::Enum(vec!["month".to_string(), "year".to_string()]),
            )
            .force_new(),
        )
        .attribute(AttributeSchema::new("period", hwcloud_core::schema::types::positive_int()).force_new())
        .attribute(AttributeSchema::new("auto_renew", flag()))
        .attribute(AttributeSchema::new("auto_pay", flag()))
}

/// Returns all resource handlers supported by this provider
pub fn handlers() -> Vec<Box<dyn ResourceHandler>> {
    vec![
        Box::new(vpc::Vpc),
        Box::new(vpc_subnet::VpcSubnet),
        Box::new(networking_secgroup::SecurityGroup),
        Box::new(evs_volume::EvsVolume),
        Box::new(elb_loadbalancer::LoadBalancer),
        Box::new(compute_instance::ComputeInstance),
        Box::new(vpcep_service::VpcepService),
    ]
}
