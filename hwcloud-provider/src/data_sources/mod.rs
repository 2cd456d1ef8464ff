//! Read-only data sources

use async_trait::async_trait;
use hwcloud_core::schema::ResourceSchema;

use crate::error::HandlerResult;
use crate::resources::ResourceContext;
use crate::utils::Attributes;

pub mod elb_loadbalancers;
pub mod evs_volumes;
pub mod vpcs;

#[async_trait]
pub trait DataSourceHandler: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn schema(&self) -> ResourceSchema;

    /// Run the query; the result holds the filters plus the flattened items
    async fn read(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<Attributes>;
}

pub fn handlers() -> Vec<Box<dyn DataSourceHandler>> {
    vec![
        Box::new(vpcs::Vpcs),
        Box::new(elb_loadbalancers::LoadBalancers),
        Box::new(evs_volumes::Volumes),
    ]
}
