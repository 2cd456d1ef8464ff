//! HuaweiCloud Provider
//!
//! Maps resource and data-source declarations onto HuaweiCloud REST APIs.
//!
//! ## Module Structure
//!
//! - `provider` - HuaweiCloudProvider, dispatch and wait settings
//! - `resources` - Managed resource handlers (VPC, subnet, security group,
//!   EVS volume, ELB load balancer, ECS instance, VPC endpoint service)
//! - `data_sources` - List queries for VPCs, load balancers and volumes
//! - `error` - Handler error type
//! - `utils` - Value conversion and attribute helpers

pub mod data_sources;
pub mod error;
pub mod provider;
pub mod resources;
pub mod utils;

// Re-export main types
pub use error::{HandlerError, HandlerResult};
pub use provider::{HuaweiCloudProvider, WaitSettings};
pub use utils::{json_to_value, value_to_json};

use hwcloud_core::provider::{BoxFuture, Provider, ProviderResult, ResourceType};
use hwcloud_core::resource::{Resource, State};

// =============================================================================
// Provider Trait Implementation
// =============================================================================

impl Provider for HuaweiCloudProvider {
    fn name(&self) -> &'static str {
        "huaweicloud"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        self.types()
    }

    fn read(
        &self,
        resource: &Resource,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        let identifier = identifier.map(|s| s.to_string());
        Box::pin(async move { self.read_resource(&resource, identifier.as_deref()).await })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.create_resource(resource).await })
    }

    fn update(
        &self,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move { self.update_resource(&identifier, &from, to).await })
    }

    fn delete(&self, state: &State) -> BoxFuture<'_, ProviderResult<()>> {
        let state = state.clone();
        Box::pin(async move { self.delete_resource(&state).await })
    }

    fn read_data_source(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.read_data_source_resource(&resource).await })
    }
}
