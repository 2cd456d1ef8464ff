//! HuaweiCloud provider implementation
//!
//! Dispatches engine operations to the registered resource and data-source
//! handlers, wrapping every failure with the identity of the resource.

use std::collections::HashMap;
use std::time::Duration;

use hwcloud_core::provider::{ProviderError, ProviderResult, ResourceType};
use hwcloud_core::resource::{Resource, ResourceId, State, Value};
use hwcloud_core::schema::ResourceSchema;
use hwcloud_sdk::{Config, ProviderClient, WaitConf};

use crate::data_sources::{self, DataSourceHandler};
use crate::error::HandlerError;
use crate::resources::{self, ResourceContext, ResourceHandler};
use crate::utils::{Attributes, get_str};

/// Overrides applied to every waiter a handler builds
#[derive(Debug, Clone, Default)]
pub struct WaitSettings {
    pub delay: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl WaitSettings {
    /// No initial delay and a 5ms poll interval
    pub fn immediate() -> Self {
        Self {
            delay: Some(Duration::ZERO),
            poll_interval: Some(Duration::from_millis(5)),
            timeout: None,
        }
    }

    pub fn apply(&self, mut conf: WaitConf) -> WaitConf {
        if let Some(delay) = self.delay {
            conf.delay = delay;
        }
        if let Some(interval) = self.poll_interval {
            conf.poll_interval = interval;
        }
        if let Some(timeout) = self.timeout {
            conf.timeout = timeout;
        }
        conf
    }
}

/// Resource type backed by a handler's schema
struct HandlerType {
    name: &'static str,
    schema: ResourceSchema,
    data_source: bool,
}

impl ResourceType for HandlerType {
    fn name(&self) -> &'static str {
        self.name
    }

    fn schema(&self) -> ResourceSchema {
        self.schema.clone()
    }

    fn is_data_source(&self) -> bool {
        self.data_source
    }
}

/// HuaweiCloud Provider
pub struct HuaweiCloudProvider {
    client: ProviderClient,
    waits: WaitSettings,
    resources: HashMap<&'static str, Box<dyn ResourceHandler>>,
    data_sources: HashMap<&'static str, Box<dyn DataSourceHandler>>,
}

impl HuaweiCloudProvider {
    /// Validate `config` and build the provider
    pub fn new(config: Config) -> ProviderResult<Self> {
        let client = ProviderClient::new(config).map_err(|e| {
            ProviderError::new(format!("failed to configure HuaweiCloud client: {}", e)).with_cause(e)
        })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: ProviderClient) -> Self {
        let resources = resources::handlers()
            .into_iter()
            .map(|h| (h.type_name(), h))
            .collect();
        let data_sources = data_sources::handlers()
            .into_iter()
            .map(|h| (h.type_name(), h))
            .collect();
        Self {
            client,
            waits: WaitSettings::default(),
            resources,
            data_sources,
        }
    }

    pub fn with_wait_settings(mut self, waits: WaitSettings) -> Self {
        self.waits = waits;
        self
    }

    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    pub(crate) fn types(&self) -> Vec<Box<dyn ResourceType>> {
        let mut types: Vec<Box<dyn ResourceType>> = Vec::new();
        for handler in self.resources.values() {
            types.push(Box::new(HandlerType {
                name: handler.type_name(),
                schema: handler.schema(),
                data_source: false,
            }));
        }
        for handler in self.data_sources.values() {
            types.push(Box::new(HandlerType {
                name: handler.type_name(),
                schema: handler.schema(),
                data_source: true,
            }));
        }
        types.sort_by_key(|t| t.name());
        types
    }

    // =========================================================================
    // Lookup and context
    // =========================================================================

    fn resource_handler(&self, id: &ResourceId) -> ProviderResult<&dyn ResourceHandler> {
        self.resources
            .get(id.resource_type.as_str())
            .map(|h| h.as_ref())
            .ok_or_else(|| {
                ProviderError::new(format!("Unknown resource type: {}", id.resource_type))
                    .for_resource(id.clone())
            })
    }

    fn data_source_handler(&self, id: &ResourceId) -> ProviderResult<&dyn DataSourceHandler> {
        self.data_sources
            .get(id.resource_type.as_str())
            .map(|h| h.as_ref())
            .ok_or_else(|| {
                ProviderError::new(format!("Unknown data source type: {}", id.resource_type))
                    .for_resource(id.clone())
            })
    }

    /// Region and enterprise project come from the resource, else the provider
    fn context(&self, attrs: &Attributes) -> ResourceContext<'_> {
        let region = get_str(attrs, "region")
            .unwrap_or(self.client.region())
            .to_string();
        let enterprise_project_id = get_str(attrs, "enterprise_project_id")
            .map(str::to_string)
            .or_else(|| self.client.config().enterprise_project_id.clone());
        ResourceContext {
            client: &self.client,
            region,
            enterprise_project_id,
            waits: &self.waits,
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn read_resource(
        &self,
        resource: &Resource,
        identifier: Option<&str>,
    ) -> ProviderResult<State> {
        let id = resource.id.clone();
        let handler = self.resource_handler(&id)?;
        let Some(identifier) = identifier else {
            return Ok(State::not_found(id));
        };
        let ctx = self.context(&resource.attributes);
        self.read_with(handler, &ctx, &id, identifier, &resource.attributes)
            .await
    }

    pub async fn create_resource(&self, resource: Resource) -> ProviderResult<State> {
        let handler = self.resource_handler(&resource.id)?;
        let schema = handler.schema();
        validate(&resource.id, &schema, &resource.attributes)?;

        let mut attrs = resource.attributes.clone();
        schema.apply_defaults(&mut attrs);
        let ctx = self.context(&attrs);

        let identifier = handler
            .create(&ctx, &attrs)
            .await
            .map_err(|e| handler_error(&resource.id, "creating", e))?;
        log::info!("created {} ({})", resource.id, identifier);

        let state = self
            .read_with(handler, &ctx, &resource.id, &identifier, &attrs)
            .await?;
        if !state.exists {
            return Err(ProviderError::new(format!(
                "{} was not found right after creation",
                identifier
            ))
            .for_resource(resource.id));
        }
        Ok(state)
    }

    pub async fn update_resource(
        &self,
        identifier: &str,
        from: &State,
        to: Resource,
    ) -> ProviderResult<State> {
        let handler = self.resource_handler(&to.id)?;
        let schema = handler.schema();
        validate(&to.id, &schema, &to.attributes)?;

        let mut attrs = to.attributes.clone();
        schema.apply_defaults(&mut attrs);
        let changed = changed_attributes(&schema, &from.attributes, &attrs);

        if let Some(name) = changed.iter().find(|name| schema.is_force_new(name)) {
            return Err(ProviderError::new(format!(
                "attribute '{}' cannot be updated in place, the resource must be replaced",
                name
            ))
            .for_resource(to.id));
        }

        let ctx = self.context(&attrs);
        if !changed.is_empty() {
            log::debug!("updating {} ({}): {:?}", to.id, identifier, changed);
            handler
                .update(&ctx, identifier, &from.attributes, &attrs, &changed)
                .await
                .map_err(|e| handler_error(&to.id, "updating", e))?;
        }

        let state = self
            .read_with(handler, &ctx, &to.id, identifier, &attrs)
            .await?;
        if !state.exists {
            return Err(
                ProviderError::new(format!("{} disappeared during update", identifier))
                    .for_resource(to.id),
            );
        }
        Ok(state)
    }

    pub async fn delete_resource(&self, state: &State) -> ProviderResult<()> {
        let handler = self.resource_handler(&state.id)?;
        let Some(identifier) = state.identifier.as_deref() else {
            log::warn!("{} has no identifier, nothing to delete", state.id);
            return Ok(());
        };
        let ctx = self.context(&state.attributes);

        match handler.delete(&ctx, identifier, &state.attributes).await {
            Ok(()) => {
                log::info!("deleted {} ({})", state.id, identifier);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                log::info!("{} ({}) was already deleted", state.id, identifier);
                Ok(())
            }
            Err(e) => Err(handler_error(&state.id, "deleting", e)),
        }
    }

    pub async fn read_data_source_resource(&self, resource: &Resource) -> ProviderResult<State> {
        let handler = self.data_source_handler(&resource.id)?;
        let schema = handler.schema();
        validate(&resource.id, &schema, &resource.attributes)?;

        let mut attrs = resource.attributes.clone();
        schema.apply_defaults(&mut attrs);
        let ctx = self.context(&attrs);

        let mut result = handler
            .read(&ctx, &attrs)
            .await
            .map_err(|e| handler_error(&resource.id, "reading", e))?;
        result.insert("region".to_string(), Value::String(ctx.region.clone()));

        let identifier = uuid::Uuid::new_v4().to_string();
        Ok(State::existing(resource.id.clone(), result).with_identifier(identifier))
    }

    /// Read through `handler`, keeping configured attributes the API does not echo
    async fn read_with(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &ResourceContext<'_>,
        id: &ResourceId,
        identifier: &str,
        configured: &Attributes,
    ) -> ProviderResult<State> {
        match handler.read(ctx, identifier, configured).await {
            Ok(Some(mut attrs)) => {
                for (name, value) in configured {
                    attrs.entry(name.clone()).or_insert_with(|| value.clone());
                }
                attrs.insert("region".to_string(), Value::String(ctx.region.clone()));
                Ok(State::existing(id.clone(), attrs).with_identifier(identifier))
            }
            Ok(None) => Ok(State::not_found(id.clone())),
            Err(e) if e.is_not_found() => {
                log::info!("{} ({}) not found, treating it as deleted", id, identifier);
                Ok(State::not_found(id.clone()))
            }
            Err(e) => Err(handler_error(id, "reading", e)),
        }
    }
}

fn validate(id: &ResourceId, schema: &ResourceSchema, attrs: &Attributes) -> ProviderResult<()> {
    schema.validate(attrs).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        ProviderError::new(format!("invalid configuration: {}", messages.join("; ")))
            .for_resource(id.clone())
    })
}

fn handler_error(id: &ResourceId, action: &str, err: HandlerError) -> ProviderError {
    ProviderError::new(format!("error {} {}: {}", action, id.resource_type, err))
        .for_resource(id.clone())
        .with_cause(err)
}

/// Attributes whose desired value differs from the last known state. Optional
/// attributes removed from the configuration count as changed.
pub(crate) fn changed_attributes(
    schema: &ResourceSchema,
    from: &Attributes,
    to: &Attributes,
) -> Vec<String> {
    let mut changed: Vec<String> = to
        .iter()
        .filter(|(name, value)| match from.get(name.as_str()) {
            Some(current) => !schema.values_equal(name, current, value),
            None => true,
        })
        .map(|(name, _)| name.clone())
        .collect();

    for (name, attr) in &schema.attributes {
        if attr.optional && !attr.computed && from.contains_key(name) && !to.contains_key(name) {
            changed.push(name.clone());
        }
    }

    changed.sort();
    changed.dedup();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwcloud_core::schema::{AttributeSchema, AttributeType};

    fn schema() -> ResourceSchema {
        ResourceSchema::new("vpc")
            .attribute(AttributeSchema::new("name", AttributeType::String).required())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(AttributeSchema::new(
                "zones",
                AttributeType::Set(Box::new(AttributeType::String)),
            ))
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn changed_ignores_set_order_and_computed_state() {
        let from = attrs(&[
            ("name", Value::string("web")),
            ("status", Value::string("OK")),
            (
                "zones",
                Value::List(vec![Value::string("az1"), Value::string("az2")]),
            ),
        ]);
        let to = attrs(&[
            ("name", Value::string("web")),
            (
                "zones",
                Value::List(vec![Value::string("az2"), Value::string("az1")]),
            ),
        ]);
        assert!(changed_attributes(&schema(), &from, &to).is_empty());
    }

    #[test]
    fn removed_optional_attribute_is_a_change() {
        let from = attrs(&[
            ("name", Value::string("web")),
            ("description", Value::string("old")),
        ]);
        let to = attrs(&[("name", Value::string("api"))]);
        assert_eq!(
            changed_attributes(&schema(), &from, &to),
            vec!["description".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn wait_settings_override_handler_defaults() {
        let conf = WaitConf::new(&["PENDING"], &["ACTIVE"], Duration::from_secs(600));
        let conf = WaitSettings::immediate().apply(conf);
        assert_eq!(conf.delay, Duration::ZERO);
        assert_eq!(conf.poll_interval, Duration::from_millis(5));
        assert_eq!(conf.timeout, Duration::from_secs(600));

        let untouched = WaitSettings::default().apply(WaitConf::new(&[], &["OK"], Duration::from_secs(1)));
        assert_eq!(untouched.delay, Duration::from_secs(10));
    }
}
