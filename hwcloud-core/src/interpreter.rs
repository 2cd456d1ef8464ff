//! Interpreter - Execute Effects using a Provider
//!
//! The Interpreter executes Effects contained in a Plan in order,
//! collecting the results. This is where side effects actually occur.

use std::collections::HashMap;

use crate::effect::Effect;
use crate::plan::Plan;
use crate::provider::{Provider, ProviderError, ProviderResult};
use crate::resource::{Resource, ResourceId, State};

/// Result of executing each Effect
#[derive(Debug)]
pub enum EffectOutcome {
    /// Data source evaluated
    Read { state: State },
    /// Create succeeded
    Created { state: State },
    /// Update succeeded
    Updated { state: State },
    /// Old object deleted and new one created
    Replaced { state: State },
    /// Delete succeeded
    Deleted { id: ResourceId },
    /// Skipped (e.g., dry-run)
    Skipped { reason: String },
}

/// Result of executing the entire Plan
#[derive(Debug)]
pub struct ApplyResult {
    pub outcomes: Vec<Result<EffectOutcome, ProviderError>>,
    pub success_count: usize,
    pub failure_count: usize,
    /// States after the apply, keyed by resource
    pub states: HashMap<ResourceId, State>,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.failure_count == 0
    }
}

/// Interpreter configuration
#[derive(Debug, Clone, Default)]
pub struct InterpreterConfig {
    /// If true, skip actual side effects
    pub dry_run: bool,
    /// Continue on error
    pub continue_on_error: bool,
}

/// Interpreter that executes Effects using a Provider
pub struct Interpreter<P: Provider> {
    provider: P,
    config: InterpreterConfig,
    prior_states: HashMap<ResourceId, State>,
}

impl<P: Provider> Interpreter<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            config: InterpreterConfig::default(),
            prior_states: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    /// States of resources that already exist; references to them resolve
    /// without being part of the plan.
    pub fn with_states(mut self, states: HashMap<ResourceId, State>) -> Self {
        self.prior_states = states;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Execute a Plan, interpreting all Effects and causing side effects
    pub async fn apply(&self, plan: &Plan) -> ApplyResult {
        let mut outcomes = Vec::new();
        let mut success_count = 0;
        let mut failure_count = 0;
        let mut states: HashMap<ResourceId, State> = self
            .prior_states
            .iter()
            .filter(|(_, s)| s.exists)
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        for effect in plan.effects() {
            log::info!("applying {}", effect.brief());
            let result = self.execute_effect(effect, &mut states).await;

            match &result {
                Ok(_) => success_count += 1,
                Err(e) => {
                    log::warn!("{} failed: {}", effect.brief(), e);
                    failure_count += 1;
                    if !self.config.continue_on_error {
                        outcomes.push(result);
                        break;
                    }
                }
            }

            outcomes.push(result);
        }

        ApplyResult {
            outcomes,
            success_count,
            failure_count,
            states,
        }
    }

    /// Execute a single Effect
    async fn execute_effect(
        &self,
        effect: &Effect,
        states: &mut HashMap<ResourceId, State>,
    ) -> ProviderResult<EffectOutcome> {
        if self.config.dry_run {
            return Ok(EffectOutcome::Skipped {
                reason: "dry-run mode".to_string(),
            });
        }

        match effect {
            Effect::Read(resource) => {
                let resource = resolve(resource, states)?;
                let state = self.provider.read_data_source(&resource).await?;
                states.insert(state.id.clone(), state.clone());
                Ok(EffectOutcome::Read { state })
            }
            Effect::Create(resource) => {
                let resource = resolve(resource, states)?;
                let state = self.provider.create(&resource).await?;
                states.insert(state.id.clone(), state.clone());
                Ok(EffectOutcome::Created { state })
            }
            Effect::Update { id, from, to, .. } => {
                let identifier = from.identifier.as_deref().ok_or_else(|| {
                    ProviderError::new("cannot update a resource without an identifier")
                        .for_resource(id.clone())
                })?;
                let to = resolve(to, states)?;
                let state = self.provider.update(identifier, from, &to).await?;
                states.insert(state.id.clone(), state.clone());
                Ok(EffectOutcome::Updated { state })
            }
            Effect::Replace { id, from, to } => {
                let to = resolve(to, states)?;
                self.provider.delete(from).await?;
                states.remove(id);
                let state = self.provider.create(&to).await?;
                states.insert(state.id.clone(), state.clone());
                Ok(EffectOutcome::Replaced { state })
            }
            Effect::Delete(state) => {
                self.provider.delete(state).await?;
                states.remove(&state.id);
                Ok(EffectOutcome::Deleted {
                    id: state.id.clone(),
                })
            }
        }
    }
}

/// Substitute `ResourceRef` values with attributes of already-applied states
fn resolve(resource: &Resource, states: &HashMap<ResourceId, State>) -> ProviderResult<Resource> {
    let by_name: HashMap<&str, &State> = states.values().map(|s| (s.id.name.as_str(), s)).collect();
    let lookup = |binding: &str, attr: &str| by_name.get(binding)?.attribute(attr);

    let mut resolved = resource.clone();
    for (key, value) in resolved.attributes.iter_mut() {
        *value = value.resolve_refs(&lookup).map_err(|(binding, attr)| {
            ProviderError::new(format!(
                "attribute '{}' refers to {}.{}, which is not known",
                key, binding, attr
            ))
            .for_resource(resource.id.clone())
        })?;
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BoxFuture, ResourceType};
    use crate::resource::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestProvider {
        calls: Mutex<Vec<String>>,
    }

    impl TestProvider {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Provider for TestProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
            vec![]
        }

        fn read(
            &self,
            resource: &Resource,
            _identifier: Option<&str>,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            let id = resource.id.clone();
            Box::pin(async move { Ok(State::not_found(id)) })
        }

        fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            self.record(format!("create {}", resource.id));
            let state = State::existing(resource.id.clone(), resource.attributes.clone())
                .with_identifier(format!("{}-id", resource.id.name));
            Box::pin(async move { Ok(state) })
        }

        fn update(
            &self,
            identifier: &str,
            _from: &State,
            to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            self.record(format!("update {}", identifier));
            let state =
                State::existing(to.id.clone(), to.attributes.clone()).with_identifier(identifier);
            Box::pin(async move { Ok(state) })
        }

        fn delete(&self, state: &State) -> BoxFuture<'_, ProviderResult<()>> {
            self.record(format!("delete {}", state.id));
            let fail = state.id.name == "stuck";
            let id = state.id.clone();
            Box::pin(async move {
                if fail {
                    Err(ProviderError::new("still in use").for_resource(id))
                } else {
                    Ok(())
                }
            })
        }

        fn read_data_source(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            let mut attrs = resource.attributes.clone();
            attrs.insert("ids".to_string(), Value::List(vec![Value::string("vpc-9")]));
            let state = State::existing(resource.id.clone(), attrs).with_identifier("ds-1");
            Box::pin(async move { Ok(state) })
        }
    }

    #[tokio::test]
    async fn apply_empty_plan() {
        let interpreter = Interpreter::new(TestProvider::default());
        let plan = Plan::new();
        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.success_count, 0);
    }

    #[tokio::test]
    async fn apply_create_effect() {
        let interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("test", "example")));

        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.success_count, 1);
        assert_eq!(
            result.states[&ResourceId::new("test", "example")].identifier,
            Some("example-id".to_string())
        );
    }

    #[tokio::test]
    async fn apply_resolves_references_from_earlier_effects() {
        let interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("vpc", "main")));
        plan.add(Effect::Create(
            Resource::new("vpc_subnet", "web")
                .with_attribute("vpc_id", Value::ResourceRef("main".into(), "id".into())),
        ));

        let result = interpreter.apply(&plan).await;
        assert!(result.is_success());
        let subnet = &result.states[&ResourceId::new("vpc_subnet", "web")];
        assert_eq!(subnet.attributes["vpc_id"], Value::string("main-id"));
    }

    #[tokio::test]
    async fn apply_fails_on_unknown_reference() {
        let interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Create(
            Resource::new("vpc_subnet", "web")
                .with_attribute("vpc_id", Value::ResourceRef("nowhere".into(), "id".into())),
        ));

        let result = interpreter.apply(&plan).await;
        assert_eq!(result.failure_count, 1);
        let err = result.outcomes[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("refers to nowhere.id"));
    }

    #[tokio::test]
    async fn replace_deletes_then_creates() {
        let interpreter = Interpreter::new(TestProvider::default());
        let old = State::existing(ResourceId::new("vpc", "main"), HashMap::new())
            .with_identifier("old-id");
        let mut plan = Plan::new();
        plan.add(Effect::Replace {
            id: old.id.clone(),
            from: old.clone(),
            to: Resource::new("vpc", "main"),
        });

        let result = interpreter.apply(&plan).await;
        assert!(result.is_success());
        assert_eq!(
            *interpreter.provider().calls.lock().unwrap(),
            vec!["delete vpc.main", "create vpc.main"]
        );
    }

    #[tokio::test]
    async fn replace_keeps_old_object_when_references_fail() {
        let interpreter = Interpreter::new(TestProvider::default());
        let old = State::existing(ResourceId::new("vpc_subnet", "web"), HashMap::new())
            .with_identifier("subnet-1");
        let mut plan = Plan::new();
        plan.add(Effect::Replace {
            id: old.id.clone(),
            from: old.clone(),
            to: Resource::new("vpc_subnet", "web")
                .with_attribute("vpc_id", Value::ResourceRef("missing".into(), "id".into())),
        });

        let result = interpreter.apply(&plan).await;
        assert_eq!(result.failure_count, 1);
        assert!(interpreter.provider().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stops_at_first_failure_unless_configured() {
        let stuck = State::existing(ResourceId::new("vpc", "stuck"), HashMap::new());
        let mut plan = Plan::new();
        plan.add(Effect::Delete(stuck));
        plan.add(Effect::Create(Resource::new("vpc", "next")));

        let interpreter = Interpreter::new(TestProvider::default());
        let result = interpreter.apply(&plan).await;
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.failure_count, 1);

        let interpreter = Interpreter::new(TestProvider::default()).with_config(InterpreterConfig {
            dry_run: false,
            continue_on_error: true,
        });
        let result = interpreter.apply(&plan).await;
        assert_eq!(result.outcomes.len(), 2);
        assert_eq!(result.success_count, 1);
    }

    #[tokio::test]
    async fn dry_run_skips_everything() {
        let interpreter = Interpreter::new(TestProvider::default()).with_config(InterpreterConfig {
            dry_run: true,
            continue_on_error: false,
        });
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("vpc", "main")));
        let result = interpreter.apply(&plan).await;
        assert!(matches!(result.outcomes[0], Ok(EffectOutcome::Skipped { .. })));
        assert!(interpreter.provider().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn data_source_results_feed_references() {
        let interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Read(Resource::data_source("vpcs", "lookup")));
        plan.add(Effect::Create(
            Resource::new("vpc_subnet", "web")
                .with_attribute("vpc_ids", Value::ResourceRef("lookup".into(), "ids".into())),
        ));
        let result = interpreter.apply(&plan).await;
        assert!(result.is_success());
        let subnet = &result.states[&ResourceId::new("vpc_subnet", "web")];
        assert_eq!(
            subnet.attributes["vpc_ids"],
            Value::List(vec![Value::string("vpc-9")])
        );
    }
}
