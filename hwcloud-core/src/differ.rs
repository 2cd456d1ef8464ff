//! Differ - Compare desired state with current state to generate a Plan
//!
//! Compares the desired resources with the current states fetched from the
//! Provider, and generates the ordered list of Effects (Plan) that converges
//! one onto the other.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::effect::Effect;
use crate::plan::Plan;
use crate::resource::{Resource, ResourceId, State, Value};
use crate::schema::ResourceSchema;

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Resource does not exist -> needs creation
    Create(Resource),
    /// Resource exists with differences -> needs update
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// A force-new attribute changed -> destroy and recreate
    Replace {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Resource exists with no differences -> no action needed
    NoChange(ResourceId),
}

impl Diff {
    /// Returns whether this Diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange(_))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle between resources: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("resource name '{0}' is declared more than once")]
    DuplicateName(String),
}

/// Compare desired state with current state to compute a Diff
pub fn diff(desired: &Resource, current: &State, schema: Option<&ResourceSchema>) -> Diff {
    if !current.exists {
        return Diff::Create(desired.clone());
    }

    let changed = find_changed_attributes(&desired.attributes, &current.attributes, schema);

    if changed.is_empty() {
        return Diff::NoChange(desired.id.clone());
    }

    let replace = schema.is_some_and(|s| changed.iter().any(|name| s.is_force_new(name)));
    if replace {
        Diff::Replace {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    } else {
        Diff::Update {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    }
}

/// Find changed attributes between desired and current state
fn find_changed_attributes(
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
    schema: Option<&ResourceSchema>,
) -> Vec<String> {
    let mut changed = Vec::new();

    for (key, desired_value) in desired {
        // Skip internal attributes (starting with _)
        if key.starts_with('_') {
            continue;
        }
        // Unknown until the referenced resource exists
        if desired_value.has_unresolved_ref() {
            continue;
        }
        // The API never echoes these back
        if schema.and_then(|s| s.get(key)).is_some_and(|a| a.sensitive) {
            continue;
        }

        let same = match (current.get(key), schema) {
            (Some(current_value), Some(s)) => s.values_equal(key, desired_value, current_value),
            (Some(current_value), None) => current_value == desired_value,
            (None, _) => false,
        };
        if !same {
            changed.push(key.clone());
        }
    }

    changed.sort();
    changed
}

/// Compute Diff for multiple resources and generate a Plan
///
/// Data sources always produce a `Read`. Managed resources are visited in
/// dependency order. States with no desired counterpart are deleted last,
/// dependents first.
pub fn create_plan(
    desired: &[Resource],
    current_states: &HashMap<ResourceId, State>,
    schemas: &HashMap<String, ResourceSchema>,
) -> Result<Plan, PlanError> {
    let mut plan = Plan::new();

    let mut by_name: HashMap<&str, &State> = HashMap::new();
    for state in current_states.values().filter(|s| s.exists) {
        by_name.insert(&state.id.name, state);
    }

    for index in dependency_order(desired)? {
        let resource = &desired[index];
        if resource.is_data_source() {
            plan.add(Effect::Read(resource.clone()));
            continue;
        }

        let current = current_states
            .get(&resource.id)
            .cloned()
            .unwrap_or_else(|| State::not_found(resource.id.clone()));

        // References to resources that already exist can be compared now
        let mut known = resource.clone();
        for value in known.attributes.values_mut() {
            if let Ok(resolved) =
                value.resolve_refs(&|binding, attr| by_name.get(binding)?.attribute(attr))
            {
                *value = resolved;
            }
        }

        match diff(&known, &current, schemas.get(&resource.id.resource_type)) {
            Diff::Create(_) => plan.add(Effect::Create(resource.clone())),
            Diff::Update {
                id,
                from,
                changed_attributes,
                ..
            } => plan.add(Effect::Update {
                id,
                from,
                to: resource.clone(),
                changed: changed_attributes,
            }),
            Diff::Replace { id, from, .. } => plan.add(Effect::Replace {
                id,
                from,
                to: resource.clone(),
            }),
            Diff::NoChange(_) => {}
        }
    }

    let desired_ids: HashSet<&ResourceId> = desired.iter().map(|r| &r.id).collect();
    let mut orphans: Vec<&State> = current_states
        .values()
        .filter(|s| s.exists && !desired_ids.contains(&s.id))
        .collect();
    orphans.sort_by(|a, b| a.id.cmp(&b.id));
    for index in deletion_order(&orphans) {
        plan.add(Effect::Delete(orphans[index].clone()));
    }

    Ok(plan)
}

/// Topological order of `resources` over their `ResourceRef` bindings,
/// stable with respect to declaration order.
fn dependency_order(resources: &[Resource]) -> Result<Vec<usize>, PlanError> {
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, r) in resources.iter().enumerate() {
        if index_of.insert(&r.id.name, i).is_some() {
            return Err(PlanError::DuplicateName(r.id.name.clone()));
        }
    }

    // References to names outside the set are external and do not order anything
    let deps: Vec<Vec<usize>> = resources
        .iter()
        .map(|r| {
            r.references()
                .iter()
                .filter_map(|name| index_of.get(name.as_str()).copied())
                .collect()
        })
        .collect();

    topological_sort(&deps).map_err(|stuck| {
        PlanError::DependencyCycle(
            stuck
                .into_iter()
                .map(|i| resources[i].id.to_string())
                .collect(),
        )
    })
}

/// Orphaned states are deleted before the states they point at
fn deletion_order(states: &[&State]) -> Vec<usize> {
    let deps: Vec<Vec<usize>> = states
        .iter()
        .map(|s| {
            let mut mentioned = BTreeSet::new();
            for value in s.attributes.values() {
                collect_strings(value, &mut mentioned);
            }
            states
                .iter()
                .enumerate()
                .filter(|(_, other)| other.id != s.id)
                .filter(|(_, other)| {
                    other
                        .identifier
                        .as_deref()
                        .is_some_and(|ident| mentioned.contains(ident))
                })
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    match topological_sort(&deps) {
        Ok(mut order) => {
            order.reverse();
            order
        }
        Err(_) => {
            log::warn!("cyclic references between orphaned resources; deleting in name order");
            (0..states.len()).collect()
        }
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut BTreeSet<&'a str>) {
    match value {
        Value::String(s) => {
            out.insert(s);
        }
        Value::List(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Map(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Kahn's algorithm; `deps[i]` lists the nodes `i` depends on.
/// On a cycle, returns the nodes that could not be ordered.
fn topological_sort(deps: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependents[d].push(i);
        }
    }

    let mut order = Vec::with_capacity(deps.len());
    let mut done = vec![false; deps.len()];
    while order.len() < deps.len() {
        let Some(next) = (0..deps.len()).find(|&i| !done[i] && remaining[i] == 0) else {
            return Err((0..deps.len()).filter(|&i| !done[i]).collect());
        };
        done[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSchema, AttributeType};

    fn subnet_schema() -> ResourceSchema {
        ResourceSchema::new("vpc_subnet")
            .attribute(AttributeSchema::new("name", AttributeType::String).required())
            .attribute(AttributeSchema::new("cidr", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("vpc_id", AttributeType::String).force_new())
            .attribute(
                AttributeSchema::new("dns_list", AttributeType::Set(Box::new(AttributeType::String))),
            )
    }

    fn existing(resource_type: &str, name: &str, attrs: &[(&str, Value)]) -> State {
        let attributes = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        State::existing(ResourceId::new(resource_type, name), attributes)
    }

    #[test]
    fn diff_create_when_not_exists() {
        let desired = Resource::new("vpc", "test");
        let current = State::not_found(ResourceId::new("vpc", "test"));

        let result = diff(&desired, &current, None);
        assert!(matches!(result, Diff::Create(_)));
    }

    #[test]
    fn diff_no_change_when_same() {
        let desired = Resource::new("vpc", "test").with_attribute("cidr", "10.0.0.0/16");
        let current = existing("vpc", "test", &[("cidr", Value::string("10.0.0.0/16"))]);

        let result = diff(&desired, &current, None);
        assert!(matches!(result, Diff::NoChange(_)));
    }

    #[test]
    fn diff_update_when_different() {
        let desired = Resource::new("vpc_subnet", "test").with_attribute("name", "new");
        let current = existing("vpc_subnet", "test", &[("name", Value::string("old"))]);

        match diff(&desired, &current, Some(&subnet_schema())) {
            Diff::Update {
                changed_attributes, ..
            } => assert_eq!(changed_attributes, vec!["name".to_string()]),
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn diff_replace_when_force_new_changes() {
        let desired = Resource::new("vpc_subnet", "test")
            .with_attribute("name", "new")
            .with_attribute("cidr", "192.168.1.0/24");
        let current = existing(
            "vpc_subnet",
            "test",
            &[
                ("name", Value::string("old")),
                ("cidr", Value::string("192.168.0.0/24")),
            ],
        );

        match diff(&desired, &current, Some(&subnet_schema())) {
            Diff::Replace {
                changed_attributes, ..
            } => assert_eq!(changed_attributes, vec!["cidr", "name"]),
            other => panic!("Expected Replace, got {:?}", other),
        }
    }

    #[test]
    fn diff_ignores_set_order_and_unresolved_refs() {
        let desired = Resource::new("vpc_subnet", "test")
            .with_attribute(
                "dns_list",
                Value::List(vec![Value::string("100.125.1.250"), Value::string("100.125.1.251")]),
            )
            .with_attribute("vpc_id", Value::ResourceRef("vpc".into(), "id".into()));
        let current = existing(
            "vpc_subnet",
            "test",
            &[(
                "dns_list",
                Value::List(vec![Value::string("100.125.1.251"), Value::string("100.125.1.250")]),
            )],
        );

        assert!(matches!(
            diff(&desired, &current, Some(&subnet_schema())),
            Diff::NoChange(_)
        ));
    }

    #[test]
    fn create_plan_from_resources() {
        let resources = vec![
            Resource::new("vpc", "new-vpc"),
            Resource::new("vpc", "existing-vpc").with_attribute("description", "updated"),
        ];

        let mut current_states = HashMap::new();
        current_states.insert(
            ResourceId::new("vpc", "existing-vpc"),
            existing("vpc", "existing-vpc", &[("description", Value::string("old"))]),
        );

        let plan = create_plan(&resources, &current_states, &HashMap::new()).unwrap();

        assert_eq!(plan.effects().len(), 2);
        assert!(matches!(plan.effects()[0], Effect::Create(_)));
        assert!(matches!(plan.effects()[1], Effect::Update { .. }));
    }

    #[test]
    fn create_plan_orders_by_references() {
        let resources = vec![
            Resource::new("vpc_subnet", "web")
                .with_attribute("vpc_id", Value::ResourceRef("main".into(), "id".into())),
            Resource::data_source("vpcs", "lookup"),
            Resource::new("vpc", "main").with_attribute("name", "main"),
        ];

        let plan = create_plan(&resources, &HashMap::new(), &HashMap::new()).unwrap();
        let order: Vec<String> = plan.effects().iter().map(|e| e.brief()).collect();
        assert_eq!(order, vec!["<= vpcs.lookup", "+ vpc.main", "+ vpc_subnet.web"]);
    }

    #[test]
    fn create_plan_resolves_refs_to_existing_states() {
        let resources = vec![
            Resource::new("vpc", "main").with_attribute("name", "main"),
            Resource::new("vpc_subnet", "web")
                .with_attribute("name", "web")
                .with_attribute("vpc_id", Value::ResourceRef("main".into(), "id".into())),
        ];
        let mut current = HashMap::new();
        current.insert(
            ResourceId::new("vpc", "main"),
            existing("vpc", "main", &[("name", Value::string("main"))]).with_identifier("vpc-2"),
        );
        current.insert(
            ResourceId::new("vpc_subnet", "web"),
            existing(
                "vpc_subnet",
                "web",
                &[
                    ("name", Value::string("web")),
                    ("vpc_id", Value::string("vpc-1")),
                ],
            ),
        );
        let mut schemas = HashMap::new();
        schemas.insert("vpc_subnet".to_string(), subnet_schema());

        let plan = create_plan(&resources, &current, &schemas).unwrap();
        assert_eq!(plan.effects().len(), 1);
        match &plan.effects()[0] {
            Effect::Replace { to, .. } => {
                // The effect keeps the reference for the interpreter to resolve
                assert_eq!(
                    to.attributes["vpc_id"],
                    Value::ResourceRef("main".into(), "id".into())
                );
            }
            other => panic!("Expected Replace, got {:?}", other),
        }
    }

    #[test]
    fn create_plan_detects_cycles() {
        let resources = vec![
            Resource::new("vpc", "a").with_attribute("x", Value::ResourceRef("b".into(), "id".into())),
            Resource::new("vpc", "b").with_attribute("x", Value::ResourceRef("a".into(), "id".into())),
        ];
        let err = create_plan(&resources, &HashMap::new(), &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            PlanError::DependencyCycle(vec!["vpc.a".to_string(), "vpc.b".to_string()])
        );
    }

    #[test]
    fn create_plan_rejects_duplicate_names() {
        let resources = vec![Resource::new("vpc", "a"), Resource::new("vpc_subnet", "a")];
        assert_eq!(
            create_plan(&resources, &HashMap::new(), &HashMap::new()).unwrap_err(),
            PlanError::DuplicateName("a".to_string())
        );
    }

    #[test]
    fn orphans_are_deleted_dependents_first() {
        let mut current = HashMap::new();
        current.insert(
            ResourceId::new("vpc", "main"),
            existing("vpc", "main", &[]).with_identifier("vpc-1"),
        );
        current.insert(
            ResourceId::new("vpc_subnet", "web"),
            existing("vpc_subnet", "web", &[("vpc_id", Value::string("vpc-1"))])
                .with_identifier("subnet-1"),
        );
        current.insert(
            ResourceId::new("vpc", "gone"),
            State::not_found(ResourceId::new("vpc", "gone")),
        );

        let plan = create_plan(&[], &current, &HashMap::new()).unwrap();
        let order: Vec<String> = plan.effects().iter().map(|e| e.brief()).collect();
        assert_eq!(order, vec!["- vpc_subnet.web", "- vpc.main"]);
    }
}
