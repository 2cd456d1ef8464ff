//! Effect - Side effects described as values
//!
//! Nothing happens when an Effect is built; the Interpreter executes it.

use crate::resource::{Resource, ResourceId, State};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Evaluate a data source
    Read(Resource),
    Create(Resource),
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed: Vec<String>,
    },
    /// Destroy `from`, then create `to`
    Replace {
        id: ResourceId,
        from: State,
        to: Resource,
    },
    Delete(State),
}

impl Effect {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Effect::Read(r) | Effect::Create(r) => &r.id,
            Effect::Update { id, .. } | Effect::Replace { id, .. } => id,
            Effect::Delete(state) => &state.id,
        }
    }

    /// Whether executing this Effect changes anything in the cloud
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Effect::Read(_))
    }

    /// Single-line description, e.g. `+ vpc.main`
    pub fn brief(&self) -> String {
        let symbol = match self {
            Effect::Read(_) => "<=",
            Effect::Create(_) => "+",
            Effect::Update { .. } => "~",
            Effect::Replace { .. } => "-/+",
            Effect::Delete(_) => "-",
        };
        format!("{} {}", symbol, self.resource_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brief_uses_symbol_and_id() {
        let create = Effect::Create(Resource::new("vpc", "main"));
        assert_eq!(create.brief(), "+ vpc.main");
        let delete = Effect::Delete(State::not_found(ResourceId::new("vpc_subnet", "old")));
        assert_eq!(delete.brief(), "- vpc_subnet.old");
        assert!(delete.is_mutating());
        assert!(!Effect::Read(Resource::data_source("vpcs", "all")).is_mutating());
    }
}
