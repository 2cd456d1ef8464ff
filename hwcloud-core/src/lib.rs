//! HuaweiCloud Core
//!
//! Resource model, attribute schemas and the plan/apply engine that drives
//! a [`provider::Provider`]. Side effects are described as values
//! ([`effect::Effect`]) and only executed by the [`interpreter::Interpreter`].

pub mod differ;
pub mod effect;
pub mod interpreter;
pub mod plan;
pub mod provider;
pub mod resource;
pub mod schema;
