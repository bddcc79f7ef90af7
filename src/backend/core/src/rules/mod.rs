//! Rule catalog: definitions, deterministic ids, and the snapshot registry.

pub mod definition;
pub mod registry;

pub use definition::{derive_rule_id, RuleDefinition, Severity};
pub use registry::{RuleRegistry, RuleSnapshot};
