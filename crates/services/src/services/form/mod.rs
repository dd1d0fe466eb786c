//! Form schemas, their expansion into state paths, and the rules and media
//! collections derived from them.

pub mod collection;
pub mod schema;
pub mod tree;
pub mod validation;

pub use schema::{Component, Field, Fieldset, FieldsetChild, Group};
pub use tree::{FieldState, FormError, FormTree, NodeId};
pub use validation::{FormMode, Rule, RuleSet, extract_rules};
