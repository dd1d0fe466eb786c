//! Declarative form components.
//!
//! A [`Fieldset`] only accepts [`FieldsetChild`] components, so a repeatable
//! group directly inside another one does not compile:
//!
//! ```compile_fail
//! use services::services::form::schema::Fieldset;
//!
//! let _ = Fieldset::new("outer").child(Fieldset::new("inner"));
//! ```

use serde::Serialize;
use serde_json::Value;
use strum_macros::{Display, EnumString};
use utils::state_path;

use super::validation::{Rule, ValidationAttributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldType {
    Text,
    Email,
    Textarea,
    Number,
    Select,
    Toggle,
    Hidden,
    Media,
    Relation,
}

/// Where a field's value ends up on save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistMode {
    /// Written through `DataSource::set`.
    Attribute,
    /// Synced through `DataSource::sync` after the save.
    Relation(String),
    /// Attached to the saved record's media collections after the save.
    Media,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text,
    Email,
    Textarea { rows: u32 },
    Number { step: Option<f64> },
    Select { options: Vec<String>, multiple: bool },
    Toggle,
    Hidden,
    Media { multiple: bool },
    Relation { relation: String, multiple: bool },
}

impl FieldKind {
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Text => FieldType::Text,
            Self::Email => FieldType::Email,
            Self::Textarea { .. } => FieldType::Textarea,
            Self::Number { .. } => FieldType::Number,
            Self::Select { .. } => FieldType::Select,
            Self::Toggle => FieldType::Toggle,
            Self::Hidden => FieldType::Hidden,
            Self::Media { .. } => FieldType::Media,
            Self::Relation { .. } => FieldType::Relation,
        }
    }

    pub fn persist_mode(&self) -> PersistMode {
        match self {
            Self::Media { .. } => PersistMode::Media,
            Self::Relation { relation, .. } => PersistMode::Relation(relation.clone()),
            _ => PersistMode::Attribute,
        }
    }

    /// The bounds this kind enforces, taken from the declared constraints.
    /// Kinds without bounds provide nothing.
    pub fn validation_attributes(&self, constraints: &Constraints) -> ValidationAttributes {
        match self {
            Self::Text => ValidationAttributes {
                min_length: constraints.min_length,
                max_length: constraints.max_length,
                pattern: constraints.pattern.clone(),
                ..Default::default()
            },
            Self::Email => ValidationAttributes {
                max_length: constraints.max_length,
                email: true,
                ..Default::default()
            },
            Self::Textarea { .. } => ValidationAttributes {
                max_length: constraints.max_length,
                ..Default::default()
            },
            Self::Number { .. } => ValidationAttributes {
                min: constraints.min,
                max: constraints.max,
                numeric: true,
                ..Default::default()
            },
            Self::Select { multiple: true, .. }
            | Self::Media { multiple: true }
            | Self::Relation { multiple: true, .. } => ValidationAttributes {
                array: true,
                ..Default::default()
            },
            _ => ValidationAttributes::default(),
        }
    }
}

/// Raw constraints as declared; the field kind decides which apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    key: String,
    kind: FieldKind,
    state_path: Option<String>,
    required: bool,
    rules: Vec<Rule>,
    constraints: Constraints,
    collection: Option<String>,
    dehydrated: bool,
    default: Option<Value>,
}

impl Field {
    pub fn new(key: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            key: key.into(),
            kind,
            state_path: None,
            required: false,
            rules: Vec::new(),
            constraints: Constraints::default(),
            collection: None,
            dehydrated: true,
            default: None,
        }
    }

    pub fn text(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Text)
    }

    pub fn email(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Email)
    }

    pub fn textarea(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Textarea { rows: 5 })
    }

    pub fn number(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Number { step: None })
    }

    pub fn select<I, S>(key: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            key,
            FieldKind::Select {
                options: options.into_iter().map(Into::into).collect(),
                multiple: false,
            },
        )
    }

    pub fn toggle(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Toggle)
    }

    pub fn hidden(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Hidden)
    }

    pub fn media(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Media { multiple: false })
    }

    pub fn relation(key: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::new(
            key,
            FieldKind::Relation {
                relation: relation.into(),
                multiple: true,
            },
        )
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.constraints.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.constraints.max_length = Some(len);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.constraints.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.constraints.max = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.constraints.pattern = Some(pattern.into());
        self
    }

    /// Add a declared rule, e.g. `"unique:posts,slug"`.
    pub fn rule(mut self, rule: impl Into<Rule>) -> Self {
        self.rules.push(rule.into());
        self
    }

    pub fn unique(self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.rule(Rule::Unique {
            table: table.into(),
            column: column.into(),
            ignore: None,
        })
    }

    /// Pin the state path instead of composing it from the container.
    pub fn state_path(mut self, path: impl Into<String>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Base media collection name; `"default"` when unset.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn multiple(mut self) -> Self {
        match &mut self.kind {
            FieldKind::Select { multiple, .. }
            | FieldKind::Media { multiple }
            | FieldKind::Relation { multiple, .. } => *multiple = true,
            _ => {}
        }
        self
    }

    /// `false` keeps the field out of persistence and validation.
    pub fn dehydrated(mut self, dehydrated: bool) -> Self {
        self.dehydrated = dehydrated;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn explicit_state_path(&self) -> Option<&str> {
        self.state_path.as_deref()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn declared_rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn collection_override(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn is_dehydrated(&self) -> bool {
        self.dehydrated
    }

    pub fn initial_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn validation_attributes(&self) -> ValidationAttributes {
        self.kind.validation_attributes(&self.constraints)
    }
}

/// A keyed group nests its children under its key; a layout group only
/// arranges them and adds no path segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    key: Option<String>,
    children: Vec<Component>,
}

impl Group {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            children: Vec::new(),
        }
    }

    pub fn layout() -> Self {
        Self {
            key: None,
            children: Vec::new(),
        }
    }

    pub fn child(mut self, component: impl Into<Component>) -> Self {
        self.children.push(component.into());
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn children(&self) -> &[Component] {
        &self.children
    }
}

/// A repeatable group; each submitted item is addressed `key.<index>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fieldset {
    key: String,
    children: Vec<FieldsetChild>,
    required: bool,
}

impl Fieldset {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            children: Vec::new(),
            required: false,
        }
    }

    pub fn child(mut self, component: impl Into<FieldsetChild>) -> Self {
        self.children.push(component.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn children(&self) -> &[FieldsetChild] {
        &self.children
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Field(Field),
    Group(Group),
    Fieldset(Fieldset),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldsetChild {
    Field(Field),
    Group(Group),
}

/// Borrowed view over either component list.
#[derive(Debug, Clone, Copy)]
pub enum ComponentRef<'s> {
    Field(&'s Field),
    Group(&'s Group),
    Fieldset(&'s Fieldset),
}

impl Component {
    pub fn view(&self) -> ComponentRef<'_> {
        match self {
            Self::Field(field) => ComponentRef::Field(field),
            Self::Group(group) => ComponentRef::Group(group),
            Self::Fieldset(fieldset) => ComponentRef::Fieldset(fieldset),
        }
    }
}

impl FieldsetChild {
    pub fn view(&self) -> ComponentRef<'_> {
        match self {
            Self::Field(field) => ComponentRef::Field(field),
            Self::Group(group) => ComponentRef::Group(group),
        }
    }
}

impl From<Field> for Component {
    fn from(field: Field) -> Self {
        Self::Field(field)
    }
}

impl From<Group> for Component {
    fn from(group: Group) -> Self {
        Self::Group(group)
    }
}

impl From<Fieldset> for Component {
    fn from(fieldset: Fieldset) -> Self {
        Self::Fieldset(fieldset)
    }
}

impl From<Field> for FieldsetChild {
    fn from(field: Field) -> Self {
        Self::Field(field)
    }
}

impl From<Group> for FieldsetChild {
    fn from(group: Group) -> Self {
        Self::Group(group)
    }
}

/// Every field and fieldset of a schema in declaration order, with paths
/// that use `*` for repeated item indexes.
pub fn flatten(schema: &[Component]) -> Vec<(String, ComponentRef<'_>)> {
    let mut out = Vec::new();
    flatten_into(schema.iter().map(Component::view), None, &mut out);
    out
}

fn flatten_into<'s>(
    components: impl Iterator<Item = ComponentRef<'s>>,
    prefix: Option<&str>,
    out: &mut Vec<(String, ComponentRef<'s>)>,
) {
    for component in components {
        match component {
            ComponentRef::Field(field) => {
                let path = match field.explicit_state_path() {
                    Some(path) => path.to_string(),
                    None => state_path::compose_path(prefix, field.key()),
                };
                out.push((path, component));
            }
            ComponentRef::Group(group) => match group.key() {
                Some(key) => {
                    let path = state_path::compose_path(prefix, key);
                    flatten_into(
                        group.children().iter().map(Component::view),
                        Some(&path),
                        out,
                    );
                }
                None => flatten_into(group.children().iter().map(Component::view), prefix, out),
            },
            ComponentRef::Fieldset(fieldset) => {
                let path = state_path::compose_path(prefix, fieldset.key());
                let item_prefix = state_path::compose_path(Some(&path), "*");
                out.push((path, component));
                flatten_into(
                    fieldset.children().iter().map(FieldsetChild::view),
                    Some(&item_prefix),
                    out,
                );
            }
        }
    }
}
