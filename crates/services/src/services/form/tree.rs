//! A form schema expanded against a data source: one node per rendered
//! component, with repeatable groups unrolled into their items.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use utils::state_path::{self, TEMPLATE_MARKER};

use super::{
    collection,
    schema::{Component, ComponentRef, Field, FieldType, PersistMode},
};
use crate::services::data_source::DataSource;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("unknown form node {0}")]
    UnknownNode(NodeId),
    #[error("form node {0} is not a field")]
    NotAField(NodeId),
    #[error("container chain above node {0} does not end")]
    CyclicContainers(NodeId),
}

impl FormError {
    pub fn status_code(&self) -> u16 {
        422
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a repeated item; the template item renders the "add" row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemIndex {
    Stored(usize),
    Template,
}

impl fmt::Display for ItemIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored(index) => write!(f, "{index}"),
            Self::Template => f.write_str(TEMPLATE_MARKER),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum NodeKind<'s> {
    Component(ComponentRef<'s>),
    Item(ItemIndex),
}

#[derive(Debug, Clone)]
struct Node<'s> {
    kind: NodeKind<'s>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    is_template: bool,
}

/// Hydration data for one rendered field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldState {
    pub state_path: String,
    pub field_type: FieldType,
    pub is_template: bool,
    pub collection: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct FormTree<'s> {
    nodes: Vec<Node<'s>>,
    roots: Vec<NodeId>,
}

impl<'s> FormTree<'s> {
    /// Expand `schema`, giving every fieldset one item per value stored at
    /// its path in `source`, followed by a template item.
    pub fn build(schema: &'s [Component], source: &dyn DataSource) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            roots: Vec::new(),
        };
        for component in schema {
            let id = tree.insert(component.view(), None, false, source);
            tree.roots.push(id);
        }
        tree
    }

    fn push(&mut self, kind: NodeKind<'s>, parent: Option<NodeId>, is_template: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
            is_template,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    fn insert(
        &mut self,
        component: ComponentRef<'s>,
        parent: Option<NodeId>,
        is_template: bool,
        source: &dyn DataSource,
    ) -> NodeId {
        let id = self.push(NodeKind::Component(component), parent, is_template);
        match component {
            ComponentRef::Field(_) => {}
            ComponentRef::Group(group) => {
                for child in group.children() {
                    self.insert(child.view(), Some(id), is_template, source);
                }
            }
            ComponentRef::Fieldset(fieldset) => {
                let stored = if is_template {
                    Vec::new()
                } else {
                    self.stored_indexes(id, source)
                };
                let items = stored
                    .into_iter()
                    .map(ItemIndex::Stored)
                    .chain([ItemIndex::Template]);
                for index in items {
                    let item_is_template = is_template || index == ItemIndex::Template;
                    let item = self.push(NodeKind::Item(index), Some(id), item_is_template);
                    for child in fieldset.children() {
                        self.insert(child.view(), Some(item), item_is_template, source);
                    }
                }
            }
        }
        id
    }

    fn stored_indexes(&self, fieldset: NodeId, source: &dyn DataSource) -> Vec<usize> {
        let Ok(path) = self.state_path(fieldset) else {
            return Vec::new();
        };
        match source.get(&path) {
            Some(Value::Array(items)) => (0..items.len()).collect(),
            Some(Value::Object(map)) => {
                let mut indexes: Vec<usize> = map.keys().filter_map(|k| k.parse().ok()).collect();
                indexes.sort_unstable();
                indexes
            }
            _ => Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> Result<&Node<'s>, FormError> {
        self.nodes.get(id.0).ok_or(FormError::UnknownNode(id))
    }

    /// The segment a node adds to its children's paths and its own.
    fn segment(kind: NodeKind<'s>) -> Option<String> {
        match kind {
            NodeKind::Component(ComponentRef::Field(field)) => Some(field.key().to_string()),
            NodeKind::Component(ComponentRef::Group(group)) => group.key().map(str::to_string),
            NodeKind::Component(ComponentRef::Fieldset(fieldset)) => {
                Some(fieldset.key().to_string())
            }
            NodeKind::Item(index) => Some(index.to_string()),
        }
    }

    /// Resolve a node's state path: an explicit override verbatim, else the
    /// container prefix joined with the key. When the container chain cannot
    /// be resolved the bare key is used and a warning logged.
    pub fn state_path(&self, id: NodeId) -> Result<String, FormError> {
        let node = self.node(id)?;
        if let NodeKind::Component(ComponentRef::Field(field)) = node.kind {
            if let Some(path) = field.explicit_state_path() {
                return Ok(path.to_string());
            }
        }

        let segment = Self::segment(node.kind);
        let prefix = match node.parent {
            Some(parent) => match self.prefix(parent, 0) {
                Ok(prefix) => prefix,
                Err(e) => {
                    let key = segment.unwrap_or_default();
                    warn!(
                        node = %id,
                        key = %key,
                        error = %e,
                        "Could not resolve container path, using the bare key"
                    );
                    return Ok(key);
                }
            },
            None => None,
        };

        Ok(match segment {
            Some(segment) => state_path::compose_path(prefix.as_deref(), &segment),
            None => prefix.unwrap_or_default(),
        })
    }

    /// The prefix a container hands to its children; `None` at the root of
    /// the form and for fields.
    pub fn child_state_path(&self, id: NodeId) -> Result<Option<String>, FormError> {
        self.prefix(id, 0)
    }

    fn prefix(&self, id: NodeId, depth: usize) -> Result<Option<String>, FormError> {
        if depth > self.nodes.len() {
            return Err(FormError::CyclicContainers(id));
        }
        let node = self.node(id)?;
        if let NodeKind::Component(ComponentRef::Field(_)) = node.kind {
            return Ok(None);
        }

        let inherited = match node.parent {
            Some(parent) => self.prefix(parent, depth + 1)?,
            None => None,
        };
        Ok(match Self::segment(node.kind) {
            Some(segment) => Some(state_path::compose_path(inherited.as_deref(), &segment)),
            None => inherited,
        })
    }

    /// The state path with the item index replaced by the template marker
    /// for fields rendered inside a template item.
    pub fn template_safe_path(&self, id: NodeId) -> Result<String, FormError> {
        let path = self.state_path(id)?;
        let node = self.node(id)?;
        if node.is_template && node.parent.is_some() && !state_path::is_template_state_path(&path) {
            return Ok(state_path::with_template_marker(&path));
        }
        Ok(path)
    }

    /// Media collection for a field instance.
    pub fn collection_name(&self, id: NodeId) -> Result<String, FormError> {
        let field = self.field(id).ok_or(FormError::NotAField(id))?;
        let path = self.template_safe_path(id)?;
        Ok(collection::collection_name(field.collection_override(), &path))
    }

    pub fn field(&self, id: NodeId) -> Option<&'s Field> {
        match self.nodes.get(id.0)?.kind {
            NodeKind::Component(ComponentRef::Field(field)) => Some(field),
            _ => None,
        }
    }

    pub fn is_template(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).is_some_and(|node| node.is_template)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0)?.parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id.0)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fields backed by stored or submitted data, in document order.
    pub fn fields(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.field_ids().filter(|id| !self.is_template(*id))
    }

    pub fn template_fields(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.field_ids().filter(|id| self.is_template(*id))
    }

    fn field_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.field(*id).is_some())
    }

    /// Every field's hydration state. Template fields carry their default
    /// value and never read from `source`.
    pub fn field_states(&self, source: &dyn DataSource) -> Result<Vec<FieldState>, FormError> {
        self.field_ids()
            .map(|id| -> Result<FieldState, FormError> {
                let field = self.field(id).ok_or(FormError::NotAField(id))?;
                let is_template = self.is_template(id);
                let path = self.template_safe_path(id)?;
                let stored = if is_template {
                    None
                } else {
                    source.get(&path).cloned()
                };
                let collection = match field.kind().persist_mode() {
                    PersistMode::Media => Some(self.collection_name(id)?),
                    _ => None,
                };
                Ok(FieldState {
                    value: stored
                        .or_else(|| field.initial_value().cloned())
                        .unwrap_or(Value::Null),
                    state_path: path,
                    field_type: field.kind().field_type(),
                    is_template,
                    collection,
                })
            })
            .collect()
    }
}
