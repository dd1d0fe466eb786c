//! Transactional reordering of sortable tables, flat or as a tree.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use db::models::sortable::{self, Placement, SortableError, SortableRow, SortableTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};
use ts_rs::TS;

use super::config::Config;

#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("records not found: {0:?}")]
    NotFound(Vec<i64>),
    #[error("not allowed to reorder record {0}")]
    Unauthorized(i64),
    #[error("tree is deeper than {max_depth} levels")]
    DepthExceeded { max_depth: usize },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("table {0} has no parent column")]
    MissingParentColumn(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ReorderError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Unauthorized(_) => 403,
            Self::DepthExceeded { .. }
            | Self::InvalidPayload(_)
            | Self::InvalidIdentifier(_)
            | Self::MissingParentColumn(_) => 422,
            Self::Database(_) => 500,
        }
    }
}

impl From<SortableError> for ReorderError {
    fn from(err: SortableError) -> Self {
        match err {
            SortableError::Database(e) => Self::Database(e),
            SortableError::InvalidIdentifier(e) => Self::InvalidIdentifier(e.0),
        }
    }
}

/// Decides per row whether the caller may move it.
#[async_trait]
pub trait ReorderGate: Send + Sync {
    async fn can_reorder(&self, row: &SortableRow) -> bool;
}

/// Gate for trusted callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl ReorderGate for AllowAll {
    async fn can_reorder(&self, _row: &SortableRow) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ReorderSummary {
    pub updated: u64,
    pub unchanged: u64,
}

/// Flatten a nested `[{id, children: [...]}]` payload into placements,
/// numbering siblings from 0. Top-level nodes are at depth 1.
pub fn flatten_tree(nodes: &Value, max_depth: usize) -> Result<Vec<Placement>, ReorderError> {
    let Value::Array(nodes) = nodes else {
        return Err(ReorderError::InvalidPayload(
            "tree payload must be an array".to_string(),
        ));
    };
    let mut out = Vec::new();
    flatten_level(nodes, None, 1, max_depth, &mut out)?;
    Ok(out)
}

fn flatten_level(
    nodes: &[Value],
    parent_id: Option<i64>,
    depth: usize,
    max_depth: usize,
    out: &mut Vec<Placement>,
) -> Result<(), ReorderError> {
    if nodes.is_empty() {
        return Ok(());
    }
    if depth > max_depth {
        return Err(ReorderError::DepthExceeded { max_depth });
    }

    for (position, node) in nodes.iter().enumerate() {
        let id = node.get("id").and_then(Value::as_i64).ok_or_else(|| {
            ReorderError::InvalidPayload(format!("node without integer id: {node}"))
        })?;
        out.push(Placement {
            id,
            parent_id,
            position: position as i64,
        });

        match node.get("children") {
            None | Some(Value::Null) => {}
            Some(Value::Array(children)) => {
                flatten_level(children, Some(id), depth + 1, max_depth, out)?
            }
            Some(_) => {
                return Err(ReorderError::InvalidPayload(format!(
                    "children of node {id} must be an array"
                )));
            }
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct ReorderService {
    pool: SqlitePool,
    max_depth: usize,
    chunk_size: usize,
}

impl ReorderService {
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        Self {
            pool,
            max_depth: config.tree_max_depth,
            chunk_size: config.reorder_chunk_size,
        }
    }

    /// Apply `id -> position` for a flat list.
    pub async fn reorder(
        &self,
        table: &SortableTable,
        positions: &[(i64, i64)],
        gate: &dyn ReorderGate,
    ) -> Result<ReorderSummary, ReorderError> {
        let placements = positions
            .iter()
            .map(|&(id, position)| Placement {
                id,
                parent_id: None,
                position,
            })
            .collect();
        self.apply(table, placements, false, gate).await
    }

    /// Rewrite parents and sibling order from a nested payload.
    pub async fn rebuild_tree(
        &self,
        table: &SortableTable,
        nodes: &Value,
        gate: &dyn ReorderGate,
    ) -> Result<ReorderSummary, ReorderError> {
        if table.parent_column.is_none() {
            return Err(ReorderError::MissingParentColumn(table.table.clone()));
        }
        let placements = flatten_tree(nodes, self.max_depth)?;
        self.apply(table, placements, true, gate).await
    }

    async fn apply(
        &self,
        table: &SortableTable,
        placements: Vec<Placement>,
        with_parent: bool,
        gate: &dyn ReorderGate,
    ) -> Result<ReorderSummary, ReorderError> {
        let mut seen = HashSet::with_capacity(placements.len());
        if let Some(dup) = placements.iter().find(|p| !seen.insert(p.id)) {
            return Err(ReorderError::InvalidPayload(format!(
                "record {} appears more than once",
                dup.id
            )));
        }
        let ids: Vec<i64> = placements.iter().map(|p| p.id).collect();

        // Dropping the transaction on any early return rolls everything back.
        let mut tx = self.pool.begin().await?;
        let rows: HashMap<i64, SortableRow> =
            sortable::lock_rows(&mut tx, table, &ids, self.chunk_size)
                .await?
                .into_iter()
                .map(|row| (row.id, row))
                .collect();

        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !rows.contains_key(id))
            .collect();
        if !missing.is_empty() {
            return Err(ReorderError::NotFound(missing));
        }

        let mut changed = Vec::new();
        for placement in &placements {
            let row = &rows[&placement.id];
            if !gate.can_reorder(row).await {
                return Err(ReorderError::Unauthorized(row.id));
            }
            let moved = row.position != Some(placement.position)
                || (with_parent && row.parent_id != placement.parent_id);
            if moved {
                changed.push(*placement);
            }
        }

        let unchanged = (placements.len() - changed.len()) as u64;
        if changed.is_empty() {
            tx.commit().await?;
            debug!(table = %table.table, unchanged, "Reorder had nothing to write");
            return Ok(ReorderSummary {
                updated: 0,
                unchanged,
            });
        }

        let updated =
            sortable::bulk_update(&mut tx, table, &changed, with_parent, self.chunk_size).await?;
        tx.commit().await?;

        info!(table = %table.table, updated, unchanged, tree = with_parent, "Reordered records");
        Ok(ReorderSummary { updated, unchanged })
    }
}
