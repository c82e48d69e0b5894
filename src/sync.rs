//! Tree synchronization: diffs a submitted nested object tree against the
//! stored one and produces a globally ordered list of insert/update/delete
//! operations. Inserts come first (parents before children, ascending
//! depth), then updates, then deletes (children before parents, descending
//! depth), so foreign keys stay valid through the whole run.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{BifrostError, BifrostResult};
use crate::model::{Link, Model, Table};
use crate::transform::mutation::DataMap;

pub const DEFAULT_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct TreeSyncOperation {
    pub op: OperationType,
    pub schema: String,
    pub table: String,
    pub data: DataMap,
    /// Child FK column to parent table name; the executor fills in the
    /// freshly generated parent key before running the statement.
    pub foreign_key_assignments: BTreeMap<String, String>,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TreeSync {
    max_depth: usize,
    delete_orphans: bool,
}

impl Default for TreeSync {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            delete_orphans: true,
        }
    }
}

impl TreeSync {
    pub fn new(max_depth: usize, delete_orphans: bool) -> BifrostResult<Self> {
        if max_depth == 0 {
            return Err(BifrostError::Config(
                "tree sync max-depth must be at least 1".into(),
            ));
        }
        Ok(Self {
            max_depth,
            delete_orphans,
        })
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn delete_orphans(&self) -> bool {
        self.delete_orphans
    }

    /// Diffs `submitted` against `existing` starting at `table` and returns
    /// the ordered operation list.
    pub fn compute_operations(
        &self,
        model: &Model,
        table: &Table,
        submitted: &DataMap,
        existing: Option<&DataMap>,
    ) -> BifrostResult<Vec<TreeSyncOperation>> {
        let mut ops = Vec::new();

        let matched = existing.filter(|e| {
            let pks = table.primary_keys();
            !pks.is_empty() && pk_values(table, submitted) == pk_values(table, e)
        });
        match matched {
            Some(existing) => self.sync_node(model, table, submitted, existing, 0, None, &mut ops)?,
            None => {
                if let Some(orphan) = existing {
                    if self.delete_orphans {
                        self.delete_subtree(model, table, orphan, 0, &mut ops)?;
                    }
                }
                self.insert_subtree(model, table, submitted, 0, None, &mut ops)?;
            }
        }

        order_ops(&mut ops);
        Ok(ops)
    }

    /// Both sides exist and share a key: update when any shadowed column
    /// differs, then reconcile the child collections.
    fn sync_node(
        &self,
        model: &Model,
        table: &Table,
        submitted: &DataMap,
        existing: &DataMap,
        depth: usize,
        _parent_link: Option<&Link>,
        ops: &mut Vec<TreeSyncOperation>,
    ) -> BifrostResult<()> {
        let data = column_data(table, submitted);
        let changed = data.iter().any(|(column, value)| {
            existing.get(column).map(|e| e != value).unwrap_or(true)
        });

        if changed {
            let mut update = data;
            // The key must survive into the update's WHERE clause.
            for pk in table.primary_keys() {
                if let Some(value) = existing.get(&pk.db_name) {
                    update.insert(pk.db_name.clone(), value.clone());
                }
            }
            ops.push(TreeSyncOperation {
                op: OperationType::Update,
                schema: table.schema_name.clone(),
                table: table.db_name.clone(),
                data: update,
                foreign_key_assignments: BTreeMap::new(),
                depth,
            });
        }

        self.sync_children(model, table, submitted, Some(existing), depth, ops)
    }

    fn insert_subtree(
        &self,
        model: &Model,
        table: &Table,
        submitted: &DataMap,
        depth: usize,
        parent_link: Option<(&Link, Option<&Value>)>,
        ops: &mut Vec<TreeSyncOperation>,
    ) -> BifrostResult<()> {
        let mut data = column_data(table, submitted);
        let mut assignments = BTreeMap::new();
        if let Some((link, parent_value)) = parent_link {
            // Under an existing parent the key is already known; under a
            // fresh one the executor fills it from the generated identity.
            if let Some(value) = parent_value {
                data.entry(link.child_column.clone())
                    .or_insert_with(|| value.clone());
            }
            assignments.insert(link.child_column.clone(), link.parent_table.clone());
        }
        ops.push(TreeSyncOperation {
            op: OperationType::Insert,
            schema: table.schema_name.clone(),
            table: table.db_name.clone(),
            data,
            foreign_key_assignments: assignments,
            depth,
        });

        self.sync_children(model, table, submitted, None, depth, ops)
    }

    /// Walks every multi-link collection present in the submitted node,
    /// matching children to existing children by primary key. Submitted
    /// keys that are neither columns nor multi-links are ignored.
    fn sync_children(
        &self,
        model: &Model,
        table: &Table,
        submitted: &DataMap,
        existing: Option<&DataMap>,
        depth: usize,
        ops: &mut Vec<TreeSyncOperation>,
    ) -> BifrostResult<()> {
        let child_depth = depth + 1;

        for (link_name, link) in &table.multi_links {
            let Some(Value::Array(submitted_children)) = submitted.get(link_name) else {
                continue;
            };
            if child_depth >= self.max_depth {
                debug!(
                    link = %link_name,
                    "children at depth {child_depth} truncated by max-depth {}",
                    self.max_depth
                );
                continue;
            }

            let child_table =
                model.require_table(&format!("{}.{}", link.child_schema, link.child_table))?;
            let parent_value = existing
                .and_then(|e| e.get(&link.parent_column))
                .filter(|v| !v.is_null());
            let existing_children: Vec<&DataMap> = existing
                .and_then(|e| e.get(link_name))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_object).collect())
                .unwrap_or_default();

            let mut claimed = vec![false; existing_children.len()];

            for child in submitted_children {
                let Some(child_map) = child.as_object() else {
                    continue;
                };
                let submitted_pk = pk_values(child_table, child_map);
                let matched = submitted_pk.as_ref().and_then(|pk| {
                    existing_children.iter().enumerate().find(|(i, candidate)| {
                        !claimed[*i] && pk_values(child_table, candidate).as_ref() == Some(pk)
                    })
                });

                match matched {
                    Some((index, existing_child)) => {
                        claimed[index] = true;
                        self.sync_node(
                            model,
                            child_table,
                            child_map,
                            existing_child,
                            child_depth,
                            Some(link),
                            ops,
                        )?;
                    }
                    None => {
                        self.insert_subtree(
                            model,
                            child_table,
                            child_map,
                            child_depth,
                            Some((link, parent_value)),
                            ops,
                        )?;
                    }
                }
            }

            if self.delete_orphans {
                for (index, existing_child) in existing_children.iter().enumerate() {
                    if !claimed[index] {
                        self.delete_subtree(model, child_table, existing_child, child_depth, ops)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Emits a delete for the node and, first, for everything under it.
    /// Rows without a primary key cannot be identified and are skipped.
    fn delete_subtree(
        &self,
        model: &Model,
        table: &Table,
        existing: &DataMap,
        depth: usize,
        ops: &mut Vec<TreeSyncOperation>,
    ) -> BifrostResult<()> {
        let child_depth = depth + 1;
        if child_depth < self.max_depth {
            for (link_name, link) in &table.multi_links {
                let Some(Value::Array(children)) = existing.get(link_name) else {
                    continue;
                };
                let child_table =
                    model.require_table(&format!("{}.{}", link.child_schema, link.child_table))?;
                for child in children {
                    if let Some(child_map) = child.as_object() {
                        self.delete_subtree(model, child_table, child_map, child_depth, ops)?;
                    }
                }
            }
        }

        let pks = table.primary_keys();
        if pks.is_empty() {
            debug!(table = %table.db_name, "cannot delete a row without a primary key");
            return Ok(());
        }
        let mut data = DataMap::new();
        for pk in pks {
            if let Some(value) = existing.get(&pk.db_name) {
                data.insert(pk.db_name.clone(), value.clone());
            }
        }
        ops.push(TreeSyncOperation {
            op: OperationType::Delete,
            schema: table.schema_name.clone(),
            table: table.db_name.clone(),
            data,
            foreign_key_assignments: BTreeMap::new(),
            depth,
        });
        Ok(())
    }
}

/// The submitted keys that name real columns, re-keyed by database column
/// name. Multi-link collections and unknown keys are left out.
fn column_data(table: &Table, submitted: &DataMap) -> DataMap {
    let mut data = DataMap::new();
    for (key, value) in submitted {
        if table.multi_links.contains_key(key) {
            continue;
        }
        if let Some(column) = table.column(key).or_else(|| table.column_by_graphql(key)) {
            data.insert(column.db_name.clone(), value.clone());
        }
    }
    data
}

/// The node's primary-key values, or `None` when any key column is null or
/// missing (which forces an insert). Submitted nodes may spell the key
/// under its GraphQL name.
fn pk_values(table: &Table, data: &DataMap) -> Option<Vec<Value>> {
    let pks = table.primary_keys();
    if pks.is_empty() {
        return None;
    }
    pks.iter()
        .map(|pk| {
            data.get(&pk.db_name)
                .or_else(|| data.get(&pk.graphql_name))
                .filter(|v| !v.is_null())
                .cloned()
        })
        .collect()
}

fn order_ops(ops: &mut [TreeSyncOperation]) {
    ops.sort_by_key(|op| match op.op {
        OperationType::Insert => (0, op.depth as i64),
        OperationType::Update => (1, 0),
        OperationType::Delete => (2, -(op.depth as i64)),
    });
}
