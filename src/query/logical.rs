//! Execution plans: a linear pipeline of nodes built from the AST or from
//! a serialized plan, with a deterministic cost model.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use xxhash_rust::xxh64::Xxh64;

use crate::catalog::Database;
use crate::mvcc::Transaction;
use crate::types::ErrorCode;

use super::arena::ArenaStr;
use super::ast::{Ast, Expr, ForSource, SortElement, Statement, Terminal};
use super::errors::QueryError;
use super::value::Value;

/// Item count assumed for lists whose length is unknown before execution.
const UNKNOWN_LIST_LENGTH: f64 = 100.0;
/// Fraction of rows assumed to pass a filter.
const FILTER_SELECTIVITY: f64 = 0.5;

/// Collection sizes used by the cost model.
pub trait CollectionStats {
    /// Number of documents in `name`, if the collection exists.
    fn collection_count(&self, name: &str) -> Option<u64>;
}

impl CollectionStats for Transaction {
    fn collection_count(&self, name: &str) -> Option<u64> {
        Transaction::collection_count(self, name)
    }
}

impl CollectionStats for Database {
    fn collection_count(&self, name: &str) -> Option<u64> {
        let committed = self.transactions().last_committed();
        self.collection(name).map(|c| c.count(committed))
    }
}

/// Pipeline node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlanNode {
    /// Produces one empty row.
    Singleton,
    /// Emits one row per document of a collection.
    EnumerateCollection {
        /// Collection name.
        collection: String,
        /// Variable receiving each document.
        out: ArenaStr,
    },
    /// Emits one row per member of an array value.
    EnumerateList {
        /// Array-valued expression.
        expr: Expr,
        /// Variable receiving each member.
        out: ArenaStr,
    },
    /// Binds a computed value.
    Calculation {
        /// Computed expression.
        expr: Expr,
        /// Variable receiving the value.
        out: ArenaStr,
    },
    /// Drops rows for which the condition is falsy.
    Filter {
        /// Condition.
        expr: Expr,
    },
    /// Orders rows.
    Sort {
        /// Criteria, most significant first.
        elements: Vec<SortElement>,
    },
    /// Skips `offset` rows and keeps at most `count`.
    Limit {
        /// Rows to skip.
        offset: u64,
        /// Rows to keep.
        count: u64,
    },
    /// Produces the result value of each row.
    Return {
        /// Result expression.
        expr: Expr,
        /// Drop duplicate results.
        distinct: bool,
    },
    /// Writes one document per row.
    Insert {
        /// Target collection.
        collection: String,
        /// Document expression.
        expr: Expr,
        /// Count failed writes instead of failing.
        #[serde(rename = "ignoreErrors", default)]
        ignore_errors: bool,
    },
    /// Produces nothing; replaces a pipeline proven empty.
    NoResults,
}

impl PlanNode {
    /// Display name used in explain output.
    pub fn name(&self) -> &'static str {
        match self {
            PlanNode::Singleton => "SingletonNode",
            PlanNode::EnumerateCollection { .. } => "EnumerateCollectionNode",
            PlanNode::EnumerateList { .. } => "EnumerateListNode",
            PlanNode::Calculation { .. } => "CalculationNode",
            PlanNode::Filter { .. } => "FilterNode",
            PlanNode::Sort { .. } => "SortNode",
            PlanNode::Limit { .. } => "LimitNode",
            PlanNode::Return { .. } => "ReturnNode",
            PlanNode::Insert { .. } => "InsertNode",
            PlanNode::NoResults => "NoResultsNode",
        }
    }

    /// Variable this node introduces, if any.
    pub fn variable_set(&self) -> Option<&ArenaStr> {
        match self {
            PlanNode::EnumerateCollection { out, .. }
            | PlanNode::EnumerateList { out, .. }
            | PlanNode::Calculation { out, .. } => Some(out),
            _ => None,
        }
    }

    /// Variables this node reads.
    pub fn variables_used(&self) -> BTreeSet<ArenaStr> {
        let mut out = BTreeSet::new();
        match self {
            PlanNode::EnumerateList { expr, .. }
            | PlanNode::Calculation { expr, .. }
            | PlanNode::Filter { expr }
            | PlanNode::Return { expr, .. }
            | PlanNode::Insert { expr, .. } => expr.collect_variables(&mut out),
            PlanNode::Sort { elements } => {
                for element in elements {
                    element.expr.collect_variables(&mut out);
                }
            }
            PlanNode::Singleton
            | PlanNode::EnumerateCollection { .. }
            | PlanNode::Limit { .. }
            | PlanNode::NoResults => {}
        }
        out
    }
}

/// Cumulative estimate after a node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Estimate {
    /// Cost up to and including the node.
    pub cost: f64,
    /// Rows the node emits.
    pub items: f64,
}

/// A complete plan.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    nodes: Vec<PlanNode>,
    rules: Vec<String>,
}

fn limit_value(expr: &Expr, what: &str) -> Result<u64, QueryError> {
    match expr.constant() {
        Some(Value::Number(n)) if n.is_finite() && *n >= 0.0 && n.fract() == 0.0 && *n <= u64::MAX as f64 => {
            Ok(*n as u64)
        }
        _ => Err(QueryError::application(
            ErrorCode::NumberOutOfRange,
            format!("LIMIT {what} must be a non-negative integer"),
        )),
    }
}

impl ExecutionPlan {
    /// Wraps a node list.
    pub fn new(nodes: Vec<PlanNode>) -> Self {
        Self {
            nodes,
            rules: Vec::new(),
        }
    }

    /// Builds the plan for a parsed, bound and optimized query.
    ///
    /// Returns `Ok(None)` for an AST without a terminal statement.
    pub fn instantiate_from_ast(ast: &Ast) -> Result<Option<Self>, QueryError> {
        let Some(terminal) = &ast.terminal else {
            return Ok(None);
        };
        let mut nodes = vec![PlanNode::Singleton];
        for statement in &ast.statements {
            nodes.push(match statement {
                Statement::For { variable, source } => match source {
                    ForSource::Collection(collection) => PlanNode::EnumerateCollection {
                        collection: resolved(collection.name())?,
                        out: variable.clone(),
                    },
                    ForSource::Expr(expr) => PlanNode::EnumerateList {
                        expr: expr.clone(),
                        out: variable.clone(),
                    },
                },
                Statement::Filter { condition } => PlanNode::Filter {
                    expr: condition.clone(),
                },
                Statement::Let { variable, expr } => PlanNode::Calculation {
                    expr: expr.clone(),
                    out: variable.clone(),
                },
                Statement::Sort { elements } => PlanNode::Sort {
                    elements: elements.clone(),
                },
                Statement::Limit { offset, count } => PlanNode::Limit {
                    offset: limit_value(offset, "offset")?,
                    count: limit_value(count, "count")?,
                },
            });
        }
        nodes.push(match terminal {
            Terminal::Return { expr, distinct } => PlanNode::Return {
                expr: expr.clone(),
                distinct: *distinct,
            },
            Terminal::Insert {
                expr,
                collection,
                ignore_errors,
            } => PlanNode::Insert {
                collection: resolved(collection.name())?,
                expr: expr.clone(),
                ignore_errors: *ignore_errors,
            },
        });
        Ok(Some(Self::new(nodes)))
    }

    /// Rebuilds a plan from the `nodes` (and optional `rules`) of its JSON
    /// form. Returns `Ok(None)` when the node list is empty.
    pub fn instantiate_from_serialized(serialized: &JsonValue) -> Result<Option<Self>, QueryError> {
        let invalid = |detail: String| {
            QueryError::application(
                ErrorCode::BadParameter,
                format!("invalid serialized plan: {detail}"),
            )
        };
        let nodes = serialized
            .get("nodes")
            .cloned()
            .ok_or_else(|| invalid("missing 'nodes'".to_owned()))?;
        let nodes: Vec<PlanNode> =
            serde_json::from_value(nodes).map_err(|err| invalid(err.to_string()))?;
        if nodes.is_empty() {
            return Ok(None);
        }
        if nodes[0] != PlanNode::Singleton {
            return Err(invalid("plan must start with a singleton".to_owned()));
        }
        let rules = match serialized.get("rules") {
            Some(rules) => {
                serde_json::from_value(rules.clone()).map_err(|err| invalid(err.to_string()))?
            }
            None => Vec::new(),
        };
        Ok(Some(Self { nodes, rules }))
    }

    /// Collection names a serialized plan reads or writes.
    pub fn collections_referenced_in(serialized: &JsonValue) -> BTreeSet<String> {
        serialized
            .get("nodes")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|node| node.get("collection").and_then(JsonValue::as_str))
            .map(str::to_owned)
            .collect()
    }

    /// Nodes in pipeline order.
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<PlanNode> {
        &mut self.nodes
    }

    /// Names of optimizer rules applied to this plan.
    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    pub(crate) fn add_rule(&mut self, rule: &str) {
        if !self.rules.iter().any(|r| r == rule) {
            self.rules.push(rule.to_owned());
        }
    }

    /// Collections the plan reads or writes.
    pub fn collections(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                PlanNode::EnumerateCollection { collection, .. }
                | PlanNode::Insert { collection, .. } => Some(collection.clone()),
                _ => None,
            })
            .collect()
    }

    /// Per-node cumulative estimates.
    pub fn estimates(&self, stats: &dyn CollectionStats) -> Vec<Estimate> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cost = 0.0;
        let mut items = 0.0_f64;
        for node in &self.nodes {
            match node {
                PlanNode::Singleton => {
                    items = 1.0;
                    cost += 1.0;
                }
                PlanNode::EnumerateCollection { collection, .. } => {
                    let count = stats.collection_count(collection).unwrap_or(0) as f64;
                    cost += items;
                    items *= count;
                    cost += items;
                }
                PlanNode::EnumerateList { expr, .. } => {
                    let length = match expr.constant() {
                        Some(Value::Array(members)) => members.len() as f64,
                        _ => UNKNOWN_LIST_LENGTH,
                    };
                    items *= length;
                    cost += items;
                }
                PlanNode::Calculation { .. } | PlanNode::Return { .. } | PlanNode::Insert { .. } => {
                    cost += items;
                }
                PlanNode::Filter { .. } => {
                    cost += items;
                    items *= FILTER_SELECTIVITY;
                }
                PlanNode::Sort { .. } => {
                    cost += items * items.max(2.0).log2();
                }
                PlanNode::Limit { offset, count } => {
                    items = (items - *offset as f64).max(0.0).min(*count as f64);
                    cost += items;
                }
                PlanNode::NoResults => {
                    items = 0.0;
                    cost += 0.5;
                }
            }
            out.push(Estimate { cost, items });
        }
        out
    }

    /// Total estimated cost.
    pub fn estimated_cost(&self, stats: &dyn CollectionStats) -> f64 {
        self.estimates(stats).last().map_or(0.0, |e| e.cost)
    }

    /// Estimated number of result rows.
    pub fn estimated_items(&self, stats: &dyn CollectionStats) -> f64 {
        self.estimates(stats).last().map_or(0.0, |e| e.items)
    }

    /// Deterministic hash of the node list.
    pub fn plan_hash(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for node in &self.nodes {
            hasher.update(node.name().as_bytes());
            hasher.update(&serde_json::to_vec(node).unwrap_or_default());
        }
        hasher.digest()
    }

    /// JSON form used by explain. Verbose output adds per-node estimates and
    /// the plan hash.
    pub fn to_json(&self, stats: &dyn CollectionStats, verbose: bool) -> JsonValue {
        let estimates = self.estimates(stats);
        let nodes: Vec<JsonValue> = self
            .nodes
            .iter()
            .zip(&estimates)
            .map(|(node, estimate)| {
                let mut value = serde_json::to_value(node).unwrap_or(JsonValue::Null);
                if verbose {
                    if let JsonValue::Object(fields) = &mut value {
                        fields.insert("estimatedCost".to_owned(), json!(estimate.cost));
                        fields.insert("estimatedNrItems".to_owned(), json!(estimate.items));
                    }
                }
                value
            })
            .collect();
        let last = estimates.last().copied().unwrap_or(Estimate {
            cost: 0.0,
            items: 0.0,
        });
        let mut out = json!({
            "nodes": nodes,
            "rules": self.rules,
            "collections": self.collections(),
            "estimatedCost": last.cost,
            "estimatedNrItems": last.items,
        });
        if verbose {
            let mut hash = String::with_capacity(16);
            let _ = write!(hash, "{:016x}", self.plan_hash());
            out["planHash"] = JsonValue::String(hash);
        }
        out
    }
}

fn resolved(name: Option<&str>) -> Result<String, QueryError> {
    name.map(str::to_owned)
        .ok_or_else(|| QueryError::internal("collection bind parameter was not resolved"))
}
