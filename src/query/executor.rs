//! Execution engine: pulls batches of result values out of a plan.
//!
//! Every plan node becomes a row stream pulling from its input; the last
//! node (RETURN or INSERT) turns rows into result values. Streams read
//! collections and write documents through the query's transaction, which
//! is lent to the engine for each pull.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, trace};

use crate::mvcc::Transaction;
use crate::types::ErrorCode;

use super::arena::ArenaStr;
use super::ast::{Expr, SortElement};
use super::errors::QueryError;
use super::eval::{evaluate, Row};
use super::functions::Executor;
use super::logical::{ExecutionPlan, PlanNode};
use super::value::Value;

/// Counters reported with a query result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    /// Documents written.
    pub writes_executed: u64,
    /// Failed writes skipped because of `ignoreErrors`.
    pub writes_ignored: u64,
    /// Documents read by full collection scans.
    pub scanned_full: u64,
    /// Documents read through indexes.
    pub scanned_index: u64,
    /// Rows dropped by filters.
    pub filtered: u64,
}

/// Result values produced by one pull. Writes without a result produce
/// [`Value::Empty`] entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    rows: Vec<Value>,
}

impl Batch {
    /// Values in order.
    pub fn rows(&self) -> &[Value] {
        &self.rows
    }

    /// Consumes the batch.
    pub fn into_rows(self) -> Vec<Value> {
        self.rows
    }

    /// Number of values, empty ones included.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the batch holds no values.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

struct Context<'a> {
    trx: &'a mut Transaction,
    executor: &'a Executor,
    stats: &'a mut ExecutionStats,
}

trait RowStream {
    fn try_next(&mut self, ctx: &mut Context<'_>) -> Result<Option<Row>, QueryError>;
}

type BoxRowStream = Box<dyn RowStream>;

struct Singleton {
    done: bool,
}

impl RowStream for Singleton {
    fn try_next(&mut self, _: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(Row::default()))
    }
}

struct Exhausted;

impl RowStream for Exhausted {
    fn try_next(&mut self, _: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        Ok(None)
    }
}

/// Nested-loop state shared by the two enumeration streams.
struct Cursor {
    row: Row,
    items: Arc<Vec<Value>>,
    next: usize,
}

impl Cursor {
    fn advance(&mut self, out: &ArenaStr) -> Option<Row> {
        let item = self.items.get(self.next)?;
        self.next += 1;
        let mut row = self.row.clone();
        row.insert(out.clone(), item.clone());
        Some(row)
    }
}

struct EnumerateCollection {
    input: BoxRowStream,
    collection: String,
    out: ArenaStr,
    documents: Option<Arc<Vec<Value>>>,
    cursor: Option<Cursor>,
}

impl RowStream for EnumerateCollection {
    fn try_next(&mut self, ctx: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        loop {
            if let Some(row) = self.cursor.as_mut().and_then(|c| c.advance(&self.out)) {
                ctx.stats.scanned_full += 1;
                return Ok(Some(row));
            }
            let Some(row) = self.input.try_next(ctx)? else {
                return Ok(None);
            };
            let documents = match &self.documents {
                Some(documents) => Arc::clone(documents),
                None => {
                    let read = ctx.trx.read_collection(&self.collection)?;
                    let documents = Arc::new(read.iter().map(|doc| Value::from_json(doc)).collect());
                    trace!(collection = %self.collection, "collection snapshot read");
                    self.documents = Some(Arc::clone(&documents));
                    documents
                }
            };
            self.cursor = Some(Cursor {
                row,
                items: documents,
                next: 0,
            });
        }
    }
}

struct EnumerateList {
    input: BoxRowStream,
    expr: Expr,
    out: ArenaStr,
    cursor: Option<Cursor>,
}

impl RowStream for EnumerateList {
    fn try_next(&mut self, ctx: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        loop {
            if let Some(row) = self.cursor.as_mut().and_then(|c| c.advance(&self.out)) {
                return Ok(Some(row));
            }
            let Some(row) = self.input.try_next(ctx)? else {
                return Ok(None);
            };
            let items = match evaluate(&self.expr, &row, ctx.executor)? {
                Value::Array(items) => items,
                other => {
                    return Err(QueryError::application(
                        ErrorCode::ArrayExpected,
                        format!("FOR loop over {}", other.type_name()),
                    ))
                }
            };
            self.cursor = Some(Cursor {
                row,
                items: Arc::new(items),
                next: 0,
            });
        }
    }
}

struct Calculation {
    input: BoxRowStream,
    expr: Expr,
    out: ArenaStr,
}

impl RowStream for Calculation {
    fn try_next(&mut self, ctx: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        let Some(mut row) = self.input.try_next(ctx)? else {
            return Ok(None);
        };
        let value = evaluate(&self.expr, &row, ctx.executor)?;
        row.insert(self.out.clone(), value);
        Ok(Some(row))
    }
}

struct Filter {
    input: BoxRowStream,
    expr: Expr,
}

impl RowStream for Filter {
    fn try_next(&mut self, ctx: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        while let Some(row) = self.input.try_next(ctx)? {
            if evaluate(&self.expr, &row, ctx.executor)?.is_truthy() {
                return Ok(Some(row));
            }
            ctx.stats.filtered += 1;
        }
        Ok(None)
    }
}

struct Sort {
    input: BoxRowStream,
    elements: Vec<SortElement>,
    sorted: Option<VecDeque<Row>>,
}

impl Sort {
    fn materialize(&mut self, ctx: &mut Context<'_>) -> Result<VecDeque<Row>, QueryError> {
        let mut keyed = Vec::new();
        while let Some(row) = self.input.try_next(ctx)? {
            let mut keys = Vec::with_capacity(self.elements.len());
            for element in &self.elements {
                keys.push(evaluate(&element.expr, &row, ctx.executor)?);
            }
            keyed.try_reserve(1)?;
            keyed.push((keys, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for ((left, right), element) in a.iter().zip(b).zip(&self.elements) {
                let ordering = left.compare(right);
                let ordering = if element.ascending {
                    ordering
                } else {
                    ordering.reverse()
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }
}

impl RowStream for Sort {
    fn try_next(&mut self, ctx: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        if self.sorted.is_none() {
            self.sorted = Some(self.materialize(ctx)?);
        }
        Ok(self.sorted.as_mut().and_then(VecDeque::pop_front))
    }
}

struct Limit {
    input: BoxRowStream,
    offset: u64,
    count: u64,
    skipped: u64,
    emitted: u64,
}

impl RowStream for Limit {
    fn try_next(&mut self, ctx: &mut Context<'_>) -> Result<Option<Row>, QueryError> {
        while self.skipped < self.offset {
            if self.input.try_next(ctx)?.is_none() {
                return Ok(None);
            }
            self.skipped += 1;
        }
        if self.emitted >= self.count {
            return Ok(None);
        }
        let row = self.input.try_next(ctx)?;
        if row.is_some() {
            self.emitted += 1;
        }
        Ok(row)
    }
}

enum Output {
    Return {
        expr: Expr,
        distinct: bool,
        seen: FxHashSet<String>,
    },
    Insert {
        collection: String,
        expr: Expr,
        ignore_errors: bool,
    },
}

impl Output {
    fn produce(&mut self, row: &Row, ctx: &mut Context<'_>) -> Result<Option<Value>, QueryError> {
        match self {
            Output::Return {
                expr,
                distinct,
                seen,
            } => {
                let value = evaluate(expr, row, ctx.executor)?;
                if *distinct && !seen.insert(value.to_json().to_string()) {
                    return Ok(None);
                }
                Ok(Some(value))
            }
            Output::Insert {
                collection,
                expr,
                ignore_errors,
            } => {
                let document = evaluate(expr, row, ctx.executor)?.to_json();
                match ctx.trx.insert(collection, document) {
                    Ok(_) => ctx.stats.writes_executed += 1,
                    Err(err) if *ignore_errors => {
                        trace!(error = %err, "insert failed, ignoring");
                        ctx.stats.writes_ignored += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
                Ok(Some(Value::Empty))
            }
        }
    }
}

/// Runs one plan against one transaction.
pub struct ExecutionEngine {
    root: BoxRowStream,
    output: Output,
    executor: Arc<Executor>,
    stats: ExecutionStats,
    exhausted: bool,
}

impl ExecutionEngine {
    /// Builds the stream pipeline for `plan`. The transaction must be
    /// ongoing and cover every collection the plan touches.
    pub fn instantiate(
        trx: &Transaction,
        executor: Arc<Executor>,
        plan: &ExecutionPlan,
    ) -> Result<Self, QueryError> {
        if !trx.is_ongoing() || trx.snapshot().is_none() {
            return Err(QueryError::internal(format!(
                "cannot execute on {trx}, transaction has not begun or has finished"
            )));
        }
        if let Some(missing) = plan
            .collections()
            .into_iter()
            .find(|name| !trx.collections().contains(name))
        {
            return Err(QueryError::internal(format!(
                "collection '{missing}' is not registered with {trx}"
            )));
        }

        let (last, pipeline) = plan
            .nodes()
            .split_last()
            .ok_or_else(|| QueryError::internal("execution plan is empty"))?;
        let output = match last {
            PlanNode::Return { expr, distinct } => Output::Return {
                expr: expr.clone(),
                distinct: *distinct,
                seen: FxHashSet::default(),
            },
            PlanNode::Insert {
                collection,
                expr,
                ignore_errors,
            } => Output::Insert {
                collection: collection.clone(),
                expr: expr.clone(),
                ignore_errors: *ignore_errors,
            },
            other => {
                return Err(QueryError::internal(format!(
                    "execution plan ends with {}",
                    other.name()
                )))
            }
        };

        let mut root: Option<BoxRowStream> = None;
        for node in pipeline {
            root = Some(stage(node, root)?);
        }
        let root = root.ok_or_else(|| QueryError::internal("execution plan has no input"))?;
        debug!(nodes = plan.nodes().len(), tx_id = trx.id().0, "execution engine instantiated");
        Ok(Self {
            root,
            output,
            executor,
            stats: ExecutionStats::default(),
            exhausted: false,
        })
    }

    /// Pulls up to `max_rows` (at least one) values. Returns `Ok(None)` once
    /// the pipeline is exhausted.
    pub fn pull_batch(&mut self, trx: &mut Transaction, max_rows: usize) -> Result<Option<Batch>, QueryError> {
        if self.exhausted {
            return Ok(None);
        }
        let max_rows = max_rows.max(1);
        let mut rows = Vec::new();
        let mut ctx = Context {
            trx,
            executor: &self.executor,
            stats: &mut self.stats,
        };
        while rows.len() < max_rows {
            let Some(row) = self.root.try_next(&mut ctx)? else {
                self.exhausted = true;
                break;
            };
            if let Some(value) = self.output.produce(&row, &mut ctx)? {
                rows.try_reserve(1)?;
                rows.push(value);
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }
        trace!(rows = rows.len(), "batch pulled");
        Ok(Some(Batch { rows }))
    }

    /// Counters so far.
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Whether the last pull reached the end of the pipeline.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

fn stage(node: &PlanNode, input: Option<BoxRowStream>) -> Result<BoxRowStream, QueryError> {
    let with_input = |input: Option<BoxRowStream>| {
        input.ok_or_else(|| QueryError::internal(format!("{} has no input", node.name())))
    };
    Ok(match node {
        PlanNode::Singleton => Box::new(Singleton { done: false }),
        PlanNode::NoResults => Box::new(Exhausted),
        PlanNode::EnumerateCollection { collection, out } => Box::new(EnumerateCollection {
            input: with_input(input)?,
            collection: collection.clone(),
            out: out.clone(),
            documents: None,
            cursor: None,
        }),
        PlanNode::EnumerateList { expr, out } => Box::new(EnumerateList {
            input: with_input(input)?,
            expr: expr.clone(),
            out: out.clone(),
            cursor: None,
        }),
        PlanNode::Calculation { expr, out } => Box::new(Calculation {
            input: with_input(input)?,
            expr: expr.clone(),
            out: out.clone(),
        }),
        PlanNode::Filter { expr } => Box::new(Filter {
            input: with_input(input)?,
            expr: expr.clone(),
        }),
        PlanNode::Sort { elements } => Box::new(Sort {
            input: with_input(input)?,
            elements: elements.clone(),
            sorted: None,
        }),
        PlanNode::Limit { offset, count } => Box::new(Limit {
            input: with_input(input)?,
            offset: *offset,
            count: *count,
            skipped: 0,
            emitted: 0,
        }),
        PlanNode::Return { .. } | PlanNode::Insert { .. } => {
            return Err(QueryError::internal(format!(
                "{} must be the last node",
                node.name()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Database;
    use crate::query::arena::StringArena;
    use crate::query::parser::Parser;
    use serde_json::{json, Value as JsonValue};

    fn plan(text: &str) -> ExecutionPlan {
        let mut arena = StringArena::new();
        let mut ast = Parser::parse(text, &mut arena).unwrap();
        ast.inject_bind_parameters(&JsonValue::Null).unwrap();
        ast.optimize(&Executor::new()).unwrap();
        ExecutionPlan::instantiate_from_ast(&ast).unwrap().unwrap()
    }

    fn seeded() -> Arc<Database> {
        let db = Database::new("test");
        db.load_json(&json!({
            "users": [
                {"_key": "a", "name": "ann", "age": 31},
                {"_key": "b", "name": "bob", "age": 17},
                {"_key": "c", "name": "cid", "age": 45}
            ]
        }))
        .unwrap();
        db
    }

    fn run(
        db: &Arc<Database>,
        text: &str,
        batch_size: usize,
    ) -> Result<(Vec<JsonValue>, ExecutionStats), QueryError> {
        let plan = plan(text);
        let mut trx = db.transactions().new_transaction(db, plan.collections());
        trx.begin()?;
        let mut engine = ExecutionEngine::instantiate(&trx, Arc::new(Executor::new()), &plan)?;
        let mut out = Vec::new();
        while let Some(batch) = engine.pull_batch(&mut trx, batch_size)? {
            assert!(batch.len() <= batch_size);
            out.extend(batch.rows().iter().filter(|v| !v.is_empty()).map(Value::to_json));
        }
        let stats = engine.stats().clone();
        trx.commit()?;
        Ok((out, stats))
    }

    #[test]
    fn filters_sorts_and_limits() -> Result<(), QueryError> {
        let db = seeded();
        let (rows, stats) = run(
            &db,
            "FOR u IN users FILTER u.age > 18 SORT u.age DESC LIMIT 0, 5 RETURN u.name",
            1,
        )?;
        assert_eq!(rows, vec![json!("cid"), json!("ann")]);
        assert_eq!(stats.scanned_full, 3);
        assert_eq!(stats.filtered, 1);
        Ok(())
    }

    #[test]
    fn batches_respect_the_row_cap() -> Result<(), QueryError> {
        let db = seeded();
        let plan = plan("FOR i IN RANGE(1, 10) RETURN i");
        let mut trx = db.transactions().new_transaction(&db, plan.collections());
        trx.begin()?;
        let mut engine = ExecutionEngine::instantiate(&trx, Arc::new(Executor::new()), &plan)?;
        let mut sizes = Vec::new();
        while let Some(batch) = engine.pull_batch(&mut trx, 4)? {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(engine.is_exhausted());
        trx.commit()?;
        Ok(())
    }

    #[test]
    fn distinct_and_nested_loops() -> Result<(), QueryError> {
        let db = seeded();
        let (rows, _) = run(
            &db,
            "FOR a IN [1, 2] FOR b IN [1, 2] RETURN DISTINCT a * b",
            100,
        )?;
        assert_eq!(rows, vec![json!(1), json!(2), json!(4)]);
        Ok(())
    }

    #[test]
    fn inserts_write_through_the_transaction() -> Result<(), QueryError> {
        let db = seeded();
        let (rows, stats) = run(
            &db,
            "FOR u IN users INSERT { _key: CONCAT('copy-', u._key) } INTO users",
            100,
        )?;
        assert!(rows.is_empty());
        assert_eq!(stats.writes_executed, 3);
        let committed = db.transactions().last_committed();
        assert_eq!(db.collection("users").map(|c| c.count(committed)), Some(6));
        Ok(())
    }

    #[test]
    fn ignored_insert_failures_are_counted() -> Result<(), QueryError> {
        let db = seeded();
        let (_, stats) = run(
            &db,
            "FOR k IN ['a', 'z'] INSERT { _key: k } INTO users OPTIONS { ignoreErrors: true }",
            100,
        )?;
        assert_eq!(stats.writes_executed, 1);
        assert_eq!(stats.writes_ignored, 1);

        let err = run(&db, "FOR k IN ['a'] INSERT { _key: k } INTO users", 100).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UniqueConstraintViolated);
        Ok(())
    }

    #[test]
    fn for_over_non_array_fails() {
        let db = seeded();
        let err = run(&db, "FOR u IN users FOR x IN u.name RETURN x", 10).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ArrayExpected);
    }

    #[test]
    fn no_results_short_circuits() -> Result<(), QueryError> {
        let db = seeded();
        let mut plan = plan("FOR u IN users RETURN u");
        plan.nodes_mut().insert(1, PlanNode::NoResults);
        let mut trx = db.transactions().new_transaction(&db, plan.collections());
        trx.begin()?;
        let mut engine = ExecutionEngine::instantiate(&trx, Arc::new(Executor::new()), &plan)?;
        assert!(engine.pull_batch(&mut trx, 10)?.is_none());
        assert_eq!(engine.stats().scanned_full, 0);
        trx.commit()?;
        Ok(())
    }

    #[test]
    fn unregistered_collections_are_rejected() {
        let db = seeded();
        let plan = plan("FOR u IN users RETURN u");
        let mut trx = db.transactions().new_transaction(&db, Vec::<String>::new());
        trx.begin().unwrap();
        assert!(ExecutionEngine::instantiate(&trx, Arc::new(Executor::new()), &plan).is_err());
        trx.rollback();
    }
}
