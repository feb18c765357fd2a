//! The query orchestrator.
//!
//! A [`Query`] owns everything a single query run needs: the string arena,
//! the parsed AST, the chosen plan, the transaction and the execution
//! engine. Each public entry point drives these through the fixed phase
//! sequence of [`LifecyclePhase`] and turns any fault into a failed
//! [`QueryResult`] after releasing what was acquired.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::catalog::Database;
use crate::mvcc::Transaction;
use crate::types::ErrorCode;

use super::arena::{ArenaStr, StringArena};
use super::ast::Ast;
use super::errors::QueryError;
use super::executor::{ExecutionEngine, ExecutionStats};
use super::functions::{Executor, SharedExecutor};
use super::logical::ExecutionPlan;
use super::options::QueryOptions;
use super::parser::{self, Parser};
use super::planner::{Optimizer, RuleSet};
use super::profile::{LifecyclePhase, Profile};
use super::result::QueryResult;
use super::value::Value;

/// What a query was created from.
#[derive(Clone, Debug, PartialEq)]
pub enum QuerySource {
    /// Query text, parsed on prepare.
    Text(String),
    /// A plan in the JSON form produced by explain.
    Serialized(JsonValue),
}

/// One query run against a database.
pub struct Query {
    db: Arc<Database>,
    source: QuerySource,
    bind_parameters: JsonValue,
    options: QueryOptions,
    profiling: bool,
    strings: StringArena,
    executor: Option<SharedExecutor>,
    profile: Profile,
    phase: Option<LifecyclePhase>,
    ast: Option<Ast>,
    plan: Option<ExecutionPlan>,
    trx: Option<Transaction>,
    engine: Option<ExecutionEngine>,
    collections: BTreeSet<String>,
}

impl Query {
    /// Query from text with bind parameters (`null` for none).
    pub fn new(
        db: Arc<Database>,
        text: impl Into<String>,
        bind_parameters: JsonValue,
        options: impl Into<QueryOptions>,
    ) -> Self {
        Self::with_source(db, QuerySource::Text(text.into()), bind_parameters, options.into())
    }

    /// Query from a serialized plan.
    pub fn from_serialized(
        db: Arc<Database>,
        plan: JsonValue,
        options: impl Into<QueryOptions>,
    ) -> Self {
        Self::with_source(db, QuerySource::Serialized(plan), JsonValue::Null, options.into())
    }

    fn with_source(
        db: Arc<Database>,
        source: QuerySource,
        bind_parameters: JsonValue,
        options: QueryOptions,
    ) -> Self {
        let profiling = options.profile(db.config());
        let mut query = Self {
            db,
            source,
            bind_parameters,
            options,
            profiling,
            strings: StringArena::new(),
            executor: None,
            profile: Profile::new(),
            phase: None,
            ast: None,
            plan: None,
            trx: None,
            engine: None,
            collections: BTreeSet::new(),
        };
        query.enter_state(LifecyclePhase::Initialization);
        query
    }

    /// Current phase.
    pub fn phase(&self) -> LifecyclePhase {
        self.phase.unwrap_or(LifecyclePhase::Initialization)
    }

    /// Recorded phase durations.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// What the query was created from.
    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    /// The query options.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Query text, or the serialized plan rendered as JSON.
    pub fn query_string(&self) -> String {
        match &self.source {
            QuerySource::Text(text) => text.clone(),
            QuerySource::Serialized(plan) => plan.to_string(),
        }
    }

    /// Collections the current or last transaction was opened on.
    pub fn collections(&self) -> &BTreeSet<String> {
        &self.collections
    }

    /// Whether a transaction is open.
    pub fn has_transaction(&self) -> bool {
        self.trx.is_some()
    }

    /// Whether a prepared engine still has rows to hand out.
    pub fn has_more(&self) -> bool {
        self.engine.as_ref().is_some_and(|engine| !engine.is_exhausted())
    }

    /// The chosen plan, while the query holds one.
    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    /// Whether no AST, plan, transaction or engine is held.
    pub fn is_released(&self) -> bool {
        self.engine.is_none() && self.trx.is_none() && self.ast.is_none() && self.plan.is_none()
    }

    /// Function executor, created on first use.
    pub fn executor(&mut self) -> SharedExecutor {
        Arc::clone(self.executor.get_or_insert_with(|| Arc::new(Executor::new())))
    }

    /// Moves to `phase`, recording the time spent in the phase being left
    /// when profiling is enabled.
    ///
    /// # Panics
    ///
    /// Panics when asked to move backwards. Only [`LifecyclePhase::Execution`]
    /// may be entered again.
    #[track_caller]
    pub fn enter_state(&mut self, phase: LifecyclePhase) {
        if let Some(current) = self.phase {
            let resume = current == phase && phase == LifecyclePhase::Execution;
            assert!(
                phase > current || resume,
                "query cannot move from state {current} back to {phase}"
            );
        }
        self.profile.enter(if self.profiling { self.phase } else { None });
        debug!(from = ?self.phase, to = %phase, "query state changed");
        self.phase = Some(phase);
    }

    /// Interns `text` in the query's arena, decoding escapes first when
    /// `must_unescape` is set.
    pub fn register_string(&mut self, text: &str, must_unescape: bool) -> Result<ArenaStr, QueryError> {
        Ok(self.strings.register(text, must_unescape)?)
    }

    /// Snippet of the query text starting at `line` (1-based) and `column`
    /// (0-based).
    pub fn extract_region(&self, line: usize, column: usize) -> String {
        match &self.source {
            QuerySource::Text(text) => parser::extract_region(text, line, column),
            QuerySource::Serialized(_) => String::new(),
        }
    }

    /// Formats a transaction failure: base text, transaction detail and the
    /// query being run.
    pub fn transaction_error(&self, code: ErrorCode, trx: &Transaction) -> QueryError {
        let mut message = code.base_text().to_owned();
        if let Some(detail) = trx.detail() {
            message.push_str(&format!(" ({detail})"));
        }
        message.push_str(&format!("\nwhile executing:\n{}\n", self.query_string()));
        QueryError::TransactionBegin { code, message }
    }

    /// Releases the engine, transaction, AST and plan, in that order. An
    /// ongoing transaction is rolled back. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        self.engine = None;
        if let Some(mut trx) = self.trx.take() {
            if trx.is_ongoing() {
                trx.rollback();
            }
        }
        self.ast = None;
        self.plan = None;
    }

    fn fail(&mut self, err: QueryError) -> QueryResult {
        self.cleanup();
        let phase = self.phase();
        warn!(state = %phase, code = %err.code(), error = %err, "query failed");
        QueryResult::failure(err.code(), format!("in state {phase}: {err}"))
    }

    fn attach_profile(&self, result: &mut QueryResult) {
        if self.profiling {
            result.profile = Some(self.profile.report());
        }
    }

    /// Parses the text and reports collections, bind parameters and the AST
    /// without planning anything. Errors are not prefixed with a state.
    pub fn parse(&mut self) -> QueryResult {
        let QuerySource::Text(text) = &self.source else {
            return QueryResult::failure(
                ErrorCode::BadParameter,
                "bad parameter: a serialized plan cannot be parsed",
            );
        };
        match Parser::parse(text, &mut self.strings) {
            Ok(ast) => {
                let mut parameters: Vec<String> = ast.bind_parameters.iter().cloned().collect();
                parameters.extend(ast.collection_parameters.iter().map(|name| format!("@{name}")));
                QueryResult {
                    rows: Some(vec![json!({
                        "collections": ast.collections(),
                        "bindVars": parameters,
                        "ast": ast.to_json(),
                    })]),
                    ..QueryResult::success()
                }
            }
            Err(err) => QueryResult::failure(err.code, err.message),
        }
    }

    /// Builds the plan, opens the transaction and instantiates the engine
    /// without pulling any rows. On an already prepared query this only
    /// resumes the execution state.
    pub fn prepare(&mut self) -> QueryResult {
        match self.prepare_inner() {
            Ok(()) => QueryResult::success(),
            Err(err) => self.fail(err),
        }
    }

    fn prepare_inner(&mut self) -> Result<(), QueryError> {
        if self.engine.is_some() {
            self.enter_state(LifecyclePhase::Execution);
            return Ok(());
        }
        self.ensure_fresh()?;
        let mut optimizer = self.optimize()?;
        let plan = optimizer
            .steal_best()
            .ok_or_else(|| QueryError::internal("optimizer produced no plan"))?;

        self.enter_state(LifecyclePhase::Execution);
        let executor = self.executor();
        let trx = self
            .trx
            .as_ref()
            .ok_or_else(|| QueryError::internal("no transaction to execute in"))?;
        let engine = ExecutionEngine::instantiate(trx, executor, &plan)?;
        self.plan = Some(plan);
        self.engine = Some(engine);
        Ok(())
    }

    fn ensure_fresh(&self) -> Result<(), QueryError> {
        if self.phase() > LifecyclePhase::Initialization {
            return Err(QueryError::internal("query has already been run"));
        }
        Ok(())
    }

    /// Parsing through plan optimization. Leaves an open, begun transaction
    /// in `self.trx` and returns the optimizer holding the ranked candidates.
    fn optimize(&mut self) -> Result<Optimizer, QueryError> {
        self.enter_state(LifecyclePhase::Parsing);
        let plan = match self.source.clone() {
            QuerySource::Text(text) => self.plan_from_text(&text)?,
            QuerySource::Serialized(serialized) => self.plan_from_serialized(&serialized)?,
        };

        self.enter_state(LifecyclePhase::PlanOptimization);
        let max_plans = self.options.max_plans(self.db.config());
        let rules = RuleSet::from_options(&self.options.optimizer_rules());
        let trx = self
            .trx
            .as_ref()
            .ok_or_else(|| QueryError::internal("no transaction to optimize in"))?;
        let mut optimizer = Optimizer::new(max_plans);
        optimizer.create_plans(plan, &rules, trx);
        Ok(optimizer)
    }

    fn plan_from_text(&mut self, text: &str) -> Result<ExecutionPlan, QueryError> {
        let mut ast = Parser::parse(text, &mut self.strings)?;
        ast.inject_bind_parameters(&self.bind_parameters)?;

        self.enter_state(LifecyclePhase::AstOptimization);
        let executor = self.executor();
        ast.optimize(&executor)?;
        let collections = ast.collections();
        self.ast = Some(ast);
        self.open_transaction(collections)?;

        self.enter_state(LifecyclePhase::PlanInstantiation);
        let ast = self
            .ast
            .as_ref()
            .ok_or_else(|| QueryError::internal("parsed query went missing"))?;
        ExecutionPlan::instantiate_from_ast(ast)?.ok_or(QueryError::PlanInstantiation)
    }

    fn plan_from_serialized(&mut self, serialized: &JsonValue) -> Result<ExecutionPlan, QueryError> {
        self.enter_state(LifecyclePhase::PlanInstantiation);
        self.ast = Some(Ast::empty());
        let collections = ExecutionPlan::collections_referenced_in(serialized);
        self.open_transaction(collections)?;
        ExecutionPlan::instantiate_from_serialized(serialized)?.ok_or(QueryError::PlanInstantiation)
    }

    /// Creates a transaction on `collections`, registers them before begin
    /// and begins it. The transaction is kept even when begin fails so that
    /// cleanup rolls it back.
    fn open_transaction(&mut self, collections: BTreeSet<String>) -> Result<(), QueryError> {
        let mut trx = self.db.transactions().new_transaction(&self.db, Vec::<String>::new());
        trx.add_collections(collections.iter().cloned())?;
        self.collections = collections;
        let begun = trx.begin();
        self.trx = Some(trx);
        match (begun, &self.trx) {
            (Err(err), Some(trx)) => Err(self.transaction_error(err.code(), trx)),
            _ => Ok(()),
        }
    }

    /// Prepares the query, pulls every batch, commits and returns the rows.
    pub fn execute(&mut self) -> QueryResult {
        let prepared = self.prepare();
        if !prepared.is_success() {
            return prepared;
        }
        let mut rows = Vec::new();
        let outcome = loop {
            match self.pull(&mut rows) {
                Ok(true) => continue,
                Ok(false) => break self.finish(rows),
                Err(err) => break Err(err),
            }
        };
        outcome.unwrap_or_else(|err| self.fail(err))
    }

    /// Hands out one batch of a prepared query. After the last batch the
    /// transaction is committed and the result carries stats (and profile).
    ///
    /// Between batches the caller may [`close_transaction`](Self::close_transaction);
    /// it has to [`reopen_transaction`](Self::reopen_transaction) before
    /// pulling again.
    pub fn next_batch(&mut self) -> QueryResult {
        if self.engine.is_none() {
            let prepared = self.prepare();
            if !prepared.is_success() {
                return prepared;
            }
        }
        let mut rows = Vec::new();
        let outcome = match self.pull(&mut rows) {
            Ok(true) => Ok(QueryResult {
                rows: Some(rows),
                ..QueryResult::success()
            }),
            Ok(false) => self.finish(rows),
            Err(err) => Err(err),
        };
        outcome.unwrap_or_else(|err| self.fail(err))
    }

    /// Pulls one batch into `rows`. Returns whether more may follow.
    fn pull(&mut self, rows: &mut Vec<JsonValue>) -> Result<bool, QueryError> {
        let batch_size = self.options.batch_size(self.db.config());
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| QueryError::internal("query is not prepared"))?;
        let trx = self
            .trx
            .as_mut()
            .ok_or_else(|| QueryError::internal("query transaction is closed"))?;
        let Some(batch) = engine.pull_batch(trx, batch_size)? else {
            return Ok(false);
        };
        rows.try_reserve(batch.len())?;
        rows.extend(
            batch
                .rows()
                .iter()
                .filter(|value| !value.is_empty())
                .map(Value::to_json),
        );
        Ok(!engine.is_exhausted())
    }

    fn finish(&mut self, rows: Vec<JsonValue>) -> Result<QueryResult, QueryError> {
        let stats = self
            .engine
            .as_ref()
            .map(|engine| engine.stats().clone())
            .unwrap_or_default();
        self.commit()?;
        self.cleanup();
        self.enter_state(LifecyclePhase::Finalization);
        info!(rows = rows.len(), writes = stats.writes_executed, "query finished");
        let mut result = QueryResult {
            rows: Some(rows),
            stats: Some(stats),
            ..QueryResult::success()
        };
        self.attach_profile(&mut result);
        Ok(result)
    }

    fn commit(&mut self) -> Result<(), QueryError> {
        let mut trx = self
            .trx
            .take()
            .ok_or_else(|| QueryError::internal("query transaction is closed"))?;
        trx.commit()?;
        Ok(())
    }

    /// Plans the query without running it and returns the serialized plans
    /// as rows: every candidate with `allPlans`, otherwise the best one.
    pub fn explain(&mut self) -> QueryResult {
        match self.explain_inner() {
            Ok(result) => result,
            Err(err) => self.fail(err),
        }
    }

    fn explain_inner(&mut self) -> Result<QueryResult, QueryError> {
        self.ensure_fresh()?;
        let mut optimizer = self.optimize()?;
        let verbose = self.options.verbose_plans();
        let plans = if self.options.all_plans() {
            optimizer.take_plans()
        } else {
            optimizer.steal_best().into_iter().collect()
        };
        let rows = {
            let trx = self
                .trx
                .as_ref()
                .ok_or_else(|| QueryError::internal("no transaction to explain in"))?;
            plans.iter().map(|plan| plan.to_json(trx, verbose)).collect()
        };
        self.commit()?;
        self.cleanup();
        self.enter_state(LifecyclePhase::Finalization);
        let mut result = QueryResult {
            rows: Some(rows),
            stats: Some(ExecutionStats::default()),
            ..QueryResult::success()
        };
        self.attach_profile(&mut result);
        Ok(result)
    }

    /// Commits and releases the open transaction, keeping plan and engine.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    #[track_caller]
    pub fn close_transaction(&mut self) -> Result<(), QueryError> {
        assert!(self.trx.is_some(), "close_transaction called without an open transaction");
        self.commit()?;
        debug!(collections = self.collections.len(), "query transaction closed");
        Ok(())
    }

    /// Opens and begins a fresh transaction on the query's collections. On
    /// failure no transaction is left open and the call may be retried.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already open.
    #[track_caller]
    pub fn reopen_transaction(&mut self) -> Result<(), QueryError> {
        assert!(self.trx.is_none(), "reopen_transaction called with a transaction still open");
        let collections = self.collections.clone();
        if let Err(err) = self.open_transaction(collections) {
            if let Some(mut trx) = self.trx.take() {
                if trx.is_ongoing() {
                    trx.rollback();
                }
            }
            return Err(err);
        }
        debug!(collections = self.collections.len(), "query transaction reopened");
        Ok(())
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.cleanup();
    }
}
