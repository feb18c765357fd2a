//! Rule-based plan optimizer.
//!
//! Rules run in level order. Each rule either rewrites a plan in place or
//! adds alternative candidates; the candidate list is capped at the
//! configured maximum and ranked by estimated cost.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use super::arena::ArenaStr;
use super::logical::{CollectionStats, ExecutionPlan, PlanNode};
use super::value::Value;

enum Effect {
    Unchanged,
    Replace(ExecutionPlan),
    Extend(Vec<ExecutionPlan>),
}

/// An optimizer rule.
pub struct Rule {
    /// Name used in options and explain output.
    pub name: &'static str,
    /// Rules run in ascending level order.
    pub level: u32,
    apply: fn(&ExecutionPlan) -> Effect,
}

static RULES: &[Rule] = &[
    Rule {
        name: "remove-unnecessary-filters",
        level: 10,
        apply: remove_unnecessary_filters,
    },
    Rule {
        name: "remove-unnecessary-calculations",
        level: 20,
        apply: remove_unnecessary_calculations,
    },
    Rule {
        name: "interchange-adjacent-enumerations",
        level: 30,
        apply: interchange_adjacent_enumerations,
    },
    Rule {
        name: "move-filters-up",
        level: 40,
        apply: move_filters_up,
    },
];

/// All rules in level order.
pub fn rules() -> &'static [Rule] {
    RULES
}

/// Enabled subset of the optimizer rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSet {
    enabled: BTreeSet<&'static str>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            enabled: RULES.iter().map(|rule| rule.name).collect(),
        }
    }
}

impl RuleSet {
    /// Applies `+all`, `-all`, `+name`, `-name` (and bare `name`) entries
    /// left to right, starting from every rule enabled. Unknown names are
    /// ignored.
    pub fn from_options<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut set = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            let (enable, name) = match entry.strip_prefix('-') {
                Some(name) => (false, name),
                None => (true, entry.strip_prefix('+').unwrap_or(entry)),
            };
            if name == "all" {
                set.enabled = if enable {
                    RULES.iter().map(|rule| rule.name).collect()
                } else {
                    BTreeSet::new()
                };
                continue;
            }
            match RULES.iter().find(|rule| rule.name == name) {
                Some(rule) if enable => {
                    set.enabled.insert(rule.name);
                }
                Some(rule) => {
                    set.enabled.remove(rule.name);
                }
                None => trace!(rule = name, "ignoring unknown optimizer rule"),
            }
        }
        set
    }

    /// Whether `name` is enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

/// Creates candidate plans and hands out the cheapest.
pub struct Optimizer {
    max_plans: usize,
    plans: Vec<ExecutionPlan>,
}

impl Optimizer {
    /// Optimizer keeping at most `max_plans` (at least one) candidates.
    pub fn new(max_plans: usize) -> Self {
        Self {
            max_plans: max_plans.max(1),
            plans: Vec::new(),
        }
    }

    /// Runs the enabled rules over `plan` and ranks the candidates by
    /// estimated cost; ties keep creation order.
    pub fn create_plans(&mut self, plan: ExecutionPlan, rules: &RuleSet, stats: &dyn CollectionStats) {
        let mut plans = vec![plan];
        for rule in RULES.iter().filter(|rule| rules.is_enabled(rule.name)) {
            let mut next = Vec::with_capacity(plans.len());
            for plan in plans {
                if next.len() >= self.max_plans {
                    break;
                }
                match (rule.apply)(&plan) {
                    Effect::Unchanged => next.push(plan),
                    Effect::Replace(mut rewritten) => {
                        rewritten.add_rule(rule.name);
                        next.push(rewritten);
                    }
                    Effect::Extend(variants) => {
                        next.push(plan);
                        for mut variant in variants {
                            if next.len() >= self.max_plans {
                                break;
                            }
                            variant.add_rule(rule.name);
                            next.push(variant);
                        }
                    }
                }
            }
            trace!(rule = rule.name, candidates = next.len(), "optimizer rule applied");
            plans = next;
        }

        let mut ranked: Vec<(f64, ExecutionPlan)> = plans
            .into_iter()
            .map(|plan| (plan.estimated_cost(stats), plan))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        debug!(
            candidates = ranked.len(),
            best_cost = ranked.first().map(|(cost, _)| *cost),
            "optimizer created plans"
        );
        self.plans = ranked.into_iter().map(|(_, plan)| plan).collect();
    }

    /// Ranked candidates.
    pub fn plans(&self) -> &[ExecutionPlan] {
        &self.plans
    }

    /// Takes every candidate, leaving the optimizer empty.
    pub fn take_plans(&mut self) -> Vec<ExecutionPlan> {
        std::mem::take(&mut self.plans)
    }

    /// Takes the cheapest plan and discards the rest.
    pub fn steal_best(&mut self) -> Option<ExecutionPlan> {
        let mut plans = self.take_plans().into_iter();
        plans.next()
    }
}

fn remove_unnecessary_filters(plan: &ExecutionPlan) -> Effect {
    let mut changed = false;
    let mut nodes = Vec::with_capacity(plan.nodes().len());
    for node in plan.nodes() {
        if let PlanNode::Filter { expr } = node {
            if let Some(value) = expr.constant() {
                changed = true;
                if !value.is_truthy() {
                    nodes.push(PlanNode::NoResults);
                }
                continue;
            }
        }
        nodes.push(node.clone());
    }
    if !changed {
        return Effect::Unchanged;
    }
    let mut rewritten = plan.clone();
    *rewritten.nodes_mut() = nodes;
    Effect::Replace(rewritten)
}

fn remove_unnecessary_calculations(plan: &ExecutionPlan) -> Effect {
    let mut nodes = plan.nodes().to_vec();
    let mut removed = 0;
    loop {
        let unused = nodes.iter().enumerate().rposition(|(i, node)| match node {
            PlanNode::Calculation { out, .. } => !nodes[i + 1..]
                .iter()
                .any(|later| later.variables_used().contains(out)),
            _ => false,
        });
        match unused {
            Some(index) => {
                nodes.remove(index);
                removed += 1;
            }
            None => break,
        }
    }
    if removed == 0 {
        return Effect::Unchanged;
    }
    let mut rewritten = plan.clone();
    *rewritten.nodes_mut() = nodes;
    Effect::Replace(rewritten)
}

fn interchange_adjacent_enumerations(plan: &ExecutionPlan) -> Effect {
    let nodes = plan.nodes();
    let variants: Vec<ExecutionPlan> = (0..nodes.len().saturating_sub(1))
        .filter(|&i| {
            matches!(
                (&nodes[i], &nodes[i + 1]),
                (
                    PlanNode::EnumerateCollection { .. },
                    PlanNode::EnumerateCollection { .. }
                )
            )
        })
        .map(|i| {
            let mut variant = plan.clone();
            variant.nodes_mut().swap(i, i + 1);
            variant
        })
        .collect();
    if variants.is_empty() {
        Effect::Unchanged
    } else {
        Effect::Extend(variants)
    }
}

fn move_filters_up(plan: &ExecutionPlan) -> Effect {
    let mut nodes = plan.nodes().to_vec();
    let mut changed = false;
    let mut index = 1;
    while index < nodes.len() {
        if !matches!(nodes[index], PlanNode::Filter { .. }) {
            index += 1;
            continue;
        }
        let used = nodes[index].variables_used();
        let filter_can_fail = matches!(&nodes[index], PlanNode::Filter { expr } if expr.can_fail());
        let mut target = index;
        while target > 1 && can_pass(&nodes[target - 1], &used, filter_can_fail) {
            target -= 1;
        }
        if target < index {
            let filter = nodes.remove(index);
            nodes.insert(target, filter);
            changed = true;
        }
        index += 1;
    }
    if !changed {
        return Effect::Unchanged;
    }
    let mut rewritten = plan.clone();
    *rewritten.nodes_mut() = nodes;
    Effect::Replace(rewritten)
}

/// A filter may move above `node` only if that cannot change which rows fail:
/// the node itself must not raise errors, and a filter that can raise errors
/// never moves above a loop, which may run it zero or many times.
fn can_pass(node: &PlanNode, used: &BTreeSet<ArenaStr>, filter_can_fail: bool) -> bool {
    let passable = match node {
        PlanNode::Limit { .. }
        | PlanNode::Singleton
        | PlanNode::NoResults
        | PlanNode::Return { .. }
        | PlanNode::Insert { .. } => false,
        PlanNode::Filter { expr } => !matches!(expr.constant(), Some(Value::Bool(false))),
        PlanNode::EnumerateCollection { .. } => !filter_can_fail,
        PlanNode::EnumerateList { expr, .. } => {
            !filter_can_fail && matches!(expr.constant(), Some(Value::Array(_)))
        }
        PlanNode::Calculation { expr, .. } => !expr.can_fail(),
        PlanNode::Sort { elements } => elements.iter().all(|element| !element.expr.can_fail()),
    };
    passable && node.variable_set().map_or(true, |set| !used.contains(set))
}
