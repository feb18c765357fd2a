use std::fmt;
use std::time::Instant;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Phases a query moves through, in order.
///
/// A query only ever moves forward through this sequence; `Ord` follows the
/// declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecyclePhase {
    /// Constructed, nothing run yet.
    Initialization,
    /// Parsing text and injecting bind parameters.
    Parsing,
    /// Rewriting the AST.
    AstOptimization,
    /// Building the logical plan.
    PlanInstantiation,
    /// Cost-based optimization.
    PlanOptimization,
    /// Engine set up or running.
    Execution,
    /// Results assembled.
    Finalization,
}

impl LifecyclePhase {
    /// Every phase in order.
    pub const ALL: [LifecyclePhase; 7] = [
        LifecyclePhase::Initialization,
        LifecyclePhase::Parsing,
        LifecyclePhase::AstOptimization,
        LifecyclePhase::PlanInstantiation,
        LifecyclePhase::PlanOptimization,
        LifecyclePhase::Execution,
        LifecyclePhase::Finalization,
    ];

    /// Human-readable phase name used in messages and profiles.
    pub fn name(self) -> &'static str {
        match self {
            LifecyclePhase::Initialization => "initialization",
            LifecyclePhase::Parsing => "parsing",
            LifecyclePhase::AstOptimization => "ast optimization",
            LifecyclePhase::PlanInstantiation => "plan instantiation",
            LifecyclePhase::PlanOptimization => "plan optimization",
            LifecyclePhase::Execution => "execution",
            LifecyclePhase::Finalization => "finalization",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wall-clock time spent per phase.
#[derive(Debug)]
pub struct Profile {
    entries: Vec<(LifecyclePhase, f64)>,
    stamp: Instant,
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile {
    /// Starts the clock.
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(LifecyclePhase::ALL.len()),
            stamp: Instant::now(),
        }
    }

    /// Records the time since the last call under `leaving`, then restarts
    /// the clock. With `None` (no phase entered yet) only the clock restarts.
    /// Time spent in a phase entered more than once accumulates in a single
    /// entry.
    pub fn enter(&mut self, leaving: Option<LifecyclePhase>) {
        let now = Instant::now();
        if let Some(phase) = leaving {
            let secs = now.duration_since(self.stamp).as_secs_f64();
            match self.entries.iter_mut().find(|(recorded, _)| *recorded == phase) {
                Some((_, total)) => *total += secs,
                None => self.entries.push((phase, secs)),
            }
        }
        self.stamp = now;
    }

    /// Recorded `(phase, seconds)` pairs, in recording order.
    pub fn entries(&self) -> &[(LifecyclePhase, f64)] {
        &self.entries
    }

    /// Sum of all recorded durations.
    pub fn total(&self) -> f64 {
        self.entries.iter().map(|(_, secs)| secs).sum()
    }

    /// Snapshot suitable for attaching to a result.
    pub fn report(&self) -> ProfileReport {
        ProfileReport(self.entries.clone())
    }
}

/// Phase-duration map attached to results. Serializes as a JSON object whose
/// keys are phase names in the order they were recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileReport(pub Vec<(LifecyclePhase, f64)>);

impl ProfileReport {
    /// Seconds recorded for `phase`, if any.
    pub fn get(&self, phase: LifecyclePhase) -> Option<f64> {
        self.0
            .iter()
            .find(|(recorded, _)| *recorded == phase)
            .map(|(_, secs)| *secs)
    }
}

impl Serialize for ProfileReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (phase, secs) in &self.0 {
            map.serialize_entry(phase.name(), secs)?;
        }
        map.end()
    }
}
