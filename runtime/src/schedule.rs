//! Unit schedules.
//!
//! A schedule is a DAG of execution units, each pinned to a stream. Units are
//! issued in a topological order of the dependency graph; dependencies that cross
//! streams become event waits at issue time, same-stream dependencies are already
//! ordered by the stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use snafu::ensure;

use crate::error::{InvalidProgramSnafu, Result};
use crate::unit::ExecutionUnit;

/// A unit with its stream assignment and the units it must run after.
#[derive(Clone)]
pub struct ScheduledUnit {
    pub unit: Arc<dyn ExecutionUnit>,
    /// Stream number; 0 is the caller's stream.
    pub stream: usize,
    /// Positions of units in the schedule that must complete first.
    pub depends_on: Vec<usize>,
}

impl ScheduledUnit {
    pub fn new(unit: impl ExecutionUnit + 'static) -> Self {
        Self { unit: Arc::new(unit), stream: 0, depends_on: Vec::new() }
    }

    pub fn on_stream(mut self, stream: usize) -> Self {
        self.stream = stream;
        self
    }

    pub fn after(mut self, dependencies: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on.extend(dependencies);
        self
    }
}

impl fmt::Debug for ScheduledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledUnit")
            .field("unit", &self.unit.name())
            .field("stream", &self.stream)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Validated, topologically ordered unit schedule.
#[derive(Debug, Clone)]
pub struct UnitSchedule {
    units: Vec<ScheduledUnit>,
    /// Issue order (positions into `units`).
    order: Vec<usize>,
    /// Whether a unit on another stream waits for the unit at each position.
    signals: Vec<bool>,
    /// Longest dependency chain ending at each position, starting at 0.
    levels: Vec<usize>,
    stream_count: usize,
}

impl UnitSchedule {
    /// Validate `units` and compute their issue order.
    ///
    /// Units become ready once all their dependencies are issued; among ready
    /// units the one declared first is issued first, so a schedule that is
    /// already in dependency order keeps its order.
    pub fn new(units: Vec<ScheduledUnit>) -> Result<Self> {
        let count = units.len();
        let mut in_degree = vec![0usize; count];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];

        for (id, scheduled) in units.iter().enumerate() {
            for &dependency in &scheduled.depends_on {
                ensure!(
                    dependency < count,
                    InvalidProgramSnafu {
                        reason: format!(
                            "unit {id} ('{}') depends on unit {dependency}, schedule has {count}",
                            scheduled.unit.name()
                        )
                    }
                );
                successors[dependency].push(id);
                in_degree[id] += 1;
            }
        }

        // Kahn's algorithm, smallest position first.
        let mut ready: BinaryHeap<Reverse<usize>> =
            in_degree.iter().enumerate().filter(|&(_, &degree)| degree == 0).map(|(id, _)| Reverse(id)).collect();
        let mut order = Vec::with_capacity(count);
        let mut levels = vec![0usize; count];

        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for &successor in &successors[id] {
                levels[successor] = levels[successor].max(levels[id] + 1);
                in_degree[successor] -= 1;
                if in_degree[successor] == 0 {
                    ready.push(Reverse(successor));
                }
            }
        }

        ensure!(
            order.len() == count,
            InvalidProgramSnafu {
                reason: format!("unit schedule has a dependency cycle through {} units", count - order.len())
            }
        );

        let signals = (0..count)
            .map(|id| successors[id].iter().any(|&successor| units[successor].stream != units[id].stream))
            .collect();
        let stream_count = units.iter().map(|scheduled| scheduled.stream + 1).max().unwrap_or(1);

        Ok(Self { units, order, signals, levels, stream_count })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[ScheduledUnit] {
        &self.units
    }

    pub fn unit(&self, id: usize) -> Option<&ScheduledUnit> {
        self.units.get(id)
    }

    /// Positions of units in issue order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Number of streams the schedule uses, at least 1.
    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// Whether unit `id` must record a completion event for another stream.
    pub fn needs_event(&self, id: usize) -> bool {
        self.signals.get(id).copied().unwrap_or(false)
    }

    /// Length of the longest dependency chain.
    pub fn depth(&self) -> usize {
        self.levels.iter().max().map_or(0, |level| level + 1)
    }

    /// Units grouped by dependency level; units within a group are independent.
    pub fn parallel_groups(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.depth()];
        for &id in &self.order {
            groups[self.levels[id]].push(id);
        }
        groups
    }
}
