/// Named counters with predicates over them, used to throttle per-backend side effects
use std::collections::HashMap;
use std::fmt;

type Condition = Box<dyn Fn(&DecisionCounters) -> bool + Send + Sync>;

/// Counters and named conditions owned by a single backend's monitor state.
///
/// Not synchronized: each instance is only touched by the task probing its
/// backend during a tick.
#[derive(Default)]
pub struct DecisionCounters {
    counters: HashMap<String, u64>,
    conditions: HashMap<String, Condition>,
}

impl DecisionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_count(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn increment_count(&mut self, name: &str) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn reset_count(&mut self, name: &str) {
        self.counters.insert(name.to_string(), 0);
    }

    /// Register (or replace) a named condition evaluated against these counters
    pub fn add_condition<F>(&mut self, name: &str, predicate: F)
    where
        F: Fn(&DecisionCounters) -> bool + Send + Sync + 'static,
    {
        self.conditions.insert(name.to_string(), Box::new(predicate));
    }

    /// Evaluate a condition. Unknown conditions are false.
    pub fn should(&self, name: &str) -> bool {
        self.conditions
            .get(name)
            .map(|predicate| predicate(self))
            .unwrap_or(false)
    }
}

impl fmt::Debug for DecisionCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut conditions: Vec<_> = self.conditions.keys().collect();
        conditions.sort();
        f.debug_struct("DecisionCounters")
            .field("counters", &self.counters)
            .field("conditions", &conditions)
            .finish()
    }
}
