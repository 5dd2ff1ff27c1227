/// Per-backend health state machine driven by probe outcomes
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Edge crossed by an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameHealthy,
    BecameUnhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthStateMachine {
    state: HealthState,
}

impl HealthStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Record a probe result, returning the transition it caused if any.
    /// Leaving `Unknown` always counts as a transition.
    pub fn observe(&mut self, healthy: bool) -> Option<Transition> {
        let next = if healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        if next == self.state {
            return None;
        }

        self.state = next;
        Some(if healthy {
            Transition::BecameHealthy
        } else {
            Transition::BecameUnhealthy
        })
    }
}
