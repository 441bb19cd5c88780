//! Opt-in experiment flags gating alternate code paths.
//!
//! The catalog is closed: toggles for names outside it are rejected.
//! All flags default to off and are reset wholesale when the connection
//! is disabled.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use crate::error::BrokerError;

/// The closed experiment catalog.
pub const AVAILABLE_EXPERIMENTS: [&str; 5] = [
    "page_diffing",
    "smart_waiting",
    "storage_inspection",
    "mouse_humanization",
    "secure_eval",
];

/// Process-global registry of experiment states.
///
/// Mutations funnel through the `experimental_features` tool handler,
/// but the registry is read from every tool path, so access is fenced
/// with a mutex rather than relying on task discipline.
pub struct ExperimentRegistry {
    states: Mutex<BTreeMap<&'static str, bool>>,
}

impl ExperimentRegistry {
    fn new() -> Self {
        let states = AVAILABLE_EXPERIMENTS.iter().map(|name| (*name, false));
        Self {
            states: Mutex::new(states.collect()),
        }
    }

    fn catalog_key(name: &str) -> Option<&'static str> {
        AVAILABLE_EXPERIMENTS
            .iter()
            .find(|known| **known == name)
            .copied()
    }

    /// Turn an experiment on.
    ///
    /// # Errors
    ///
    /// `UnknownExperiment` for names outside the catalog.
    pub fn enable(&self, name: &str) -> Result<(), BrokerError> {
        self.set(name, true)
    }

    /// Turn an experiment off.
    ///
    /// # Errors
    ///
    /// `UnknownExperiment` for names outside the catalog.
    pub fn disable(&self, name: &str) -> Result<(), BrokerError> {
        self.set(name, false)
    }

    fn set(&self, name: &str, value: bool) -> Result<(), BrokerError> {
        let key = Self::catalog_key(name)
            .ok_or_else(|| BrokerError::UnknownExperiment(name.to_owned()))?;
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.insert(key, value);
        Ok(())
    }

    /// Whether a named experiment is on. Unknown names read as off.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        let states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.get(name).copied().unwrap_or(false)
    }

    /// The catalog, in stable order.
    #[must_use]
    pub fn list_available(&self) -> Vec<&'static str> {
        AVAILABLE_EXPERIMENTS.to_vec()
    }

    /// Snapshot of every experiment's state, in stable order.
    #[must_use]
    pub fn get_states(&self) -> Vec<(&'static str, bool)> {
        let states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.iter().map(|(name, on)| (*name, *on)).collect()
    }

    /// Reset every experiment to off. Called on `disable` and test
    /// teardown.
    pub fn reset(&self) {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for value in states.values_mut() {
            *value = false;
        }
    }
}

/// The process-wide registry.
pub fn registry() -> &'static ExperimentRegistry {
    static REGISTRY: OnceLock<ExperimentRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ExperimentRegistry::new)
}

/// Check the startup allow-list for experiments that gate infrastructure
/// choices (e.g. the connection multiplexer) rather than runtime
/// behavior. These are not part of the runtime catalog.
#[must_use]
pub fn is_infra_enabled(name: &str, allow_list: &[String]) -> bool {
    allow_list.iter().any(|entry| entry == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests share the process-global registry; each builds a private
    // instance instead to stay independent.

    #[test]
    fn defaults_are_off() {
        let reg = ExperimentRegistry::new();
        for name in AVAILABLE_EXPERIMENTS {
            assert!(!reg.is_enabled(name), "{name} should default off");
        }
    }

    #[test]
    fn enable_disable_roundtrip() {
        let reg = ExperimentRegistry::new();
        reg.enable("page_diffing").unwrap();
        assert!(reg.is_enabled("page_diffing"));
        reg.disable("page_diffing").unwrap();
        assert!(!reg.is_enabled("page_diffing"));
    }

    #[test]
    fn unknown_names_rejected() {
        let reg = ExperimentRegistry::new();
        let err = reg.enable("time_travel").unwrap_err();
        assert!(matches!(err, BrokerError::UnknownExperiment(name) if name == "time_travel"));
        assert!(reg.disable("time_travel").is_err());
    }

    #[test]
    fn unknown_names_read_as_off() {
        let reg = ExperimentRegistry::new();
        assert!(!reg.is_enabled("time_travel"));
    }

    #[test]
    fn reset_clears_all() {
        let reg = ExperimentRegistry::new();
        reg.enable("secure_eval").unwrap();
        reg.enable("mouse_humanization").unwrap();
        reg.reset();
        assert!(reg.get_states().iter().all(|(_, on)| !on));
    }

    #[test]
    fn states_cover_catalog() {
        let reg = ExperimentRegistry::new();
        let states = reg.get_states();
        assert_eq!(states.len(), AVAILABLE_EXPERIMENTS.len());
        for name in AVAILABLE_EXPERIMENTS {
            assert!(states.iter().any(|(n, _)| *n == name));
        }
    }

    #[test]
    fn infra_allow_list() {
        let allow = vec!["multiplexer".to_owned()];
        assert!(is_infra_enabled("multiplexer", &allow));
        assert!(!is_infra_enabled("page_diffing", &allow));
        assert!(!is_infra_enabled("multiplexer", &[]));
    }
}
