use std::sync::{Arc, RwLock};

/// Tunables for the placement engine (§3, §4.5, §9).
///
/// Defaults match the reference implementation: `R = 4`, `K = 3`, `alpha =
/// 0.5`. `can_fit` and `too_many_starting` default to `false` — the
/// over-commit and in-flight-start checks are opt-in. This is almost
/// certainly the wrong default for a production cluster (§9 Open Question),
/// so `from_env` logs a warning whenever `can_fit` stays disabled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementConfig {
    pub r: f64,
    pub alpha: f64,
    pub k: usize,
    pub can_fit: bool,
    pub too_many_starting: bool,
    pub max_starting_instances_per_node: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            r: 4.0,
            alpha: 0.5,
            k: 3,
            can_fit: false,
            too_many_starting: false,
            max_starting_instances_per_node: 3,
        }
    }
}

impl PlacementConfig {
    pub fn from_env() -> Self {
        let config = Self {
            r: std::env::var("SANDBOX_PLACEMENT_R")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4.0),
            alpha: std::env::var("SANDBOX_PLACEMENT_ALPHA")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.5),
            k: std::env::var("SANDBOX_PLACEMENT_K")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            can_fit: std::env::var("SANDBOX_PLACEMENT_CAN_FIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
            too_many_starting: std::env::var("SANDBOX_PLACEMENT_TOO_MANY_STARTING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
            max_starting_instances_per_node: std::env::var("SANDBOX_PLACEMENT_MAX_STARTING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        };

        if !config.can_fit {
            tracing::warn!(
                "placement started with can_fit disabled: nodes will be picked without an \
                 over-commit check; set SANDBOX_PLACEMENT_CAN_FIT=true for production clusters"
            );
        }

        config
    }
}

/// Read-copy-update handle around a `PlacementConfig`.
///
/// A placement call takes one snapshot at entry (`current()`); config
/// updates made mid-call are only observed by the *next* call, matching
/// §3's "current snapshot read once per placement call" guarantee and §9's
/// "updates are applied atomically under a writer lock" note.
#[derive(Clone)]
pub struct PlacementConfigHandle {
    inner: Arc<RwLock<PlacementConfig>>,
}

impl PlacementConfigHandle {
    pub fn new(config: PlacementConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn current(&self) -> PlacementConfig {
        *self.inner.read().expect("placement config lock poisoned")
    }

    pub fn update(&self, config: PlacementConfig) {
        *self.inner.write().expect("placement config lock poisoned") = config;
    }
}
