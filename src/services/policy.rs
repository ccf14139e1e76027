//! Crash classification.
//!
//! A crash triggers a delayed restart only when the service's metadata and
//! the global switch both allow it and the root cause is not one of the
//! codes known to fail again on retry (bad config, device init failures).

use std::collections::HashSet;
use std::time::Duration;

use crate::types::{ErrorReport, SupervisorConfig};

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    auto_reload: bool,
    ignored: HashSet<String>,
    delay: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            auto_reload: config.auto_reload,
            ignored: config.ignore_auto_reload_errors.iter().cloned().collect(),
            delay: config.restart_delay,
        }
    }

    /// Whether the crash described by `report` may be retried.
    ///
    /// `report` is the wrapped failure; its first nested error is the root cause.
    pub fn evaluate(&self, meta_allows: bool, report: &ErrorReport) -> bool {
        if !(meta_allows && self.auto_reload) {
            return false;
        }
        match report.root_code() {
            Some(code) => !self.ignored.contains(code),
            None => true,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn crash(root: &str) -> ErrorReport {
        ErrorReport::worker_internal(ErrorReport::new(root, "root cause"))
    }

    #[test]
    fn test_default_policy() {
        let policy = RestartPolicy::from_config(&SupervisorConfig::default());
        assert!(policy.evaluate(true, &crash("SOCKET_TIMEOUT")));
        assert!(!policy.evaluate(true, &crash("CTR_CONF_EXTENDS_PROBLEM")));
        assert!(!policy.evaluate(false, &crash("SOCKET_TIMEOUT")));
        assert_eq!(policy.delay(), Duration::from_millis(5000));
    }

    #[test]
    fn test_global_switch_off() {
        let config = SupervisorConfig {
            auto_reload: false,
            ..SupervisorConfig::default()
        };
        let policy = RestartPolicy::from_config(&config);
        assert!(!policy.evaluate(true, &crash("SOCKET_TIMEOUT")));
    }

    #[test]
    fn test_only_root_cause_is_inspected() {
        let policy = RestartPolicy::from_config(&SupervisorConfig::default());
        // An ignored code deeper than the first nested error does not count.
        let report = ErrorReport::worker_internal(
            ErrorReport::new("SOCKET_TIMEOUT", "io").with_nested(ErrorReport::new(
                "CTR_ERROR_INIT_DEVICE",
                "device",
            )),
        );
        assert!(policy.evaluate(true, &report));
        assert!(policy.evaluate(true, &ErrorReport::new("WORKER_INTERNAL_ERROR", "bare")));
    }

    proptest! {
        #[test]
        fn prop_reload_iff_allowed_and_not_ignored(
            meta in any::<bool>(),
            global in any::<bool>(),
            code in prop_oneof![
                Just("CTR_ERROR_INIT_DEVICE".to_string()),
                Just("CTR_IGNORE_SERVICE_AUTORELOAD".to_string()),
                "[A-Z_]{3,12}",
            ],
        ) {
            let config = SupervisorConfig { auto_reload: global, ..SupervisorConfig::default() };
            let ignored = config.ignore_auto_reload_errors.contains(&code);
            let policy = RestartPolicy::from_config(&config);
            prop_assert_eq!(policy.evaluate(meta, &crash(&code)), meta && global && !ignored);
        }
    }
}
