//! Process-local operation and error counters.
//!
//! Counters are labeled by component and, for errors, by classification
//! code. They feed the end-of-run debug summary and the integration tests;
//! nothing here is exported off-process.

use std::collections::BTreeMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::pipeline::error::ErrorCode;

static OPS: Lazy<Mutex<BTreeMap<(String, String), u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));
static ERRORS: Lazy<Mutex<BTreeMap<(String, String), u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

pub fn inc_op(component: &str, outcome: &str) {
    let mut ops = OPS.lock().expect("metrics mutex poisoned");
    *ops.entry((component.to_string(), outcome.to_string())).or_insert(0) += 1;
}

pub fn inc_error(component: &str, code: ErrorCode) {
    let mut errors = ERRORS.lock().expect("metrics mutex poisoned");
    *errors
        .entry((component.to_string(), code.as_ref().to_string()))
        .or_insert(0) += 1;
}

/// Copy of all error counters, keyed by `(component, code)`.
pub fn error_snapshot() -> BTreeMap<(String, String), u64> {
    ERRORS.lock().expect("metrics mutex poisoned").clone()
}

/// Copy of all operation counters, keyed by `(component, outcome)`.
pub fn op_snapshot() -> BTreeMap<(String, String), u64> {
    OPS.lock().expect("metrics mutex poisoned").clone()
}

/// Emits all counters at debug level; called once at run end.
pub fn log_summary() {
    for ((component, outcome), count) in op_snapshot() {
        tracing::debug!(component, outcome, count, "op counter");
    }
    for ((component, code), count) in error_snapshot() {
        tracing::debug!(component, code, count, "error counter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        inc_op("metrics_test", "finish");
        inc_op("metrics_test", "finish");
        inc_error("metrics_test", ErrorCode::Network);

        let ops = op_snapshot();
        assert_eq!(ops[&("metrics_test".to_string(), "finish".to_string())], 2);
        let errors = error_snapshot();
        assert_eq!(errors[&("metrics_test".to_string(), "network".to_string())], 1);
    }
}
