#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Rule-driven torrent retirement.
//!
//! Rules evaluate condition arrays (or a compiled expression) over live
//! torrent state, hold a per-`(downloader, rule, torrent)` duration timer
//! across restarts, and execute pause / speed-cap / delete actions in strict
//! priority order under a per-run action cap. Every evaluation failure is
//! fail-closed: a malformed rule deletes nothing.

mod condition;
mod context;
mod engine;
mod script;

pub use condition::{evaluate_condition, evaluate_rule};
pub use context::EvalContext;
pub use engine::{DeleteEngine, RuleRunReport};
pub use script::evaluate_script;

/// Mandatory hysteresis key form: rules must never share a timer.
#[must_use]
pub fn hysteresis_key(rule_id: i64, infohash: &str) -> String {
    format!("r{rule_id}:{infohash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_form_is_rule_scoped() {
        assert_eq!(hysteresis_key(7, "abcdef"), "r7:abcdef");
        assert_ne!(hysteresis_key(7, "abcdef"), hysteresis_key(8, "abcdef"));
    }
}
