//! Rule registry and pattern matching
//!
//! Rules bind a URL pattern (plus an optional attribute filter and predicate)
//! to a result handler. On completion a task is dispatched to the first rule,
//! in registration order, that matches it.

pub mod pattern;
mod registry;

pub use pattern::{glob_to_regex, pattern_for_path, Pattern};
pub use registry::{ExpandFn, Handler, Predicate, Rule, RuleContext, RuleRegistry};
