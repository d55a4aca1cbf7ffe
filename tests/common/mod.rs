//! Shared test helpers for integration tests

use mercury::config::{Capacities, HostContext, RuntimeConfig};
use mercury::promise::{PromiseRegistry, ReactionOptions};
use mercury::{Runtime, Value};
use std::cell::RefCell;
use std::rc::Rc;

#[allow(dead_code)]
/// Registry with explicit capacities and a default host
pub fn registry(promises: usize, reactions: usize) -> PromiseRegistry {
    PromiseRegistry::with_capacities(
        HostContext::default(),
        Capacities {
            promise_capacity: promises,
            reaction_capacity: reactions,
            ..Capacities::default()
        },
    )
}

/// Runtime whose microtask drain is limited to `budget` per tick
#[allow(dead_code)]
pub fn runtime_with_budget(budget: usize) -> Runtime {
    let config = RuntimeConfig {
        microtask_budget: budget,
        ..RuntimeConfig::default()
    };
    Runtime::new(config, HostContext::default()).expect("default host resolves")
}

/// Shared log that callbacks append to
pub type Log = Rc<RefCell<Vec<String>>>;

#[allow(dead_code)]
pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Reaction that records `name` and passes the value through
#[allow(dead_code)]
pub fn recording(log: &Log, name: &str) -> ReactionOptions {
    let log = Rc::clone(log);
    let name = name.to_string();
    ReactionOptions::new().label(name.clone()).on_fulfilled(move |input| {
        log.borrow_mut().push(name);
        Ok(input.value().clone())
    })
}

/// Reaction that adds one to a numeric value
#[allow(dead_code)]
pub fn increment() -> ReactionOptions {
    ReactionOptions::new()
        .on_fulfilled(|input| Ok(Value::from(input.value().as_number().unwrap_or(0.0) + 1.0)))
}
