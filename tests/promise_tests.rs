//! Integration tests for the promise registry and microtask scheduler

mod common;
use common::{increment, log, recording, registry, runtime_with_budget};
use mercury::promise::{PromiseState, ReactionOptions, Rejection};
use mercury::{Status, Value};

mod settlement {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_double_resolve_is_invalid() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("once").unwrap();
        assert!(reg.resolve(p, Value::from(1), "").is_ok());

        let err = reg.resolve(p, Value::from(2), "").unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        assert_eq!(reg.snapshot(p).unwrap().value, Value::from(1));
    }

    #[test]
    fn test_cancel_after_fulfill_is_noop() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("done").unwrap();
        reg.fulfill(p, Value::from("ok")).unwrap();

        assert!(!reg.cancel(p).unwrap());
        assert_eq!(reg.state(p).unwrap(), PromiseState::Fulfilled);
        assert_eq!(reg.stats().promises_cancelled, 0);
    }

    #[test]
    fn test_reject_requires_diagnostics() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let err = reg.reject(p, "", Value::Undefined).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        assert!(reg.is_pending(p));
    }

    #[test]
    fn test_cancel_rejects_derived_with_cancelled() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let derived = reg.then(p, increment()).unwrap();
        assert!(reg.cancel(p).unwrap());
        reg.process_microtasks(8);

        let snapshot = reg.snapshot(derived).unwrap();
        assert_eq!(snapshot.state, PromiseState::Rejected);
        assert_eq!(snapshot.diagnostics, "cancelled");
    }
}

mod reactions {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reactions_run_in_attachment_order() {
        let mut reg = registry(16, 16);
        let events = log();
        let p = reg.create_promise("source").unwrap();
        for name in ["first", "second", "third"] {
            reg.then(p, recording(&events, name)).unwrap();
        }
        reg.resolve(p, Value::Null, "").unwrap();
        assert!(events.borrow().is_empty());

        reg.process_microtasks(16);
        assert_eq!(*events.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_reactions_of_different_promises_follow_settlement_order() {
        let mut reg = registry(16, 16);
        let events = log();
        let p = reg.create_promise("p").unwrap();
        let q = reg.create_promise("q").unwrap();
        reg.then(p, recording(&events, "p1")).unwrap();
        reg.then(q, recording(&events, "q1")).unwrap();
        reg.then(p, recording(&events, "p2")).unwrap();
        reg.then(q, recording(&events, "q2")).unwrap();

        reg.resolve(q, Value::Null, "").unwrap();
        reg.resolve(p, Value::Null, "").unwrap();
        reg.process_microtasks(16);
        assert_eq!(*events.borrow(), vec!["q1", "q2", "p1", "p2"]);
    }

    #[test]
    fn test_identity_then_round_trip() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let derived = reg
            .then(p, ReactionOptions::new().on_fulfilled(|input| Ok(input.value().clone())))
            .unwrap();
        let payload = Value::Array(vec![Value::from(1), Value::from("two"), Value::Null]);
        reg.resolve(p, payload.clone(), "").unwrap();
        reg.process_microtasks(8);

        assert_eq!(reg.snapshot(derived).unwrap().value, payload);
    }

    #[test]
    fn test_then_on_settled_source_still_defers() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        reg.fulfill(p, Value::from(1)).unwrap();
        let derived = reg.then(p, increment()).unwrap();

        assert!(reg.is_pending(derived));
        assert_eq!(reg.pending_microtasks(), 1);
        reg.process_microtasks(1);
        assert_eq!(reg.snapshot(derived).unwrap().value, Value::from(2));
    }

    #[test]
    fn test_catch_recovers() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let recovered = reg
            .catch(p, "fallback", |input| {
                Ok(Value::from(format!("recovered from {}", input.diagnostics())))
            })
            .unwrap();
        reg.reject(p, "disk full", Value::Undefined).unwrap();
        reg.process_microtasks(8);

        let snapshot = reg.snapshot(recovered).unwrap();
        assert_eq!(snapshot.state, PromiseState::Fulfilled);
        assert_eq!(snapshot.value, Value::from("recovered from disk full"));
    }

    #[test]
    fn test_callback_rejection_carries_value() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let derived = reg
            .then(
                p,
                ReactionOptions::new().on_fulfilled(|_| {
                    Err(Rejection::new("validation failed").with_value(Value::from(422)))
                }),
            )
            .unwrap();
        reg.fulfill(p, Value::Undefined).unwrap();
        reg.process_microtasks(8);

        let snapshot = reg.snapshot(derived).unwrap();
        assert_eq!(snapshot.state, PromiseState::Rejected);
        assert_eq!(snapshot.diagnostics, "validation failed");
        assert_eq!(snapshot.value, Value::from(422));
    }

    #[test]
    fn test_user_data_is_passed_back() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let derived = reg
            .then(
                p,
                ReactionOptions::new()
                    .user_data(0xfeed)
                    .on_fulfilled(|input| Ok(Value::from(input.user_data as f64))),
            )
            .unwrap();
        reg.fulfill(p, Value::Undefined).unwrap();
        reg.process_microtasks(8);
        assert_eq!(reg.snapshot(derived).unwrap().value, Value::from(0xfeed as f64));
    }
}

mod capacity {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_third_promise_overflows() {
        let mut reg = registry(2, 8);
        reg.create_promise("a").unwrap();
        reg.create_promise("b").unwrap();

        let err = reg.create_promise("c").unwrap_err();
        assert_eq!(err.status(), Status::CapacityExceeded);
        assert_eq!(reg.stats().promise_overflow, 1);
        assert_eq!(reg.live_promises(), 2);
    }

    #[test]
    fn test_release_then_resolve_is_not_found() {
        let mut reg = registry(2, 8);
        let old = reg.create_promise("old").unwrap();
        reg.release(old).unwrap();

        let err = reg.resolve(old, Value::from(1), "").unwrap_err();
        assert_eq!(err.status(), Status::NotFound);

        let fresh = reg.create_promise("fresh").unwrap();
        assert_ne!(fresh, old);
        assert_eq!(fresh.handle().index(), old.handle().index());
        reg.resolve(fresh, Value::from(2), "").unwrap();
        assert_eq!(reg.state(old).unwrap_err().status(), Status::NotFound);
        assert_eq!(reg.state(fresh).unwrap(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_released_sources_orphan_queued_reactions() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let derived = reg.then(p, increment()).unwrap();
        reg.fulfill(p, Value::from(1)).unwrap();
        reg.release(p).unwrap();

        let report = reg.process_microtasks(8);
        assert_eq!(report.orphaned, 1);
        assert!(reg.is_pending(derived));
        assert_eq!(reg.live_reactions(), 0);
    }
}

mod scheduling {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_chain_of_ten_with_budget_three() {
        let mut rt = runtime_with_budget(3);
        let promises = rt.promises_mut();
        let head = promises.create_promise("head").unwrap();
        let mut links = Vec::new();
        let mut tail = head;
        for _ in 0..10 {
            tail = promises.then(tail, increment()).unwrap();
            links.push(tail);
        }
        promises.resolve(head, Value::from(0), "").unwrap();

        let pending = |rt: &mercury::Runtime| {
            links
                .iter()
                .filter(|link| rt.promises().is_pending(**link))
                .count()
        };

        let first = rt.tick(1, 0.016).unwrap();
        assert_eq!(first.microtasks.processed, 3);
        assert_eq!(pending(&rt), 7);

        let mut frames = 1;
        while pending(&rt) > 0 {
            frames += 1;
            rt.tick(frames, 0.016).unwrap();
            assert!(frames < 10, "chain stalled");
        }
        assert_eq!(frames, 4);
        assert_eq!(rt.promises().snapshot(tail).unwrap().value, Value::from(10));
    }

    #[test]
    fn test_unhandled_rejection_reported_once() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("lonely").unwrap();
        reg.reject(p, "nobody listens", Value::Undefined).unwrap();

        let unhandled = reg.drain_unhandled_rejections();
        assert_eq!(unhandled.len(), 1);
        assert_eq!(unhandled[0].promise, p);
        assert_eq!(unhandled[0].diagnostics, "nobody listens");
        assert!(reg.drain_unhandled_rejections().is_empty());
    }

    #[test]
    fn test_panicking_callback_only_rejects_its_derived() {
        let mut reg = registry(8, 8);
        let p = reg.create_promise("").unwrap();
        let bad = reg
            .then(p, ReactionOptions::new().on_fulfilled(|_| panic!("callback bug")))
            .unwrap();
        let good = reg.then(p, increment()).unwrap();
        reg.fulfill(p, Value::from(1)).unwrap();
        reg.process_microtasks(8);

        assert_eq!(reg.state(bad).unwrap(), PromiseState::Rejected);
        assert!(reg.snapshot(bad).unwrap().diagnostics.contains("callback bug"));
        assert_eq!(reg.snapshot(good).unwrap().value, Value::from(2));
        assert_eq!(reg.stats().callback_panics, 1);
    }
}
