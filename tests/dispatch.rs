//! Integration tests for the event pipeline.
//!
//! Ordering, fault isolation and the capability views of dispatched payloads, driven
//! through the public registry and dispatcher only.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use dotpatch::{prelude::*, Result};

fn dispatcher(registry: &Arc<EventRegistry>, config: DispatchConfig) -> (Dispatcher, Arc<Diagnostics>) {
    let diagnostics = Arc::new(Diagnostics::new());
    (
        Dispatcher::new(Arc::clone(registry), Arc::clone(&diagnostics), config),
        diagnostics,
    )
}

fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str, priority: i32) -> Subscriber {
    let log = Arc::clone(log);
    let tag = name.to_string();
    Subscriber::new(name, Priority(priority), move |_| {
        log.lock().unwrap().push(tag.clone());
        Ok(())
    })
}

/// Subscribers run by ascending priority, equal priorities in registration order.
#[test]
fn priority_order_with_stable_ties() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    registry.register(EventKind::RESERVED_SLOT, recorder(&log, "ten", 10));
    registry.register(EventKind::RESERVED_SLOT, recorder(&log, "five-a", 5));
    registry.register(EventKind::RESERVED_SLOT, recorder(&log, "five-b", 5));

    let (dispatcher, _) = dispatcher(&registry, DispatchConfig::default());
    let mut state = ReservedSlotCheck::new(true, "a@steam");
    let outcome = dispatcher.dispatch_dyn(&EventKind::RESERVED_SLOT, &mut state);

    assert!(outcome.is_clean());
    assert_eq!(outcome.invoked, 3);
    assert_eq!(*log.lock().unwrap(), vec!["five-a", "five-b", "ten"]);
    Ok(())
}

/// Unregistering one subscriber leaves the relative order of the others unchanged.
#[test]
fn unregister_keeps_order() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    registry.register(EventKind::DAMAGING_DOOR, recorder(&log, "late", Priority::LATE.0));
    let middle = registry.register(EventKind::DAMAGING_DOOR, recorder(&log, "normal", 0));
    registry.register(EventKind::DAMAGING_DOOR, recorder(&log, "first", Priority::FIRST.0));

    assert!(registry.unregister(&middle));
    assert!(!registry.unregister(&middle));

    let (dispatcher, _) = dispatcher(&registry, DispatchConfig::default());
    dispatcher.dispatch(
        &EventKind::DAMAGING_DOOR,
        DamagingDoor::new(3, 10.0, DoorDamageType::Grenade, None),
    );
    assert_eq!(*log.lock().unwrap(), vec!["first", "late"]);
    Ok(())
}

/// Registry changes made by a running subscriber apply from the next dispatch on.
#[test]
fn changes_during_dispatch_apply_next_time() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let victim = registry.register(EventKind::RESERVED_SLOT, recorder(&log, "victim", Priority::LATE.0));
    let pending = Mutex::new(Some(victim));
    let newcomer = recorder(&log, "newcomer", Priority::NORMAL.0);
    let newcomer = Mutex::new(Some(newcomer));
    let reentrant = Arc::clone(&registry);
    registry.register_fn(EventKind::RESERVED_SLOT, "mutator", Priority::FIRST, move |_| {
        if let Some(handle) = pending.lock().unwrap().take() {
            assert!(reentrant.unregister(&handle));
        }
        if let Some(subscriber) = newcomer.lock().unwrap().take() {
            reentrant.register(EventKind::RESERVED_SLOT, subscriber);
        }
        Ok(())
    });

    let (dispatcher, _) = dispatcher(&registry, DispatchConfig::default());
    let mut state = ReservedSlotCheck::new(true, "a@steam");

    let outcome = dispatcher.dispatch_dyn(&EventKind::RESERVED_SLOT, &mut state);
    assert!(outcome.is_clean());
    assert_eq!(outcome.invoked, 2);
    assert_eq!(*log.lock().unwrap(), vec!["victim"]);

    let outcome = dispatcher.dispatch_dyn(&EventKind::RESERVED_SLOT, &mut state);
    assert!(outcome.is_clean());
    assert_eq!(outcome.invoked, 2);
    assert_eq!(*log.lock().unwrap(), vec!["victim", "newcomer"]);
    Ok(())
}

/// Dispatches on several threads stay ordered and complete while subscribers come and go.
#[test]
fn concurrent_dispatch_with_registration_churn() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    let completed = Arc::new(AtomicUsize::new(0));

    registry.register(
        EventKind::RESERVED_SLOT,
        Subscriber::typed("deny", Priority::FIRST, |ev: &mut ReservedSlotCheck| {
            ev.deny();
            Ok(())
        }),
    );
    let seen = Arc::clone(&completed);
    registry.register(
        EventKind::RESERVED_SLOT,
        Subscriber::typed("audit", Priority::LAST, move |ev: &mut ReservedSlotCheck| {
            assert!(!ev.is_allowed());
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );

    let (dispatcher, diagnostics) = dispatcher(&registry, DispatchConfig::default());
    let churning = AtomicBool::new(true);

    std::thread::scope(|s| {
        for worker in 0..2 {
            let (registry, churning) = (&registry, &churning);
            s.spawn(move || {
                let mut round = 0;
                while churning.load(Ordering::Relaxed) || round < 50 {
                    let handle = registry.register_fn(
                        EventKind::RESERVED_SLOT,
                        format!("transient-{worker}-{round}"),
                        Priority(round % 3 * 100 - 100),
                        |_| Ok(()),
                    );
                    assert!(registry.unregister(&handle));
                    round += 1;
                }
            });
        }

        let dispatchers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = &dispatcher;
                s.spawn(move || {
                    for _ in 0..200 {
                        let ev = dispatcher
                            .dispatch(&EventKind::RESERVED_SLOT, ReservedSlotCheck::new(true, "a"));
                        assert!(!ev.is_allowed());
                    }
                })
            })
            .collect();
        for handle in dispatchers {
            handle.join().unwrap();
        }
        churning.store(false, Ordering::Relaxed);
    });

    assert_eq!(completed.load(Ordering::Relaxed), 800);
    assert_eq!(registry.len(&EventKind::RESERVED_SLOT), 2);
    assert!(!diagnostics.has_any());
    Ok(())
}

/// A faulting or panicking subscriber is recorded and skipped; later subscribers still run.
#[test]
fn faults_are_isolated() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    registry.register_fn(EventKind::SPAWNING_RAGDOLL, "fails", Priority::FIRST, |_| {
        Err(Error::Execution("lookup failed".into()))
    });
    registry.register_fn(EventKind::SPAWNING_RAGDOLL, "panics", Priority::EARLY, |_| {
        panic!("subscriber bug")
    });
    registry.register(EventKind::SPAWNING_RAGDOLL, recorder(&log, "survivor", 0));

    let (dispatcher, diagnostics) = dispatcher(&registry, DispatchConfig::default());
    let mut state = SpawningRagdoll::new("ClassD", "Falldown", None);
    let outcome = dispatcher.dispatch_dyn(&EventKind::SPAWNING_RAGDOLL, &mut state);

    assert_eq!(outcome.invoked, 3);
    assert_eq!(outcome.faults.len(), 2);
    assert!(matches!(
        &outcome.faults[1],
        Error::SubscriberFault { subscriber, message, .. }
            if subscriber == "panics" && message.contains("subscriber bug")
    ));
    assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    assert_eq!(diagnostics.by_category(DiagnosticCategory::Subscriber).len(), 2);
    Ok(())
}

/// Denial is a flag, not a stop: later subscribers observe it and may re-allow.
#[test]
fn denial_does_not_short_circuit() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    let observed = Arc::new(Mutex::new(None));

    registry.register(
        EventKind::RESERVED_SLOT,
        Subscriber::typed("deny", Priority::EARLY, |ev: &mut ReservedSlotCheck| {
            ev.deny();
            Ok(())
        }),
    );
    let seen = Arc::clone(&observed);
    registry.register(
        EventKind::RESERVED_SLOT,
        Subscriber::typed("override", Priority::LATE, move |ev: &mut ReservedSlotCheck| {
            *seen.lock().unwrap() = Some(ev.is_allowed());
            if &*ev.user_id == "admin" {
                ev.set_allowed(true);
            }
            Ok(())
        }),
    );

    let (dispatcher, _) = dispatcher(&registry, DispatchConfig::default());

    let ev = dispatcher.dispatch(&EventKind::RESERVED_SLOT, ReservedSlotCheck::new(true, "admin"));
    assert!(ev.is_allowed());
    assert_eq!(*observed.lock().unwrap(), Some(false));

    let ev = dispatcher.dispatch(&EventKind::RESERVED_SLOT, ReservedSlotCheck::new(true, "guest"));
    assert!(!ev.is_allowed());
    Ok(())
}

/// A typed subscriber handed the wrong payload faults instead of misreading it.
#[test]
fn typed_subscriber_rejects_other_payloads() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    registry.register(
        EventKind::new("custom.kind"),
        Subscriber::typed("door-only", Priority::NORMAL, |ev: &mut DamagingDoor| {
            ev.set_damage(0.0);
            Ok(())
        }),
    );

    let (dispatcher, _) = dispatcher(&registry, DispatchConfig::default());
    let mut state = ReservedSlotCheck::new(false, "x");
    let outcome = dispatcher.dispatch_dyn(&EventKind::new("custom.kind"), &mut state);

    assert_eq!(outcome.faults.len(), 1);
    assert!(outcome.faults[0].to_string().contains("door-only"));
    Ok(())
}

/// The type-erased views expose decision, actor and parameters.
#[test]
fn capability_views() -> Result<()> {
    let actor = Actor::shared(7, "Dr. Bright", "76561198000000000@steam");
    let mut door = DamagingDoor::new(12, 25.0, DoorDamageType::Scp096, Some(Arc::clone(&actor)));
    let state: &mut dyn EventState = &mut door;

    assert!(state.capabilities().contains(Capabilities::DENIABLE));
    assert!(state.capabilities().contains(Capabilities::ACTOR_BOUND));
    assert!(state.capabilities().contains(Capabilities::MUTABLE_PARAMETERS));
    assert_eq!(state.is_allowed(), Some(true));
    assert_eq!(state.actor().map(|a| a.id), Some(7));
    assert_eq!(state.parameter(DamagingDoor::DAMAGE), Some(ParamValue::Float(25.0)));

    let slot: &dyn EventState = &ReservedSlotCheck::new(true, "x");
    assert!(slot.actor().is_none());
    assert!(slot.parameter("damage").is_none());
    Ok(())
}

/// Dispatch with no subscribers returns the payload untouched.
#[test]
fn empty_kind_is_a_no_op() -> Result<()> {
    let registry = Arc::new(EventRegistry::new());
    let (dispatcher, diagnostics) = dispatcher(&registry, DispatchConfig::default());

    let ev = dispatcher.dispatch(
        &EventKind::DAMAGING_DOOR,
        DamagingDoor::new(1, 5.0, DoorDamageType::Weapon, None),
    );
    assert!((ev.damage() - 5.0).abs() < f32::EPSILON);
    assert!(!diagnostics.has_any());
    Ok(())
}
