//! Benchmarks for event dispatch.
//!
//! Measures the per-call cost of the dispatch engine and of a patched call site:
//! - Dispatch with no subscribers
//! - Dispatch through a chain of typed subscribers
//! - Dispatch with a faulting subscriber in the chain
//! - A full patched call site executed by the interpreter

extern crate dotpatch;

use criterion::{criterion_group, criterion_main, Criterion};
use dotpatch::prelude::*;
use std::{hint::black_box, sync::Arc};

fn dispatcher(registry: Arc<EventRegistry>) -> Dispatcher {
    Dispatcher::new(registry, Arc::new(Diagnostics::new()), DispatchConfig::default())
}

/// Benchmark dispatching an event nobody subscribed to.
fn bench_dispatch_empty(c: &mut Criterion) {
    let dispatcher = dispatcher(Arc::new(EventRegistry::new()));

    c.bench_function("dispatch_empty", |b| {
        b.iter(|| {
            let ev = dispatcher.dispatch(
                black_box(&EventKind::RESERVED_SLOT),
                ReservedSlotCheck::new(true, "a@steam"),
            );
            black_box(ev)
        });
    });
}

/// Benchmark dispatching through 16 typed subscribers at mixed priorities.
fn bench_dispatch_chain(c: &mut Criterion) {
    let registry = Arc::new(EventRegistry::new());
    for i in 0..16 {
        registry.register(
            EventKind::DAMAGING_DOOR,
            Subscriber::typed(
                format!("scale-{i}"),
                Priority((i % 4) * 100),
                |ev: &mut DamagingDoor| {
                    ev.set_damage(ev.damage() * 0.99);
                    Ok(())
                },
            ),
        );
    }
    let dispatcher = dispatcher(registry);

    c.bench_function("dispatch_chain_16", |b| {
        b.iter(|| {
            let ev = dispatcher.dispatch(
                &EventKind::DAMAGING_DOOR,
                DamagingDoor::new(1, black_box(50.0), DoorDamageType::Weapon, None),
            );
            black_box(ev.damage())
        });
    });
}

/// Benchmark dispatching with one subscriber returning an error.
fn bench_dispatch_fault(c: &mut Criterion) {
    let registry = Arc::new(EventRegistry::new());
    registry.register_fn(EventKind::RESERVED_SLOT, "fails", Priority::FIRST, |_| {
        Err(Error::Execution("unavailable".into()))
    });
    registry.register_fn(EventKind::RESERVED_SLOT, "ok", Priority::NORMAL, |_| Ok(()));
    let dispatcher = Dispatcher::new(
        registry,
        Arc::new(Diagnostics::new()),
        DispatchConfig::new().with_record_faults(false),
    );

    c.bench_function("dispatch_fault", |b| {
        b.iter(|| {
            let mut ev = ReservedSlotCheck::new(true, "a@steam");
            let outcome = dispatcher.dispatch_dyn(&EventKind::RESERVED_SLOT, &mut ev);
            black_box(outcome.faults.len())
        });
    });
}

/// Benchmark executing a patched `HasReservedSlot` end to end.
fn bench_patched_call_site(c: &mut Criterion) {
    let methods = Arc::new(LiveMethodTable::new());
    let target = Token::method_def(1);
    let mut b = StreamBuilder::new();
    b.ldc_i4(1).unwrap().ret().unwrap();
    methods.load(target, b.build(1, true).unwrap());

    let host = ExtensionHost::attach(methods, HostConfig::default());
    let ctor = MethodRef::new(Token::member_ref(1), "ReservedSlotCheck", ".ctor").with_params(2);
    host.bridge().register_event(host.natives(), &ctor, |args| {
        let user = args[1].as_str().unwrap_or_default().to_string();
        Ok(ReservedSlotCheck::new(args[0].is_truthy(), user))
    });
    host.registry().register(
        EventKind::RESERVED_SLOT,
        Subscriber::typed("banned", Priority::NORMAL, |ev: &mut ReservedSlotCheck| {
            if ev.user_id.starts_with('b') {
                ev.deny();
            }
            Ok(())
        }),
    );
    let block =
        deniable_result(host.bridge().point(), &ctor, &EventKind::RESERVED_SLOT, &[0]).unwrap();
    host.apply_patch(
        Patch::new("ReservedSlotPatch")
            .target(target)
            .anchor(AnchorPattern::before_last_return())
            .insert(block),
    )
    .unwrap();

    c.bench_function("patched_call_site", |b| {
        b.iter(|| {
            let result = host
                .execute(target, vec![EmValue::from(black_box("a@steam"))])
                .unwrap();
            black_box(result)
        });
    });
}

criterion_group!(
    benches,
    bench_dispatch_empty,
    bench_dispatch_chain,
    bench_dispatch_fault,
    bench_patched_call_site,
);
criterion_main!(benches);
