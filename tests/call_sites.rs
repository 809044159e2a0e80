//! End-to-end tests of patched call sites.
//!
//! Each test loads a small host method into a live method table, attaches an
//! [`ExtensionHost`], installs a patch built from one of the interception templates and
//! executes the live body, checking that subscriber decisions reach the call site.

use std::sync::Arc;

use dotpatch::{prelude::*, Result};

const RESERVED_SLOT_CTOR: Token = Token::member_ref(0x0E01);
const DAMAGING_DOOR_CTOR: Token = Token::member_ref(0x0E02);

fn reserved_slot_ctor() -> MethodRef {
    MethodRef::new(RESERVED_SLOT_CTOR, "ReservedSlotCheck", ".ctor").with_params(2)
}

fn damaging_door_ctor() -> MethodRef {
    MethodRef::new(DAMAGING_DOOR_CTOR, "DamagingDoor", ".ctor").with_params(1)
}

/// Registers the payload constructors the templates call with `newobj`.
fn register_events(host: &ExtensionHost) {
    host.bridge()
        .register_event(host.natives(), &reserved_slot_ctor(), |args| {
            let user = args[1].as_str().unwrap_or_default().to_string();
            Ok(ReservedSlotCheck::new(args[0].is_truthy(), user))
        });
    host.bridge()
        .register_event(host.natives(), &damaging_door_ctor(), |args| {
            #[allow(clippy::cast_possible_truncation)]
            let damage = args[0].as_f64().unwrap_or_default() as f32;
            Ok(DamagingDoor::new(4, damage, DoorDamageType::Weapon, None))
        });
}

/// `static bool HasReservedSlot(string userId) => Lookup(userId);`
fn reserved_slot_host(lookup: &MethodRef) -> Result<InstructionStream> {
    let mut b = StreamBuilder::new();
    b.ldarg(0)?.call(lookup)?.ret()?;
    b.build(1, true)
}

struct BanList(&'static [&'static str]);

impl Extension for BanList {
    fn name(&self) -> &str {
        "ban-list"
    }

    fn subscriptions(&self) -> Vec<(EventKind, Subscriber)> {
        let banned = self.0;
        vec![(
            EventKind::RESERVED_SLOT,
            Subscriber::typed("revoke-banned", Priority::NORMAL, move |ev: &mut ReservedSlotCheck| {
                if banned.iter().any(|b| *b == &*ev.user_id) {
                    ev.deny();
                }
                Ok(())
            }),
        )]
    }
}

struct GrantAll;

impl Extension for GrantAll {
    fn name(&self) -> &str {
        "grant-all"
    }

    fn subscriptions(&self) -> Vec<(EventKind, Subscriber)> {
        vec![(
            EventKind::RESERVED_SLOT,
            Subscriber::typed("grant", Priority::FIRST, |ev: &mut ReservedSlotCheck| {
                ev.set_allowed(true);
                Ok(())
            }),
        )]
    }
}

/// The host's own lookup result reaches the event; subscribers decide the final answer.
#[test]
fn reserved_slot_decision_reaches_call_site() -> Result<()> {
    let methods = Arc::new(LiveMethodTable::new());
    let lookup = MethodRef::new(Token::method_def(0x20), "ReservedSlots", "Lookup")
        .with_params(1)
        .returning();
    let target = Token::method_def(0x10);
    methods.load(target, reserved_slot_host(&lookup)?);

    let host = ExtensionHost::attach(methods, HostConfig::default());
    host.natives().register(lookup.token, |_, args| {
        Ok(EmValue::bool(args[0].as_str().is_some_and(|u| u.ends_with("@steam"))))
    });
    register_events(&host);

    let block = deniable_result(
        host.bridge().point(),
        &reserved_slot_ctor(),
        &EventKind::RESERVED_SLOT,
        &[0],
    )?;
    host.apply_patch(
        Patch::new("ReservedSlotPatch")
            .target(target)
            .anchor(AnchorPattern::Window(
                WindowPattern::new(vec![OpPattern::call("Lookup"), OpPattern::Return]).before(1),
            ))
            .insert(block)
            .event(EventKind::RESERVED_SLOT),
    )?;

    // no subscribers: the lookup stands
    assert_eq!(host.execute(target, vec![EmValue::from("a@steam")])?, Some(EmValue::I32(1)));
    assert_eq!(host.execute(target, vec![EmValue::from("a@discord")])?, Some(EmValue::I32(0)));

    let bans = host.load_extension(&BanList(&["b@steam"]))?;
    assert_eq!(host.execute(target, vec![EmValue::from("a@steam")])?, Some(EmValue::I32(1)));
    assert_eq!(host.execute(target, vec![EmValue::from("b@steam")])?, Some(EmValue::I32(0)));

    // a FIRST grant is overridden by the NORMAL ban that runs after it
    host.load_extension(&GrantAll)?;
    assert_eq!(host.execute(target, vec![EmValue::from("a@discord")])?, Some(EmValue::I32(1)));
    assert_eq!(host.execute(target, vec![EmValue::from("b@steam")])?, Some(EmValue::I32(0)));

    host.unload_extension(&bans)?;
    assert_eq!(host.execute(target, vec![EmValue::from("b@steam")])?, Some(EmValue::I32(1)));

    host.detach()
}

/// A guard prefix rewrites the damage argument and returns early when denied.
#[test]
fn door_damage_is_rewritten_and_denied() -> Result<()> {
    let methods = Arc::new(LiveMethodTable::new());
    let target = Token::method_def(0x11);

    // static float ServerDamage(float hp) => hp;
    let mut b = StreamBuilder::new();
    b.ldarg(0)?.ret()?;
    methods.load(target, b.build(1, true)?);

    let host = ExtensionHost::attach(methods, HostConfig::default());
    register_events(&host);

    host.registry().register(
        EventKind::DAMAGING_DOOR,
        Subscriber::typed("armor", Priority::EARLY, |ev: &mut DamagingDoor| {
            ev.set_damage(ev.damage() * 0.25);
            Ok(())
        }),
    );
    host.registry().register(
        EventKind::DAMAGING_DOOR,
        Subscriber::typed("indestructible", Priority::LATE, |ev: &mut DamagingDoor| {
            if ev.damage() > 100.0 {
                ev.deny();
            }
            Ok(())
        }),
    );

    let block = guard_prefix(
        host.bridge().point(),
        &damaging_door_ctor(),
        &EventKind::DAMAGING_DOOR,
        &[0],
        &[(DamagingDoor::DAMAGE, 0)],
        DenyAction::ReturnConstant(-1),
    )?;
    host.apply_patch(
        Patch::new("DamagingDoorPatch")
            .target(target)
            .anchor(AnchorPattern::method_start())
            .insert(block)
            .event(EventKind::DAMAGING_DOOR),
    )?;

    assert_eq!(host.execute(target, vec![EmValue::F64(80.0)])?, Some(EmValue::F64(20.0)));
    assert_eq!(host.execute(target, vec![EmValue::F64(800.0)])?, Some(EmValue::I32(-1)));
    Ok(())
}

/// A result postfix folds a further call into the computed result.
#[test]
fn result_postfix_combines_results() -> Result<()> {
    let methods = Arc::new(LiveMethodTable::new());
    let target = Token::method_def(0x12);

    // bool CanUse(this) => false;
    let mut b = StreamBuilder::new();
    b.ldc_i4(0)?.ret()?;
    methods.load(target, b.build(1, true)?);

    let override_getter = MethodRef::new(Token::method_def(0x21), "Item", "get_Override")
        .instance()
        .returning();

    let host = ExtensionHost::attach(methods, HostConfig::default());
    host.natives().register(override_getter.token, |_, args| {
        Ok(EmValue::bool(args[0].as_i32() == Some(7)))
    });

    host.apply_patch(
        Patch::new("CanUsePostfix")
            .target(target)
            .anchor(AnchorPattern::before_last_return())
            .insert(result_postfix(&override_getter, &[0], "or")?),
    )?;

    assert_eq!(host.execute(target, vec![EmValue::I32(7)])?, Some(EmValue::I32(1)));
    assert_eq!(host.execute(target, vec![EmValue::I32(3)])?, Some(EmValue::I32(0)));
    Ok(())
}

/// A subscriber that panics inside a patched call is isolated; the call still completes.
#[test]
fn subscriber_panic_inside_patched_call() -> Result<()> {
    let methods = Arc::new(LiveMethodTable::new());
    let target = Token::method_def(0x13);
    let mut b = StreamBuilder::new();
    b.ldc_i4(1)?.ret()?;
    methods.load(target, b.build(1, true)?);

    let host = ExtensionHost::attach(methods, HostConfig::default());
    register_events(&host);
    host.registry()
        .register_fn(EventKind::RESERVED_SLOT, "buggy", Priority::FIRST, |_| panic!("boom"));
    host.load_extension(&BanList(&["x"]))?;

    host.apply_patch(
        Patch::new("ReservedSlotPatch")
            .target(target)
            .anchor(AnchorPattern::before_last_return())
            .insert(deniable_result(
                host.bridge().point(),
                &reserved_slot_ctor(),
                &EventKind::RESERVED_SLOT,
                &[0],
            )?),
    )?;

    assert_eq!(host.execute(target, vec![EmValue::from("x")])?, Some(EmValue::I32(0)));
    assert_eq!(
        host.diagnostics()
            .by_category(DiagnosticCategory::Subscriber)
            .len(),
        1
    );
    Ok(())
}
