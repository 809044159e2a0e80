//! Concrete event payloads raised by the built-in interception points.

use std::{any::Any, sync::Arc};

use strum::{Display, FromRepr};

use crate::{
    events::state::{Actor, ActorBound, Deniable, EventState, MutableParameters, ParamValue},
    Error, Result,
};

/// Raised when the host checks whether a joining user holds a reserved slot.
///
/// The decision starts out as the host's own answer, so subscribers can both grant and
/// revoke a slot. The patched check returns the final decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedSlotCheck {
    /// Account id of the joining user
    pub user_id: Arc<str>,
    /// What the host computed before dispatch
    pub has_reserved_slot: bool,
    allowed: bool,
}

impl ReservedSlotCheck {
    /// Creates the payload; the decision is initialized from `has_reserved_slot`.
    pub fn new(has_reserved_slot: bool, user_id: impl Into<Arc<str>>) -> Self {
        Self {
            user_id: user_id.into(),
            has_reserved_slot,
            allowed: has_reserved_slot,
        }
    }
}

impl Deniable for ReservedSlotCheck {
    fn is_allowed(&self) -> bool {
        self.allowed
    }

    fn set_allowed(&mut self, allowed: bool) {
        self.allowed = allowed;
    }
}

impl EventState for ReservedSlotCheck {
    fn as_deniable(&self) -> Option<&dyn Deniable> {
        Some(self)
    }

    fn as_deniable_mut(&mut self) -> Option<&mut dyn Deniable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Source of door damage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum DoorDamageType {
    /// No specific source
    None = 0,
    /// Gunfire
    Weapon = 1,
    /// Grenade blast
    Grenade = 2,
    /// SCP-096 charge
    Scp096 = 4,
    /// Server command
    ServerCommand = 8,
}

/// Raised before a breakable door takes damage.
///
/// `damage` is a mutable parameter; a subscriber lowering it to zero does not deny the
/// event, only [`Deniable::deny`] does. The decision starts as `damage > 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct DamagingDoor {
    /// Id of the damaged door
    pub door: u32,
    /// Source of the damage
    pub damage_type: DoorDamageType,
    actor: Option<Arc<Actor>>,
    damage: f32,
    allowed: bool,
}

impl DamagingDoor {
    /// Parameter name of the damage amount
    pub const DAMAGE: &'static str = "damage";

    /// Creates the payload; the decision is `damage > 0`.
    #[must_use]
    pub fn new(
        door: u32,
        damage: f32,
        damage_type: DoorDamageType,
        actor: Option<Arc<Actor>>,
    ) -> Self {
        Self {
            door,
            damage_type,
            actor,
            damage,
            allowed: damage > 0.0,
        }
    }

    /// Current damage amount.
    #[must_use]
    pub fn damage(&self) -> f32 {
        self.damage
    }

    /// Overwrites the damage amount.
    pub fn set_damage(&mut self, damage: f32) {
        self.damage = damage;
    }
}

impl Deniable for DamagingDoor {
    fn is_allowed(&self) -> bool {
        self.allowed
    }

    fn set_allowed(&mut self, allowed: bool) {
        self.allowed = allowed;
    }
}

impl ActorBound for DamagingDoor {
    fn actor(&self) -> Option<&Arc<Actor>> {
        self.actor.as_ref()
    }
}

impl MutableParameters for DamagingDoor {
    fn parameter_names(&self) -> &'static [&'static str] {
        &[Self::DAMAGE]
    }

    fn parameter(&self, name: &str) -> Option<ParamValue> {
        (name == Self::DAMAGE).then(|| ParamValue::Float(f64::from(self.damage)))
    }

    fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<()> {
        if name != Self::DAMAGE {
            return Err(Error::InvalidParameter {
                name: name.to_string(),
                reason: "DamagingDoor has no such parameter".to_string(),
            });
        }
        match value {
            #[allow(clippy::cast_possible_truncation)]
            ParamValue::Float(v) => self.damage = v as f32,
            #[allow(clippy::cast_precision_loss)]
            ParamValue::Int(v) => self.damage = v as f32,
            other => {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    reason: format!("expected float, got {}", other.type_name()),
                })
            }
        }
        Ok(())
    }
}

impl EventState for DamagingDoor {
    fn as_deniable(&self) -> Option<&dyn Deniable> {
        Some(self)
    }

    fn as_deniable_mut(&mut self) -> Option<&mut dyn Deniable> {
        Some(self)
    }

    fn as_actor_bound(&self) -> Option<&dyn ActorBound> {
        Some(self)
    }

    fn as_parameters(&self) -> Option<&dyn MutableParameters> {
        Some(self)
    }

    fn as_parameters_mut(&mut self) -> Option<&mut dyn MutableParameters> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Wear state of a jailbird.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum JailbirdWearState {
    /// No wear
    Healthy = 0,
    /// Worn
    LowWear = 1,
    /// Heavily worn
    MediumWear = 2,
    /// Close to breaking
    HighWear = 3,
    /// About to break on next use
    AlmostBroken = 4,
    /// Broken
    Broken = 5,
}

/// Raised after a jailbird changed its wear state. Observation only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailbirdChangedWearState {
    /// Serial of the jailbird item
    pub serial: u16,
    /// State before the change
    pub old_state: JailbirdWearState,
    /// State after the change
    pub new_state: JailbirdWearState,
    owner: Option<Arc<Actor>>,
}

impl JailbirdChangedWearState {
    /// Creates the payload.
    #[must_use]
    pub fn new(
        serial: u16,
        new_state: JailbirdWearState,
        old_state: JailbirdWearState,
        owner: Option<Arc<Actor>>,
    ) -> Self {
        Self {
            serial,
            old_state,
            new_state,
            owner,
        }
    }
}

impl ActorBound for JailbirdChangedWearState {
    fn actor(&self) -> Option<&Arc<Actor>> {
        self.owner.as_ref()
    }
}

impl EventState for JailbirdChangedWearState {
    fn as_actor_bound(&self) -> Option<&dyn ActorBound> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Raised before a ragdoll is spawned for a dead player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawningRagdoll {
    /// Role name shown on the ragdoll
    pub role: Arc<str>,
    /// Cause of death shown on the ragdoll
    pub death_reason: Arc<str>,
    player: Option<Arc<Actor>>,
    allowed: bool,
}

impl SpawningRagdoll {
    /// Creates the payload; spawning is allowed by default.
    pub fn new(
        role: impl Into<Arc<str>>,
        death_reason: impl Into<Arc<str>>,
        player: Option<Arc<Actor>>,
    ) -> Self {
        Self {
            role: role.into(),
            death_reason: death_reason.into(),
            player,
            allowed: true,
        }
    }
}

impl Deniable for SpawningRagdoll {
    fn is_allowed(&self) -> bool {
        self.allowed
    }

    fn set_allowed(&mut self, allowed: bool) {
        self.allowed = allowed;
    }
}

impl ActorBound for SpawningRagdoll {
    fn actor(&self) -> Option<&Arc<Actor>> {
        self.player.as_ref()
    }
}

impl EventState for SpawningRagdoll {
    fn as_deniable(&self) -> Option<&dyn Deniable> {
        Some(self)
    }

    fn as_deniable_mut(&mut self) -> Option<&mut dyn Deniable> {
        Some(self)
    }

    fn as_actor_bound(&self) -> Option<&dyn ActorBound> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
