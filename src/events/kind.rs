use std::{borrow::Cow, fmt};

/// Stable identifier naming a class of event.
///
/// Kinds are plain dotted strings such as `player.damaging-door`. Well-known kinds are
/// available as associated constants; extensions may define their own with
/// [`EventKind::new`].
///
/// # Examples
///
/// ```rust
/// use dotpatch::events::EventKind;
///
/// let custom = EventKind::new("server.round-ended");
/// assert_eq!(custom.as_str(), "server.round-ended");
/// assert_eq!(EventKind::DAMAGING_DOOR, EventKind::new("player.damaging-door"));
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKind(Cow<'static, str>);

impl EventKind {
    /// A player with a reserved slot is checked on join
    pub const RESERVED_SLOT: Self = Self::from_static("player.reserved-slot");
    /// A door is about to take damage
    pub const DAMAGING_DOOR: Self = Self::from_static("player.damaging-door");
    /// A jailbird changed its wear state
    pub const JAILBIRD_WEAR_STATE: Self = Self::from_static("item.jailbird-wear-state");
    /// A ragdoll is about to be spawned
    pub const SPAWNING_RAGDOLL: Self = Self::from_static("player.spawning-ragdoll");

    /// Creates a kind from a static string.
    #[must_use]
    pub const fn from_static(name: &'static str) -> Self {
        EventKind(Cow::Borrowed(name))
    }

    /// Creates a kind from any string.
    pub fn new(name: impl Into<String>) -> Self {
        EventKind(Cow::Owned(name.into()))
    }

    /// The kind identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKind({})", self.0)
    }
}

impl From<&'static str> for EventKind {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn borrowed_and_owned_are_equal() {
        let owned = EventKind::new(String::from("player.reserved-slot"));
        assert_eq!(owned, EventKind::RESERVED_SLOT);

        let set: HashSet<_> = [owned, EventKind::RESERVED_SLOT].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn formatting() {
        assert_eq!(EventKind::DAMAGING_DOOR.to_string(), "player.damaging-door");
        assert_eq!(
            format!("{:?}", EventKind::SPAWNING_RAGDOLL),
            "EventKind(player.spawning-ragdoll)"
        );
    }
}
