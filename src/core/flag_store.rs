use parking_lot::RwLock;
use std::collections::HashSet;

use crate::types::{FlagName, FlagVariation, Flags, UpdateFlagsOptions};

#[derive(Default)]
struct FlagStoreState {
    flags: Flags,
    locked: HashSet<FlagName>,
    unsubscribed: HashSet<FlagName>,
}

impl FlagStoreState {
    fn accepts_remote(&self, flag_name: &str) -> bool {
        !self.locked.contains(flag_name) && !self.unsubscribed.contains(flag_name)
    }
}

/// Flags held by a single adapter.
///
/// Provider updates go through [`FlagStore::apply_remote`] or
/// [`FlagStore::replace_remote`], which skip keys that were locked or
/// unsubscribed by a local [`FlagStore::apply_local`] call.
#[derive(Default)]
pub struct FlagStore {
    state: RwLock<FlagStoreState>,
}

impl FlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flag_name: &str) -> Option<FlagVariation> {
        self.state.read().flags.get(flag_name).cloned()
    }

    pub fn all(&self) -> Flags {
        self.state.read().flags.clone()
    }

    pub fn is_locked(&self, flag_name: &str) -> bool {
        let state = self.state.read();
        state.locked.contains(flag_name) || state.unsubscribed.contains(flag_name)
    }

    /// Applies a local override and returns the resulting flags.
    ///
    /// Without `lock_flags` the written keys are unlocked again, which is how a
    /// lock is lifted.
    pub fn apply_local(&self, flags: &Flags, options: UpdateFlagsOptions) -> Flags {
        let mut state = self.state.write();

        for (name, value) in flags {
            state.flags.insert(name.clone(), value.clone());

            if options.lock_flags {
                state.locked.insert(name.clone());
            } else {
                state.locked.remove(name);
            }

            if options.unsubscribe_flags {
                state.unsubscribed.insert(name.clone());
            }
        }

        state.flags.clone()
    }

    /// Merges a partial provider update. Returns `true` when anything changed.
    pub fn apply_remote(&self, flags: Flags) -> bool {
        let mut state = self.state.write();
        let mut changed = false;

        for (name, value) in flags {
            if !state.accepts_remote(&name) {
                continue;
            }
            if state.flags.get(&name) != Some(&value) {
                state.flags.insert(name, value);
                changed = true;
            }
        }

        changed
    }

    /// Replaces the flag set with a full provider snapshot, keeping locked and
    /// unsubscribed keys at their local values. Returns `true` when anything
    /// changed.
    pub fn replace_remote(&self, flags: Flags) -> bool {
        let mut state = self.state.write();

        let mut next: Flags = flags
            .into_iter()
            .filter(|(name, _)| state.accepts_remote(name))
            .collect();

        for (name, value) in &state.flags {
            if !state.accepts_remote(name) {
                next.insert(name.clone(), value.clone());
            }
        }

        let changed = next != state.flags;
        state.flags = next;
        changed
    }

    /// Drops all flags and locks.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.flags.clear();
        state.locked.clear();
        state.unsubscribed.clear();
    }

    pub fn len(&self) -> usize {
        self.state.read().flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().flags.is_empty()
    }
}
