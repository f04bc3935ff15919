//! Copy-on-write indices of standing rewrite rules.
//!
//! A [`RuleIndex`] is consulted for every unit that passes through the pipeline, so reads
//! must be cheap and must never observe a half-applied registration. Rules are held in
//! persistent maps (`imbl`) behind an `RwLock`: a reader clones the map for its loader under
//! the read lock, which is O(1) thanks to structural sharing, and then works on that
//! immutable snapshot without holding any lock. Writers replace the map for one loader
//! atomically.
//!
//! Rules are grouped by the loader whose units must be rewritten and keyed by
//! `(owner, member)` within that loader.

use std::sync::RwLock;

use crate::classfile::LoaderId;

/// Identity of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    /// Internal name of the type declaring the member
    pub owner: String,
    /// Member name
    pub member: String,
    /// Loader whose units are rewritten
    pub loader: LoaderId,
}

impl RuleKey {
    /// Creates a key; dotted owner names are normalised to internal form.
    #[must_use]
    pub fn new(owner: &str, member: &str, loader: LoaderId) -> Self {
        RuleKey {
            owner: crate::classfile::internal_name(owner),
            member: member.to_string(),
            loader,
        }
    }
}

type Members<V> = imbl::HashMap<(String, String), V>;

/// Concurrent rule index with snapshot reads.
#[derive(Debug)]
pub struct RuleIndex<V: Clone> {
    rules: RwLock<imbl::HashMap<LoaderId, Members<V>>>,
}

impl<V: Clone> Default for RuleIndex<V> {
    fn default() -> Self {
        RuleIndex {
            rules: RwLock::new(imbl::HashMap::new()),
        }
    }
}

impl<V: Clone> RuleIndex<V> {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable view of the rules for `loader`.
    pub fn snapshot(&self, loader: LoaderId) -> RuleSnapshot<V> {
        let members = read_lock!(self.rules)
            .get(&loader)
            .cloned()
            .unwrap_or_default();
        RuleSnapshot { loader, members }
    }

    /// Adds or replaces a rule, returning the previous value.
    pub fn insert(&self, key: RuleKey, value: V) -> Option<V> {
        let mut rules = write_lock!(self.rules);
        let mut members = rules.get(&key.loader).cloned().unwrap_or_default();
        let previous = members.insert((key.owner, key.member), value);
        rules.insert(key.loader, members);
        previous
    }

    /// Removes one rule.
    pub fn remove(&self, key: &RuleKey) -> Option<V> {
        let mut rules = write_lock!(self.rules);
        let mut members = rules.get(&key.loader)?.clone();
        let previous = members.remove(&(key.owner.clone(), key.member.clone()));
        if members.is_empty() {
            rules.remove(&key.loader);
        } else {
            rules.insert(key.loader, members);
        }
        previous
    }

    /// Removes every rule for members of `owner` under `loader`.
    pub fn clear(&self, owner: &str, loader: LoaderId) {
        let owner = crate::classfile::internal_name(owner);
        let mut rules = write_lock!(self.rules);
        let Some(members) = rules.get(&loader) else {
            return;
        };
        let mut members = members.clone();
        members.retain(|(declaring, _), _| *declaring != owner);
        if members.is_empty() {
            rules.remove(&loader);
        } else {
            rules.insert(loader, members);
        }
    }

    /// Drops every rule of a discarded loader.
    pub fn clear_loader(&self, loader: LoaderId) {
        write_lock!(self.rules).remove(&loader);
    }

    /// Total number of rules across all loaders.
    pub fn len(&self) -> usize {
        read_lock!(self.rules).values().map(imbl::HashMap::len).sum()
    }

    /// Returns `true` if no rules are registered.
    pub fn is_empty(&self) -> bool {
        read_lock!(self.rules).is_empty()
    }
}

/// The rules of one loader as seen by a single scan.
///
/// Rules registered by the scan itself go into the snapshot via
/// [`RuleSnapshot::insert_local`] so the rest of the scan sees them; other scans see them
/// only once they are also inserted into the shared index.
#[derive(Debug, Clone)]
pub struct RuleSnapshot<V: Clone> {
    loader: LoaderId,
    members: Members<V>,
}

impl<V: Clone> RuleSnapshot<V> {
    /// Loader the snapshot was taken for.
    #[must_use]
    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    /// Looks up the rule for `member` of `owner`.
    #[must_use]
    pub fn get(&self, owner: &str, member: &str) -> Option<&V> {
        self.members.get(&(owner.to_string(), member.to_string()))
    }

    /// Adds a rule visible only to this snapshot.
    pub fn insert_local(&mut self, owner: &str, member: &str, value: V) {
        self.members
            .insert((owner.to_string(), member.to_string()), value);
    }

    /// Number of rules in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the loader has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L1: LoaderId = LoaderId(1);
    const L2: LoaderId = LoaderId(2);

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let index = RuleIndex::new();
        index.insert(RuleKey::new("a.B", "x", L1), 1);
        let before = index.snapshot(L1);

        index.insert(RuleKey::new("a/B", "y", L1), 2);
        index.remove(&RuleKey::new("a/B", "x", L1));

        assert_eq!(before.get("a/B", "x"), Some(&1));
        assert_eq!(before.get("a/B", "y"), None);

        let after = index.snapshot(L1);
        assert_eq!(after.get("a/B", "x"), None);
        assert_eq!(after.get("a/B", "y"), Some(&2));
    }

    #[test]
    fn clears_by_owner_and_loader() {
        let index = RuleIndex::new();
        index.insert(RuleKey::new("a/B", "x", L1), 1);
        index.insert(RuleKey::new("a/C", "x", L1), 2);
        index.insert(RuleKey::new("a/B", "x", L2), 3);
        assert_eq!(index.len(), 3);

        index.clear("a.B", L1);
        assert!(index.snapshot(L1).get("a/B", "x").is_none());
        assert_eq!(index.snapshot(L1).get("a/C", "x"), Some(&2));
        assert_eq!(index.snapshot(L2).get("a/B", "x"), Some(&3));

        index.clear_loader(L2);
        assert!(index.snapshot(L2).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn local_inserts_stay_local() {
        let index: RuleIndex<u32> = RuleIndex::new();
        let mut snapshot = index.snapshot(L1);
        snapshot.insert_local("a/B", "z", 9);
        assert_eq!(snapshot.get("a/B", "z"), Some(&9));
        assert!(index.is_empty());
    }
}
