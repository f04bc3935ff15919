//! Collaborators the pipeline consults but does not own.
//!
//! The host decides which units are replaceable, knows which types are loaded and how they
//! relate, and performs eager resolution. Each concern is a small trait so hosts and tests
//! can supply exactly what they have.

use std::sync::Arc;

use crate::{
    analysis::{TypeHierarchy, TypeInfo},
    classfile::{LoaderId, UnitId},
    Result,
};

/// Decides whether a unit may be redefined later.
pub trait ReplaceablePolicy: Send + Sync {
    /// Returns `true` if `unit` is eligible for redefinition.
    fn is_replaceable(&self, unit: &UnitId) -> bool;
}

impl<F> ReplaceablePolicy for F
where
    F: Fn(&UnitId) -> bool + Send + Sync,
{
    fn is_replaceable(&self, unit: &UnitId) -> bool {
        self(unit)
    }
}

/// A policy that never allows redefinition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReplaceable;

impl ReplaceablePolicy for NeverReplaceable {
    fn is_replaceable(&self, _unit: &UnitId) -> bool {
        false
    }
}

/// Units whose internal name starts with one of the prefixes are replaceable.
#[derive(Debug, Clone, Default)]
pub struct PrefixPolicy {
    prefixes: Vec<String>,
}

impl PrefixPolicy {
    /// Creates a policy from dotted or internal package prefixes.
    #[must_use]
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        PrefixPolicy {
            prefixes: prefixes
                .into_iter()
                .map(|prefix| crate::classfile::internal_name(prefix.as_ref()))
                .collect(),
        }
    }
}

impl ReplaceablePolicy for PrefixPolicy {
    fn is_replaceable(&self, unit: &UnitId) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| unit.name.starts_with(prefix.as_str()))
    }
}

/// An additional eligibility rule contributed by an extension.
pub trait ReplaceableSelector: Send + Sync {
    /// Returns `true` if the selector makes `unit` replaceable.
    fn selects(&self, unit: &UnitId) -> bool;
}

/// The host's policy widened by every selector registered so far.
///
/// Selectors are only ever appended, so readers never block.
pub struct Replaceability {
    base: Arc<dyn ReplaceablePolicy>,
    selectors: boxcar::Vec<Arc<dyn ReplaceableSelector>>,
}

impl Replaceability {
    /// Wraps the host's policy.
    pub fn new(base: Arc<dyn ReplaceablePolicy>) -> Self {
        Replaceability {
            base,
            selectors: boxcar::Vec::new(),
        }
    }

    /// Adds a selector.
    pub fn add_selector(&self, selector: Arc<dyn ReplaceableSelector>) {
        self.selectors.push(selector);
    }

    /// Returns `true` if the base policy or any selector accepts `unit`.
    pub fn is_replaceable(&self, unit: &UnitId) -> bool {
        self.base.is_replaceable(unit)
            || self
                .selectors
                .iter()
                .any(|(_, selector)| selector.selects(unit))
    }
}

/// Knowledge about types that are already loaded.
pub trait LoadedTypes: Send + Sync {
    /// Whether the loaded version of `owner` in `loader` declares a field `name`.
    ///
    /// Returns `None` if `owner` is not loaded there.
    fn field_exists(&self, loader: LoaderId, owner: &str, name: &str) -> Option<bool>;
}

/// Knows nothing about loaded types; disables on-the-fly field discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoadedTypes;

impl LoadedTypes for NoLoadedTypes {
    fn field_exists(&self, _loader: LoaderId, _owner: &str, _name: &str) -> Option<bool> {
        None
    }
}

/// Services the host runtime provides to the pipeline.
pub trait HostRuntime: Send + Sync {
    /// Describes `name` as seen from `loader`, or `None` if it cannot be resolved now.
    fn describe_type(&self, loader: LoaderId, name: &str) -> Option<TypeInfo>;

    /// Loads and links `types` in `loader`, forcing verification of the rewritten code.
    ///
    /// # Errors
    /// Returns [`crate::Error::Resolution`] if any of the types fails to load.
    fn resolve_types(&self, loader: LoaderId, types: &[String]) -> Result<()>;
}

/// Adapts a [`HostRuntime`] to the [`TypeHierarchy`] of one loader.
pub(crate) struct LoaderHierarchy<'a> {
    pub host: &'a dyn HostRuntime,
    pub loader: LoaderId,
}

impl TypeHierarchy for LoaderHierarchy<'_> {
    fn lookup(&self, name: &str) -> Option<TypeInfo> {
        self.host.describe_type(self.loader, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Selects(&'static str);

    impl ReplaceableSelector for Selects {
        fn selects(&self, unit: &UnitId) -> bool {
            unit.name == self.0
        }
    }

    #[test]
    fn selectors_widen_the_base_policy() {
        let policy = Replaceability::new(Arc::new(PrefixPolicy::new(["com.app."])));
        let app = UnitId::new("com.app.Service", LoaderId(1));
        let lib = UnitId::new("org/lib/Util", LoaderId(1));
        assert!(policy.is_replaceable(&app));
        assert!(!policy.is_replaceable(&lib));

        policy.add_selector(Arc::new(Selects("org/lib/Util")));
        assert!(policy.is_replaceable(&lib));
    }

    #[test]
    fn closures_are_policies() {
        let policy: Arc<dyn ReplaceablePolicy> = Arc::new(|unit: &UnitId| unit.loader == LoaderId(7));
        assert!(policy.is_replaceable(&UnitId::new("a/B", LoaderId(7))));
        assert!(!NeverReplaceable.is_replaceable(&UnitId::new("a/B", LoaderId(7))));
    }
}
