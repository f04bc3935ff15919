//! Lazy activation of third-party extensions.
//!
//! An extension reacts to redefinitions of some framework (re-wiring a dependency-injection
//! container, flushing a template cache, ...). It only makes sense once the framework is
//! actually in use, so each [`Extension`] names trigger types; the first time one of them
//! passes through the pipeline the [`ActivationGate`] creates the extension's reaction hook
//! on the worker pool, off the rewriting path, and registers it with the change notifier.
//! Each extension is activated at most once per pipeline.

use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use dashmap::DashSet;
use tracing::{debug, error};

use crate::{
    classfile::{internal_name, LoaderId, UnitId},
    pipeline::policy::{ReplaceableSelector, Replaceability},
    rewrite::Rewriter,
    scheduler::{ChangeListener, ChangeNotifier},
    Error, Result,
};

/// The object an extension installs on activation.
pub trait ReactionHook: Send + Sync {
    /// Returns the hook as a change listener if it wants batch notifications.
    fn change_listener(self: Arc<Self>) -> Option<Arc<dyn ChangeListener>> {
        None
    }
}

/// Creates the reaction hook of an extension for the loader that triggered it.
pub type HookFactory = Arc<dyn Fn(LoaderId) -> Result<Arc<dyn ReactionHook>> + Send + Sync>;

/// Creates a selector that widens the set of replaceable units.
pub type SelectorFactory =
    Arc<dyn Fn(LoaderId) -> Result<Arc<dyn ReplaceableSelector>> + Send + Sync>;

/// A registered extension.
pub struct Extension {
    hook_name: String,
    triggers: Vec<String>,
    tracked_types: Vec<String>,
    rewriters: Vec<Arc<dyn Rewriter>>,
    hook_factory: HookFactory,
    selector_factory: Option<SelectorFactory>,
}

impl Extension {
    /// Creates an extension identified by the name of its reaction hook.
    #[must_use]
    pub fn new<F>(hook_name: &str, hook_factory: F) -> Self
    where
        F: Fn(LoaderId) -> Result<Arc<dyn ReactionHook>> + Send + Sync + 'static,
    {
        Extension {
            hook_name: hook_name.to_string(),
            triggers: Vec::new(),
            tracked_types: Vec::new(),
            rewriters: Vec::new(),
            hook_factory: Arc::new(hook_factory),
            selector_factory: None,
        }
    }

    /// Activates the extension when `type_name` (dotted or internal) is first seen.
    #[must_use]
    pub fn trigger(mut self, type_name: &str) -> Self {
        self.triggers.push(internal_name(type_name));
        self
    }

    /// Tracks live instances of `type_name`.
    #[must_use]
    pub fn track(mut self, type_name: &str) -> Self {
        self.tracked_types.push(internal_name(type_name));
        self
    }

    /// Runs `rewriter` ahead of the core rewriters.
    #[must_use]
    pub fn rewriter(mut self, rewriter: Arc<dyn Rewriter>) -> Self {
        self.rewriters.push(rewriter);
        self
    }

    /// Installs a replaceability selector on activation.
    #[must_use]
    pub fn selector<F>(mut self, factory: F) -> Self
    where
        F: Fn(LoaderId) -> Result<Arc<dyn ReplaceableSelector>> + Send + Sync + 'static,
    {
        self.selector_factory = Some(Arc::new(factory));
        self
    }

    /// Name of the reaction hook; identifies the extension.
    #[must_use]
    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    /// Internal names of the trigger types.
    #[must_use]
    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// Internal names of the types whose instances are tracked.
    #[must_use]
    pub fn tracked_types(&self) -> &[String] {
        &self.tracked_types
    }

    /// Rewriters contributed by the extension.
    #[must_use]
    pub fn rewriters(&self) -> &[Arc<dyn Rewriter>] {
        &self.rewriters
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("hook_name", &self.hook_name)
            .field("triggers", &self.triggers)
            .field("tracked_types", &self.tracked_types)
            .field("rewriters", &self.rewriters.len())
            .field("selector", &self.selector_factory.is_some())
            .finish()
    }
}

/// All extensions of a pipeline, indexed by trigger type.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<Extension>>,
    by_trigger: HashMap<String, Vec<usize>>,
}

impl ExtensionRegistry {
    /// Builds the registry.
    #[must_use]
    pub fn new(extensions: Vec<Extension>) -> Self {
        let mut by_trigger: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, extension) in extensions.iter().enumerate() {
            for trigger in &extension.triggers {
                by_trigger.entry(trigger.clone()).or_default().push(index);
            }
        }
        ExtensionRegistry {
            extensions: extensions.into_iter().map(Arc::new).collect(),
            by_trigger,
        }
    }

    /// Extensions triggered by the unit named `name` (internal form).
    pub fn triggered_by<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Arc<Extension>> + 'a {
        self.by_trigger
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|index| self.extensions.get(*index))
    }

    /// Every registered extension, in registration order.
    #[must_use]
    pub fn extensions(&self) -> &[Arc<Extension>] {
        &self.extensions
    }

    /// Number of registered extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Returns `true` if no extension is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

/// Activates each extension the first time one of its triggers is observed.
pub struct ActivationGate {
    registry: Arc<ExtensionRegistry>,
    activated: DashSet<String>,
    notifier: Arc<ChangeNotifier>,
    replaceability: Arc<Replaceability>,
    pool: Arc<rayon::ThreadPool>,
}

impl ActivationGate {
    /// Creates a gate over `registry`.
    ///
    /// Hooks that listen for changes are added to `notifier`; selectors to
    /// `replaceability`. Activation runs on `pool`.
    #[must_use]
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        notifier: Arc<ChangeNotifier>,
        replaceability: Arc<Replaceability>,
        pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        ActivationGate {
            registry,
            activated: DashSet::new(),
            notifier,
            replaceability,
            pool,
        }
    }

    /// Notes that `unit` passed through the pipeline.
    ///
    /// Spawns the activation of every not yet activated extension triggered by it and
    /// returns immediately.
    pub fn observe(&self, unit: &UnitId) {
        for extension in self.registry.triggered_by(&unit.name) {
            if !self.activated.insert(extension.hook_name.clone()) {
                continue;
            }
            debug!(extension = %extension.hook_name, trigger = %unit, "activating extension");

            let extension = extension.clone();
            let notifier = self.notifier.clone();
            let replaceability = self.replaceability.clone();
            let loader = unit.loader;
            self.pool.spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    activate(&extension, loader, &notifier, &replaceability)
                }));
                match outcome {
                    Ok(Ok(())) => debug!(extension = %extension.hook_name, "extension activated"),
                    Ok(Err(err)) => error!(error = %err, "extension activation failed"),
                    Err(_) => error!(extension = %extension.hook_name, "extension activation panicked"),
                }
            });
        }
    }

    /// Returns `true` if activation of the extension named `hook_name` has started.
    #[must_use]
    pub fn is_activated(&self, hook_name: &str) -> bool {
        self.activated.contains(hook_name)
    }

    /// The registry this gate serves.
    #[must_use]
    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }
}

fn activate(
    extension: &Extension,
    loader: LoaderId,
    notifier: &ChangeNotifier,
    replaceability: &Replaceability,
) -> Result<()> {
    let failed = |err: Error| Error::Activation {
        extension: extension.hook_name.clone(),
        message: err.to_string(),
    };

    let hook = (extension.hook_factory)(loader).map_err(failed)?;
    if let Some(listener) = hook.change_listener() {
        notifier.add_listener(listener);
    }
    if let Some(factory) = &extension.selector_factory {
        let selector = factory(loader).map_err(failed)?;
        replaceability.add_selector(selector);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::policy::NeverReplaceable,
        scheduler::{ChangedUnit, NewUnit},
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    struct Listening;

    impl ChangeListener for Listening {
        fn after_change(&self, _changed: &[ChangedUnit], _added: &[NewUnit]) {}
    }

    impl ReactionHook for Listening {
        fn change_listener(self: Arc<Self>) -> Option<Arc<dyn ChangeListener>> {
            Some(self)
        }
    }

    struct AllOf(&'static str);

    impl ReplaceableSelector for AllOf {
        fn selects(&self, unit: &UnitId) -> bool {
            unit.name.starts_with(self.0)
        }
    }

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap())
    }

    #[test]
    fn triggers_are_normalised() {
        let registry = ExtensionRegistry::new(vec![Extension::new(
            "Hook",
            |_| Ok(Arc::new(Listening) as Arc<dyn ReactionHook>),
        )
        .trigger("org.framework.Context")]);
        assert_eq!(registry.triggered_by("org/framework/Context").count(), 1);
        assert_eq!(registry.triggered_by("org.framework.Context").count(), 0);
    }

    #[test]
    fn activates_once_and_registers_hook_and_selector() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (done, finished) = mpsc::channel();
        let counter = calls.clone();
        let extension = Extension::new(
            "FrameworkHook",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Listening) as Arc<dyn ReactionHook>)
            },
        )
        .trigger("org.framework.Context")
        .selector(move |_| {
            done.send(()).ok();
            Ok(Arc::new(AllOf("org/framework/")) as Arc<dyn ReplaceableSelector>)
        });

        let notifier = Arc::new(ChangeNotifier::new());
        let replaceability = Arc::new(Replaceability::new(Arc::new(NeverReplaceable)));
        let gate = ActivationGate::new(
            Arc::new(ExtensionRegistry::new(vec![extension])),
            notifier.clone(),
            replaceability.clone(),
            pool(),
        );

        let trigger = UnitId::new("org.framework.Context", LoaderId(1));
        gate.observe(&UnitId::new("org.other.Thing", LoaderId(1)));
        assert!(!gate.is_activated("FrameworkHook"));
        gate.observe(&trigger);
        gate.observe(&trigger);
        assert!(gate.is_activated("FrameworkHook"));

        finished.recv_timeout(Duration::from_secs(5)).unwrap();
        // the pool has a single thread, so a second activation would be queued behind this one
        let (flushed, flush) = mpsc::channel();
        gate.pool.spawn(move || {
            flushed.send(()).ok();
        });
        flush.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.len(), 1);
        assert!(replaceability.is_replaceable(&UnitId::new("org/framework/Bean", LoaderId(1))));
    }

    #[test]
    fn failing_factory_is_contained() {
        let (done, finished) = mpsc::channel();
        let extension = Extension::new(
            "BrokenHook",
            move |_| {
                done.send(()).ok();
                Err(Error::Error("hook class missing".to_string()))
            },
        )
        .trigger("a.Trigger");
        let notifier = Arc::new(ChangeNotifier::new());
        let gate = ActivationGate::new(
            Arc::new(ExtensionRegistry::new(vec![extension])),
            notifier.clone(),
            Arc::new(Replaceability::new(Arc::new(NeverReplaceable))),
            pool(),
        );

        gate.observe(&UnitId::new("a.Trigger", LoaderId(0)));
        finished.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(notifier.is_empty());
    }
}
