//! The per-unit rewriting driver.
//!
//! The host hands every unit to [`Pipeline::transform`] before it is loaded or redefined.
//! The pipeline runs every registered [`Rewriter`], repairs the methods they touched,
//! serializes the result and, for redefinitions, feeds the [`ChangeScheduler`].
//!
//! # Steps
//!
//! 1. Units without a name pass through. Units that are not replaceable and were proven
//!    unmodified before are rejected without parsing.
//! 2. The unit is parsed; a parse failure is returned to the host.
//! 3. Rewriters run in registration order, extension rewriters first. Each runs on its own
//!    copy of the unit, so a rewriter that fails or panics leaves no trace and counts as
//!    "no change".
//! 4. Nothing changed: the unit is remembered for step 1 and passed through.
//! 5. Modified methods are repaired. A method whose frames need a type the host cannot
//!    resolve yet gets a body that throws `NoClassDefFoundError` instead. Any other repair
//!    failure aborts the unit.
//! 6. Types the rewriters asked for are resolved on the worker pool while the scheduler
//!    holds its batch back.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hotswap::prelude::*;
//!
//! struct Host;
//!
//! impl HostRuntime for Host {
//!     fn describe_type(&self, _loader: LoaderId, _name: &str) -> Option<TypeInfo> {
//!         None
//!     }
//!     fn resolve_types(&self, _loader: LoaderId, _types: &[String]) -> hotswap::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let pipeline = PipelineBuilder::new(Arc::new(Host))
//!     .policy(Arc::new(PrefixPolicy::new(["com.example."])))
//!     .build()?;
//!
//! let bytes = std::fs::read("Service.class")?;
//! match pipeline.transform(TransformRequest::load("com/example/Service", LoaderId(1), bytes))? {
//!     Transformed::Unchanged => println!("load the original"),
//!     Transformed::Rewritten { bytes, .. } => println!("load {} rewritten bytes", bytes.len()),
//! }
//! # Ok::<(), hotswap::Error>(())
//! ```

pub mod dump;
pub mod policy;

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use dashmap::DashSet;
use tracing::{debug, error, info, trace, warn};

use crate::{
    analysis::{failure_stub, repair_method},
    classfile::{internal_name, CompiledUnit, LoaderId, UnitId},
    config::EngineConfig,
    extension::{ActivationGate, Extension, ExtensionRegistry},
    rewrite::{
        FieldStorageRewriter, InstanceTrackingRewriter, ModifiedMethods,
        ReflectiveConstructorRewriter, ReflectiveFieldRewriter, RewriteContext, Rewriter,
    },
    scheduler::{ChangeNotifier, ChangeScheduler, ChangedUnit, NewUnit},
    Error, RepairError, Result,
};

use dump::DumpDir;
use policy::{
    HostRuntime, LoadedTypes, LoaderHierarchy, NeverReplaceable, NoLoadedTypes,
    ReplaceablePolicy, Replaceability,
};

/// One unit handed over by the host.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    /// Name of the unit as the host reports it, `None` for hidden or anonymous units
    pub name: Option<String>,
    /// Loader defining the unit
    pub loader: LoaderId,
    /// The binary form to rewrite
    pub bytes: Arc<[u8]>,
    /// Binary form of the loaded version when this is a redefinition
    pub previous: Option<Arc<[u8]>>,
}

impl TransformRequest {
    /// A unit loaded for the first time.
    #[must_use]
    pub fn load(name: &str, loader: LoaderId, bytes: impl Into<Arc<[u8]>>) -> Self {
        TransformRequest {
            name: Some(name.to_string()),
            loader,
            bytes: bytes.into(),
            previous: None,
        }
    }

    /// A redefinition of a loaded unit.
    #[must_use]
    pub fn redefine(
        name: &str,
        loader: LoaderId,
        bytes: impl Into<Arc<[u8]>>,
        previous: impl Into<Arc<[u8]>>,
    ) -> Self {
        TransformRequest {
            name: Some(name.to_string()),
            loader,
            bytes: bytes.into(),
            previous: Some(previous.into()),
        }
    }

    /// Returns `true` if this is a redefinition.
    #[must_use]
    pub fn is_redefinition(&self) -> bool {
        self.previous.is_some()
    }
}

/// Outcome of [`Pipeline::transform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    /// Load the original bytes
    Unchanged,
    /// Load these bytes instead
    Rewritten {
        /// The rewritten binary form
        bytes: Vec<u8>,
        /// Methods whose code changed
        modified_methods: ModifiedMethods,
    },
}

impl Transformed {
    /// Returns `true` for [`Transformed::Rewritten`].
    #[must_use]
    pub fn is_rewritten(&self) -> bool {
        matches!(self, Transformed::Rewritten { .. })
    }
}

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    config: EngineConfig,
    host: Arc<dyn HostRuntime>,
    policy: Arc<dyn ReplaceablePolicy>,
    loaded: Arc<dyn LoadedTypes>,
    extensions: Vec<Extension>,
    notifier: Arc<ChangeNotifier>,
}

impl PipelineBuilder {
    /// Starts a builder with the default configuration, no replaceable units, no knowledge
    /// about loaded types and no extensions.
    #[must_use]
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        PipelineBuilder {
            config: EngineConfig::default(),
            host,
            policy: Arc::new(NeverReplaceable),
            loaded: Arc::new(NoLoadedTypes),
            extensions: Vec::new(),
            notifier: Arc::new(ChangeNotifier::new()),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the replaceability policy.
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn ReplaceablePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the source of knowledge about loaded types.
    #[must_use]
    pub fn loaded_types(mut self, loaded: Arc<dyn LoadedTypes>) -> Self {
        self.loaded = loaded;
        self
    }

    /// Registers an extension.
    #[must_use]
    pub fn extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Uses `notifier` for settled batches, so listeners can be registered up front.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Builds the pipeline, starting its worker pool and scheduler thread.
    ///
    /// # Errors
    /// Returns [`Error::Error`] if the worker pool cannot be built and
    /// [`Error::FileError`] if the scheduler thread cannot be spawned.
    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|index| format!("hotswap-worker-{index}"))
            .build()
            .map_err(|err| Error::Error(format!("Failed to build worker pool: {err}")))?;
        let pool = Arc::new(pool);
        let scheduler = Arc::new(ChangeScheduler::new(
            config.debounce_window,
            self.notifier.clone(),
        )?);
        let replaceability = Arc::new(Replaceability::new(self.policy));

        let fields = Arc::new(FieldStorageRewriter::new(
            config.targets.clone(),
            self.loaded,
        ));
        let tracking = Arc::new(InstanceTrackingRewriter::new(config.targets.clone()));

        let mut rewriters: Vec<Arc<dyn Rewriter>> = Vec::new();
        for extension in &self.extensions {
            rewriters.extend(extension.rewriters().iter().cloned());
            for tracked in extension.tracked_types() {
                tracking.add_tracked(tracked);
            }
        }
        let extension_rewriters = rewriters.len();
        rewriters.push(fields.clone());
        rewriters.push(Arc::new(ReflectiveFieldRewriter::new(config.targets.clone())));
        rewriters.push(Arc::new(ReflectiveConstructorRewriter::new(
            config.targets.clone(),
        )));
        rewriters.push(tracking.clone());

        let gate = ActivationGate::new(
            Arc::new(ExtensionRegistry::new(self.extensions)),
            self.notifier,
            replaceability.clone(),
            pool.clone(),
        );
        let dump = config.dump_dir.as_ref().map(DumpDir::new);

        Ok(Pipeline {
            config,
            host: self.host,
            replaceability,
            scheduler,
            pool,
            rewriters: RwLock::new(rewriters.into()),
            extension_rewriters: RwLock::new(extension_rewriters),
            unmodified: DashSet::new(),
            gate,
            fields,
            tracking,
            retransformation_started: AtomicBool::new(false),
            dump,
        })
    }
}

/// Rewrites units on their way into the host runtime.
pub struct Pipeline {
    config: EngineConfig,
    host: Arc<dyn HostRuntime>,
    replaceability: Arc<Replaceability>,
    scheduler: Arc<ChangeScheduler>,
    pool: Arc<rayon::ThreadPool>,
    rewriters: RwLock<Arc<[Arc<dyn Rewriter>]>>,
    extension_rewriters: RwLock<usize>,
    unmodified: DashSet<String>,
    gate: ActivationGate,
    fields: Arc<FieldStorageRewriter>,
    tracking: Arc<InstanceTrackingRewriter>,
    retransformation_started: AtomicBool,
    dump: Option<DumpDir>,
}

impl Pipeline {
    /// Rewrites one unit.
    ///
    /// # Errors
    /// Returns a format error if the unit does not parse, [`Error::Repair`] if a modified
    /// method cannot be repaired for a reason other than a missing type, and
    /// [`Error::SymbolTableFull`] / [`Error::CodeTooLarge`] if the rewritten unit exceeds the
    /// format limits. The host must then load nothing for this unit.
    pub fn transform(&self, request: TransformRequest) -> Result<Transformed> {
        let Some(name) = request.name.as_deref() else {
            trace!(loader = %request.loader, "unnamed unit passed through");
            return Ok(Transformed::Unchanged);
        };
        let id = UnitId::new(name, request.loader);
        let redefinition = request.is_redefinition();
        if redefinition && !self.retransformation_started.swap(true, Ordering::AcqRel) {
            debug!(unit = %id, "first redefinition");
        }

        self.gate.observe(&id);

        let outcome = self.rewrite(&id, &request.bytes, redefinition)?;

        if let Some(previous) = request.previous {
            if let Transformed::Rewritten { bytes, .. } = &outcome {
                if self.config.log_redefinition {
                    info!(unit = %id, "redefining");
                }
                self.scheduler.enqueue_changed(ChangedUnit {
                    id,
                    previous,
                    current: Arc::from(bytes.as_slice()),
                });
            }
        } else if self.scheduler.is_waiting() {
            self.scheduler.enqueue_added(NewUnit { id });
        }
        Ok(outcome)
    }

    fn rewrite(&self, id: &UnitId, bytes: &[u8], redefinition: bool) -> Result<Transformed> {
        let replaceable = self.replaceability.is_replaceable(id);
        if !replaceable && self.unmodified.contains(&id.name) {
            trace!(unit = %id, "fast reject");
            return Ok(Transformed::Unchanged);
        }

        let mut unit = CompiledUnit::parse(bytes)?;
        let mut cx = RewriteContext::new(id.loader, redefinition, replaceable);

        let rewriters = self.rewriters();
        let mut changed = false;
        for rewriter in rewriters.iter() {
            changed |= run_isolated(rewriter.as_ref(), &mut unit, &mut cx);
        }

        if !changed {
            self.unmodified.insert(id.name.clone());
            trace!(unit = %id, "unchanged");
            return Ok(Transformed::Unchanged);
        }

        for &index in &cx.modified_methods {
            self.repair(&mut unit, index, id, bytes)?;
        }

        let rewritten = unit.to_bytes()?;
        debug!(
            unit = %id,
            methods = cx.modified_methods.len(),
            size = rewritten.len(),
            "unit rewritten"
        );
        if let Some(dump) = &self.dump {
            dump.original(&id.name, bytes);
            dump.rewritten(&id.name, &rewritten);
        }
        if !cx.eager_resolution.is_empty() {
            self.resolve_eagerly(id.loader, cx.eager_resolution.iter().cloned().collect());
        }

        Ok(Transformed::Rewritten {
            bytes: rewritten,
            modified_methods: cx.modified_methods,
        })
    }

    fn repair(&self, unit: &mut CompiledUnit, index: usize, id: &UnitId, original: &[u8]) -> Result<()> {
        let hierarchy = LoaderHierarchy {
            host: self.host.as_ref(),
            loader: id.loader,
        };
        match repair_method(unit, index, &hierarchy) {
            Ok(()) => Ok(()),
            Err(Error::Repair {
                method,
                source: RepairError::MissingType(missing),
            }) => {
                warn!(unit = %id, %method, %missing, "type not resolvable, method will throw");
                failure_stub(
                    unit,
                    index,
                    &format!("{missing} (while rewriting {}.{method})", id.name),
                )
            }
            Err(err) => {
                error!(unit = %id, error = %err, "repair failed");
                if let Some(dump) = &self.dump {
                    dump.failed(&id.name, original);
                }
                Err(err)
            }
        }
    }

    fn resolve_eagerly(&self, loader: LoaderId, types: Vec<String>) {
        self.scheduler.begin_verification();
        let host = self.host.clone();
        let scheduler = self.scheduler.clone();
        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| host.resolve_types(loader, &types)));
            match outcome {
                Ok(Ok(())) => trace!(?types, "eager resolution done"),
                Ok(Err(err)) => error!(%loader, error = %err, "eager resolution failed"),
                Err(_) => error!(%loader, ?types, "eager resolution panicked"),
            }
            scheduler.end_verification();
        });
    }

    /// Reports that the host refused to load a unit returned by [`Pipeline::transform`].
    ///
    /// The failure is logged; the returned error is meant to be surfaced by the host.
    pub fn report_load_failure(&self, unit: UnitId, message: &str) -> Error {
        error!(%unit, %message, "host rejected rewritten unit");
        Error::HostRejected {
            unit,
            message: message.to_string(),
        }
    }

    /// The rewriters in execution order.
    #[must_use]
    pub fn rewriters(&self) -> Arc<[Arc<dyn Rewriter>]> {
        read_lock!(self.rewriters).clone()
    }

    /// Registers `rewriter` after the other extension rewriters and before the core ones.
    ///
    /// Transforms already running keep the list they started with.
    pub fn add_rewriter(&self, rewriter: Arc<dyn Rewriter>) {
        let mut rewriters = write_lock!(self.rewriters);
        let mut boundary = write_lock!(self.extension_rewriters);
        let mut list = rewriters.to_vec();
        list.insert(*boundary, rewriter);
        *boundary += 1;
        *rewriters = list.into();
    }

    /// Removes every rewriter named `name`; returns `true` if one was removed.
    pub fn remove_rewriter(&self, name: &str) -> bool {
        let mut rewriters = write_lock!(self.rewriters);
        let mut boundary = write_lock!(self.extension_rewriters);
        let mut list = Vec::with_capacity(rewriters.len());
        for (position, rewriter) in rewriters.iter().enumerate() {
            if rewriter.name() != name {
                list.push(rewriter.clone());
            } else if position < *boundary {
                *boundary -= 1;
            }
        }
        let removed = list.len() != rewriters.len();
        *rewriters = list.into();
        removed
    }

    /// Forgets every rule about members of `owner` defined by `loader`.
    pub fn clear_rewrites(&self, owner: &str, loader: LoaderId) {
        let owner = internal_name(owner);
        for rewriter in self.rewriters().iter() {
            rewriter.clear_rewrites(&owner, loader);
        }
    }

    /// Forgets every rule defined by `loader`; the host calls this when it discards a loader.
    pub fn clear_loader(&self, loader: LoaderId) {
        debug!(%loader, "loader discarded");
        for rewriter in self.rewriters().iter() {
            rewriter.clear_loader(loader);
        }
    }

    /// Redirects accesses to the field `owner.name` of type `descriptor` in `loader`.
    ///
    /// Returns the slot of the field in the runtime store.
    pub fn add_field(&self, owner: &str, name: &str, descriptor: &str, loader: LoaderId) -> i32 {
        self.fields
            .add_field(&internal_name(owner), name, descriptor, loader)
    }

    /// The field storage rewriter, for inspecting its rules.
    #[must_use]
    pub fn field_storage(&self) -> &FieldStorageRewriter {
        &self.fields
    }

    /// Tracks live instances of `type_name` from now on.
    pub fn track_instances(&self, type_name: &str) {
        self.tracking.add_tracked(type_name);
    }

    /// The combined replaceability policy.
    #[must_use]
    pub fn replaceability(&self) -> &Arc<Replaceability> {
        &self.replaceability
    }

    /// The scheduler receiving redefinitions.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<ChangeScheduler> {
        &self.scheduler
    }

    /// The extension activation gate.
    #[must_use]
    pub fn activation_gate(&self) -> &ActivationGate {
        &self.gate
    }

    /// Returns `true` once the first redefinition went through the pipeline.
    #[must_use]
    pub fn retransformation_started(&self) -> bool {
        self.retransformation_started.load(Ordering::Acquire)
    }

    /// Returns `true` if `name` is known to need no rewriting.
    #[must_use]
    pub fn is_known_unmodified(&self, name: &str) -> bool {
        self.unmodified.contains(&internal_name(name))
    }

    /// The configuration the pipeline was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Runs one rewriter on a copy of the unit and keeps the copy only if it succeeded.
fn run_isolated(rewriter: &dyn Rewriter, unit: &mut CompiledUnit, cx: &mut RewriteContext) -> bool {
    let mut candidate = unit.clone();
    let mut candidate_cx = cx.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        rewriter.rewrite(&mut candidate, &mut candidate_cx)
    }));
    match outcome {
        Ok(Ok(true)) => {
            *unit = candidate;
            *cx = candidate_cx;
            true
        }
        Ok(Ok(false)) => false,
        Ok(Err(err)) => {
            warn!(rewriter = rewriter.name(), error = %err, "rewriter failed, skipping it");
            false
        }
        Err(_) => {
            warn!(rewriter = rewriter.name(), "rewriter panicked, skipping it");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::TypeInfo,
        assembly::opcodes::*,
        classfile::{builder::UnitBuilder, MemberAccess},
    };

    struct Host;

    impl HostRuntime for Host {
        fn describe_type(&self, _loader: LoaderId, name: &str) -> Option<TypeInfo> {
            (name == "java/lang/Object").then(|| TypeInfo {
                super_name: None,
                is_interface: false,
            })
        }

        fn resolve_types(&self, _loader: LoaderId, _types: &[String]) -> Result<()> {
            Ok(())
        }
    }

    struct Failing;

    impl Rewriter for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn rewrite(&self, unit: &mut CompiledUnit, _cx: &mut RewriteContext) -> Result<bool> {
            unit.methods.clear();
            Err(Error::Error("broken rewriter".to_string()))
        }
    }

    struct Panicking;

    impl Rewriter for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn rewrite(&self, _unit: &mut CompiledUnit, _cx: &mut RewriteContext) -> Result<bool> {
            panic!("rewriter bug");
        }
    }

    fn plain_unit() -> Vec<u8> {
        UnitBuilder::new("t/Plain")
            .method(MemberAccess::STATIC, "one", "()I", |code| {
                code.op(ICONST_1)?;
                code.op(IRETURN)
            })
            .build()
            .unwrap()
    }

    #[test]
    fn unnamed_units_pass_through() -> Result<()> {
        let pipeline = PipelineBuilder::new(Arc::new(Host)).build()?;
        let request = TransformRequest {
            name: None,
            loader: LoaderId(0),
            bytes: Arc::from(&b"not even a class file"[..]),
            previous: None,
        };
        assert_eq!(pipeline.transform(request)?, Transformed::Unchanged);
        Ok(())
    }

    #[test]
    fn faulty_rewriters_are_isolated() -> Result<()> {
        let pipeline = PipelineBuilder::new(Arc::new(Host)).build()?;
        pipeline.add_rewriter(Arc::new(Failing));
        pipeline.add_rewriter(Arc::new(Panicking));
        assert_eq!(pipeline.rewriters()[0].name(), "failing");
        assert_eq!(pipeline.rewriters()[1].name(), "panicking");

        let outcome = pipeline.transform(TransformRequest::load("t/Plain", LoaderId(0), plain_unit()))?;
        assert_eq!(outcome, Transformed::Unchanged);
        assert!(pipeline.is_known_unmodified("t.Plain"));
        Ok(())
    }

    #[test]
    fn removing_rewriters_keeps_order() -> Result<()> {
        let pipeline = PipelineBuilder::new(Arc::new(Host)).build()?;
        let core = pipeline.rewriters().len();
        pipeline.add_rewriter(Arc::new(Failing));
        assert!(pipeline.remove_rewriter("failing"));
        assert!(!pipeline.remove_rewriter("failing"));
        assert_eq!(pipeline.rewriters().len(), core);
        assert_eq!(pipeline.rewriters()[0].name(), "field-storage");

        pipeline.add_rewriter(Arc::new(Panicking));
        assert_eq!(pipeline.rewriters()[0].name(), "panicking");
        Ok(())
    }

    #[test]
    fn parse_errors_reach_the_caller() -> Result<()> {
        let pipeline = PipelineBuilder::new(Arc::new(Host)).build()?;
        let request = TransformRequest::load("t/Broken", LoaderId(0), vec![0xCA, 0xFE]);
        assert!(pipeline.transform(request).is_err());
        Ok(())
    }

    #[test]
    fn host_rejection_is_reported() -> Result<()> {
        let pipeline = PipelineBuilder::new(Arc::new(Host)).build()?;
        let err = pipeline.report_load_failure(UnitId::new("a.B", LoaderId(2)), "VerifyError");
        assert!(matches!(err, Error::HostRejected { ref message, .. } if message == "VerifyError"));
        Ok(())
    }
}
