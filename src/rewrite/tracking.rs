//! Registration of live instances of tracked types.
//!
//! Extensions that re-wire object graphs after a redefinition need to find the existing
//! instances of a few types. Every constructor of such a type reports `this` to the
//! instance tracker as soon as the object is initialised.

use std::collections::BTreeSet;

use dashmap::DashSet;
use tracing::debug;

use crate::{
    assembly::{encoder::PatchEncoder, opcodes::*},
    classfile::{internal_name, CompiledUnit},
    rewrite::{check_neutral, edit_methods, targets::TRACKER_ADD, Edit, RewriteContext, Rewriter, RuntimeTargets},
    Result,
};

const NAME: &str = "instance-tracking";
const CONSTRUCTOR: &str = "<init>";

/// Inserts an instance-tracker call after the `this`/`super` constructor call.
pub struct InstanceTrackingRewriter {
    tracked: DashSet<String>,
    targets: RuntimeTargets,
}

impl InstanceTrackingRewriter {
    /// Creates a rewriter tracking nothing yet.
    #[must_use]
    pub fn new(targets: RuntimeTargets) -> Self {
        InstanceTrackingRewriter {
            tracked: DashSet::new(),
            targets,
        }
    }

    /// Tracks instances of `name` (dotted or internal form) from now on.
    pub fn add_tracked(&self, name: &str) {
        self.tracked.insert(internal_name(name));
    }

    /// Returns `true` if instances of `name` are tracked.
    #[must_use]
    pub fn is_tracked(&self, name: &str) -> bool {
        self.tracked.contains(&internal_name(name))
    }
}

impl Rewriter for InstanceTrackingRewriter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Reports every constructed instance of a tracked type to the instance tracker"
    }

    fn rewrite(&self, unit: &mut CompiledUnit, cx: &mut RewriteContext) -> Result<bool> {
        if self.tracked.is_empty() {
            return Ok(false);
        }
        let this_name = unit.name()?.into_owned();
        if !self.tracked.contains(&this_name) {
            return Ok(false);
        }
        let super_name = unit.super_name()?.map(|name| name.into_owned());

        let mut constructors = BTreeSet::new();
        for (index, method) in unit.methods.iter().enumerate() {
            if method.name(&unit.symbols)? == CONSTRUCTOR {
                constructors.insert(index);
            }
        }
        if constructors.is_empty() {
            return Ok(false);
        }

        // The tracker is keyed by the source-level type name.
        let reported = this_name.replace('/', ".");
        let tracker = self.targets.instance_tracker.as_str();
        let changed = edit_methods(unit, cx, |method, instruction, symbols| {
            if instruction.opcode != INVOKESPECIAL || !constructors.contains(&method) {
                return Ok(None);
            }
            let Some(index) = instruction.symbol() else {
                return Ok(None);
            };
            let Some(target) = symbols.member_ref(index)? else {
                return Ok(None);
            };
            let delegates = target.name == CONSTRUCTOR
                && (target.owner == this_name.as_str()
                    || super_name.as_deref() == Some(target.owner.as_ref()));
            if !delegates {
                return Ok(None);
            }
            // only the first delegating call initialises `this`
            constructors.remove(&method);

            let mut encoder = PatchEncoder::new(symbols);
            encoder.push_string(&reported)?;
            encoder.op(ALOAD_0)?;
            encoder.invoke(INVOKESTATIC, tracker, TRACKER_ADD.0, TRACKER_ADD.1)?;
            let patch = encoder.finish()?;
            check_neutral(NAME, &patch, 0)?;
            Ok(Some(Edit::InsertAfter(patch)))
        })?;

        if changed {
            debug!(unit = %this_name, "instance tracking inserted");
        }
        Ok(changed)
    }
}
