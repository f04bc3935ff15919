//! Redirected field storage.
//!
//! A loaded type cannot gain fields, so accesses to fields added by a redefinition are
//! redirected to a per-slot store in the runtime. Each field is identified by a slot number
//! allocated per `(name, descriptor)`. A redirected access becomes
//!
//! ```text
//! <slot>; invokestatic FieldSlots.isRedirected(I)Z; ifeq ORIGINAL
//! <store or load through FieldSlots>; goto END
//! ORIGINAL: <the original get/put>
//! END:
//! ```
//!
//! Instance accesses pass the receiver to the store; static accesses pass the owning
//! `Class` instead, because one store serves the synthetic slots of every type.

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    assembly::{
        encoder::{Patch, PatchEncoder},
        opcodes::*,
    },
    classfile::{
        constants::{MemberKind, MemberRef, SymbolTable},
        descriptor::{field_access_delta, FieldType},
        CompiledUnit, LoaderId,
    },
    pipeline::policy::LoadedTypes,
    rewrite::{
        boxing::{box_value, unbox_value},
        check_neutral, edit_methods,
        rules::{RuleIndex, RuleKey, RuleSnapshot},
        scanner::{scan_references, ReferenceRule},
        targets::{RuntimeTargets, SLOT_GET, SLOT_PREDICATE, SLOT_SET},
        Edit, RewriteContext, Rewriter,
    },
    Result,
};

const NAME: &str = "field-storage";

/// A field whose accesses go through the slot store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRedirect {
    /// Slot number in the store
    pub slot: i32,
    /// Internal name of the declaring type
    pub owner: String,
    /// Field name
    pub name: String,
    /// Field descriptor
    pub descriptor: String,
}

/// Rewrites get/put of redirected fields into calls on the slot store.
pub struct FieldStorageRewriter {
    rules: RuleIndex<FieldRedirect>,
    slots: DashMap<(String, String), i32>,
    next_slot: AtomicI32,
    loaded: Arc<dyn LoadedTypes>,
    targets: RuntimeTargets,
}

impl FieldStorageRewriter {
    /// Creates a rewriter calling into `targets`, discovering added fields through `loaded`.
    pub fn new(targets: RuntimeTargets, loaded: Arc<dyn LoadedTypes>) -> Self {
        FieldStorageRewriter {
            rules: RuleIndex::new(),
            slots: DashMap::new(),
            next_slot: AtomicI32::new(0),
            loaded,
            targets,
        }
    }

    /// The slot for `(name, descriptor)`, allocating one on first use.
    pub fn slot_for(&self, name: &str, descriptor: &str) -> i32 {
        *self
            .slots
            .entry((name.to_string(), descriptor.to_string()))
            .or_insert_with(|| self.next_slot.fetch_add(1, Ordering::Relaxed))
    }

    /// Redirects field `name` of `owner` in units of `loader` and returns its slot.
    pub fn add_field(&self, owner: &str, name: &str, descriptor: &str, loader: LoaderId) -> i32 {
        let key = RuleKey::new(owner, name, loader);
        let slot = self.slot_for(name, descriptor);
        let redirect = FieldRedirect {
            slot,
            owner: key.owner.clone(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        };
        self.rules.insert(key, redirect);
        slot
    }

    /// The standing redirections.
    pub fn rules(&self) -> &RuleIndex<FieldRedirect> {
        &self.rules
    }

    fn redirect_patch(
        &self,
        opcode: u8,
        index: u16,
        redirect: &FieldRedirect,
        symbols: &mut SymbolTable,
    ) -> Result<Patch> {
        let field = FieldType::parse(&redirect.descriptor)?;
        let store = self.targets.field_slots.as_str();
        let is_static = matches!(opcode, GETSTATIC | PUTSTATIC);
        let is_put = matches!(opcode, PUTFIELD | PUTSTATIC);

        let mut encoder = PatchEncoder::new(symbols);
        encoder.push_int(redirect.slot)?;
        encoder.invoke(INVOKESTATIC, store, SLOT_PREDICATE.0, SLOT_PREDICATE.1)?;
        encoder.branch(IFEQ, "original")?;

        if is_put {
            // receiver (or owning class), boxed value, slot
            box_value(&mut encoder, &field)?;
            if is_static {
                encoder.push_class(&redirect.owner)?;
                encoder.op(SWAP)?;
            }
            encoder.push_int(redirect.slot)?;
            encoder.invoke(INVOKESTATIC, store, SLOT_SET.0, SLOT_SET.1)?;
        } else {
            if is_static {
                encoder.push_class(&redirect.owner)?;
            }
            encoder.push_int(redirect.slot)?;
            encoder.invoke(INVOKESTATIC, store, SLOT_GET.0, SLOT_GET.1)?;
            unbox_value(&mut encoder, &field)?;
        }
        encoder.branch(GOTO, "end")?;

        encoder.define_label("original")?;
        encoder.field_symbol(opcode, index)?;
        encoder.define_label("end")?;

        let patch = encoder.finish()?;
        check_neutral(NAME, &patch, field_access_delta(&field, is_static, is_put))?;
        Ok(patch)
    }
}

struct FieldScan<'r> {
    rewriter: &'r FieldStorageRewriter,
    snapshot: RuleSnapshot<FieldRedirect>,
}

impl ReferenceRule for FieldScan<'_> {
    type Redirect = FieldRedirect;

    fn is_idle(&self, cx: &RewriteContext) -> bool {
        self.snapshot.is_empty() && !cx.replaceable
    }

    fn classify(
        &mut self,
        _index: u16,
        reference: &MemberRef<'_>,
        _symbols: &mut SymbolTable,
        cx: &mut RewriteContext,
    ) -> Result<Option<FieldRedirect>> {
        if reference.kind != MemberKind::Field {
            return Ok(None);
        }
        if let Some(redirect) = self.snapshot.get(&reference.owner, &reference.name) {
            return Ok((redirect.descriptor == reference.descriptor).then(|| redirect.clone()));
        }
        if !cx.replaceable {
            return Ok(None);
        }

        // a field the loaded version of its owner lacks is about to be added
        let exists = self
            .rewriter
            .loaded
            .field_exists(cx.loader, &reference.owner, &reference.name);
        if exists != Some(false) {
            return Ok(None);
        }

        let slot = self
            .rewriter
            .add_field(&reference.owner, &reference.name, &reference.descriptor, cx.loader);
        let redirect = FieldRedirect {
            slot,
            owner: reference.owner.to_string(),
            name: reference.name.to_string(),
            descriptor: reference.descriptor.to_string(),
        };
        debug!(
            owner = %reference.owner,
            field = %reference.name,
            slot,
            "redirecting access to added field"
        );
        self.snapshot
            .insert_local(&reference.owner, &reference.name, redirect.clone());
        cx.require_resolution(&reference.owner);
        Ok(Some(redirect))
    }
}

impl Rewriter for FieldStorageRewriter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Redirects accesses to fields added after load to the runtime slot store"
    }

    fn rewrite(&self, unit: &mut CompiledUnit, cx: &mut RewriteContext) -> Result<bool> {
        let mut scan = FieldScan {
            rewriter: self,
            snapshot: self.rules.snapshot(cx.loader),
        };
        let matches = scan_references(unit, &mut scan, cx)?;
        if matches.is_empty() {
            return Ok(false);
        }

        edit_methods(unit, cx, |_, instruction, symbols| {
            if !matches!(
                instruction.opcode,
                GETFIELD | PUTFIELD | GETSTATIC | PUTSTATIC
            ) {
                return Ok(None);
            }
            let Some(index) = instruction.symbol() else {
                return Ok(None);
            };
            let Some(redirect) = matches.get(index) else {
                return Ok(None);
            };
            self.redirect_patch(instruction.opcode, index, redirect, symbols)
                .map(|patch| Some(Edit::Substitute(patch)))
        })
    }

    fn clear_rewrites(&self, owner: &str, loader: LoaderId) {
        self.rules.clear(owner, loader);
    }

    fn clear_loader(&self, loader: LoaderId) {
        self.rules.clear_loader(loader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::instruction::decode_all,
        classfile::{builder::UnitBuilder, MemberAccess},
        pipeline::policy::NoLoadedTypes,
    };

    struct Lacks(&'static str);

    impl LoadedTypes for Lacks {
        fn field_exists(&self, _loader: LoaderId, owner: &str, name: &str) -> Option<bool> {
            (owner == "t/Holder").then(|| name != self.0)
        }
    }

    fn accessor() -> CompiledUnit {
        let bytes = UnitBuilder::new("t/User")
            .method(MemberAccess::STATIC, "bump", "(Lt/Holder;)V", |code| {
                code.op(ALOAD_0)?;
                code.op(ALOAD_0)?;
                code.field(GETFIELD, "t/Holder", "count", "J")?;
                code.op(LCONST_1)?;
                code.op(LADD)?;
                code.field(PUTFIELD, "t/Holder", "count", "J")?;
                code.field(GETSTATIC, "t/Holder", "name", "Ljava/lang/String;")?;
                code.op(POP)?;
                code.op(RETURN)
            })
            .build()
            .unwrap();
        CompiledUnit::parse(&bytes).unwrap()
    }

    fn opcodes(unit: &CompiledUnit) -> Vec<u8> {
        decode_all(&unit.methods[0].code().unwrap().code)
            .unwrap()
            .into_iter()
            .map(|i| i.opcode)
            .collect()
    }

    #[test]
    fn untouched_without_rules() -> Result<()> {
        let rewriter = FieldStorageRewriter::new(RuntimeTargets::default(), Arc::new(NoLoadedTypes));
        let mut unit = accessor();
        let original = unit.clone();
        let mut cx = RewriteContext::new(LoaderId(1), false, true);
        assert!(!rewriter.rewrite(&mut unit, &mut cx)?);
        assert_eq!(unit, original);
        assert!(cx.modified_methods.is_empty());
        Ok(())
    }

    #[test]
    fn redirects_registered_fields() -> Result<()> {
        let rewriter = FieldStorageRewriter::new(RuntimeTargets::default(), Arc::new(NoLoadedTypes));
        let slot = rewriter.add_field("t.Holder", "count", "J", LoaderId(1));
        assert_eq!(rewriter.slot_for("count", "J"), slot);

        let mut unit = accessor();
        let mut cx = RewriteContext::new(LoaderId(1), false, false);
        assert!(rewriter.rewrite(&mut unit, &mut cx)?);
        assert_eq!(cx.modified_methods.len(), 1);

        let ops = opcodes(&unit);
        // both accesses of `count` are wrapped, `name` is not
        assert_eq!(ops.iter().filter(|op| **op == GETFIELD).count(), 1);
        assert_eq!(ops.iter().filter(|op| **op == PUTFIELD).count(), 1);
        assert_eq!(ops.iter().filter(|op| **op == GETSTATIC).count(), 1);
        assert_eq!(ops.iter().filter(|op| **op == IFEQ).count(), 2);
        assert_eq!(ops.iter().filter(|op| **op == NOP).count(), 6);

        let reparsed = CompiledUnit::parse(&unit.to_bytes()?)?;
        assert_eq!(reparsed, unit);
        Ok(())
    }

    #[test]
    fn other_loaders_are_unaffected() -> Result<()> {
        let rewriter = FieldStorageRewriter::new(RuntimeTargets::default(), Arc::new(NoLoadedTypes));
        rewriter.add_field("t/Holder", "count", "J", LoaderId(1));
        let mut unit = accessor();
        let mut cx = RewriteContext::new(LoaderId(2), false, false);
        assert!(!rewriter.rewrite(&mut unit, &mut cx)?);

        rewriter.clear_rewrites("t/Holder", LoaderId(1));
        let mut cx = RewriteContext::new(LoaderId(1), false, false);
        assert!(!rewriter.rewrite(&mut unit, &mut cx)?);
        Ok(())
    }

    #[test]
    fn discarded_loaders_lose_their_rules() -> Result<()> {
        let rewriter = FieldStorageRewriter::new(RuntimeTargets::default(), Arc::new(NoLoadedTypes));
        rewriter.add_field("t/Holder", "count", "J", LoaderId(1));
        rewriter.add_field("t/Holder", "count", "J", LoaderId(2));

        rewriter.clear_loader(LoaderId(1));

        let mut cx = RewriteContext::new(LoaderId(1), false, false);
        assert!(!rewriter.rewrite(&mut accessor(), &mut cx)?);
        let mut cx = RewriteContext::new(LoaderId(2), false, false);
        assert!(rewriter.rewrite(&mut accessor(), &mut cx)?);
        Ok(())
    }

    #[test]
    fn discovers_added_fields_in_replaceable_units() -> Result<()> {
        let rewriter = FieldStorageRewriter::new(RuntimeTargets::default(), Arc::new(Lacks("name")));
        let mut unit = accessor();
        let mut cx = RewriteContext::new(LoaderId(3), true, true);

        assert!(rewriter.rewrite(&mut unit, &mut cx)?);
        assert!(cx.eager_resolution.contains("t/Holder"));
        assert!(rewriter
            .rules()
            .snapshot(LoaderId(3))
            .get("t/Holder", "name")
            .is_some());
        // `count` exists on the loaded type and stays a plain access
        let ops = opcodes(&unit);
        assert_eq!(ops.iter().filter(|op| **op == IFEQ).count(), 1);
        Ok(())
    }

    #[test]
    fn static_put_threads_the_owner_class() -> Result<()> {
        let rewriter = FieldStorageRewriter::new(RuntimeTargets::default(), Arc::new(NoLoadedTypes));
        let redirect = FieldRedirect {
            slot: 3,
            owner: "t/Holder".into(),
            name: "total".into(),
            descriptor: "D".into(),
        };
        let mut symbols = SymbolTable::new();
        let index = symbols.add_field_ref("t/Holder", "total", "D")?;
        let patch = rewriter.redirect_patch(PUTSTATIC, index, &redirect, &mut symbols)?;
        assert_eq!(patch.stack_delta, -2);

        let ops: Vec<u8> = decode_all(&patch.code)?.into_iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![
                ICONST_3,
                INVOKESTATIC,
                IFEQ,
                INVOKESTATIC,
                LDC,
                SWAP,
                ICONST_3,
                INVOKESTATIC,
                GOTO,
                PUTSTATIC
            ]
        );
        Ok(())
    }
}
