//! Symbol-table scan that finds the member references a rule wants redirected.

use rustc_hash::FxHashMap;

use crate::{
    classfile::{
        constants::{MemberRef, SymbolTable},
        CompiledUnit,
    },
    rewrite::RewriteContext,
    Result,
};

/// Per-scan view of one redirection concern.
///
/// Implementations usually hold a [`crate::rewrite::rules::RuleSnapshot`] taken when the scan
/// starts, so classification is consistent across the whole table.
pub trait ReferenceRule {
    /// What the rewriter needs to know about a matched reference.
    type Redirect: Clone;

    /// Returns `true` if nothing can match for this unit, which skips the scan entirely.
    fn is_idle(&self, _cx: &RewriteContext) -> bool {
        false
    }

    /// Decides whether the reference at `index` is redirected.
    ///
    /// Rules may append symbols (the redirection targets) and register new rules on the fly;
    /// the scan continues with the next index afterwards.
    ///
    /// # Errors
    /// Returns an error if a required symbol cannot be added.
    fn classify(
        &mut self,
        index: u16,
        reference: &MemberRef<'_>,
        symbols: &mut SymbolTable,
        cx: &mut RewriteContext,
    ) -> Result<Option<Self::Redirect>>;
}

/// Matched references of one scan, keyed by symbol index.
#[derive(Debug, Clone)]
pub struct ScanMatches<R> {
    matches: FxHashMap<u16, R>,
}

impl<R> Default for ScanMatches<R> {
    fn default() -> Self {
        ScanMatches {
            matches: FxHashMap::default(),
        }
    }
}

impl<R> ScanMatches<R> {
    /// The redirect for symbol `index`, if it matched.
    #[must_use]
    pub fn get(&self, index: u16) -> Option<&R> {
        self.matches.get(&index)
    }

    /// Number of matched references.
    #[must_use]
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// Returns `true` if nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Classifies every member reference that existed in `unit` when the scan started.
///
/// Symbols appended during the scan are redirection targets and are not scanned again.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for broken references and any error raised by the
/// rule.
pub fn scan_references<R: ReferenceRule>(
    unit: &mut CompiledUnit,
    rule: &mut R,
    cx: &mut RewriteContext,
) -> Result<ScanMatches<R::Redirect>> {
    let mut matches = ScanMatches::default();
    if rule.is_idle(cx) {
        return Ok(matches);
    }

    let end = u16::try_from(unit.symbols.len()).map_err(|_| out_of_bounds_error!())?;
    for index in 1..end {
        let Some(reference) = unit.symbols.member_ref(index)? else {
            continue;
        };
        let reference = reference.into_owned();
        if let Some(redirect) = rule.classify(index, &reference, &mut unit.symbols, cx)? {
            matches.matches.insert(index, redirect);
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{constants::MemberKind, LoaderId};

    struct NamedMethods(&'static str);

    impl ReferenceRule for NamedMethods {
        type Redirect = u16;

        fn classify(
            &mut self,
            _index: u16,
            reference: &MemberRef<'_>,
            symbols: &mut SymbolTable,
            _cx: &mut RewriteContext,
        ) -> Result<Option<u16>> {
            if reference.kind != MemberKind::Method || reference.name != self.0 {
                return Ok(None);
            }
            // appending a reference must not extend the scan
            symbols
                .add_method_ref("t/Helper", self.0, "()V")
                .map(Some)
        }
    }

    #[test]
    fn scans_only_the_original_table() -> Result<()> {
        let mut unit = CompiledUnit::parse(
            &crate::classfile::builder::UnitBuilder::new("t/Scan")
                .method(crate::classfile::MemberAccess::STATIC, "run", "()V", |code| {
                    code.invoke(crate::assembly::opcodes::INVOKESTATIC, "t/Other", "go", "()V")?;
                    code.field(crate::assembly::opcodes::GETSTATIC, "t/Other", "go", "I")?;
                    code.op(crate::assembly::opcodes::POP)?;
                    code.op(crate::assembly::opcodes::RETURN)
                })
                .build()?,
        )?;
        let before = unit.symbols.len();
        let mut cx = RewriteContext::new(LoaderId(0), false, false);

        let matches = scan_references(&mut unit, &mut NamedMethods("go"), &mut cx)?;

        assert_eq!(matches.len(), 1);
        assert!(unit.symbols.len() > before);
        let (index, helper) = matches.matches.iter().next().map(|(i, h)| (*i, *h)).unwrap();
        assert!(usize::from(index) < before);
        assert!(usize::from(helper) >= before);
        Ok(())
    }
}
