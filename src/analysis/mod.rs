//! Stack-map and frame-limit repair for rewritten method bodies.
//!
//! Rewriting changes instruction offsets and stack shapes, which invalidates a method's
//! `StackMapTable` and possibly its `max_stack`. [`repair_method`] recomputes both from
//! scratch with the abstract interpreter in [`frames`]; [`failure_stub`] replaces a body that
//! cannot be repaired because one of its types does not resolve.
//!
//! Units older than major version 50 carry no stack maps, so repair only recomputes their
//! `max_stack`.

pub mod frames;
pub mod stub;

use crate::{
    assembly::opcodes::{ATHROW, NOP},
    classfile::{
        code::{ExceptionEntry, RawAttribute},
        CompiledUnit, STACK_MAP_MAJOR_VERSION,
    },
    Error, Result,
};

pub use frames::{
    Frame, LenientHierarchy, TypeHierarchy, TypeInfo, VType, OBJECT, THROWABLE,
};
pub use stub::failure_stub;

use frames::{analyze, encode_stack_map, MethodContext, ScopedHierarchy};

/// Recomputes `max_stack` and the stack-map frames of method `index` of `unit`.
///
/// Blocks that no path reaches are overwritten with `nop`s ending in `athrow` and get a
/// frame with an empty local array and a `java/lang/Throwable` on the stack; exception
/// ranges are cut around them. Methods without a body are left alone.
///
/// # Errors
/// Returns [`Error::Repair`] when the body cannot be given consistent frames. A
/// [`crate::RepairError::MissingType`] source means a merged type did not resolve through
/// `hierarchy`.
pub fn repair_method(
    unit: &mut CompiledUnit,
    index: usize,
    hierarchy: &dyn TypeHierarchy,
) -> Result<()> {
    if unit.major_version < STACK_MAP_MAJOR_VERSION {
        return compute_max_stack(unit, index);
    }

    let owner = unit.name()?.into_owned();
    let info = TypeInfo {
        super_name: unit.super_name()?.map(std::borrow::Cow::into_owned),
        is_interface: unit.is_interface(),
    };

    let CompiledUnit {
        symbols, methods, ..
    } = unit;
    let method = methods.get_mut(index).ok_or(out_of_bounds_error!())?;
    let method_name = method.display_name(symbols);
    let name = method.name(symbols)?.into_owned();
    let descriptor = method.descriptor(symbols)?.into_owned();
    let is_static = method.is_static();
    let Some(code) = method.code_mut() else {
        return Ok(());
    };

    let context = MethodContext {
        owner: &owner,
        name: &name,
        descriptor: &descriptor,
        is_static,
        max_locals: code.max_locals,
        allow_subroutines: false,
    };
    let wrap = |source| Error::Repair {
        method: method_name.clone(),
        source,
    };

    let scoped = ScopedHierarchy {
        name: &owner,
        info,
        inner: hierarchy,
    };
    let analysis =
        analyze(&code.code, &code.exception_table, symbols, &scoped, &context).map_err(wrap)?;

    for (start, end) in &analysis.dead_ranges {
        let (start, end) = (*start as usize, *end as usize);
        code.code[start..end - 1].fill(NOP);
        code.code[end - 1] = ATHROW;
    }
    code.exception_table = cut_ranges(&code.exception_table, &analysis.dead_ranges);

    let dead_frame = Frame {
        locals: Vec::new(),
        stack: vec![VType::Object(THROWABLE.to_string())],
    };
    let frames = analysis
        .frame_offsets
        .iter()
        .map(|offset| {
            let frame = analysis
                .frames
                .get(offset)
                .cloned()
                .unwrap_or_else(|| dead_frame.clone());
            (*offset, frame)
        })
        .collect::<Vec<_>>();

    code.max_stack = if analysis.dead_ranges.is_empty() {
        analysis.max_stack
    } else {
        analysis.max_stack.max(1)
    };
    code.remove_attribute(symbols, "StackMapTable");
    if !frames.is_empty() {
        let data = encode_stack_map(&frames, symbols)?;
        code.attributes.push(RawAttribute {
            name_index: symbols.add_utf8("StackMapTable")?,
            data,
        });
    }
    Ok(())
}

/// Recomputes only `max_stack` of method `index`, merging unknown references leniently.
///
/// # Errors
/// Returns [`Error::Repair`] for bodies whose stack heights are inconsistent.
pub fn compute_max_stack(unit: &mut CompiledUnit, index: usize) -> Result<()> {
    let owner = unit.name()?.into_owned();
    let legacy = unit.major_version < STACK_MAP_MAJOR_VERSION;
    let CompiledUnit {
        symbols, methods, ..
    } = unit;
    let method = methods.get_mut(index).ok_or(out_of_bounds_error!())?;
    let method_name = method.display_name(symbols);
    let name = method.name(symbols)?.into_owned();
    let descriptor = method.descriptor(symbols)?.into_owned();
    let is_static = method.is_static();
    let Some(code) = method.code_mut() else {
        return Ok(());
    };

    let context = MethodContext {
        owner: &owner,
        name: &name,
        descriptor: &descriptor,
        is_static,
        max_locals: code.max_locals,
        allow_subroutines: legacy,
    };
    let analysis = analyze(
        &code.code,
        &code.exception_table,
        symbols,
        &LenientHierarchy,
        &context,
    )
    .map_err(|source| Error::Repair {
        method: method_name,
        source,
    })?;
    code.max_stack = analysis.max_stack;
    Ok(())
}

/// Removes the `[start, end)` ranges in `dead` from every protected range, splitting entries
/// that straddle a dead block and dropping those left empty.
#[allow(clippy::cast_possible_truncation)]
fn cut_ranges(entries: &[ExceptionEntry], dead: &[(u32, u32)]) -> Vec<ExceptionEntry> {
    let mut result = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut pieces = vec![(u32::from(entry.start_pc), u32::from(entry.end_pc))];
        for (dead_start, dead_end) in dead {
            pieces = pieces
                .into_iter()
                .flat_map(|(start, end)| {
                    let before = (start, end.min(*dead_start));
                    let after = (start.max(*dead_end), end);
                    [before, after]
                })
                .filter(|(start, end)| start < end)
                .collect();
        }
        // pieces lie inside the original u16 range
        for (start, end) in pieces {
            result.push(ExceptionEntry {
                start_pc: start as u16,
                end_pc: end as u16,
                ..*entry
            });
        }
    }
    result
}
