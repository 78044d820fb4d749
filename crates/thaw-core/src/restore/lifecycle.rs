// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type lifecycle restorer.
//!
//! Drives a parsed type through the ordinary loader's states: define (or
//! merge with the predefined type of the same name and loader), link
//! without re-checking dispatch compatibility, and stop at
//! `BeingInitialized` when the record reached a terminal state. The rest
//! of initialization needs heap data and completes in the heap phase.
use tracing::debug;

use super::reconcile::check_equivalent;
use super::UnfilledTypeInfo;
use crate::codec::{DeferredRef, ParsedClass};
use crate::error::RestoreError;
use crate::identity::{IdentityTable, LiveRef};
use crate::runtime::{
    internal, ClassDefinition, ClassSlot, CpEntry, LifecycleState, Runtime, TypeRef,
};

/// Outcome of defining one class record.
#[derive(Debug)]
pub(crate) struct Defined {
    pub(crate) ty: TypeRef,
    pub(crate) deferred: Vec<DeferredRef>,
    pub(crate) unfilled: Option<UnfilledTypeInfo>,
}

/// Defines `parsed` and advances it as far as the class dump alone allows.
///
/// The type is marked on the restore gate; the caller clears the mark once
/// the type has reached its final state.
pub(crate) fn define(
    rt: &mut Runtime,
    ids: &mut IdentityTable,
    parsed: ParsedClass,
) -> Result<Defined, RestoreError> {
    let ParsedClass {
        id,
        definition,
        target,
        init_error,
        vtable_len,
        itable_len,
        deferred,
    } = parsed;
    let name = definition.name.clone();

    let (ty, deferred) = match rt.find_defined(&definition.name, definition.loader) {
        Some(existing) => {
            check_equivalent(rt, existing, &definition)?;
            ids.insert_preexisting(id, LiveRef::Type(existing))?;
            let deferred = merge(rt, existing, definition, deferred)?;
            (existing, deferred)
        }
        None => {
            let t = rt.allocate_class(definition)?;
            ids.insert(id, LiveRef::Type(t))?;
            rt.load_class(t)?;
            (t, deferred)
        }
    };
    rt.restore_gate().mark(ty);

    if target.is_at_least(LifecycleState::Linked)
        && !rt.class(ty)?.state.is_at_least(LifecycleState::Linked)
    {
        debug_assert!(
            dependencies_reached(rt, ty, LifecycleState::Linked),
            "{name}: supertypes must be linked first"
        );
        rt.link_trusted(ty, vtable_len, itable_len)?;
    }

    let state = rt.class(ty)?.state;
    let unfilled = if target.is_terminal() && !state.is_terminal() {
        rt.advance_state(ty, LifecycleState::BeingInitialized)?;
        Some(UnfilledTypeInfo { target, init_error })
    } else {
        None
    };
    debug!(
        class = %name,
        %id,
        ?target,
        state = ?rt.class(ty)?.state,
        deferred = deferred.len(),
        "type defined"
    );
    Ok(Defined {
        ty,
        deferred,
        unfilled,
    })
}

/// Moves the parts of `parsed` the predefined type lacks into it and
/// returns the deferred references that still apply.
fn merge(
    rt: &mut Runtime,
    existing: TypeRef,
    parsed: ClassDefinition,
    deferred: Vec<DeferredRef>,
) -> Result<Vec<DeferredRef>, RestoreError> {
    let ic = rt.instance_mut(existing)?;
    let body = parsed.body;
    let transplant = ic.linkage.is_none() && body.linkage.is_some();
    if transplant {
        ic.linkage = body.linkage;
        ic.internal_flags |= internal::REWRITTEN;
    }
    if ic.cached_class_file.is_none() {
        ic.cached_class_file = body.cached_class_file;
    }
    Ok(deferred
        .into_iter()
        .filter(|d| match d {
            DeferredRef::CpClass { index, .. } => matches!(
                ic.constants.get(*index),
                Some(CpEntry::Class {
                    slot: ClassSlot::Unresolved,
                    ..
                })
            ),
            _ => transplant,
        })
        .collect())
}

/// Supertype, and default-method interfaces when `t` carries defaults
/// itself, have reached `state`.
fn dependencies_reached(rt: &Runtime, t: TypeRef, state: LifecycleState) -> bool {
    let Ok(c) = rt.class(t) else {
        return false;
    };
    let reached = |d: TypeRef| rt.class(d).is_ok_and(|dc| dc.state.is_at_least(state));
    let defaults = |d: TypeRef| {
        rt.instance(d).is_ok_and(|ic| {
            ic.has_internal(internal::HAS_DEFAULT_METHODS)
                || ic.has_internal(internal::DECLARES_DEFAULT_METHODS)
        })
    };
    c.super_class.is_none_or(reached)
        && (!defaults(t)
            || c.interfaces
                .iter()
                .filter(|i| defaults(**i))
                .all(|i| reached(*i)))
}
