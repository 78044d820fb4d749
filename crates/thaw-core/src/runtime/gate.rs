// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Restore gate: blocks threads that reach a type still being restored.
//!
//! The restoring thread marks each type it is about to drive through the
//! lifecycle and clears the mark once the type has reached its final
//! state. Any other thread that needs a marked type parks on the gate's
//! condition variable and resumes only after the clear, so it never sees
//! an intermediate state.
use std::sync::{Condvar, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};

use super::class::{LifecycleState, TypeRef};

#[derive(Debug, Default)]
struct GateState {
    marked: FxHashSet<TypeRef>,
    published: FxHashMap<TypeRef, LifecycleState>,
}

/// What a waiting thread observes once a type is released.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Released {
    /// The type that was waited on.
    pub ty: TypeRef,
    /// State published by the restoring thread, `None` if the type was
    /// never under restore.
    pub state: Option<LifecycleState>,
}

/// Shared "being restored" marks plus the condition variable waiters park on.
#[derive(Debug, Default)]
pub struct RestoreGate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl RestoreGate {
    /// Marks `ty` as being restored.
    pub fn mark(&self, ty: TypeRef) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.marked.insert(ty);
    }

    /// Returns `true` while `ty` is marked.
    pub fn is_marked(&self, ty: TypeRef) -> bool {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.marked.contains(&ty)
    }

    /// Number of types currently marked.
    pub fn marked_count(&self) -> usize {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.marked.len()
    }

    /// Types currently marked, in arena order.
    pub fn marked(&self) -> Vec<TypeRef> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = st.marked.iter().copied().collect();
        out.sort_unstable();
        out
    }

    /// Clears the mark on `ty`, publishes its final state and wakes waiters.
    pub fn clear(&self, ty: TypeRef, state: LifecycleState) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.marked.remove(&ty);
            st.published.insert(ty, state);
        }
        self.released.notify_all();
    }

    /// Blocks until `ty` is not marked, then reports its published state.
    pub fn wait_until_restored(&self, ty: TypeRef) -> Released {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let st = self
            .released
            .wait_while(st, |s| s.marked.contains(&ty))
            .unwrap_or_else(|e| e.into_inner());
        Released {
            ty,
            state: st.published.get(&ty).copied(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn unmarked_type_does_not_block() {
        let gate = RestoreGate::default();
        let r = gate.wait_until_restored(TypeRef(3));
        assert_eq!(r.state, None);
    }

    #[test]
    fn waiters_resume_with_final_state() {
        let gate = Arc::new(RestoreGate::default());
        let ty = TypeRef(9);
        gate.mark(ty);
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let g = Arc::clone(&gate);
                thread::spawn(move || g.wait_until_restored(ty))
            })
            .collect();
        assert!(gate.is_marked(ty));
        gate.clear(ty, LifecycleState::FullyInitialized);
        for w in waiters {
            let r = w.join().unwrap();
            assert_eq!(r.ty, ty);
            assert_eq!(r.state, Some(LifecycleState::FullyInitialized));
        }
        assert_eq!(gate.marked_count(), 0);
    }
}
