// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Loader helpers: creating loader objects and a preset loader provider.

use rustc_hash::{FxHashMap, FxHashSet};
use thaw_core::runtime::{fields, ObjRef, Runtime, RuntimeError, TypeRef, Value};
use thaw_core::{FormatError, LoaderContext, LoaderProvider, ObjectId, RestoreError};

/// Allocates a loader of class `class` with `parent` and `name` set, the
/// way a loader constructor leaves them.
pub fn create_loader(
    rt: &mut Runtime,
    class: TypeRef,
    parent: Option<ObjRef>,
    name: &str,
) -> Result<ObjRef, RuntimeError> {
    let loader = rt.new_instance(class)?;
    let name = rt.new_string(name)?;
    rt.set_field(loader, fields::LOADER_PARENT, Value::Ref(parent))?;
    rt.set_field(loader, fields::LOADER_NAME, Value::Ref(Some(name)))?;
    Ok(loader)
}

/// Hands out loaders the target runtime already has, keyed by snapshot
/// identity, and records every request.
///
/// Models an embedder whose application loaders exist before restore
/// starts.
#[derive(Debug, Default)]
pub struct PresetLoaderProvider {
    preset: FxHashMap<ObjectId, ObjRef>,
    requests: Vec<(ObjectId, String)>,
}

impl PresetLoaderProvider {
    /// Provider with no loaders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers requests for `id` with `loader`.
    pub fn with(mut self, id: ObjectId, loader: ObjRef) -> Self {
        self.preset.insert(id, loader);
        self
    }

    /// Requests seen so far: identity and requesting class (empty during
    /// the heap phase).
    pub fn requests(&self) -> &[(ObjectId, String)] {
        &self.requests
    }

    /// Number of distinct identities requested.
    pub fn distinct_requests(&self) -> usize {
        self.requests
            .iter()
            .map(|(id, _)| *id)
            .collect::<FxHashSet<_>>()
            .len()
    }
}

impl LoaderProvider for PresetLoaderProvider {
    fn prepare_loader(
        &mut self,
        id: ObjectId,
        cx: &mut LoaderContext<'_>,
    ) -> Result<ObjRef, RestoreError> {
        self.requests.push((id, cx.requester.to_owned()));
        self.preset
            .get(&id)
            .copied()
            .ok_or_else(|| FormatError::MissingIdentity(id).into())
    }
}
