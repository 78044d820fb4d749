// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Heap snapshot: the object stream that shares its identity namespace
//! with the class dump.
//!
//! Restore reads heap records on demand through [`HeapSource`];
//! [`HeapSnapshot`] is the in-memory implementation and [`HeapDumper`]
//! produces one from a live runtime.

mod blob;
mod dump;
mod frames;
mod snapshot;

use bytes::Bytes;

pub use blob::{BlobReader, BlobValue, BlobWriter};
pub(crate) use blob::field_value;
pub use dump::HeapDumper;
pub use frames::{CapturedFrame, CapturedThread, FrameValue, RestoredFrame, RestoredThread, StackSlot};
pub use snapshot::HeapSnapshot;

use crate::ident::{IdWidth, ObjectId};
use crate::runtime::PrimKind;

/// Record kind tags.
pub mod record_kind {
    /// Instance with a flat field blob.
    pub const INSTANCE: u8 = 1;
    /// Array of references.
    pub const OBJ_ARRAY: u8 = 2;
    /// Array of primitives.
    pub const PRIM_ARRAY: u8 = 3;
}

/// Contents of one heap record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordBody {
    /// Plain object.
    Instance {
        /// Identity of the object's type.
        class: ObjectId,
        /// Field values in layout order; see [`BlobReader`].
        fields: Bytes,
    },
    /// Reference array.
    ObjArray {
        /// Identity of the component type.
        element_type: ObjectId,
        /// Element identities, null for null elements.
        elements: Vec<ObjectId>,
    },
    /// Primitive array.
    PrimArray {
        /// Element kind.
        kind: PrimKind,
        /// Little-endian element bytes.
        bytes: Bytes,
    },
}

/// One object of the heap snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapRecord {
    /// Identity hash the object carried, if one had been computed.
    pub identity_hash: Option<u32>,
    /// Contents.
    pub body: RecordBody,
}

impl HeapRecord {
    /// Wire tag of the record kind.
    #[must_use]
    pub const fn kind(&self) -> u8 {
        match self.body {
            RecordBody::Instance { .. } => record_kind::INSTANCE,
            RecordBody::ObjArray { .. } => record_kind::OBJ_ARRAY,
            RecordBody::PrimArray { .. } => record_kind::PRIM_ARRAY,
        }
    }
}

/// Heap records keyed by identity, supplied on demand during restore.
pub trait HeapSource {
    /// Identity width of reference fields in instance blobs.
    fn id_width(&self) -> IdWidth;

    /// Record of `id`, if the heap snapshot has one.
    fn record(&self, id: ObjectId) -> Option<&HeapRecord>;

    /// Returns `true` if `id` was an interned string when dumped.
    fn is_interned(&self, id: ObjectId) -> bool;
}
