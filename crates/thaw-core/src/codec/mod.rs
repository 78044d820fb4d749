// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type-metadata codec: the class-dump stream.
//!
//! The writer transcribes every loaded instance class of a [`Runtime`]
//! into one deterministic stream; the parser turns records back into
//! unlinked [`ClassDefinition`](crate::runtime::ClassDefinition)s plus
//! [`DeferredRef`]s. Both ends share the primitive encoding in [`stream`].
//!
//! [`Runtime`]: crate::runtime::Runtime

mod deferred;
mod format;
mod parse;
pub mod stream;
mod write;

pub use deferred::{DeferredRef, FieldDesc, LinkDesc, MemberDesc};
pub use format::{cp_tag, indy_state, link_tag, Features, CLASS_MAGIC, FORMAT_VERSION, HEAP_MAGIC};
pub use parse::ParsedClass;
pub(crate) use parse::{read_class_record, read_features, read_preamble, RecordScope};
pub(crate) use write::create_dump_file;
pub use write::{dump, dump_to};
#[cfg(test)]
pub(crate) use write::{dump_order, write_in_order};

use crate::ident::ObjectId;
use crate::runtime::ObjRef;

/// Identity the dumping side assigns to a live object: heap slot plus one,
/// so zero stays free for null.
pub(crate) fn object_id(r: ObjRef) -> ObjectId {
    ObjectId(r.index() as u64 + 1)
}
