// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Captured call stacks.
//!
//! A captured frame names its method portably and holds locals, operands
//! and monitors by identity; restore turns it into a [`RestoredFrame`]
//! over live references.
use std::io::{self, Read, Write};

use crate::codec::stream::{SnapshotReader, SnapshotWriter};
use crate::codec::MemberDesc;
use crate::error::{FormatError, RestoreError};
use crate::ident::ObjectId;
use crate::runtime::{MethodRef, ObjRef};

const SLOT_PRIM: u8 = 0;
const SLOT_REF: u8 = 1;

/// Local or operand slot of a captured frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StackSlot {
    /// Primitive bits.
    Prim(u64),
    /// Reference by identity; null for null.
    Ref(ObjectId),
}

impl StackSlot {
    fn write_to<W: Write>(self, w: &mut SnapshotWriter<W>) -> io::Result<()> {
        match self {
            Self::Prim(bits) => {
                w.u8(SLOT_PRIM)?;
                w.u64(bits)
            }
            Self::Ref(id) => {
                w.u8(SLOT_REF)?;
                w.id(id)
            }
        }
    }

    fn read_from<R: Read>(r: &mut SnapshotReader<R>) -> Result<Self, RestoreError> {
        match r.u8()? {
            SLOT_PRIM => Ok(Self::Prim(r.u64()?)),
            SLOT_REF => Ok(Self::Ref(r.id()?)),
            tag => Err(FormatError::IllegalTag {
                what: "stack slot",
                tag,
            }
            .into()),
        }
    }
}

/// One frame of a captured stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Executing method.
    pub method: MemberDesc,
    /// Bytecode index.
    pub bci: u16,
    /// Local variable slots.
    pub locals: Vec<StackSlot>,
    /// Operand stack, bottom first.
    pub operands: Vec<StackSlot>,
    /// Objects whose monitors the frame holds.
    pub monitors: Vec<ObjectId>,
}

impl CapturedFrame {
    fn write_to<W: Write>(&self, w: &mut SnapshotWriter<W>) -> io::Result<()> {
        self.method.write_to(w)?;
        w.u16(self.bci)?;
        w.array(Some(self.locals.as_slice()), |w, s| s.write_to(w))?;
        w.array(Some(self.operands.as_slice()), |w, s| s.write_to(w))?;
        for m in &self.monitors {
            w.id(*m)?;
        }
        w.end()
    }

    fn read_from<R: Read>(r: &mut SnapshotReader<R>) -> Result<Self, RestoreError> {
        Ok(Self {
            method: MemberDesc::read_from(r)?,
            bci: r.u16()?,
            locals: r.required_array("locals", StackSlot::read_from)?,
            operands: r.required_array("operands", StackSlot::read_from)?,
            monitors: r.ids_until_end()?,
        })
    }
}

/// Stack of one thread, innermost frame first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedThread {
    /// Identity of the thread object.
    pub thread: ObjectId,
    /// Frames.
    pub frames: Vec<CapturedFrame>,
}

impl CapturedThread {
    pub(crate) fn write_to<W: Write>(&self, w: &mut SnapshotWriter<W>) -> io::Result<()> {
        w.id(self.thread)?;
        let n = u32::try_from(self.frames.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many frames"))?;
        w.u32(n)?;
        self.frames.iter().try_for_each(|f| f.write_to(w))
    }

    pub(crate) fn read_from<R: Read>(
        r: &mut SnapshotReader<R>,
        thread: ObjectId,
    ) -> Result<Self, RestoreError> {
        let n = r.u32()?;
        let mut frames = Vec::with_capacity((n as usize).min(256));
        for _ in 0..n {
            frames.push(CapturedFrame::read_from(r)?);
        }
        Ok(Self { thread, frames })
    }
}

/// Local or operand value of a live frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameValue {
    /// Primitive bits.
    Prim(u64),
    /// Reference.
    Ref(Option<ObjRef>),
}

/// A frame over live references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoredFrame {
    /// Executing method.
    pub method: MethodRef,
    /// Bytecode index.
    pub bci: u16,
    /// Local variable slots.
    pub locals: Vec<FrameValue>,
    /// Operand stack, bottom first.
    pub operands: Vec<FrameValue>,
    /// Objects whose monitors the frame holds.
    pub monitors: Vec<ObjRef>,
}

/// A thread's stack over live references.
///
/// Restore returns these; the dumper also accepts them as the live stacks
/// to capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoredThread {
    /// Thread object.
    pub thread: ObjRef,
    /// Frames, innermost first.
    pub frames: Vec<RestoredFrame>,
}
