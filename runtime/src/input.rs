//! Caller-supplied arguments.

use std::collections::BTreeMap;

use kiln_device::{DeviceMemory, OwnedMemory};

use crate::shape::ShapeIndex;

/// One argument buffer.
#[derive(Debug)]
pub enum InputBuffer {
    /// The caller keeps ownership; the program must not retain it.
    Borrowed(DeviceMemory),
    /// The caller gives the buffer up. The program may reuse it as an output;
    /// otherwise it is freed once the execution has finished.
    Donated(OwnedMemory),
}

impl InputBuffer {
    pub fn memory(&self) -> DeviceMemory {
        match self {
            Self::Borrowed(memory) => *memory,
            Self::Donated(owned) => owned.memory(),
        }
    }

    pub fn is_donated(&self) -> bool {
        matches!(self, Self::Donated(_))
    }
}

/// Buffers of one entry parameter, keyed by shape index inside the parameter.
#[derive(Debug, Default)]
pub struct ExecutionInput {
    buffers: BTreeMap<ShapeIndex, InputBuffer>,
}

impl ExecutionInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Array-shaped parameter lent by the caller.
    pub fn borrowed(memory: DeviceMemory) -> Self {
        Self::new().with_buffer(ShapeIndex::root(), InputBuffer::Borrowed(memory))
    }

    /// Array-shaped parameter donated by the caller.
    pub fn donated(memory: OwnedMemory) -> Self {
        Self::new().with_buffer(ShapeIndex::root(), InputBuffer::Donated(memory))
    }

    pub fn with_buffer(mut self, index: ShapeIndex, buffer: InputBuffer) -> Self {
        self.buffers.insert(index, buffer);
        self
    }

    pub fn set_buffer(&mut self, index: ShapeIndex, buffer: InputBuffer) -> Option<InputBuffer> {
        self.buffers.insert(index, buffer)
    }

    pub fn buffer(&self, index: &ShapeIndex) -> Option<&InputBuffer> {
        self.buffers.get(index)
    }

    /// Move the buffer at `index` out of the argument.
    pub fn take(&mut self, index: &ShapeIndex) -> Option<InputBuffer> {
        self.buffers.remove(index)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShapeIndex, &InputBuffer)> {
        self.buffers.iter()
    }
}
