//! Output descriptors and execution results.

use derive_more::Display;
use kiln_device::{DeviceMemory, OwnedMemory};

use crate::allocation::AllocationIndex;
use crate::shape::{ShapeIndex, ShapeTree};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasKind {
    /// The output may reuse the input's buffer when it was donated.
    #[display("may-alias")]
    MayAlias,
    /// The output must reuse the input's buffer; the caller has to donate it.
    #[display("must-alias")]
    MustAlias,
}

/// Relationship between an output and the entry parameter it was computed in place of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputAlias {
    pub parameter: usize,
    pub parameter_index: ShapeIndex,
    pub kind: AliasKind,
}

impl OutputAlias {
    pub fn may_alias(parameter: usize, parameter_index: ShapeIndex) -> Self {
        Self { parameter, parameter_index, kind: AliasKind::MayAlias }
    }

    pub fn must_alias(parameter: usize, parameter_index: ShapeIndex) -> Self {
        Self { parameter, parameter_index, kind: AliasKind::MustAlias }
    }
}

/// Where one leaf of the result comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub allocation_index: AllocationIndex,
    /// The output is an entry parameter returned unchanged.
    pub passthrough: bool,
    pub alias: Option<OutputAlias>,
}

impl OutputInfo {
    pub fn new(allocation_index: usize) -> Self {
        Self { allocation_index: AllocationIndex(allocation_index), passthrough: false, alias: None }
    }

    pub fn passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    pub fn aliasing(mut self, alias: OutputAlias) -> Self {
        self.alias = Some(alias);
        self
    }
}

/// One leaf of an execution result.
#[derive(Debug)]
pub enum OutputBuffer {
    /// Freshly allocated for this execution; ownership passes to the caller.
    Owned(OwnedMemory),
    /// A donated input reused as the output.
    Donated(OwnedMemory),
    /// Memory the executor does not own: a borrowed input or a module global.
    Borrowed(DeviceMemory),
}

impl OutputBuffer {
    pub fn memory(&self) -> DeviceMemory {
        match self {
            Self::Owned(owned) | Self::Donated(owned) => owned.memory(),
            Self::Borrowed(memory) => *memory,
        }
    }

    /// Owned memory, if the caller now owns this buffer.
    pub fn into_owned(self) -> Option<OwnedMemory> {
        match self {
            Self::Owned(owned) | Self::Donated(owned) => Some(owned),
            Self::Borrowed(_) => None,
        }
    }
}

pub type OutputTree = ShapeTree<OutputBuffer>;

/// Result of [`Executable::execute`](crate::Executable::execute).
#[derive(Debug)]
pub struct ExecutionOutput {
    result: OutputTree,
    aliased_indices: Vec<ShapeIndex>,
}

impl ExecutionOutput {
    pub fn new(result: OutputTree, aliased_indices: Vec<ShapeIndex>) -> Self {
        Self { result, aliased_indices }
    }

    pub fn result(&self) -> &OutputTree {
        &self.result
    }

    pub fn into_result(self) -> OutputTree {
        self.result
    }

    /// Output indices whose buffers were taken over from donated inputs.
    pub fn aliased_indices(&self) -> &[ShapeIndex] {
        &self.aliased_indices
    }

    pub fn buffer(&self, index: &ShapeIndex) -> Option<&OutputBuffer> {
        self.result.get(index)
    }

    pub fn into_parts(self) -> (OutputTree, Vec<ShapeIndex>) {
        (self.result, self.aliased_indices)
    }
}
