//! Execution of compiled GPU programs.
//!
//! An [`Executable`] pairs device code with the static facts the compiler worked
//! out about it: which allocations exist, which of them hold constants, which are
//! parameters, and how outputs relate to inputs. Executing it binds those
//! allocations to real device memory and issues the program on device streams.
//!
//! # Execution
//!
//! - [`ConstantResolver`] loads the module once per device and initializes its globals
//! - [`BufferBinder`] maps every allocation to memory, honoring donation and aliasing
//! - the program runner issues a [`UnitSchedule`] across streams, or a [`WholeProgram`]
//!
//! # Host platform
//!
//! The `devices::host` module implements the device traits in-process so programs
//! can run end to end without GPU hardware.

pub mod allocation;
pub mod binding;
pub mod constants;
pub mod context;
pub mod devices;
pub mod error;
pub mod executable;
pub mod input;
pub mod output;
pub mod profile;
pub mod program;
pub mod runner;
pub mod schedule;
pub mod shape;
pub mod unit;


pub use allocation::{Allocation, AllocationFlag, AllocationIndex, AllocationTable, ParameterSlot};
pub use binding::{BoundBuffer, BufferBinder, BufferBinding};
pub use constants::{ConstantInfo, ConstantResolver, ModuleImage, ResolvedModule};
pub use context::{RunContext, RunOptions};
pub use devices::host::{HostDevice, HostPlatform, KernelContext};
pub use error::*;
pub use executable::{DebugRecords, Executable};
pub use input::{ExecutionInput, InputBuffer};
pub use output::{AliasKind, ExecutionOutput, OutputAlias, OutputBuffer, OutputInfo, OutputTree};
pub use profile::{ExecutionProfile, ExecutionProfiler, RecordingProfiler};
pub use program::{Program, WholeProgram};
pub use runner::RunSummary;
pub use schedule::{ScheduledUnit, UnitSchedule};
pub use shape::{Shape, ShapeIndex, ShapeTree};
pub use unit::{BufferSlice, ExecutionUnit, KernelUnit, MemcpyUnit, MemsetUnit, UnitParams};
