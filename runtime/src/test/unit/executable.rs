use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_device::{Allocator, DeviceMemory, GpuVersion, LaunchDimensions, OwnedMemory, StreamPool};
use test_case::test_case;

use crate::test::mocks::{CountingAllocator, FaultyStream, MockDevice, MockStream, Op, VERSION, context};
use crate::{
    Allocation, AllocationTable, BufferSlice, ConstantInfo, Error, Executable, ExecutionInput, KernelUnit, MemcpyUnit,
    OutputAlias, OutputBuffer, OutputInfo, Program, RecordingProfiler, RunContext, RunOptions, ScheduledUnit, Shape,
    ShapeIndex, UnitSchedule, WholeProgram,
};

const WEIGHTS: DeviceMemory = DeviceMemory::new(0x4000, 8);

fn allocations() -> AllocationTable {
    AllocationTable::new(vec![
        Allocation::parameter(0, 16, 0),
        Allocation::constant(1, 8),
        Allocation::output(2, 16),
        Allocation::temporary(3, 32),
    ])
    .unwrap()
}

/// `fill` on stream 0, `mix` on stream 1, then a copy of the result back on stream 0.
fn two_stream_program() -> UnitSchedule {
    let dims = LaunchDimensions::new_1d(1, 32);
    UnitSchedule::new(vec![
        ScheduledUnit::new(KernelUnit::new("fill", "fill", vec![BufferSlice::whole(3, 32)], dims)),
        ScheduledUnit::new(KernelUnit::new(
            "mix",
            "mix",
            vec![BufferSlice::whole(0, 16), BufferSlice::whole(1, 8), BufferSlice::whole(3, 32)],
            dims,
        ))
        .on_stream(1)
        .after([0]),
        ScheduledUnit::new(MemcpyUnit::new("copy", BufferSlice::new(3, 0, 16), BufferSlice::whole(2, 16))).after([1]),
    ])
    .unwrap()
}

fn executable() -> Executable {
    Executable::builder()
        .text(".entry fill\n.entry mix")
        .gpu_version(VERSION)
        .program(two_stream_program())
        .constants(vec![ConstantInfo::new("weights", [7u8; 8], Some(1))])
        .outputs(BTreeMap::from([(ShapeIndex::root(), OutputInfo::new(2))]))
        .module_name("two_streams")
        .output_shape(Shape::array(16))
        .allocations(allocations())
        .build()
        .unwrap()
}

fn device() -> Arc<MockDevice> {
    Arc::new(MockDevice::new(0).with_symbol("weights", WEIGHTS))
}

fn input(allocator: &CountingAllocator) -> Vec<ExecutionInput> {
    vec![ExecutionInput::borrowed(allocator.preallocate(16))]
}

fn position(journal: &[Op], predicate: impl Fn(&Op) -> bool) -> usize {
    journal.iter().position(predicate).unwrap()
}

#[test]
fn test_execute_across_streams() {
    let device = device();
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    let output = executable().execute(&context, input(&allocator), &dyn_allocator).unwrap();

    let result = output.buffer(&ShapeIndex::root()).unwrap();
    assert!(matches!(result, OutputBuffer::Owned(_)));
    assert_eq!(result.memory().size(), 16);
    assert!(output.aliased_indices().is_empty());
    assert_eq!(device.state.launches(), vec!["fill", "mix"]);

    let main = context.stream.id();
    let journal = device.state.journal();
    let aux = journal
        .iter()
        .find_map(|op| match op {
            Op::Launch { stream, kernel, .. } if kernel == "mix" => Some(*stream),
            _ => None,
        })
        .unwrap();
    assert_ne!(aux, main);

    let fill = position(&journal, |op| matches!(op, Op::Launch { kernel, .. } if kernel == "fill"));
    let mix = position(&journal, |op| matches!(op, Op::Launch { kernel, .. } if kernel == "mix"));
    let copy = position(&journal, |op| matches!(op, Op::DeviceToDevice { .. }));
    assert!(fill < mix && mix < copy);

    // mix waits for fill, the copy waits for mix.
    assert!(
        journal[fill..mix].iter().any(|op| matches!(op, Op::Wait { stream, on, .. } if *stream == aux && *on == main))
    );
    assert!(
        journal[mix..copy].iter().any(|op| matches!(op, Op::Wait { stream, on, .. } if *stream == main && *on == aux))
    );
    // The allocator frees eagerly, so the host waits for stream 0 at the end.
    assert_eq!(journal.last(), Some(&Op::Block { stream: main }));

    // Output and input stay alive, the temporary is gone.
    drop(output);
    assert_eq!(allocator.live(), 1);
}

#[test]
fn test_constants_resolved_once_across_runs() {
    let device = device();
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();
    let executable = executable();

    for _ in 0..3 {
        executable.execute(&context, input(&allocator), &dyn_allocator).unwrap();
    }

    assert_eq!(device.loads(), 1);
    let uploads = device.state.journal().iter().filter(|op| matches!(op, Op::HostToDevice { .. })).count();
    assert_eq!(uploads, 1);
}

#[test]
fn test_kernel_arguments_are_bound_addresses() {
    let device = device();
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();
    let inputs = input(&allocator);
    let parameter = inputs[0].buffer(&ShapeIndex::root()).unwrap().memory();

    executable().execute(&context, inputs, &dyn_allocator).unwrap();

    let args = device
        .state
        .journal()
        .into_iter()
        .find_map(|op| match op {
            Op::Launch { kernel, args, .. } if kernel == "mix" => Some(args),
            _ => None,
        })
        .unwrap();
    assert_eq!(args.len(), 3);
    assert_eq!(args[0], parameter);
    assert_eq!(args[1], WEIGHTS);
    assert_eq!(args[2].size(), 32);
}

#[test]
fn test_version_mismatch_touches_nothing() {
    let device = Arc::new(MockDevice::with_version(0, GpuVersion::Cuda { major: 7, minor: 5 }));
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    let result = executable().execute(&context, input(&allocator), &dyn_allocator);

    assert!(matches!(result, Err(Error::DeviceCompatibility { expected: VERSION, .. })));
    assert_eq!(device.loads(), 0);
    assert_eq!(allocator.allocations(), 0);
    assert!(device.state.journal().is_empty());
}

#[test]
fn test_allocation_failure_launches_nothing() {
    let device = device();
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::failing_on(32));
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    let result = executable().execute(&context, input(&allocator), &dyn_allocator);

    assert!(matches!(result, Err(Error::Allocation { size: 32, .. })));
    assert!(device.state.launches().is_empty());
    assert_eq!(allocator.live(), 1);
}

#[test]
fn test_launch_failure_drains_streams() {
    let device = device();
    device.state.failing_kernels.lock().insert("mix".to_string());
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    let result = executable().execute(&context, input(&allocator), &dyn_allocator);

    assert!(matches!(result, Err(Error::Launch { ref unit, stream: 1, .. }) if unit == "mix"));
    assert_eq!(device.state.launches(), vec!["fill"]);
    let journal = device.state.journal();
    let fill = position(&journal, |op| matches!(op, Op::Launch { .. }));
    let blocks = journal[fill..].iter().filter(|op| matches!(op, Op::Block { .. })).count();
    assert_eq!(blocks, 2);
    assert_eq!(allocator.live(), 1);
}

#[test]
fn test_kernel_without_module_names_device() {
    let device = device();
    let context = context(&device);
    let allocator: Arc<dyn Allocator> = Arc::new(CountingAllocator::default());
    let executable = Executable::builder()
        .gpu_version(VERSION)
        .program(
            UnitSchedule::new(vec![ScheduledUnit::new(KernelUnit::new(
                "fill",
                "fill",
                vec![BufferSlice::whole(0, 4)],
                LaunchDimensions::new_1d(1, 4),
            ))])
            .unwrap(),
        )
        .outputs(root_output(0))
        .output_shape(Shape::array(4))
        .allocations(AllocationTable::new(vec![Allocation::output(0, 4)]).unwrap())
        .build()
        .unwrap();

    let result = executable.execute(&context, vec![], &allocator);

    assert!(matches!(
        result,
        Err(Error::Launch { source: kiln_device::Error::NoModule { device: id, ref kernel }, .. })
            if id == context.device.id() && kernel == "fill"
    ));
    assert_eq!(device.loads(), 0);
}

#[test]
fn test_final_wait_failure_is_reported() {
    let device = device();
    let stream = Arc::new(FaultyStream(MockStream::new(Arc::clone(&device.state), 0)));
    let context = RunContext::builder()
        .device(device.clone() as Arc<dyn kiln_device::Device>)
        .stream(stream as Arc<dyn kiln_device::Stream>)
        .options(RunOptions::builder().build())
        .build();
    let allocator: Arc<dyn Allocator> = Arc::new(CountingAllocator::default());
    let image = Executable::builder()
        .gpu_version(VERSION)
        .program(WholeProgram::new(*b"program", "main"))
        .outputs(BTreeMap::from([(ShapeIndex::root(), OutputInfo::new(0))]))
        .output_shape(Shape::array(4))
        .allocations(AllocationTable::new(vec![Allocation::output(0, 4)]).unwrap())
        .build()
        .unwrap();

    let result = image.execute(&context, vec![], &allocator);
    assert!(matches!(result, Err(Error::Device { .. })));
}

#[test]
fn test_asynchronous_allocator_does_not_block() {
    let device = device();
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::asynchronous());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    executable().execute(&context, input(&allocator), &dyn_allocator).unwrap();

    let journal = device.state.journal();
    let copy = position(&journal, |op| matches!(op, Op::DeviceToDevice { .. }));
    assert!(!journal[copy..].iter().any(|op| matches!(op, Op::Block { .. })));
}

#[test]
fn test_requested_blocking() {
    let device = device();
    let mut context = context(&device);
    context.options = RunOptions::builder().block_host_until_done(true).build();
    let allocator = Arc::new(CountingAllocator::asynchronous());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    executable().execute(&context, input(&allocator), &dyn_allocator).unwrap();

    assert_eq!(device.state.journal().last(), Some(&Op::Block { stream: context.stream.id() }));
}

#[test]
fn test_auxiliary_streams_come_from_pool() {
    let device = device();
    let pool = Arc::new(StreamPool::new());
    let base = context(&device);
    let context = RunContext::builder()
        .device(base.device.clone())
        .stream(base.stream.clone())
        .stream_pool(pool.clone())
        .options(base.options)
        .build();
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();
    let executable = executable();

    executable.execute(&context, input(&allocator), &dyn_allocator).unwrap();
    executable.execute(&context, input(&allocator), &dyn_allocator).unwrap();

    assert_eq!(device.state.streams_created.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(pool.idle_count(context.device.id()), 1);
}

#[test]
fn test_profiler_sees_every_unit() {
    let device = device();
    let profiler = Arc::new(RecordingProfiler::new());
    let base = context(&device);
    let context = RunContext::builder()
        .device(base.device.clone())
        .stream(base.stream.clone())
        .profiler(profiler.clone())
        .options(base.options)
        .run_id(42)
        .build();
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    executable().execute(&context, input(&allocator), &dyn_allocator).unwrap();

    let launches = profiler.launches();
    assert_eq!(launches, vec![("fill".to_string(), 0), ("mix".to_string(), 1), ("copy".to_string(), 0)]);
    let profiles = profiler.profiles();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].module_name, "two_streams");
    assert_eq!(profiles[0].run_id, 42);
    assert_eq!(profiles[0].units_launched, 3);
    assert_eq!(profiles[0].streams_used, 2);
    assert!(profiles[0].blocked);
}

fn donating_executable(alias: OutputAlias) -> Executable {
    Executable::builder()
        .gpu_version(VERSION)
        .program(WholeProgram::new(*b"program", "update"))
        .outputs(BTreeMap::from([(ShapeIndex::root(), OutputInfo::new(0).aliasing(alias))]))
        .output_shape(Shape::array(16))
        .allocations(AllocationTable::new(vec![Allocation::parameter(0, 16, 0).live_out()]).unwrap())
        .build()
        .unwrap()
}

#[test]
fn test_donated_input_becomes_output() {
    let device = device();
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();
    let memory = allocator.preallocate(16);
    let inputs = vec![ExecutionInput::donated(OwnedMemory::from_raw(memory, 0, dyn_allocator.clone()))];

    let output = donating_executable(OutputAlias::must_alias(0, ShapeIndex::root()))
        .execute(&context, inputs, &dyn_allocator)
        .unwrap();

    assert_eq!(output.aliased_indices(), &[ShapeIndex::root()]);
    assert_eq!(output.buffer(&ShapeIndex::root()).unwrap().memory(), memory);
    assert_eq!(
        device.state.journal()[0],
        Op::Program { stream: context.stream.id(), entry_point: "update".to_string(), args: vec![memory] }
    );
    assert_eq!(allocator.allocations(), 0);
    assert!(allocator.is_live(memory));
}

#[test]
fn test_must_alias_without_donation_fails_before_launch() {
    let device = device();
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();

    let executable = donating_executable(OutputAlias::must_alias(0, ShapeIndex::root()));

    let result = executable.execute(&context, input(&allocator), &dyn_allocator);

    assert!(matches!(result, Err(Error::AliasingContract { .. })));
    assert!(device.state.launches().is_empty());
}

#[test]
fn test_donated_input_with_constant_binds_output_in_place() {
    const TABLE: DeviceMemory = DeviceMemory::new(0x6000, 8);
    let device = Arc::new(MockDevice::new(0).with_symbol("table", TABLE));
    let context = context(&device);
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn Allocator> = allocator.clone();
    let executable = Executable::builder()
        .text(".global table 8\n.entry update")
        .gpu_version(VERSION)
        .program(
            UnitSchedule::new(vec![ScheduledUnit::new(KernelUnit::new(
                "update",
                "update",
                vec![BufferSlice::whole(0, 4), BufferSlice::whole(1, 8), BufferSlice::whole(2, 4)],
                LaunchDimensions::new_1d(1, 4),
            ))])
            .unwrap(),
        )
        .constants(vec![ConstantInfo::new("table", *b"CONST123", Some(1))])
        .outputs(BTreeMap::from([(
            ShapeIndex::root(),
            OutputInfo::new(2).aliasing(OutputAlias::must_alias(0, ShapeIndex::root())),
        )]))
        .output_shape(Shape::array(4))
        .allocations(
            AllocationTable::new(vec![
                Allocation::parameter(0, 4, 0),
                Allocation::constant(1, 8),
                Allocation::output(2, 4),
            ])
            .unwrap(),
        )
        .build()
        .unwrap();
    let memory = allocator.preallocate(4);
    let inputs = vec![ExecutionInput::donated(OwnedMemory::from_raw(memory, 0, dyn_allocator.clone()))];

    let output = executable.execute(&context, inputs, &dyn_allocator).unwrap();

    let journal = device.state.journal();
    let uploads: Vec<_> = journal.iter().filter(|op| matches!(op, Op::HostToDevice { .. })).collect();
    assert_eq!(
        uploads,
        vec![&Op::HostToDevice { stream: context.stream.id(), destination: TABLE, data: b"CONST123".to_vec() }]
    );
    let args = journal
        .iter()
        .find_map(|op| match op {
            Op::Launch { args, .. } => Some(args.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(args, vec![memory, TABLE, memory]);

    let result = output.buffer(&ShapeIndex::root()).unwrap();
    assert!(matches!(result, OutputBuffer::Donated(owned) if owned.memory() == memory));
    assert_eq!(output.aliased_indices(), &[ShapeIndex::root()]);
    assert_eq!(allocator.allocations(), 0);
    assert!(allocator.is_live(memory));
}

#[test]
fn test_parameter_returned_and_aliased_rejected() {
    let shape = Shape::tuple([Shape::array(16), Shape::array(16)]);
    let result = Executable::builder()
        .gpu_version(VERSION)
        .program(WholeProgram::new(*b"program", "update"))
        .outputs(BTreeMap::from([
            (ShapeIndex::from([0]), OutputInfo::new(0)),
            (ShapeIndex::from([1]), OutputInfo::new(1).aliasing(OutputAlias::may_alias(0, ShapeIndex::root()))),
        ]))
        .output_shape(shape)
        .allocations(
            AllocationTable::new(vec![Allocation::parameter(0, 16, 0).live_out(), Allocation::output(1, 16)]).unwrap(),
        )
        .build();

    assert!(matches!(result, Err(Error::InvalidProgram { ref reason }) if reason.contains("parameter 0")));
}

#[test]
fn test_parameter_aliased_twice_rejected() {
    let shape = Shape::tuple([Shape::array(16), Shape::array(16)]);
    let alias = OutputAlias::may_alias(0, ShapeIndex::root());
    let result = Executable::builder()
        .gpu_version(VERSION)
        .program(WholeProgram::new(*b"program", "update"))
        .outputs(BTreeMap::from([
            (ShapeIndex::from([0]), OutputInfo::new(1).aliasing(alias.clone())),
            (ShapeIndex::from([1]), OutputInfo::new(2).aliasing(alias)),
        ]))
        .output_shape(shape)
        .allocations(
            AllocationTable::new(vec![
                Allocation::parameter(0, 16, 0),
                Allocation::output(1, 16),
                Allocation::output(2, 16),
            ])
            .unwrap(),
        )
        .build();

    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test]
fn test_output_returning_own_aliased_parameter_builds() {
    assert!(
        Executable::builder()
            .gpu_version(VERSION)
            .program(WholeProgram::new(*b"program", "update"))
            .outputs(BTreeMap::from([(
                ShapeIndex::root(),
                OutputInfo::new(0).aliasing(OutputAlias::may_alias(0, ShapeIndex::root())),
            )]))
            .output_shape(Shape::array(16))
            .allocations(AllocationTable::new(vec![Allocation::parameter(0, 16, 0).live_out()]).unwrap())
            .build()
            .is_ok()
    );
}

fn build(
    program: impl Into<Program>,
    outputs: BTreeMap<ShapeIndex, OutputInfo>,
    shape: Shape,
    constants: Vec<ConstantInfo>,
) -> crate::Result<Executable> {
    Executable::builder()
        .text(".entry fill")
        .gpu_version(VERSION)
        .program(program)
        .constants(constants)
        .outputs(outputs)
        .output_shape(shape)
        .allocations(allocations())
        .build()
}

fn weights() -> Vec<ConstantInfo> {
    vec![ConstantInfo::new("weights", [0u8; 8], Some(1))]
}

fn root_output(allocation: usize) -> BTreeMap<ShapeIndex, OutputInfo> {
    BTreeMap::from([(ShapeIndex::root(), OutputInfo::new(allocation))])
}

#[test]
fn test_valid_program_builds() {
    assert!(build(two_stream_program(), root_output(2), Shape::array(16), weights()).is_ok());
}

#[test]
fn test_missing_output_descriptor() {
    let shape = Shape::tuple([Shape::array(16), Shape::array(32)]);
    let outputs = BTreeMap::from([(ShapeIndex::from([0]), OutputInfo::new(2))]);
    let result = build(two_stream_program(), outputs, shape, weights());
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test]
fn test_output_descriptor_outside_shape() {
    let outputs =
        BTreeMap::from([(ShapeIndex::root(), OutputInfo::new(2)), (ShapeIndex::from([3]), OutputInfo::new(3))]);
    let result = build(two_stream_program(), outputs, Shape::array(16), weights());
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test]
fn test_output_unknown_allocation() {
    let result = build(two_stream_program(), root_output(9), Shape::array(16), weights());
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test]
fn test_output_allocation_returned_twice() {
    let shape = Shape::tuple([Shape::array(16), Shape::array(16)]);
    let outputs =
        BTreeMap::from([(ShapeIndex::from([0]), OutputInfo::new(2)), (ShapeIndex::from([1]), OutputInfo::new(2))]);
    let result = build(two_stream_program(), outputs, shape, weights());
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test_case(vec![] ; "constant allocation without entry")]
#[test_case(vec![ConstantInfo::new("weights", [0u8; 8], Some(3))] ; "entry bound to temporary")]
#[test_case(vec![ConstantInfo::new("weights", [0u8; 8], Some(7))] ; "entry bound to unknown allocation")]
#[test_case(
    vec![ConstantInfo::new("a", [0u8; 8], Some(1)), ConstantInfo::new("b", [0u8; 8], Some(1))] ;
    "allocation bound twice"
)]
fn test_invalid_constants(constants: Vec<ConstantInfo>) {
    let result = build(two_stream_program(), root_output(2), Shape::array(16), constants);
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test]
fn test_unit_slice_out_of_bounds() {
    let schedule = UnitSchedule::new(vec![ScheduledUnit::new(MemcpyUnit::new(
        "copy",
        BufferSlice::new(3, 24, 16),
        BufferSlice::whole(2, 16),
    ))])
    .unwrap();
    let result = build(schedule, root_output(2), Shape::array(16), weights());
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test]
fn test_whole_program_needs_binary() {
    let result = build(WholeProgram::new(Vec::<u8>::new(), "main"), root_output(2), Shape::array(16), weights());
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}

#[test_case("ptx", &[], None ; "text only")]
#[test_case("", &[0u8; 100], Some(108) ; "binary")]
#[test_case("ptx", &[0u8; 10], Some(18) ; "binary takes precedence")]
#[test_case("", &[], Some(8) ; "empty module")]
fn test_size_of_generated_code(text: &str, binary: &[u8], expected: Option<usize>) {
    let executable = Executable::builder()
        .text(text)
        .binary(binary.to_vec())
        .gpu_version(VERSION)
        .program(two_stream_program())
        .constants(weights())
        .outputs(root_output(2))
        .output_shape(Shape::array(16))
        .allocations(allocations())
        .build()
        .unwrap();
    assert_eq!(executable.size_of_generated_code(), expected);
}

#[test]
fn test_ir_module_string() {
    let executable = executable();
    assert!(executable.ir_module_string().is_none());
    executable.set_ir_module_string("module @two_streams {}");
    assert_eq!(executable.ir_module_string().as_deref(), Some("module @two_streams {}"));
}
