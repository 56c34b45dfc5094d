//! Host streams: one worker thread per stream, fed through a channel.
//!
//! Enqueue methods validate what they can up front and send an operation to the
//! worker, which runs operations strictly in order. Completion is tracked with a
//! timeline signal: recording an event enqueues a signal operation with the next
//! timeline value.
//!
//! A failing operation faults the stream. The fault is sticky: later work is
//! skipped (signals and waits still run so events keep completing) and every
//! subsequent [`Stream::block_until_done`] reports it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use kiln_device::error::{LaunchRejectedSnafu, RuntimeSnafu, SizeMismatchSnafu, StreamClosedSnafu, StreamFaultSnafu};
use kiln_device::{
    CpuTimelineSignal, DeviceMemory, Event, KernelHandle, LaunchDimensions, Stream, StreamId, TimelineSignal,
};
use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tracing::{trace, warn};

use super::host::{HostKernel, KernelContext, Shared};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

enum Op {
    Launch { name: String, kernel: HostKernel, args: Vec<DeviceMemory>, dims: LaunchDimensions },
    CopyHostToDevice { destination: DeviceMemory, data: Vec<u8> },
    CopyDeviceToDevice { destination: DeviceMemory, source: DeviceMemory, size: usize },
    Zero { destination: DeviceMemory, size: usize },
    Signal(u64),
    Wait(Event),
    Shutdown,
}

impl Op {
    fn describe(&self) -> String {
        match self {
            Self::Launch { name, .. } => format!("launch of '{name}'"),
            Self::CopyHostToDevice { destination, data } => {
                format!("host-to-device copy of {} bytes to {destination:?}", data.len())
            }
            Self::CopyDeviceToDevice { destination, source, size } => {
                format!("copy of {size} bytes from {source:?} to {destination:?}")
            }
            Self::Zero { destination, size } => format!("zeroing {size} bytes at {destination:?}"),
            Self::Signal(value) => format!("signal {value}"),
            Self::Wait(event) => format!("wait for {event:?}"),
            Self::Shutdown => "shutdown".to_string(),
        }
    }
}

/// In-order stream executing on a dedicated host thread.
pub struct HostStream {
    id: StreamId,
    ordinal: usize,
    shared: Arc<Shared>,
    sender: Sender<Op>,
    signal: Arc<CpuTimelineSignal>,
    timeline: AtomicU64,
    fault: Arc<Mutex<Option<String>>>,
}

impl HostStream {
    pub(crate) fn spawn(shared: Arc<Shared>, ordinal: usize) -> kiln_device::Result<Self> {
        let id = StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = channel::unbounded();
        let signal = Arc::new(CpuTimelineSignal::new());
        let fault = Arc::new(Mutex::new(None));

        let worker = Worker { id, shared: Arc::clone(&shared), signal: Arc::clone(&signal), fault: Arc::clone(&fault) };
        let handle = thread::Builder::new()
            .name(format!("kiln-host-stream-{}", id.0))
            .spawn(move || worker.run(receiver))
            .map_err(|error| RuntimeSnafu { message: format!("failed to spawn stream worker: {error}") }.build())?;

        // The worker is detached: it drains the queue and exits on shutdown.
        drop(handle);

        trace!(stream = %id, device.ordinal = ordinal, "Created host stream");
        Ok(Self { id, ordinal, shared, sender, signal, timeline: AtomicU64::new(0), fault })
    }

    fn send(&self, op: Op) -> kiln_device::Result<()> {
        self.sender.send(op).ok().context(StreamClosedSnafu { stream: self.id })
    }

    /// Fault reported by the worker, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }
}

impl Stream for HostStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn device_ordinal(&self) -> usize {
        self.ordinal
    }

    fn launch(&self, kernel: &KernelHandle, args: &[DeviceMemory], dims: LaunchDimensions) -> kiln_device::Result<()> {
        let body = self.shared.kernel(&kernel.name).context(LaunchRejectedSnafu {
            kernel: kernel.to_string(),
            reason: "kernel is not registered on the host platform",
        })?;
        ensure!(
            dims.thread_count() > 0,
            LaunchRejectedSnafu { kernel: kernel.to_string(), reason: format!("empty launch {dims}") }
        );
        self.send(Op::Launch { name: kernel.to_string(), kernel: body, args: args.to_vec(), dims })
    }

    fn execute_program(&self, binary: &[u8], entry_point: &str, args: &[DeviceMemory]) -> kiln_device::Result<()> {
        ensure!(
            !binary.is_empty(),
            LaunchRejectedSnafu { kernel: entry_point, reason: "program binary is empty" }
        );
        let body = self.shared.program(entry_point).context(LaunchRejectedSnafu {
            kernel: entry_point,
            reason: "program is not registered on the host platform",
        })?;
        self.send(Op::Launch {
            name: entry_point.to_string(),
            kernel: body,
            args: args.to_vec(),
            dims: LaunchDimensions::default(),
        })
    }

    fn memcpy_host_to_device(&self, destination: DeviceMemory, data: &[u8]) -> kiln_device::Result<()> {
        ensure!(data.len() <= destination.size(), SizeMismatchSnafu { expected: destination.size(), actual: data.len() });
        self.send(Op::CopyHostToDevice { destination, data: data.to_vec() })
    }

    fn memcpy_device_to_device(
        &self,
        destination: DeviceMemory,
        source: DeviceMemory,
        size: usize,
    ) -> kiln_device::Result<()> {
        ensure!(
            size <= destination.size() && size <= source.size(),
            SizeMismatchSnafu { expected: destination.size().min(source.size()), actual: size }
        );
        self.send(Op::CopyDeviceToDevice { destination, source, size })
    }

    fn memzero(&self, destination: DeviceMemory, size: usize) -> kiln_device::Result<()> {
        ensure!(size <= destination.size(), SizeMismatchSnafu { expected: destination.size(), actual: size });
        self.send(Op::Zero { destination, size })
    }

    fn record_event(&self) -> kiln_device::Result<Event> {
        let value = self.timeline.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(Op::Signal(value))?;
        let signal: Arc<dyn TimelineSignal> = Arc::clone(&self.signal) as Arc<dyn TimelineSignal>;
        Ok(Event::new(self.id, signal, value))
    }

    fn wait_event(&self, event: &Event) -> kiln_device::Result<()> {
        if event.stream() == self.id || event.is_complete() {
            return Ok(());
        }
        self.send(Op::Wait(event.clone()))
    }

    fn block_until_done(&self) -> kiln_device::Result<()> {
        self.record_event()?.synchronize()?;
        match self.fault() {
            Some(reason) => StreamFaultSnafu { stream: self.id, reason }.fail(),
            None => Ok(()),
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Queued work still runs; the host does not wait for it.
        let _ = self.sender.send(Op::Shutdown);
    }
}

impl fmt::Debug for HostStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostStream")
            .field("id", &self.id)
            .field("ordinal", &self.ordinal)
            .field("timeline", &self.signal.value())
            .field("fault", &*self.fault.lock())
            .finish()
    }
}

struct Worker {
    id: StreamId,
    shared: Arc<Shared>,
    signal: Arc<CpuTimelineSignal>,
    fault: Arc<Mutex<Option<String>>>,
}

impl Worker {
    fn run(self, receiver: Receiver<Op>) {
        while let Ok(op) = receiver.recv() {
            match op {
                Op::Shutdown => break,
                Op::Signal(value) => self.signal.set(value),
                Op::Wait(event) => {
                    if let Err(error) = event.synchronize() {
                        self.record_fault(format!("wait for {event:?} failed: {error}"));
                    }
                }
                op => {
                    if self.fault.lock().is_some() {
                        trace!(stream = %self.id, op = %op.describe(), "Skipping work on faulted stream");
                        continue;
                    }
                    let description = op.describe();
                    if let Err(error) = self.execute(op) {
                        self.record_fault(format!("{description} failed: {error}"));
                    }
                }
            }
        }
    }

    fn execute(&self, op: Op) -> kiln_device::Result<()> {
        let memory = &*self.shared.memory;
        match op {
            Op::Launch { name, kernel, args, dims } => {
                trace!(stream = %self.id, kernel = %name, %dims, "Running kernel");
                (*kernel)(&KernelContext::new(memory, &args, dims))
            }
            Op::CopyHostToDevice { destination, data } => memory.write(destination, &data),
            Op::CopyDeviceToDevice { destination, source, size } => memory.copy(destination, source, size),
            Op::Zero { destination, size } => memory.zero(destination, size),
            Op::Signal(_) | Op::Wait(_) | Op::Shutdown => Ok(()),
        }
    }

    fn record_fault(&self, reason: String) {
        warn!(stream = %self.id, %reason, "Host stream faulted");
        self.fault.lock().get_or_insert(reason);
    }
}
