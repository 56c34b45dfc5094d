//! Program runner: issues a bound program onto device streams.
//!
//! Stream 0 is the caller's stream. Auxiliary streams first wait for everything
//! already queued on stream 0, and stream 0 waits for all of them at the end, so
//! to the caller the whole program looks like work enqueued on their stream.

use std::ops::Deref;
use std::sync::Arc;

use kiln_device::{Event, ModuleHandle, PooledStream, Stream};
use snafu::ResultExt;
use tracing::{debug, trace, warn};

use crate::binding::BufferBinding;
use crate::context::RunContext;
use crate::error::{DeviceSnafu, LaunchSnafu, Result};
use crate::program::{Program, WholeProgram};
use crate::schedule::UnitSchedule;
use crate::unit::UnitParams;

/// What a successful run issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub units_launched: usize,
    pub streams_used: usize,
}

enum AuxStream {
    Pooled(PooledStream),
    Created(Arc<dyn Stream>),
}

impl Deref for AuxStream {
    type Target = dyn Stream;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Pooled(stream) => &**stream,
            Self::Created(stream) => &**stream,
        }
    }
}

pub(crate) struct ProgramRunner<'a> {
    context: &'a RunContext,
    module: Option<ModuleHandle>,
    binding: &'a BufferBinding,
}

impl<'a> ProgramRunner<'a> {
    pub(crate) fn new(context: &'a RunContext, module: Option<ModuleHandle>, binding: &'a BufferBinding) -> Self {
        Self { context, module, binding }
    }

    /// Issue `program`, then block on stream 0 if `block` is set.
    pub(crate) fn run(&self, program: &Program, block: bool) -> Result<RunSummary> {
        let summary = match program {
            Program::Units(schedule) => self.run_units(schedule)?,
            Program::WholeProgram(whole) => self.run_whole_program(whole)?,
        };

        if block {
            self.context.stream.block_until_done().context(DeviceSnafu)?;
        }
        Ok(summary)
    }

    fn run_units(&self, schedule: &UnitSchedule) -> Result<RunSummary> {
        let main: &dyn Stream = &*self.context.stream;
        let mut aux = Vec::with_capacity(schedule.stream_count().saturating_sub(1));
        for _ in 1..schedule.stream_count() {
            let stream = match self.acquire_stream() {
                Ok(stream) => stream,
                Err(error) => {
                    drain(main, &aux);
                    return Err(error);
                }
            };
            if let Err(error) = stream.wait_stream(main) {
                aux.push(stream);
                drain(main, &aux);
                return Err(error).context(DeviceSnafu);
            }
            aux.push(stream);
        }

        let streams: Vec<&dyn Stream> = std::iter::once(main).chain(aux.iter().map(|s| &**s)).collect();
        match self.issue(schedule, &streams) {
            Ok(units_launched) => {
                debug!(
                    units = units_launched,
                    streams = streams.len(),
                    schedule.depth = schedule.depth(),
                    "Issued unit schedule"
                );
                Ok(RunSummary { units_launched, streams_used: streams.len() })
            }
            Err(error) => {
                drain(main, &aux);
                Err(error)
            }
        }
    }

    fn issue(&self, schedule: &UnitSchedule, streams: &[&dyn Stream]) -> Result<usize> {
        let units = schedule.units();
        let mut events: Vec<Option<Event>> = vec![None; units.len()];
        let mut launched = 0;

        for &id in schedule.order() {
            let scheduled = &units[id];
            let stream = streams[scheduled.stream];
            let name = scheduled.unit.name();

            for &dependency in &scheduled.depends_on {
                if units[dependency].stream != scheduled.stream
                    && let Some(event) = &events[dependency]
                {
                    stream.wait_event(event).context(LaunchSnafu { unit: name, stream: scheduled.stream })?;
                }
            }

            let params =
                UnitParams { device: &*self.context.device, module: self.module, binding: self.binding, stream };
            scheduled.unit.execute(&params).context(LaunchSnafu { unit: name, stream: scheduled.stream })?;
            launched += 1;
            trace!(unit = name, unit.id = id, stream = scheduled.stream, "Launched unit");
            if let Some(profiler) = &self.context.profiler {
                profiler.on_unit_launched(name, scheduled.stream);
            }

            if schedule.needs_event(id) {
                let event = stream.record_event().context(LaunchSnafu { unit: name, stream: scheduled.stream })?;
                events[id] = Some(event);
            }
        }

        let main = streams[0];
        for (number, stream) in streams.iter().enumerate().skip(1) {
            main.wait_stream(*stream).context(LaunchSnafu { unit: format!("<join stream {number}>"), stream: 0usize })?;
        }
        Ok(launched)
    }

    fn run_whole_program(&self, whole: &WholeProgram) -> Result<RunSummary> {
        let stream = &*self.context.stream;
        let args = self.binding.addresses();
        trace!(entry_point = %whole.entry_point, binary.len = whole.binary.len(), args = args.len(), "Launching program");

        if let Err(error) = stream.execute_program(&whole.binary, &whole.entry_point, &args) {
            drain(stream, &[]);
            return Err(error).context(LaunchSnafu { unit: &whole.entry_point, stream: 0usize });
        }
        if let Some(profiler) = &self.context.profiler {
            profiler.on_unit_launched(&whole.entry_point, 0);
        }
        Ok(RunSummary { units_launched: 1, streams_used: 1 })
    }

    fn acquire_stream(&self) -> Result<AuxStream> {
        let device = &*self.context.device;
        let stream = match &self.context.stream_pool {
            Some(pool) => AuxStream::Pooled(pool.borrow_stream(device).context(DeviceSnafu)?),
            None => AuxStream::Created(device.create_stream().context(DeviceSnafu)?),
        };
        Ok(stream)
    }
}

/// Wait for everything already issued; the binding must outlive queued work.
fn drain(main: &dyn Stream, aux: &[AuxStream]) {
    for stream in std::iter::once(main).chain(aux.iter().map(|s| &**s)) {
        if let Err(error) = stream.block_until_done() {
            warn!(stream = %stream.id(), %error, "Stream failed while draining after error");
        }
    }
}
