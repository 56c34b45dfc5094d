//! Per-invocation run context.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bon::bon;
use kiln_device::{Device, Stream, StreamPool};

use crate::profile::ExecutionProfiler;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Caller preferences for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Wait for the device to finish before returning.
    pub block_host_until_done: bool,
}

#[bon]
impl RunOptions {
    #[builder]
    pub fn builder(#[builder(default = false)] block_host_until_done: bool) -> Self {
        Self { block_host_until_done }
    }

    /// Options from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `KILN_BLOCK_HOST_UNTIL_DONE` - Block after every execution if set to anything but `0`
    pub fn from_env() -> Self {
        let block_host_until_done = std::env::var("KILN_BLOCK_HOST_UNTIL_DONE").is_ok_and(|value| value != "0");
        Self { block_host_until_done }
    }
}

/// Where and how one execution runs.
pub struct RunContext {
    pub device: Arc<dyn Device>,
    /// Stream 0 of the program; every other stream synchronizes with it.
    pub stream: Arc<dyn Stream>,
    /// Source of auxiliary streams. Without a pool they are created on the device.
    pub stream_pool: Option<Arc<StreamPool>>,
    pub profiler: Option<Arc<dyn ExecutionProfiler>>,
    pub options: RunOptions,
    pub run_id: u64,
}

#[bon]
impl RunContext {
    #[builder]
    pub fn builder(
        device: Arc<dyn Device>,
        stream: Arc<dyn Stream>,
        stream_pool: Option<Arc<StreamPool>>,
        profiler: Option<Arc<dyn ExecutionProfiler>>,
        #[builder(default = RunOptions::from_env())] options: RunOptions,
        run_id: Option<u64>,
    ) -> Self {
        let run_id = run_id.unwrap_or_else(|| NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed));
        Self { device, stream, stream_pool, profiler, options, run_id }
    }

    /// Context running on `device` with a fresh stream and default options.
    pub fn for_device(device: Arc<dyn Device>) -> kiln_device::Result<Self> {
        let stream = device.create_stream()?;
        Ok(Self::builder().device(device).stream(stream).build())
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("device", &self.device.id())
            .field("stream", &self.stream.id())
            .field("stream_pool", &self.stream_pool.is_some())
            .field("profiler", &self.profiler.is_some())
            .field("options", &self.options)
            .field("run_id", &self.run_id)
            .finish()
    }
}
