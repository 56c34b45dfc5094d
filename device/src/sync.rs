//! Timeline signals and stream events.
//!
//! A timeline signal is a monotonically increasing counter. Each stream owns one and
//! advances it as its queued work retires; an [`Event`] is a `(signal, value)` pair
//! that is complete once the signal reaches the value. Cross-stream ordering is
//! expressed as "stream B waits for event E recorded on stream A".

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RuntimeSnafu};
use crate::stream::StreamId;

/// Monotonic counter that waiters can block on.
pub trait TimelineSignal: Send + Sync + fmt::Debug {
    fn value(&self) -> u64;

    /// Advance the signal. Values lower than the current one are ignored.
    fn set(&self, value: u64);

    /// Block until the signal reaches `value`. `timeout_ms == 0` waits forever.
    fn wait(&self, value: u64, timeout_ms: u64) -> Result<()>;

    fn is_reached(&self, value: u64) -> bool {
        self.value() >= value
    }
}

/// Host timeline signal backed by a mutex-protected counter and a condvar.
#[derive(Debug, Default)]
pub struct CpuTimelineSignal {
    value: Mutex<u64>,
    condvar: Condvar,
}

impl CpuTimelineSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(initial: u64) -> Self {
        Self { value: Mutex::new(initial), condvar: Condvar::new() }
    }
}

impl TimelineSignal for CpuTimelineSignal {
    fn value(&self) -> u64 {
        *self.value.lock()
    }

    fn set(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
            self.condvar.notify_all();
        }
    }

    fn wait(&self, target: u64, timeout_ms: u64) -> Result<()> {
        let mut current = self.value.lock();
        if timeout_ms == 0 {
            while *current < target {
                self.condvar.wait(&mut current);
            }
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while *current < target {
            if self.condvar.wait_until(&mut current, deadline).timed_out() && *current < target {
                return RuntimeSnafu {
                    message: format!(
                        "timeline signal timeout: waited {timeout_ms}ms for value {target}, current {}",
                        *current
                    ),
                }
                .fail();
            }
        }
        Ok(())
    }
}

/// Completion marker recorded on a stream.
#[derive(Clone)]
pub struct Event {
    stream: StreamId,
    signal: Arc<dyn TimelineSignal>,
    value: u64,
}

impl Event {
    pub fn new(stream: StreamId, signal: Arc<dyn TimelineSignal>, value: u64) -> Self {
        Self { stream, signal, value }
    }

    /// Stream the event was recorded on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_complete(&self) -> bool {
        self.signal.is_reached(self.value)
    }

    /// Block the calling thread until the event completes.
    pub fn synchronize(&self) -> Result<()> {
        self.signal.wait(self.value, 0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("stream", &self.stream)
            .field("value", &self.value)
            .field("complete", &self.is_complete())
            .finish()
    }
}
