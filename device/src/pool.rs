//! Reusable stream pool.
//!
//! Creating a stream is expensive on every driver, so executors borrow auxiliary
//! streams from a pool and hand them back when an execution has been issued.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{Device, DeviceId};
use crate::error::Result;
use crate::stream::Stream;

#[derive(Debug)]
pub struct StreamPool {
    idle: Mutex<HashMap<DeviceId, Vec<Arc<dyn Stream>>>>,
    max_idle_per_device: usize,
}

impl Default for StreamPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamPool {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(max_idle_per_device: usize) -> Self {
        Self { idle: Mutex::new(HashMap::new()), max_idle_per_device }
    }

    /// Borrow a stream on `device`, creating one when none is idle.
    pub fn borrow_stream(self: &Arc<Self>, device: &dyn Device) -> Result<PooledStream> {
        let key = device.id();
        let cached = self.idle.lock().get_mut(&key).and_then(Vec::pop);

        let stream = match cached {
            Some(stream) => stream,
            None => device.create_stream()?,
        };
        Ok(PooledStream { stream, device: key, pool: Arc::clone(self) })
    }

    pub fn idle_count(&self, device: DeviceId) -> usize {
        self.idle.lock().get(&device).map_or(0, Vec::len)
    }

    fn give_back(&self, device: DeviceId, stream: Arc<dyn Stream>) {
        let mut idle = self.idle.lock();
        let streams = idle.entry(device).or_default();
        if streams.len() < self.max_idle_per_device {
            streams.push(stream);
        }
    }
}

/// Stream borrowed from a [`StreamPool`]; returns to the pool on drop.
#[derive(Debug)]
pub struct PooledStream {
    stream: Arc<dyn Stream>,
    device: DeviceId,
    pool: Arc<StreamPool>,
}

impl PooledStream {
    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }
}

impl Deref for PooledStream {
    type Target = dyn Stream;

    fn deref(&self) -> &Self::Target {
        &**self.stream()
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        self.pool.give_back(self.device, Arc::clone(&self.stream));
    }
}
