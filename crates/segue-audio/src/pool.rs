//! Reusable sample storage for the rendering context.
//!
//! Two resource kinds are pooled: [`SampleContainer`]s, the multi-channel
//! buffers handed to the output device, and [`SampleMemory`], the raw planes
//! that travel to the decode context and back. Both are recycled LIFO so a
//! free followed by an allocation of the same shape hands back the same memory.

use segue_core::{Error, Result};
use tracing::{debug, warn};

use crate::buffering::{PoolLimits, FLOAT32_BYTES};

/// One plane of raw sample memory.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMemory {
    data: Vec<f32>,
}

impl SampleMemory {
    /// Allocate zeroed memory for `frames` samples.
    pub fn new(frames: usize) -> Self {
        Self {
            data: vec![0.0; frames],
        }
    }

    pub fn from_vec(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn frames(&self) -> usize {
        self.data.len()
    }

    pub fn byte_length(&self) -> usize {
        self.data.len() * FLOAT32_BYTES
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Address of the backing storage, stable across moves.
    pub fn as_ptr(&self) -> *const f32 {
        self.data.as_ptr()
    }
}

/// Shape shared by every container of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolShape {
    pub channel_count: u16,
    pub sample_rate: u32,
    pub frame_count: usize,
}

impl PoolShape {
    pub const fn new(channel_count: u16, sample_rate: u32, frame_count: usize) -> Self {
        Self {
            channel_count,
            sample_rate,
            frame_count,
        }
    }

    /// Byte length of one raw memory plane of this shape.
    pub const fn memory_byte_length(&self) -> usize {
        self.frame_count * FLOAT32_BYTES
    }
}

/// Planar multi-channel buffer played by the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleContainer {
    shape: PoolShape,
    planes: Vec<Vec<f32>>,
}

impl SampleContainer {
    pub fn new(shape: PoolShape) -> Self {
        Self {
            shape,
            planes: vec![vec![0.0; shape.frame_count]; usize::from(shape.channel_count)],
        }
    }

    pub const fn shape(&self) -> PoolShape {
        self.shape
    }

    pub const fn sample_rate(&self) -> u32 {
        self.shape.sample_rate
    }

    pub const fn frame_count(&self) -> usize {
        self.shape.frame_count
    }

    pub fn channel_count(&self) -> usize {
        self.planes.len()
    }

    pub fn channel(&self, channel: usize) -> &[f32] {
        self.planes.get(channel).map_or(&[], Vec::as_slice)
    }

    /// Copy `source` into `channel`, zeroing whatever it does not cover.
    pub fn copy_to_channel(&mut self, source: &[f32], channel: usize) {
        let Some(plane) = self.planes.get_mut(channel) else {
            return;
        };
        let n = source.len().min(plane.len());
        plane[..n].copy_from_slice(&source[..n]);
        plane[n..].fill(0.0);
    }

    /// Address of the first plane, used to observe reuse.
    pub fn as_ptr(&self) -> *const f32 {
        self.planes.first().map_or(std::ptr::null(), Vec::as_ptr)
    }
}

/// Allocation counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub containers_allocated: usize,
    pub memory_allocated: usize,
    pub containers_free: usize,
    pub memory_free: usize,
}

/// Pool of sample containers and raw sample memory.
#[derive(Debug, Default)]
pub struct BufferPool {
    shape: Option<PoolShape>,
    limits: Option<PoolLimits>,
    containers: Vec<SampleContainer>,
    memory: Vec<SampleMemory>,
    containers_allocated: usize,
    memory_allocated: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a new shape; entries of any other shape are dropped.
    pub fn configure(&mut self, shape: PoolShape, limits: PoolLimits) {
        if self.shape != Some(shape) {
            debug!(
                "Buffer pool reshaped: {} ch, {} Hz, {} frames",
                shape.channel_count, shape.sample_rate, shape.frame_count
            );
            self.containers.clear();
            self.memory.clear();
            self.containers_allocated = 0;
            self.memory_allocated = 0;
        }
        self.shape = Some(shape);
        self.limits = Some(limits);
    }

    pub const fn shape(&self) -> Option<PoolShape> {
        self.shape
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            containers_allocated: self.containers_allocated,
            memory_allocated: self.memory_allocated,
            containers_free: self.containers.len(),
            memory_free: self.memory.len(),
        }
    }

    fn current_shape(&self) -> Result<PoolShape> {
        self.shape
            .ok_or_else(|| Error::InvalidState("buffer pool used before configuration".into()))
    }

    /// Take a container of the current shape, reusing a freed one if possible.
    pub fn alloc_container(&mut self) -> Result<SampleContainer> {
        let shape = self.current_shape()?;
        if let Some(container) = self.containers.pop() {
            return Ok(container);
        }
        self.containers_allocated += 1;
        if let Some(limits) = self.limits {
            if self.containers_allocated > limits.max_containers {
                warn!(
                    "Possible memory leak: {} sample containers allocated (max {})",
                    self.containers_allocated, limits.max_containers
                );
            }
        }
        Ok(SampleContainer::new(shape))
    }

    /// Return a container; returns false if it no longer fits the pool.
    pub fn free_container(&mut self, container: SampleContainer) -> bool {
        if self.shape != Some(container.shape()) {
            return false;
        }
        self.containers.push(container);
        true
    }

    /// Take one raw plane of the current byte length.
    pub fn alloc_memory(&mut self) -> Result<SampleMemory> {
        let shape = self.current_shape()?;
        if let Some(memory) = self.memory.pop() {
            return Ok(memory);
        }
        self.memory_allocated += 1;
        if let Some(limits) = self.limits {
            if self.memory_allocated > limits.max_memory {
                warn!(
                    "Possible memory leak: {} sample planes allocated (max {})",
                    self.memory_allocated, limits.max_memory
                );
            }
        }
        Ok(SampleMemory::new(shape.frame_count))
    }

    /// Return a raw plane; returns false if its byte length no longer fits.
    pub fn free_memory(&mut self, memory: SampleMemory) -> bool {
        match self.shape {
            Some(shape) if shape.memory_byte_length() == memory.byte_length() => {
                self.memory.push(memory);
                true
            }
            _ => false,
        }
    }

    /// Return every plane of a transfer list.
    pub fn free_transfer_list(&mut self, memory: impl IntoIterator<Item = SampleMemory>) {
        for plane in memory {
            self.free_memory(plane);
        }
    }
}
