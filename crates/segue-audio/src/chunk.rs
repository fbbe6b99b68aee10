//! A decoded chunk on the rendering side, from arrival until it is recycled.

use std::sync::Arc;

use segue_core::BufferDescriptor;

use crate::output::UnitId;
use crate::pool::{BufferPool, SampleContainer, SampleMemory};

/// One chunk queued, playing or kept in history by a source node.
#[derive(Debug)]
pub struct ScheduledChunk {
    pub start_time: f64,
    pub end_time: f64,
    pub length: usize,
    /// Playback duration in seconds.
    pub duration: f64,
    /// Seconds already rendered before the current start.
    pub played_so_far: f64,
    /// Clock time the chunk's current run begins at.
    pub started: Option<f64>,
    /// Output unit playing this chunk.
    pub unit: Option<UnitId>,
    pub is_last_for_track: bool,
    pub is_background: bool,
    gain: Option<f32>,
    buffer: Option<Arc<SampleContainer>>,
    channel_data: Vec<SampleMemory>,
}

impl ScheduledChunk {
    pub fn new(
        descriptor: &BufferDescriptor,
        container: SampleContainer,
        channel_data: Vec<SampleMemory>,
    ) -> Self {
        Self {
            start_time: descriptor.start_time,
            end_time: descriptor.end_time,
            length: descriptor.length,
            duration: descriptor.duration(),
            played_so_far: 0.0,
            started: None,
            unit: None,
            is_last_for_track: descriptor.is_last_buffer,
            is_background: descriptor.is_background_buffer,
            gain: descriptor.loudness_info.gain,
            buffer: Some(Arc::new(container)),
            channel_data,
        }
    }

    /// Seconds left to play.
    pub fn remaining(&self) -> f64 {
        (self.duration - self.played_so_far).max(0.0)
    }

    /// Clock time the current run ends at.
    pub fn ends_at(&self) -> Option<f64> {
        self.started.map(|started| started + self.remaining())
    }

    /// Gain to play at: the chunk's own estimate, else the node's base gain.
    pub fn gain(&self, base_gain: f32) -> f32 {
        self.gain.unwrap_or(base_gain)
    }

    pub const fn loudness_gain(&self) -> Option<f32> {
        self.gain
    }

    pub const fn buffer(&self) -> Option<&Arc<SampleContainer>> {
        self.buffer.as_ref()
    }

    /// Raw planes kept for visualization, `length` valid frames each.
    pub fn channel_data(&self) -> &[SampleMemory] {
        &self.channel_data
    }

    /// Hand the chunk's memory back to the pool. A container still shared
    /// with the output is dropped instead.
    pub fn retire(&mut self, pool: &mut BufferPool) {
        if let Some(buffer) = self.buffer.take() {
            if let Ok(container) = Arc::try_unwrap(buffer) {
                pool.free_container(container);
            }
        }
        pool.free_transfer_list(self.channel_data.drain(..));
        self.unit = None;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use crate::buffering::PoolLimits;
    use crate::pool::PoolShape;
    use segue_core::LoudnessInfo;

    fn descriptor() -> BufferDescriptor {
        BufferDescriptor {
            length: 400,
            start_time: 1.0,
            end_time: 1.4,
            loudness_info: LoudnessInfo::new(Some(0.5)),
            sample_rate: 1000,
            channel_count: 1,
            decoding_latency_ms: 0.0,
            is_background_buffer: false,
            is_last_buffer: false,
        }
    }

    fn pool() -> BufferPool {
        let mut pool = BufferPool::new();
        pool.configure(PoolShape::new(1, 1000, 400), PoolLimits::for_layout(1, 4, 1));
        pool
    }

    #[test]
    fn test_remaining_and_gain() {
        let mut pool = pool();
        let container = pool.alloc_container().unwrap();
        let mut chunk = ScheduledChunk::new(&descriptor(), container, Vec::new());
        assert!((chunk.remaining() - 0.4).abs() < 1e-9);
        chunk.played_so_far = 0.1;
        chunk.started = Some(2.0);
        assert!((chunk.ends_at().unwrap() - 2.3).abs() < 1e-9);
        assert!((chunk.gain(1.0) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_retire_recycles_unshared_memory() {
        let mut pool = pool();
        let container = pool.alloc_container().unwrap();
        let memory = vec![pool.alloc_memory().unwrap()];
        let mut chunk = ScheduledChunk::new(&descriptor(), container, memory);
        chunk.retire(&mut pool);
        assert!(chunk.buffer().is_none());
        let stats = pool.stats();
        assert_eq!(stats.containers_free, 1);
        assert_eq!(stats.memory_free, 1);
    }

    #[test]
    fn test_retire_drops_shared_container() {
        let mut pool = pool();
        let container = pool.alloc_container().unwrap();
        let mut chunk = ScheduledChunk::new(&descriptor(), container, Vec::new());
        let held = Arc::clone(chunk.buffer().unwrap());
        chunk.retire(&mut pool);
        assert_eq!(pool.stats().containers_free, 0);
        drop(held);
    }
}
