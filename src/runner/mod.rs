use anyhow::Result;

use crate::geometry::{Geometry, GeometryBounds};

pub mod cuda;

/// One batched Argon2 memory-fill engine on one device.
///
/// Memory regions are addressed by job index within the batch the runner was
/// built for. Input regions hold the first two blocks of every lane
/// (`lanes * 2 * 128` words), output regions the last block of every lane
/// (`lanes * 128` words). `run` dispatches the fill for the whole batch and
/// may return before the device is done; `finish` blocks until completion
/// and reports the elapsed milliseconds, which the tuning search uses as its
/// measurement.
pub trait KernelRunner {
    fn min_lanes_per_block(&self) -> u32;

    fn max_lanes_per_block(&self) -> u32;

    fn min_jobs_per_block(&self) -> u32;

    fn max_jobs_per_block(&self) -> u32;

    fn bounds(&self) -> GeometryBounds {
        GeometryBounds {
            min_lanes_per_block: self.min_lanes_per_block(),
            max_lanes_per_block: self.max_lanes_per_block(),
            min_jobs_per_block: self.min_jobs_per_block(),
            max_jobs_per_block: self.max_jobs_per_block(),
        }
    }

    fn write_input_memory(&mut self, index: usize, first_blocks: &[u64]) -> Result<()>;

    fn run(&mut self, geometry: Geometry) -> Result<()>;

    fn finish(&mut self) -> Result<f32>;

    fn read_output_memory(&mut self, index: usize, last_blocks: &mut [u64]) -> Result<()>;
}
