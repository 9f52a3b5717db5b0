use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use cudarc::{
    driver::{CudaFunction, CudaSlice, CudaStream, DriverError, LaunchConfig, PushKernelArg},
    nvrtc::{compile_ptx_with_opts, CompileOptions},
};

use argon2_hash_spec::{
    Argon2Kind, HashParams, ProgramContext, ARGON2_BLOCK_SIZE, ARGON2_BLOCK_WORDS,
    ARGON2_SYNC_POINTS,
};

use crate::device::{CudaDeviceBinding, DeviceBinding};
use crate::geometry::Geometry;
use crate::runner::KernelRunner;

const KERNEL_SRC: &str = include_str!("argon2_kernel.cu");
const THREADS_PER_LANE: u32 = 32;
const SEGMENT_KERNEL_NAME: &str = "argon2_segment_kernel";
const ONESHOT_KERNEL_NAME: &str = "argon2_oneshot_kernel";
const PRECOMPUTE_KERNEL_NAME: &str = "argon2_precompute_kernel";

/// Kernel selection knobs fixed at construction time.
#[derive(Debug, Clone, Copy)]
pub struct CudaRunnerOptions {
    /// Launch one kernel per (pass, slice) wave instead of a single kernel
    /// that loops over the whole fill. The by-segment shape synchronizes
    /// lanes through kernel boundaries and so allows splitting a job's lanes
    /// across thread blocks.
    pub by_segment: bool,
    /// Resolve data-independent references into a device table once at
    /// construction instead of recomputing address blocks during every fill.
    /// Ignored for argon2d, which has no data-independent segments.
    pub precompute_refs: bool,
}

impl Default for CudaRunnerOptions {
    fn default() -> Self {
        Self {
            by_segment: true,
            precompute_refs: false,
        }
    }
}

/// [`KernelRunner`] backed by an NVRTC-compiled CUDA module.
///
/// Cost parameters, lane count and batch size are baked into the kernel as
/// preprocessor defines at construction; only the launch geometry varies
/// between dispatches. Job memory is one contiguous device allocation,
/// lane-major within each job.
pub struct CudaKernelRunner {
    stream: Arc<CudaStream>,
    kernel: CudaFunction,
    memory: CudaSlice<u64>,
    refs: CudaSlice<u32>,
    lanes: u32,
    passes: u32,
    lane_blocks: usize,
    batch_size: u32,
    by_segment: bool,
    slot_shared_bytes: u32,
    started: Option<Instant>,
}

impl CudaKernelRunner {
    pub fn new(
        binding: &CudaDeviceBinding,
        params: &HashParams,
        context: ProgramContext,
        batch_size: usize,
        options: CudaRunnerOptions,
    ) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        let batch_size_u32 =
            u32::try_from(batch_size).map_err(|_| anyhow!("batch size {batch_size} overflow"))?;

        let lanes = params.lanes();
        let passes = params.time_cost();
        let lane_blocks = params.lane_blocks();
        let segment_blocks = params.segment_blocks();
        let precompute = options.precompute_refs && context.kind.uses_data_independent_addressing();

        let ctx = binding.context();
        let stream = ctx.default_stream();
        let (cc_major, cc_minor) = ctx
            .compute_capability()
            .map_err(|err| anyhow!("failed to query compute capability: {err:?}"))?;

        let nvrtc_options = vec![
            "--std=c++14".to_string(),
            "--restrict".to_string(),
            format!("-DA2_TYPE={}", context.kind.as_u32()),
            format!("-DA2_VERSION={}", context.version.as_u32()),
            format!("-DA2_LANES={lanes}U"),
            format!("-DA2_PASSES={passes}U"),
            format!("-DA2_SEGMENT_BLOCKS={segment_blocks}U"),
            format!("-DA2_PRECOMPUTE={}", u32::from(precompute)),
            format!("--gpu-architecture=compute_{cc_major}{cc_minor}"),
        ];
        let ptx = compile_ptx_with_opts(
            KERNEL_SRC,
            CompileOptions {
                options: nvrtc_options,
                ..Default::default()
            },
        )
        .map_err(|err| anyhow!("failed to compile Argon2 kernel with NVRTC: {err:?}"))?;

        let module = ctx
            .load_module(ptx)
            .map_err(|err| anyhow!("failed to load CUDA module: {err:?}"))?;
        let kernel_name = if options.by_segment {
            SEGMENT_KERNEL_NAME
        } else {
            ONESHOT_KERNEL_NAME
        };
        let kernel = module
            .load_function(kernel_name)
            .map_err(|err| anyhow!("failed to load CUDA kernel function {kernel_name}: {err:?}"))?;

        let job_words = params
            .memory_blocks()
            .checked_mul(ARGON2_BLOCK_WORDS)
            .and_then(|words| words.checked_mul(batch_size))
            .ok_or_else(|| anyhow!("device buffer size overflows"))?;
        let memory = unsafe { stream.alloc::<u64>(job_words) }.map_err(|err| {
            anyhow!(
                "failed to allocate {} MiB of device memory for {batch_size} jobs on device {}: {err:?}",
                (job_words * 8) >> 20,
                binding.index(),
            )
        })?;

        let di_segments = data_independent_segments(context.kind, passes);
        // The kernel signature always takes a refs pointer; without
        // precompute it is never dereferenced, so a two-word stub suffices.
        let ref_words = if precompute {
            2 * di_segments as usize * lanes as usize * segment_blocks
        } else {
            2
        };
        let mut refs = unsafe { stream.alloc::<u32>(ref_words) }.map_err(cuda_driver_err)?;

        if precompute {
            let precompute_kernel = module.load_function(PRECOMPUTE_KERNEL_NAME).map_err(|err| {
                anyhow!("failed to load CUDA kernel function {PRECOMPUTE_KERNEL_NAME}: {err:?}")
            })?;
            let cfg = LaunchConfig {
                grid_dim: (1, lanes, di_segments),
                block_dim: (THREADS_PER_LANE, 1, 1),
                shared_mem_bytes: 0,
            };
            unsafe {
                let mut launch = stream.launch_builder(&precompute_kernel);
                launch.arg(&mut refs);
                launch.launch(cfg).map_err(cuda_driver_err)?;
            }
            stream.synchronize().map_err(cuda_driver_err)?;
        }

        let slot_shared_bytes =
            shared_blocks_per_slot(context.kind, precompute) * ARGON2_BLOCK_SIZE as u32;

        Ok(Self {
            stream,
            kernel,
            memory,
            refs,
            lanes,
            passes,
            lane_blocks,
            batch_size: batch_size_u32,
            by_segment: options.by_segment,
            slot_shared_bytes,
            started: None,
        })
    }
}

impl KernelRunner for CudaKernelRunner {
    fn min_lanes_per_block(&self) -> u32 {
        // The oneshot kernel synchronizes a job's lanes with barriers, so
        // they must all share one thread block.
        if self.by_segment {
            1
        } else {
            self.lanes
        }
    }

    fn max_lanes_per_block(&self) -> u32 {
        self.lanes
    }

    fn min_jobs_per_block(&self) -> u32 {
        1
    }

    fn max_jobs_per_block(&self) -> u32 {
        self.batch_size
    }

    fn write_input_memory(&mut self, index: usize, first_blocks: &[u64]) -> Result<()> {
        let lanes = self.lanes as usize;
        let expected = lanes * 2 * ARGON2_BLOCK_WORDS;
        if first_blocks.len() != expected {
            bail!(
                "input region expects {expected} words, got {}",
                first_blocks.len()
            );
        }
        if index >= self.batch_size as usize {
            bail!(
                "job index {index} out of range for batch of {}",
                self.batch_size
            );
        }

        for lane in 0..lanes {
            let start = (index * lanes + lane) * self.lane_blocks * ARGON2_BLOCK_WORDS;
            let host = &first_blocks[lane * 2 * ARGON2_BLOCK_WORDS..][..2 * ARGON2_BLOCK_WORDS];
            let mut view = self
                .memory
                .try_slice_mut(start..start + 2 * ARGON2_BLOCK_WORDS)
                .ok_or_else(|| anyhow!("failed to slice device memory for job {index} lane {lane}"))?;
            self.stream
                .memcpy_htod(host, &mut view)
                .map_err(cuda_driver_err)?;
        }
        Ok(())
    }

    fn run(&mut self, geometry: Geometry) -> Result<()> {
        let bounds = self.bounds();
        if !bounds.contains(geometry) {
            bail!(
                "geometry {geometry} outside runner bounds L[{}..{}] J[{}..{}]",
                bounds.min_lanes_per_block,
                bounds.max_lanes_per_block,
                bounds.min_jobs_per_block,
                bounds.max_jobs_per_block,
            );
        }
        if self.lanes % geometry.lanes_per_block != 0 {
            bail!(
                "lanes per block {} does not divide {} lanes",
                geometry.lanes_per_block,
                self.lanes
            );
        }
        if self.batch_size % geometry.jobs_per_block != 0 {
            bail!(
                "jobs per block {} does not divide batch size {}",
                geometry.jobs_per_block,
                self.batch_size
            );
        }

        let shared = u64::from(self.slot_shared_bytes)
            * u64::from(geometry.lanes_per_block)
            * u64::from(geometry.jobs_per_block);
        let shared_mem_bytes = u32::try_from(shared)
            .map_err(|_| anyhow!("shared memory request overflows for {geometry}"))?;

        self.started = Some(Instant::now());

        if self.by_segment {
            let cfg = LaunchConfig {
                grid_dim: (
                    1,
                    self.lanes / geometry.lanes_per_block,
                    self.batch_size / geometry.jobs_per_block,
                ),
                block_dim: (
                    THREADS_PER_LANE,
                    geometry.lanes_per_block,
                    geometry.jobs_per_block,
                ),
                shared_mem_bytes,
            };
            for pass in 0..self.passes {
                for slice in 0..ARGON2_SYNC_POINTS {
                    unsafe {
                        let mut launch = self.stream.launch_builder(&self.kernel);
                        launch
                            .arg(&mut self.memory)
                            .arg(&self.refs)
                            .arg(&pass)
                            .arg(&slice);
                        launch.launch(cfg).map_err(cuda_driver_err)?;
                    }
                }
            }
        } else {
            let cfg = LaunchConfig {
                grid_dim: (1, 1, self.batch_size / geometry.jobs_per_block),
                block_dim: (
                    THREADS_PER_LANE,
                    geometry.lanes_per_block,
                    geometry.jobs_per_block,
                ),
                shared_mem_bytes,
            };
            unsafe {
                let mut launch = self.stream.launch_builder(&self.kernel);
                launch.arg(&mut self.memory).arg(&self.refs);
                launch.launch(cfg).map_err(cuda_driver_err)?;
            }
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<f32> {
        let started = self
            .started
            .take()
            .ok_or_else(|| anyhow!("no dispatch in flight"))?;
        self.stream.synchronize().map_err(cuda_driver_err)?;
        Ok(started.elapsed().as_secs_f32() * 1000.0)
    }

    fn read_output_memory(&mut self, index: usize, last_blocks: &mut [u64]) -> Result<()> {
        let lanes = self.lanes as usize;
        let expected = lanes * ARGON2_BLOCK_WORDS;
        if last_blocks.len() != expected {
            bail!(
                "output region expects {expected} words, got {}",
                last_blocks.len()
            );
        }
        if index >= self.batch_size as usize {
            bail!(
                "job index {index} out of range for batch of {}",
                self.batch_size
            );
        }

        for lane in 0..lanes {
            let start = ((index * lanes + lane) * self.lane_blocks + (self.lane_blocks - 1))
                * ARGON2_BLOCK_WORDS;
            let view = self
                .memory
                .try_slice(start..start + ARGON2_BLOCK_WORDS)
                .ok_or_else(|| anyhow!("failed to slice device memory for job {index} lane {lane}"))?;
            self.stream
                .memcpy_dtoh(
                    &view,
                    &mut last_blocks[lane * ARGON2_BLOCK_WORDS..][..ARGON2_BLOCK_WORDS],
                )
                .map_err(cuda_driver_err)?;
        }
        Ok(())
    }
}

fn cuda_driver_err(err: DriverError) -> anyhow::Error {
    anyhow!("CUDA driver error: {err:?}")
}

/// Number of (pass, slice) segments whose references can be resolved before
/// the fill starts.
fn data_independent_segments(kind: Argon2Kind, passes: u32) -> u32 {
    match kind {
        Argon2Kind::Argon2d => 0,
        Argon2Kind::Argon2i => passes * ARGON2_SYNC_POINTS,
        Argon2Kind::Argon2id => ARGON2_SYNC_POINTS / 2,
    }
}

fn shared_blocks_per_slot(kind: Argon2Kind, precompute: bool) -> u32 {
    // argon2d never builds address blocks; precompute moves them off the
    // fill path. Otherwise each slot needs a third scratch block for them.
    if kind == Argon2Kind::Argon2d || precompute {
        2
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_independent_segment_counts_by_kind() {
        assert_eq!(data_independent_segments(Argon2Kind::Argon2d, 3), 0);
        assert_eq!(data_independent_segments(Argon2Kind::Argon2i, 3), 12);
        assert_eq!(data_independent_segments(Argon2Kind::Argon2id, 3), 2);
        assert_eq!(data_independent_segments(Argon2Kind::Argon2i, 1), 4);
    }

    #[test]
    fn shared_slot_sizing_matches_addressing_mode() {
        assert_eq!(shared_blocks_per_slot(Argon2Kind::Argon2d, false), 2);
        assert_eq!(shared_blocks_per_slot(Argon2Kind::Argon2d, true), 2);
        assert_eq!(shared_blocks_per_slot(Argon2Kind::Argon2i, false), 3);
        assert_eq!(shared_blocks_per_slot(Argon2Kind::Argon2id, true), 2);
    }
}
