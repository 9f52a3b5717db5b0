use anyhow::{bail, Context, Result};

use argon2_hash_spec::{HashParams, ProgramContext, ARGON2_BLOCK_WORDS};

use crate::device::DeviceBinding;
use crate::geometry::{Geometry, GeometryOverrides};
use crate::observer::{TuneDimension, UnitEvent, UnitObserver};
use crate::runner::KernelRunner;

/// One batch-hashing engine bound to one device.
///
/// Construction stages an empty password into every job slot and then tunes
/// the default launch geometry with timed trials. Afterwards the unit cycles
/// through `set_password`, `begin_processing`, `end_processing` and
/// `get_hash`. Job slots keep their inputs and outputs until overwritten, so
/// a slot can be re-hashed or re-read without another upload.
pub struct ProcessingUnit {
    binding: Box<dyn DeviceBinding>,
    runner: Box<dyn KernelRunner>,
    observer: Box<dyn UnitObserver>,
    params: HashParams,
    context: ProgramContext,
    batch_size: usize,
    tuned: Geometry,
    input_words: Vec<u64>,
    output_words: Vec<u64>,
}

impl std::fmt::Debug for ProcessingUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingUnit")
            .field("params", &self.params)
            .field("context", &self.context)
            .field("batch_size", &self.batch_size)
            .field("tuned", &self.tuned)
            .finish_non_exhaustive()
    }
}

impl ProcessingUnit {
    pub fn new(
        binding: Box<dyn DeviceBinding>,
        runner: Box<dyn KernelRunner>,
        observer: Box<dyn UnitObserver>,
        params: HashParams,
        context: ProgramContext,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be at least 1");
        }

        binding.ensure_bound()?;

        let bounds = runner.bounds();
        let lanes = params.lanes() as usize;
        let mut unit = Self {
            tuned: Geometry {
                lanes_per_block: bounds.min_lanes_per_block,
                jobs_per_block: bounds.min_jobs_per_block,
            },
            input_words: vec![0u64; lanes * 2 * ARGON2_BLOCK_WORDS],
            output_words: vec![0u64; lanes * ARGON2_BLOCK_WORDS],
            binding,
            runner,
            observer,
            params,
            context,
            batch_size,
        };

        // Tuning trials run over whatever the job slots hold; stage the hash
        // of an empty password everywhere first.
        for index in 0..batch_size {
            unit.set_password(index, b"")
                .with_context(|| format!("pre-filling job slot {index}"))?;
        }

        unit.autotune();
        Ok(unit)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn output_len(&self) -> usize {
        self.params.output_len()
    }

    pub fn device_index(&self) -> u32 {
        self.binding.index()
    }

    /// The geometry construction settled on; dispatches fall back to it when
    /// no override applies.
    pub fn tuned_geometry(&self) -> Geometry {
        self.tuned
    }

    /// Computes the first two blocks of every lane for `password` and stages
    /// them into job slot `index` on the device.
    pub fn set_password(&mut self, index: usize, password: &[u8]) -> Result<()> {
        self.params
            .fill_first_blocks(self.context, password, &mut self.input_words)?;
        self.runner.write_input_memory(index, &self.input_words)
    }

    /// Reads back the last block of every lane of job `index` and finalizes
    /// it into `hash`, whose length must match the configured output length.
    pub fn get_hash(&mut self, index: usize, hash: &mut [u8]) -> Result<()> {
        self.runner.read_output_memory(index, &mut self.output_words)?;
        self.params.finalize(&self.output_words, hash)
    }

    /// Dispatches the memory fill for the whole batch, resolving geometry
    /// overrides from the environment, and returns without waiting. Dispatch
    /// failures here are not tuning trials and propagate to the caller.
    pub fn begin_processing(&mut self) -> Result<()> {
        self.begin_processing_with(GeometryOverrides::from_env())
    }

    pub fn begin_processing_with(&mut self, overrides: GeometryOverrides) -> Result<()> {
        self.binding.ensure_bound()?;

        let bounds = self.runner.bounds();
        let geometry = overrides.resolve(self.tuned, &bounds);
        self.observer.record(&UnitEvent::Dispatch { geometry, bounds });
        self.runner.run(geometry)
    }

    /// Blocks until the dispatched fill is complete.
    pub fn end_processing(&mut self) -> Result<()> {
        self.runner.finish()?;
        Ok(())
    }

    /// Picks default launch geometry by doubling each dimension through its
    /// power-of-two candidates and keeping the fastest trial. A failed trial
    /// ends that dimension's search; whatever measured best so far stands.
    fn autotune(&mut self) {
        let bounds = self.runner.bounds();

        if bounds.max_lanes_per_block > bounds.min_lanes_per_block
            && bounds.max_lanes_per_block.is_power_of_two()
        {
            self.observer.record(&UnitEvent::TuningStarted {
                dimension: TuneDimension::LanesPerBlock,
            });

            let mut best_time = f32::INFINITY;
            let mut lanes_per_block = 1u32;
            while lanes_per_block <= bounds.max_lanes_per_block {
                let geometry = Geometry {
                    lanes_per_block,
                    jobs_per_block: self.tuned.jobs_per_block,
                };
                let time = match self.observed_trial(geometry) {
                    Some(time) => time,
                    None => break,
                };
                if time < best_time {
                    best_time = time;
                    self.tuned.lanes_per_block = lanes_per_block;
                }
                lanes_per_block = match lanes_per_block.checked_mul(2) {
                    Some(next) => next,
                    None => break,
                };
            }

            self.observer.record(&UnitEvent::TuningPicked {
                dimension: TuneDimension::LanesPerBlock,
                value: self.tuned.lanes_per_block,
            });
        }

        // Packing jobs only pays once a thread block already spans every
        // lane of a job. Policy choice; relax here if that assumption stops
        // holding for some device class.
        let lanes_saturated = self.tuned.lanes_per_block == bounds.max_lanes_per_block;
        if lanes_saturated
            && bounds.max_jobs_per_block > bounds.min_jobs_per_block
            && bounds.max_jobs_per_block.is_power_of_two()
        {
            self.observer.record(&UnitEvent::TuningStarted {
                dimension: TuneDimension::JobsPerBlock,
            });

            let mut best_time = f32::INFINITY;
            let mut jobs_per_block = 1u32;
            while jobs_per_block <= bounds.max_jobs_per_block {
                let geometry = Geometry {
                    lanes_per_block: self.tuned.lanes_per_block,
                    jobs_per_block,
                };
                let time = match self.observed_trial(geometry) {
                    Some(time) => time,
                    None => break,
                };
                if time < best_time {
                    best_time = time;
                    self.tuned.jobs_per_block = jobs_per_block;
                }
                jobs_per_block = match jobs_per_block.checked_mul(2) {
                    Some(next) => next,
                    None => break,
                };
            }

            self.observer.record(&UnitEvent::TuningPicked {
                dimension: TuneDimension::JobsPerBlock,
                value: self.tuned.jobs_per_block,
            });
        }
    }

    /// One timed trial. Failures are reported to the observer and swallowed;
    /// tuning treats them as "this candidate is not available".
    fn observed_trial(&mut self, geometry: Geometry) -> Option<f32> {
        let outcome = self
            .runner
            .run(geometry)
            .and_then(|()| self.runner.finish());
        match outcome {
            Ok(elapsed_ms) => {
                self.observer.record(&UnitEvent::Trial {
                    geometry,
                    elapsed_ms,
                });
                Some(elapsed_ms)
            }
            Err(err) => {
                self.observer.record(&UnitEvent::TrialFailed {
                    geometry,
                    error: format!("{err:#}"),
                });
                None
            }
        }
    }
}
