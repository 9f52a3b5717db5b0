use std::fmt;

use crate::geometry::{Geometry, GeometryBounds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneDimension {
    LanesPerBlock,
    JobsPerBlock,
}

impl fmt::Display for TuneDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LanesPerBlock => "lanes per block",
            Self::JobsPerBlock => "jobs per block",
        };
        f.write_str(name)
    }
}

/// Diagnostic events a processing unit reports while tuning and dispatching.
/// The unit calls the observer unconditionally; whether anything is printed
/// is the observer's business.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    TuningStarted {
        dimension: TuneDimension,
    },
    Trial {
        geometry: Geometry,
        elapsed_ms: f32,
    },
    TrialFailed {
        geometry: Geometry,
        error: String,
    },
    TuningPicked {
        dimension: TuneDimension,
        value: u32,
    },
    Dispatch {
        geometry: Geometry,
        bounds: GeometryBounds,
    },
}

pub trait UnitObserver {
    fn record(&self, event: &UnitEvent);
}

/// Default observer; drops every event.
pub struct SilentObserver;

impl UnitObserver for SilentObserver {
    fn record(&self, _event: &UnitEvent) {}
}

/// Renders events as tagged stderr lines. Selected at startup via
/// `--verbose` or a nonzero `A2_DEBUG`.
pub struct StderrObserver;

impl UnitObserver for StderrObserver {
    fn record(&self, event: &UnitEvent) {
        match event {
            UnitEvent::TuningStarted { dimension } => {
                eprintln!("[tune] searching {dimension}...");
            }
            UnitEvent::Trial {
                geometry,
                elapsed_ms,
            } => {
                eprintln!("[tune]   {geometry}: {elapsed_ms:.3} ms");
            }
            UnitEvent::TrialFailed { geometry, error } => {
                eprintln!("[tune]   {geometry} failed: {error}");
            }
            UnitEvent::TuningPicked { dimension, value } => {
                eprintln!("[tune] picked {value} {dimension}");
            }
            UnitEvent::Dispatch { geometry, bounds } => {
                eprintln!(
                    "[dispatch] {geometry} (bounds L[{}..{}] J[{}..{}])",
                    bounds.min_lanes_per_block,
                    bounds.max_lanes_per_block,
                    bounds.min_jobs_per_block,
                    bounds.max_jobs_per_block,
                );
            }
        }
    }
}
