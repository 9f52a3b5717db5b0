use std::env;
use std::fmt;

pub const LANES_PER_BLOCK_ENV: &str = "A2_LPB";
pub const JOBS_PER_BLOCK_ENV: &str = "A2_JPB";
pub const FORCE_MAX_ENV: &str = "A2_FORCE";
pub const DEBUG_ENV: &str = "A2_DEBUG";

/// Kernel launch geometry: how many Argon2 lanes and how many independent
/// jobs share one thread block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub lanes_per_block: u32,
    pub jobs_per_block: u32,
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lpb={} jpb={}", self.lanes_per_block, self.jobs_per_block)
    }
}

/// Inclusive per-dimension limits reported by a kernel runner. Both minima
/// are at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBounds {
    pub min_lanes_per_block: u32,
    pub max_lanes_per_block: u32,
    pub min_jobs_per_block: u32,
    pub max_jobs_per_block: u32,
}

impl GeometryBounds {
    pub fn clamp_lanes(&self, value: u32) -> u32 {
        value
            .min(self.max_lanes_per_block)
            .max(self.min_lanes_per_block)
    }

    pub fn clamp_jobs(&self, value: u32) -> u32 {
        value
            .min(self.max_jobs_per_block)
            .max(self.min_jobs_per_block)
    }

    pub fn contains(&self, geometry: Geometry) -> bool {
        (self.min_lanes_per_block..=self.max_lanes_per_block).contains(&geometry.lanes_per_block)
            && (self.min_jobs_per_block..=self.max_jobs_per_block).contains(&geometry.jobs_per_block)
    }
}

/// Runtime geometry overrides, re-read from the environment before every
/// dispatch so operators can steer a long-lived unit without restarting it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeometryOverrides {
    pub lanes_per_block: Option<u32>,
    pub jobs_per_block: Option<u32>,
    pub force_max: bool,
}

impl GeometryOverrides {
    pub fn from_env() -> Self {
        Self {
            lanes_per_block: parse_override(env::var(LANES_PER_BLOCK_ENV).ok().as_deref()),
            jobs_per_block: parse_override(env::var(JOBS_PER_BLOCK_ENV).ok().as_deref()),
            force_max: parse_switch(env::var(FORCE_MAX_ENV).ok().as_deref()),
        }
    }

    /// Resolves the geometry for one dispatch. Tuned defaults apply first,
    /// force-max substitutes the maximum for each dimension lacking an
    /// explicit override, and explicit overrides win last, clamped into the
    /// runner's bounds. An explicit zero therefore clamps to the minimum
    /// rather than being rejected.
    pub fn resolve(&self, tuned: Geometry, bounds: &GeometryBounds) -> Geometry {
        let mut lanes = self.lanes_per_block;
        let mut jobs = self.jobs_per_block;

        if self.force_max {
            lanes = lanes.or(Some(bounds.max_lanes_per_block));
            jobs = jobs.or(Some(bounds.max_jobs_per_block));
        }

        Geometry {
            lanes_per_block: lanes
                .map(|value| bounds.clamp_lanes(value))
                .unwrap_or(tuned.lanes_per_block),
            jobs_per_block: jobs
                .map(|value| bounds.clamp_jobs(value))
                .unwrap_or(tuned.jobs_per_block),
        }
    }
}

pub fn debug_env_enabled() -> bool {
    parse_switch(env::var(DEBUG_ENV).ok().as_deref())
}

/// Malformed values count as unset; overrides must never make a dispatch
/// fail on their own.
fn parse_override(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|text| text.trim().parse::<u32>().ok())
}

fn parse_switch(raw: Option<&str>) -> bool {
    raw.and_then(|text| text.trim().parse::<i64>().ok())
        .map(|value| value != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: GeometryBounds = GeometryBounds {
        min_lanes_per_block: 1,
        max_lanes_per_block: 16,
        min_jobs_per_block: 1,
        max_jobs_per_block: 8,
    };

    const TUNED: Geometry = Geometry {
        lanes_per_block: 4,
        jobs_per_block: 2,
    };

    #[test]
    fn resolve_keeps_tuned_defaults_without_overrides() {
        let resolved = GeometryOverrides::default().resolve(TUNED, &BOUNDS);
        assert_eq!(resolved, TUNED);
    }

    #[test]
    fn explicit_overrides_clamp_into_bounds() {
        let overrides = GeometryOverrides {
            lanes_per_block: Some(0),
            jobs_per_block: Some(99),
            force_max: false,
        };
        let resolved = overrides.resolve(TUNED, &BOUNDS);
        assert_eq!(resolved.lanes_per_block, 1);
        assert_eq!(resolved.jobs_per_block, 8);
        assert!(BOUNDS.contains(resolved));
    }

    #[test]
    fn force_max_fills_unset_dimensions() {
        let overrides = GeometryOverrides {
            lanes_per_block: None,
            jobs_per_block: None,
            force_max: true,
        };
        let resolved = overrides.resolve(TUNED, &BOUNDS);
        assert_eq!(resolved.lanes_per_block, 16);
        assert_eq!(resolved.jobs_per_block, 8);
    }

    #[test]
    fn explicit_override_wins_over_force_max() {
        let overrides = GeometryOverrides {
            lanes_per_block: Some(2),
            jobs_per_block: None,
            force_max: true,
        };
        let resolved = overrides.resolve(TUNED, &BOUNDS);
        assert_eq!(resolved.lanes_per_block, 2);
        assert_eq!(resolved.jobs_per_block, 8);
    }

    #[test]
    fn resolve_stays_in_bounds_for_adversarial_inputs() {
        for lanes in [None, Some(0), Some(1), Some(17), Some(u32::MAX)] {
            for jobs in [None, Some(0), Some(9), Some(u32::MAX)] {
                for force_max in [false, true] {
                    let overrides = GeometryOverrides {
                        lanes_per_block: lanes,
                        jobs_per_block: jobs,
                        force_max,
                    };
                    let resolved = overrides.resolve(TUNED, &BOUNDS);
                    assert!(
                        BOUNDS.contains(resolved),
                        "resolved {resolved} escaped bounds for {overrides:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn parse_override_rejects_malformed_text() {
        assert_eq!(parse_override(Some("4")), Some(4));
        assert_eq!(parse_override(Some(" 8 ")), Some(8));
        assert_eq!(parse_override(Some("0")), Some(0));
        assert_eq!(parse_override(Some("")), None);
        assert_eq!(parse_override(Some("abc")), None);
        assert_eq!(parse_override(Some("12abc")), None);
        assert_eq!(parse_override(Some("-3")), None);
        assert_eq!(parse_override(None), None);
    }

    #[test]
    fn parse_switch_treats_nonzero_as_on() {
        assert!(parse_switch(Some("1")));
        assert!(parse_switch(Some("2")));
        assert!(parse_switch(Some("-1")));
        assert!(!parse_switch(Some("0")));
        assert!(!parse_switch(Some("yes")));
        assert!(!parse_switch(None));
    }

    #[test]
    fn clamp_respects_each_dimension() {
        assert_eq!(BOUNDS.clamp_lanes(0), 1);
        assert_eq!(BOUNDS.clamp_lanes(16), 16);
        assert_eq!(BOUNDS.clamp_lanes(40), 16);
        assert_eq!(BOUNDS.clamp_jobs(3), 3);
        assert_eq!(BOUNDS.clamp_jobs(100), 8);
    }
}
