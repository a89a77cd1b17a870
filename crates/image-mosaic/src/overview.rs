//! Per-granule pyramid level selection.
//!
//! Granules in one mosaic may have different native resolutions and pyramid
//! depths, so the choice is made for each granule separately.

use serde::{Deserialize, Serialize};

use mosaic_common::PixelRect;

use crate::granule::OverviewLevel;
use crate::types::{DecimationPolicy, OverviewPolicy};

/// How to read one granule: pyramid level, decoder subsampling and source window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPlan {
    pub level: usize,
    pub subsampling: (usize, usize),
    /// Window in the selected level's pixel space.
    pub source_region: PixelRect,
}

impl ReadPlan {
    /// Restrict the plan to a source window.
    pub fn with_region(self, source_region: PixelRect) -> Self {
        Self {
            source_region,
            ..self
        }
    }
}

/// Choose the pyramid level and subsampling for a requested resolution.
///
/// `levels` is ordered finest first. The returned plan covers the whole
/// selected level; narrow it with [`ReadPlan::with_region`].
pub fn resolve(
    requested: (f64, f64),
    levels: &[OverviewLevel],
    policy: OverviewPolicy,
    decimation: DecimationPolicy,
) -> ReadPlan {
    let Some(base) = levels.first() else {
        return ReadPlan {
            level: 0,
            subsampling: (1, 1),
            source_region: PixelRect::sized(0, 0),
        };
    };

    let level = match policy {
        OverviewPolicy::Ignore => 0,
        _ => pick_level(requested, levels, policy),
    };

    let selected = &levels[level];
    let subsampling = match decimation {
        DecimationPolicy::Disallow => (1, 1),
        DecimationPolicy::Allow => {
            let (rx, ry) = selected.resolution();
            (
                subsample_factor(requested.0, rx, selected.width),
                subsample_factor(requested.1, ry, selected.height),
            )
        }
    };

    tracing::trace!(
        level,
        ss_x = subsampling.0,
        ss_y = subsampling.1,
        base_res = base.resolution().0,
        "Resolved read plan"
    );

    ReadPlan {
        level,
        subsampling,
        source_region: PixelRect::sized(selected.width, selected.height),
    }
}

/// Index of the level to read under `policy` (never `Ignore`).
fn pick_level(requested: (f64, f64), levels: &[OverviewLevel], policy: OverviewPolicy) -> usize {
    let (base_x, base_y) = levels[0].resolution();
    let (fx, fy) = (requested.0 / base_x, requested.1 / base_y);
    // Reduce along the axis that needs it least so neither axis is upsampled.
    let use_x = fx <= fy;
    let factor = if use_x { fx } else { fy };
    let level_factor = |l: &OverviewLevel| {
        let (rx, ry) = l.resolution();
        if use_x {
            rx / base_x
        } else {
            ry / base_y
        }
    };

    if !(factor > 1.0) || levels.len() == 1 {
        return 0;
    }

    let mut order: Vec<usize> = (0..levels.len()).collect();
    order.sort_by(|&a, &b| level_factor(&levels[a]).total_cmp(&level_factor(&levels[b])));

    let coarsest = order[order.len() - 1];
    if factor >= level_factor(&levels[coarsest]) {
        return coarsest;
    }

    let mut prev = order[0];
    for &curr in &order[1..] {
        let curr_factor = level_factor(&levels[curr]);
        if factor == curr_factor {
            return curr;
        }
        if factor < curr_factor {
            let prev_factor = level_factor(&levels[prev]);
            return match policy {
                OverviewPolicy::Quality => prev,
                OverviewPolicy::Speed => curr,
                // log-distance: ln(f / p) < ln(c / f)  <=>  f^2 < p * c
                _ => {
                    if factor * factor < prev_factor * curr_factor {
                        prev
                    } else {
                        curr
                    }
                }
            };
        }
        prev = curr;
    }
    coarsest
}

fn subsample_factor(requested: f64, level_res: f64, extent: usize) -> usize {
    if !(requested > 0.0 && level_res > 0.0) {
        return 1;
    }
    ((requested / level_res).floor() as usize).clamp(1, extent.max(1))
}
