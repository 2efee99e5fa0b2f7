use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Skill, SkillTrajectory, TrajectoryPoint};

/// Maximum snapshot points retained per trajectory.
pub const HISTORY_WINDOW: usize = 20;

const TREND_BOUND: f64 = 0.5;
const STABILITY_FLOOR_INCREMENTAL: f64 = 0.3;
const STABILITY_FLOOR_HISTORICAL: f64 = 0.2;
const STABILITY_DECAY: f64 = 0.9;
const INITIAL_STABILITY: f64 = 0.8;

/// Fresh trajectory for a skill's first snapshot.
pub fn new_trajectory(student_id: Uuid, skill: Skill) -> SkillTrajectory {
    SkillTrajectory {
        student_id,
        skill,
        trend: 0.0,
        stability: INITIAL_STABILITY,
        history: Vec::new(),
        last_snapshot_at: None,
    }
}

/// Incremental update: fold one new snapshot point into the trajectory.
///
/// Stability decays toward its floor; the trend is left for the next
/// historical recompute, which fits over the full window. Replaying a
/// snapshot at or before `last_snapshot_at` is a no-op, so a retried
/// evaluation cannot double-decay stability.
pub fn apply_snapshot(
    trajectory: &mut SkillTrajectory,
    at: DateTime<Utc>,
    value: f64,
) -> bool {
    if let Some(last) = trajectory.last_snapshot_at {
        if at <= last {
            return false;
        }
    }

    if trajectory.last_snapshot_at.is_some() {
        trajectory.stability =
            (trajectory.stability * STABILITY_DECAY).max(STABILITY_FLOOR_INCREMENTAL);
    }

    trajectory.history.push(TrajectoryPoint {
        at,
        value: value.clamp(0.0, 1.0),
    });
    if trajectory.history.len() > HISTORY_WINDOW {
        let excess = trajectory.history.len() - HISTORY_WINDOW;
        trajectory.history.drain(..excess);
    }
    trajectory.last_snapshot_at = Some(at);
    true
}

/// Historical recompute: refit trend and stability over the stored history.
/// Requires at least three points; returns false (no change) otherwise.
pub fn recompute(trajectory: &mut SkillTrajectory) -> bool {
    if trajectory.history.len() < 3 {
        return false;
    }

    let values: Vec<f64> = trajectory.history.iter().map(|p| p.value).collect();
    trajectory.trend = ols_slope(&values).clamp(-TREND_BOUND, TREND_BOUND);
    trajectory.stability = stability(&values);
    true
}

/// Ordinary least squares slope over (index, value) pairs. Zero when the
/// denominator vanishes or fewer than two points exist.
pub fn ols_slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }

    let n = values.len() as f64;
    let x_mean = (values.len() - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in values.iter().enumerate() {
        let x_diff = i as f64 - x_mean;
        numerator += x_diff * (y - y_mean);
        denominator += x_diff * x_diff;
    }

    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    numerator / denominator
}

/// `1 - stddev / max(0.1, mean)`, clamped to [0.2, 1.0]. Sample standard
/// deviation (n-1 divisor); a series shorter than two points is fully stable.
pub fn stability(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 1.0;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| (v - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let stddev = variance.sqrt();

    (1.0 - stddev / mean.max(0.1)).clamp(STABILITY_FLOOR_HISTORICAL, 1.0)
}
