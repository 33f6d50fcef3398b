//! ELO rating engine.
//!
//! Pure functions from pre-match ratings and match counts to new ratings and
//! deltas. The provisional scheme scales K by seniority so new agents
//! converge quickly while established ratings stay stable. The floor-at-zero
//! clamp is applied at persistence time, not here.

/// Outcome for player one: win, draw, or loss.
pub const WIN: f64 = 1.0;
pub const DRAW: f64 = 0.5;
pub const LOSS: f64 = 0.0;

const DEFAULT_K: f64 = 32.0;

/// K-factor by match count (provisional rating scheme).
///
/// New agents (< 10 matches) use K=40 for fast convergence, intermediate
/// agents (< 20) K=32, established agents K=24.
pub fn k_factor(match_count: i64) -> f64 {
    if match_count < 10 {
        40.0
    } else if match_count < 20 {
        32.0
    } else {
        24.0
    }
}

/// Expected score of a rated `rating_a` player against `rating_b`.
pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
}

/// New ratings and deltas using per-player K-factors from match counts.
///
/// `outcome` is encoded for player one (1.0 / 0.5 / 0.0). Each player's
/// delta uses its own K against its own expected score.
pub fn calculate_with_match_counts(
    rating1: i64,
    rating2: i64,
    matches1: i64,
    matches2: i64,
    outcome: f64,
) -> (i64, i64, i64, i64) {
    calculate_with_k(
        rating1,
        rating2,
        k_factor(matches1),
        k_factor(matches2),
        outcome,
    )
}

/// Legacy entry point with a single K of 32 for both players.
pub fn calculate(rating1: i64, rating2: i64, outcome: f64) -> (i64, i64, i64, i64) {
    calculate_with_k(rating1, rating2, DEFAULT_K, DEFAULT_K, outcome)
}

fn calculate_with_k(rating1: i64, rating2: i64, k1: f64, k2: f64, outcome: f64) -> (i64, i64, i64, i64) {
    let expected1 = expected_score(rating1 as f64, rating2 as f64);
    let expected2 = 1.0 - expected1;

    let new1 = (rating1 as f64 + k1 * (outcome - expected1)).round() as i64;
    let new2 = (rating2 as f64 + k2 * ((1.0 - outcome) - expected2)).round() as i64;

    (new1, new2, new1 - rating1, new2 - rating2)
}
