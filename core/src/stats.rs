//! Numeric helpers shared by the fact and trend builders.
//!
//! RULE: an undefined value is `None`, never NaN and never an error.

/// `numerator / denominator`, or `None` when either side is absent
/// or the denominator is not positive.
pub fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d > 0.0 => Some(n / d),
        _ => None,
    }
}

/// `ratio` multiplied by `scale`.
pub fn scaled_ratio(numerator: Option<f64>, denominator: Option<f64>, scale: f64) -> Option<f64> {
    ratio(numerator, denominator).map(|r| r * scale)
}

/// `last - base` when both exist.
pub fn abs_delta(base: Option<f64>, last: Option<f64>) -> Option<f64> {
    Some(last? - base?)
}

/// `last / base - 1` when both exist and base is non-zero.
pub fn pct_delta(base: Option<f64>, last: Option<f64>) -> Option<f64> {
    match (base, last) {
        (Some(b), Some(l)) if b != 0.0 => Some(l / b - 1.0),
        _ => None,
    }
}

/// Sum of the present values, `None` when nothing is present.
pub fn sum_present(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    values.into_iter().flatten().fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// Mean of the present values, `None` when nothing is present.
pub fn mean_present(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Median of the present values, `None` when nothing is present.
pub fn median(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let mut sorted: Vec<f64> = values.into_iter().flatten().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Dense rank, largest value first: equal values share a rank and the
/// next distinct value takes the next integer.
pub fn dense_rank_desc(values: &[f64]) -> Vec<u32> {
    let mut distinct: Vec<f64> = values.to_vec();
    distinct.sort_by(|a, b| b.total_cmp(a));
    distinct.dedup();
    values
        .iter()
        .map(|v| {
            let position = distinct.iter().position(|d| d == v).unwrap_or(0);
            position as u32 + 1
        })
        .collect()
}

/// Percentile rank in `(0, 1]`, ties sharing their average rank.
pub fn percentile_rank(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    values
        .iter()
        .map(|v| {
            let below = values.iter().filter(|o| *o < v).count() as f64;
            let equal = values.iter().filter(|o| *o == v).count() as f64;
            (below + (equal + 1.0) / 2.0) / n
        })
        .collect()
}

/// Size bucket for a percentile rank: quartiles `P`, `M`, `G`, `GG`.
pub fn size_bucket(percentile: f64) -> &'static str {
    if percentile <= 0.25 {
        "P"
    } else if percentile <= 0.5 {
        "M"
    } else if percentile <= 0.75 {
        "G"
    } else {
        "GG"
    }
}
