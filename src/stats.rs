//! Agreement and correlation statistics for graded questionnaires.
//!
//! Reliability data is laid out raters × units: one row per respondent, one
//! column per question, `None` where a respondent skipped a question.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StatsError {
    #[error("length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("need at least {needed} observations, got {got}")]
    TooFewObservations { needed: usize, got: usize },
    #[error("input {0} is constant; statistic is undefined")]
    ConstantInput(&'static str),
    #[error("row {row} has {got} entries, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("unit {unit} was rated {got} times, expected {expected} (fleiss kappa needs equal rater counts)")]
    UnequalRaterCounts {
        unit: usize,
        expected: u32,
        got: u32,
    },
    #[error("no unit has two or more ratings")]
    NoPairableValues,
    #[error("all ratings share one value; agreement is undefined")]
    SingleValueDomain,
    #[error("column {0} has no values")]
    EmptyColumn(usize),
    #[error("distribution error: {0}")]
    Distribution(String),
}

impl StatsError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::TooFewObservations { .. } => "too_few_observations",
            Self::ConstantInput(_) => "constant_input",
            Self::RaggedRows { .. } => "ragged_rows",
            Self::UnequalRaterCounts { .. } => "unequal_rater_counts",
            Self::NoPairableValues => "no_pairable_values",
            Self::SingleValueDomain => "single_value_domain",
            Self::EmptyColumn(_) => "empty_column",
            Self::Distribution(_) => "distribution_error",
        }
    }
}

/// A correlation coefficient with its two-sided p-value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CorrelationResult {
    pub statistic: f64,
    pub p_value: f64,
}

// =============================================================================
// Inter-rater agreement
// =============================================================================

fn check_rectangular<T>(rows: &[Vec<T>]) -> Result<usize, StatsError> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    for (row, values) in rows.iter().enumerate() {
        if values.len() != width {
            return Err(StatsError::RaggedRows {
                row,
                expected: width,
                got: values.len(),
            });
        }
    }
    Ok(width)
}

/// Krippendorff's alpha with the ordinal difference function.
///
/// Units with fewer than two ratings are not pairable and drop out.
pub fn krippendorff_alpha_ordinal(reliability_data: &[Vec<Option<i64>>]) -> Result<f64, StatsError> {
    let units = check_rectangular(reliability_data)?;

    let mut domain: Vec<i64> = reliability_data.iter().flatten().flatten().copied().collect();
    domain.sort_unstable();
    domain.dedup();
    if domain.len() < 2 {
        return Err(StatsError::SingleValueDomain);
    }
    let v = domain.len();

    // Coincidence matrix.
    let mut o = vec![vec![0.0f64; v]; v];
    let mut pairable = 0usize;
    for unit in 0..units {
        let mut counts = vec![0.0f64; v];
        let mut m = 0usize;
        for row in reliability_data {
            let Some(value) = row[unit] else { continue };
            let Ok(idx) = domain.binary_search(&value) else {
                continue;
            };
            counts[idx] += 1.0;
            m += 1;
        }
        if m < 2 {
            continue;
        }
        pairable += 1;
        let weight = 1.0 / (m - 1) as f64;
        for c in 0..v {
            if counts[c] == 0.0 {
                continue;
            }
            for k in 0..v {
                let pairs = if c == k {
                    counts[c] * (counts[c] - 1.0)
                } else {
                    counts[c] * counts[k]
                };
                o[c][k] += pairs * weight;
            }
        }
    }
    if pairable == 0 {
        return Err(StatsError::NoPairableValues);
    }

    let marginals: Vec<f64> = o.iter().map(|row| row.iter().sum()).collect();
    let n: f64 = marginals.iter().sum();

    let mut prefix = Vec::with_capacity(v + 1);
    prefix.push(0.0);
    for m in &marginals {
        prefix.push(prefix[prefix.len() - 1] + m);
    }
    let delta = |c: usize, k: usize| -> f64 {
        let (a, b) = if c <= k { (c, k) } else { (k, c) };
        let span = prefix[b + 1] - prefix[a] - (marginals[a] + marginals[b]) / 2.0;
        span * span
    };

    let mut observed = 0.0;
    let mut expected = 0.0;
    for c in 0..v {
        for k in 0..v {
            let d = delta(c, k);
            observed += o[c][k] * d;
            expected += marginals[c] * marginals[k] * d;
        }
    }
    if expected == 0.0 {
        return Err(StatsError::SingleValueDomain);
    }

    Ok(1.0 - (n - 1.0) * observed / expected)
}

/// Per-unit category counts: one row per column of `reliability_data`.
///
/// Values outside `categories` and missing ratings are not counted.
pub fn category_counts(reliability_data: &[Vec<Option<i64>>], categories: &[i64]) -> Vec<Vec<u32>> {
    let units = reliability_data.first().map(Vec::len).unwrap_or(0);
    (0..units)
        .map(|unit| {
            categories
                .iter()
                .map(|cat| {
                    reliability_data
                        .iter()
                        .filter(|row| row.get(unit).copied().flatten() == Some(*cat))
                        .count() as u32
                })
                .collect()
        })
        .collect()
}

/// Fleiss' kappa over a units × categories count table.
///
/// Every unit must have been rated the same number of times.
pub fn fleiss_kappa(table: &[Vec<u32>]) -> Result<f64, StatsError> {
    check_rectangular(table)?;
    let Some(first) = table.first() else {
        return Err(StatsError::TooFewObservations { needed: 1, got: 0 });
    };
    let raters: u32 = first.iter().sum();
    for (unit, row) in table.iter().enumerate() {
        let got: u32 = row.iter().sum();
        if got != raters {
            return Err(StatsError::UnequalRaterCounts {
                unit,
                expected: raters,
                got,
            });
        }
    }
    if raters < 2 {
        return Err(StatsError::TooFewObservations {
            needed: 2,
            got: raters as usize,
        });
    }

    let n_units = table.len() as f64;
    let r = raters as f64;
    let total = n_units * r;

    let categories = first.len();
    let p_cat: Vec<f64> = (0..categories)
        .map(|j| table.iter().map(|row| row[j] as f64).sum::<f64>() / total)
        .collect();
    let p_unit_mean = table
        .iter()
        .map(|row| {
            let sq: f64 = row.iter().map(|&c| (c as f64) * (c as f64)).sum();
            (sq - r) / (r * (r - 1.0))
        })
        .sum::<f64>()
        / n_units;
    let p_expected: f64 = p_cat.iter().map(|p| p * p).sum();

    if p_expected >= 1.0 {
        return Err(StatsError::SingleValueDomain);
    }
    Ok((p_unit_mean - p_expected) / (1.0 - p_expected))
}

// =============================================================================
// Rank correlation
// =============================================================================

fn check_pair(x: &[f64], y: &[f64], needed: usize) -> Result<usize, StatsError> {
    if x.len() != y.len() {
        return Err(StatsError::LengthMismatch {
            left: x.len(),
            right: y.len(),
        });
    }
    if x.len() < needed {
        return Err(StatsError::TooFewObservations {
            needed,
            got: x.len(),
        });
    }
    Ok(x.len())
}

/// Tie-group sums over runs of equal values: Σt(t−1)/2, Σt(t−1)(t−2)
/// and Σt(t−1)(2t+5).
struct TieSums {
    pairs: f64,
    v0: f64,
    v1: f64,
}

fn tie_sums(values: &[f64]) -> TieSums {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut sums = TieSums {
        pairs: 0.0,
        v0: 0.0,
        v1: 0.0,
    };
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        let t = (j - i) as f64;
        sums.pairs += t * (t - 1.0) / 2.0;
        sums.v0 += t * (t - 1.0) * (t - 2.0);
        sums.v1 += t * (t - 1.0) * (2.0 * t + 5.0);
        i = j;
    }
    sums
}

struct PairCounts {
    concordant: f64,
    discordant: f64,
}

fn count_pairs(x: &[f64], y: &[f64]) -> PairCounts {
    let mut concordant = 0f64;
    let mut discordant = 0f64;
    for i in 0..x.len() {
        for j in (i + 1)..x.len() {
            let s = (x[i] - x[j]) * (y[i] - y[j]);
            if s > 0.0 {
                concordant += 1.0;
            } else if s < 0.0 {
                discordant += 1.0;
            }
        }
    }
    PairCounts {
        concordant,
        discordant,
    }
}

/// Kendall's tau-b with the tie-corrected normal approximation for the p-value.
pub fn kendall_tau_b(x: &[f64], y: &[f64]) -> Result<CorrelationResult, StatsError> {
    let n = check_pair(x, y, 2)?;
    let nf = n as f64;
    let total = nf * (nf - 1.0) / 2.0;

    let tx = tie_sums(x);
    let ty = tie_sums(y);
    let (x_tie, y_tie) = (tx.pairs, ty.pairs);
    if x_tie == total {
        return Err(StatsError::ConstantInput("x"));
    }
    if y_tie == total {
        return Err(StatsError::ConstantInput("y"));
    }

    let PairCounts {
        concordant,
        discordant,
    } = count_pairs(x, y);
    let s = concordant - discordant;
    let tau = (s / ((total - x_tie) * (total - y_tie)).sqrt()).clamp(-1.0, 1.0);

    if n < 3 {
        return Ok(CorrelationResult {
            statistic: tau,
            p_value: 1.0,
        });
    }

    let m = nf * (nf - 1.0);
    let var = (m * (2.0 * nf + 5.0) - tx.v1 - ty.v1) / 18.0
        + (2.0 * x_tie * y_tie) / m
        + tx.v0 * ty.v0 / (9.0 * m * (nf - 2.0));
    let z = s / var.sqrt();

    Ok(CorrelationResult {
        statistic: tau,
        p_value: erfc(z.abs() / SQRT_2).min(1.0),
    })
}

/// Kendall's tau-a: pairs tied on either side count as neither concordant
/// nor discordant; the denominator is all n(n−1)/2 pairs.
pub fn kendall_tau_a(x: &[f64], y: &[f64]) -> Result<f64, StatsError> {
    let n = check_pair(x, y, 2)? as f64;
    let PairCounts {
        concordant,
        discordant,
    } = count_pairs(x, y);
    Ok((concordant - discordant) / (0.5 * n * (n - 1.0)))
}

/// Average ranks (1-based); ties share the mean of the positions they span.
pub fn ranks_with_ties(scores: &[f64]) -> Vec<f64> {
    let n = scores.len();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0usize;
    while i < n {
        let score = scores[indices[i]];
        let mut j = i + 1;
        while j < n && scores[indices[j]] == score {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for &idx in &indices[i..j] {
            ranks[idx] = avg_rank;
        }
        i = j;
    }

    ranks
}

fn correlation(x: &[f64], y: &[f64]) -> Result<f64, StatsError> {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den_x = 0.0;
    let mut den_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        num += dx * dy;
        den_x += dx * dx;
        den_y += dy * dy;
    }

    if den_x == 0.0 {
        return Err(StatsError::ConstantInput("x"));
    }
    if den_y == 0.0 {
        return Err(StatsError::ConstantInput("y"));
    }
    Ok((num / (den_x * den_y).sqrt()).clamp(-1.0, 1.0))
}

/// Two-sided p-value of r under H0: ρ = 0, via Student's t with n−2 df.
fn correlation_p_value(r: f64, n: usize) -> Result<f64, StatsError> {
    if n < 3 {
        return Ok(1.0);
    }
    if r.abs() >= 1.0 {
        return Ok(0.0);
    }
    let df = (n - 2) as f64;
    let t = r * (df / ((1.0 + r) * (1.0 - r))).sqrt();
    let dist = StudentsT::new(0.0, 1.0, df).map_err(|e| StatsError::Distribution(e.to_string()))?;
    Ok((2.0 * dist.sf(t.abs())).min(1.0))
}

pub fn pearson(x: &[f64], y: &[f64]) -> Result<CorrelationResult, StatsError> {
    let n = check_pair(x, y, 2)?;
    let r = correlation(x, y)?;
    Ok(CorrelationResult {
        statistic: r,
        p_value: correlation_p_value(r, n)?,
    })
}

pub fn spearman(x: &[f64], y: &[f64]) -> Result<CorrelationResult, StatsError> {
    let n = check_pair(x, y, 2)?;
    let r = correlation(&ranks_with_ties(x), &ranks_with_ties(y))?;
    Ok(CorrelationResult {
        statistic: r,
        p_value: correlation_p_value(r, n)?,
    })
}

// =============================================================================
// Vectors
// =============================================================================

pub fn euclidean_distance(x: &[f64], y: &[f64]) -> Result<f64, StatsError> {
    check_pair(x, y, 0)?;
    Ok(x.iter()
        .zip(y)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt())
}

/// Mean rating per column, skipping missing entries.
pub fn column_means(reliability_data: &[Vec<Option<i64>>]) -> Result<Vec<f64>, StatsError> {
    let units = check_rectangular(reliability_data)?;
    (0..units)
        .map(|unit| {
            let (sum, count) = reliability_data
                .iter()
                .filter_map(|row| row[unit])
                .fold((0.0, 0usize), |(s, c), v| (s + v as f64, c + 1));
            if count == 0 {
                Err(StatsError::EmptyColumn(unit))
            } else {
                Ok(sum / count as f64)
            }
        })
        .collect()
}

/// Wrap-pad or truncate `values` to exactly `len` entries.
pub fn fit_to_len(values: &[f64], len: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    values.iter().copied().cycle().take(len).collect()
}

// =============================================================================
// Ranking comparison
// =============================================================================

/// How closely one model's grades track the respondents' mean grades.
#[derive(Debug, Clone, Serialize)]
pub struct RankingComparison {
    pub name: String,
    pub euclidean_distance: f64,
    pub average_distance: f64,
    pub kendall_tau: Option<CorrelationResult>,
    pub kendall_tau_a: f64,
    pub spearman: Option<CorrelationResult>,
    pub pearson: Option<CorrelationResult>,
}

/// Compare a ranking against the quiz vector. The ranking is first fitted to
/// the quiz length; correlations that are undefined (constant input) are `None`.
pub fn compare_ranking(
    name: impl Into<String>,
    ranking: &[f64],
    quiz_vector: &[f64],
) -> Result<RankingComparison, StatsError> {
    let name = name.into();
    if ranking.is_empty() {
        return Err(StatsError::TooFewObservations { needed: 1, got: 0 });
    }
    if ranking.len() != quiz_vector.len() {
        warn!(
            ranking = %name,
            ranking_len = ranking.len(),
            quiz_len = quiz_vector.len(),
            "ranking length differs from question count; fitting by wrap/truncate"
        );
    }
    let fitted = fit_to_len(ranking, quiz_vector.len());

    let distance = euclidean_distance(&fitted, quiz_vector)?;
    let average_distance = if quiz_vector.is_empty() {
        0.0
    } else {
        distance / quiz_vector.len() as f64
    };

    let optional = |label: &'static str, r: Result<CorrelationResult, StatsError>| match r {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(ranking = %name, statistic = label, error = %err, "statistic undefined");
            None
        }
    };

    Ok(RankingComparison {
        kendall_tau: optional("kendall_tau", kendall_tau_b(&fitted, quiz_vector)),
        kendall_tau_a: kendall_tau_a(&fitted, quiz_vector)?,
        spearman: optional("spearman", spearman(&fitted, quiz_vector)),
        pearson: optional("pearson", pearson(&fitted, quiz_vector)),
        euclidean_distance: distance,
        average_distance,
        name,
    })
}
