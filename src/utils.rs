use statrs::statistics::Statistics;

/// Compute mean and (sample) standard deviation of a slice
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    if values.len() == 1 {
        return (values[0], 0.0);
    }
    let mean = values.mean();
    let std = values.std_dev();
    (mean, std)
}

/// Assign average ranks (1-based) to values, ties share the mean of their rank span
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut indexed: Vec<(usize, f64)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < indexed.len() {
        let start = i;
        while i + 1 < indexed.len() && indexed[i].1 == indexed[i + 1].1 {
            i += 1;
        }
        // mean of the 1-based ranks covered by the tie group
        let rank = (start + i + 2) as f64 / 2.0;
        for item in indexed.iter().take(i + 1).skip(start) {
            ranks[item.0] = rank;
        }
        i += 1;
    }
    ranks
}

/// Spearman rank correlation between two series
///
/// Returns None when the series are too short or either side has no variance,
/// which callers treat as an evaluation failure rather than a zero.
pub fn spearman(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 3 {
        return None;
    }
    if a.iter().any(|x| !x.is_finite()) || b.iter().any(|x| !x.is_finite()) {
        return None;
    }

    let ra = average_ranks(a);
    let rb = average_ranks(b);

    let (mean_a, std_a) = mean_and_std(&ra);
    let (mean_b, std_b) = mean_and_std(&rb);
    if std_a == 0.0 || std_b == 0.0 {
        return None;
    }

    let n = a.len() as f64;
    let cov: f64 = ra
        .iter()
        .zip(rb.iter())
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / (n - 1.0);

    Some(cov / (std_a * std_b))
}

/// Coefficient of variation: std / |mean|, or None when the mean is ~0
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    let (mean, std) = mean_and_std(values);
    if mean.abs() < 1e-12 {
        return None;
    }
    Some(std / mean.abs())
}

/// Clamp into [0, 1]
pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}
