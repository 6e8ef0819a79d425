//! Exact similarity in each metric's natural range. Higher is better.
use docvector_core::types::DistanceMetric;

/// Cosine in [-1, 1], raw inner product for dot, `1 / (1 + d)` for euclidean.
pub fn similarity(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f64 {
    match metric {
        DistanceMetric::Cosine => cosine(a, b),
        DistanceMetric::Dot => dot(a, b),
        DistanceMetric::Euclidean => euclidean_score(euclidean(a, b)),
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum()
}

/// Zero vectors have no direction and score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

pub fn euclidean_score(distance: f64) -> f64 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Scores closer than this compare equal, so near-identical floats fall
/// back to insertion order.
#[allow(clippy::cast_possible_truncation)]
pub fn tie_key(score: f64) -> i64 {
    (score * 1e6).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let a = vec![0.1f32; 384];
        let b = vec![0.2f32; 384];
        assert_eq!(tie_key(cosine(&a, &b)), tie_key(1.0));
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn euclidean_maps_into_unit_interval() {
        assert_eq!(similarity(DistanceMetric::Euclidean, &[1.0, 2.0], &[1.0, 2.0]), 1.0);
        let s = similarity(DistanceMetric::Euclidean, &[0.0, 0.0], &[3.0, 4.0]);
        assert!((s - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn dot_is_raw() {
        assert_eq!(similarity(DistanceMetric::Dot, &[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }
}
