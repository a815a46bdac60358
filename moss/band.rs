use crate::eic::EicMatrix;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of Gaussian-multiplier draws for the sup statistic.
pub const DEFAULT_BAND_DRAWS: usize = 10_000;

#[derive(Debug, Error)]
pub enum BandError {
    #[error("confidence level must be in (0, 1), got {0}")]
    InvalidLevel(f64),
    #[error("at least one multiplier draw is required")]
    NoDraws,
    #[error("at least two subjects are required to estimate the EIC covariance")]
    TooFewSubjects,
}

/// Simultaneous confidence band for the whole survival curve.
///
/// `estimate ± multiplier * se` covers the curve jointly at `level`;
/// `estimate ± pointwise_z * se` is the per-time band. The simultaneous
/// multiplier accounts for the correlation of the EIC across adjacent times,
/// which pointwise bands ignore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceBand {
    pub level: f64,
    pub k_grid: Vec<usize>,
    /// Standard error of the estimate at each target time.
    pub se: Array1<f64>,
    pub multiplier: f64,
    pub pointwise_z: f64,
}

impl ConfidenceBand {
    pub fn half_width(&self) -> Array1<f64> {
        self.se.mapv(|se| self.multiplier * se)
    }

    pub fn pointwise_half_width(&self) -> Array1<f64> {
        self.se.mapv(|se| self.pointwise_z * se)
    }
}

/// Builds a simultaneous band from the EIC matrix evaluated at the final
/// targeted estimate.
///
/// The multiplier is the `level` quantile of the sup of a mean-zero Gaussian
/// process with the EIC's empirical covariance, realized by a multiplier
/// bootstrap: each draw attaches i.i.d. standard normals to the centered
/// subject rows and standardizes by the per-time standard deviation. The
/// result is floored at the pointwise normal quantile, so the joint band is
/// never narrower than the pointwise one. Times with zero variance get
/// `se = 0` and are excluded from the sup.
pub fn confidence_band<R: Rng + ?Sized>(
    eic: &EicMatrix,
    level: f64,
    draws: usize,
    rng: &mut R,
) -> Result<ConfidenceBand, BandError> {
    if !level.is_finite() || level <= 0.0 || level >= 1.0 {
        return Err(BandError::InvalidLevel(level));
    }
    if draws == 0 {
        return Err(BandError::NoDraws);
    }
    let n = eic.values.nrows();
    if n < 2 {
        return Err(BandError::TooFewSubjects);
    }
    let k = eic.values.ncols();

    let mut centered = Array2::<f64>::zeros((n, k));
    let mut sd = Array1::<f64>::zeros(k);
    let mut se = Array1::<f64>::zeros(k);
    for j in 0..k {
        let column = eic.values.column(j);
        let mean = column.sum() / n as f64;
        let mut sum_sq = 0.0;
        for i in 0..n {
            let deviation = column[i] - mean;
            centered[[i, j]] = deviation;
            sum_sq += deviation * deviation;
        }
        let variance = sum_sq / (n - 1) as f64;
        sd[j] = variance.sqrt();
        se[j] = (variance / n as f64).sqrt();
    }

    let active: Vec<usize> = (0..k).filter(|&j| sd[j] > 0.0).collect();
    let pointwise_z = normal_quantile(1.0 - (1.0 - level) / 2.0);
    let multiplier = if active.is_empty() {
        pointwise_z
    } else {
        let mut sups = Vec::with_capacity(draws);
        let scale = (n as f64).sqrt();
        let mut xi = vec![0.0f64; n];
        for _ in 0..draws {
            for value in xi.iter_mut() {
                *value = rng.sample(StandardNormal);
            }
            let mut sup = 0.0f64;
            for &j in &active {
                let mut dot = 0.0;
                for i in 0..n {
                    dot += xi[i] * centered[[i, j]];
                }
                let z = (dot / (scale * sd[j])).abs();
                if z > sup {
                    sup = z;
                }
            }
            sups.push(sup);
        }
        sups.sort_by(|a, b| a.total_cmp(b));
        let index = ((level * draws as f64).ceil() as usize).clamp(1, draws) - 1;
        sups[index].max(pointwise_z)
    };

    Ok(ConfidenceBand {
        level,
        k_grid: eic.k_grid.clone(),
        se,
        multiplier,
        pointwise_z,
    })
}

/// Inverse standard-normal CDF (Acklam's rational approximation, |error|
/// below 1.2e-9 on (0, 1)).
fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    debug_assert!(p > 0.0 && p < 1.0);
    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn toy_eic() -> EicMatrix {
        EicMatrix {
            values: array![
                [1.0, 0.5, 0.2],
                [-1.0, -0.3, 0.1],
                [0.5, 0.1, -0.4],
                [-0.5, -0.3, 0.1]
            ],
            psi: array![0.8, 0.6, 0.4],
            k_grid: vec![1, 2, 3],
        }
    }

    #[test]
    fn normal_quantile_matches_reference_values() {
        assert_abs_diff_eq!(normal_quantile(0.975), 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(normal_quantile(0.5), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(normal_quantile(0.05), -1.644854, epsilon = 1e-5);
        assert_abs_diff_eq!(normal_quantile(0.001), -3.090232, epsilon = 1e-4);
    }

    #[test]
    fn standard_errors_match_hand_computation() {
        let mut rng = StdRng::seed_from_u64(7);
        let band = confidence_band(&toy_eic(), 0.95, 200, &mut rng).unwrap();
        // First column: mean 0, sample variance (1 + 1 + 0.25 + 0.25)/3.
        let variance: f64 = 2.5 / 3.0;
        assert_abs_diff_eq!(band.se[0], (variance / 4.0).sqrt(), epsilon = 1e-12);
        for &se in band.se.iter() {
            assert!(se >= 0.0);
        }
    }

    #[test]
    fn simultaneous_multiplier_is_at_least_pointwise() {
        let mut rng = StdRng::seed_from_u64(42);
        let band = confidence_band(&toy_eic(), 0.95, 2_000, &mut rng).unwrap();
        assert!(band.multiplier >= band.pointwise_z);
        assert_abs_diff_eq!(band.pointwise_z, 1.959964, epsilon = 1e-5);
        for (joint, pointwise) in band
            .half_width()
            .iter()
            .zip(band.pointwise_half_width().iter())
        {
            assert!(joint >= pointwise);
        }
    }

    #[test]
    fn zero_variance_columns_get_zero_se_and_are_skipped() {
        let eic = EicMatrix {
            values: array![[0.0, 1.0], [0.0, -1.0], [0.0, 0.0]],
            psi: array![0.5, 0.4],
            k_grid: vec![1, 2],
        };
        let mut rng = StdRng::seed_from_u64(3);
        let band = confidence_band(&eic, 0.95, 500, &mut rng).unwrap();
        assert_eq!(band.se[0], 0.0);
        assert!(band.se[1] > 0.0);
        assert!(band.multiplier.is_finite());
    }

    #[test]
    fn seeded_runs_are_deterministic() {
        let first = confidence_band(&toy_eic(), 0.95, 500, &mut StdRng::seed_from_u64(11)).unwrap();
        let second = confidence_band(&toy_eic(), 0.95, 500, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(first.multiplier, second.multiplier);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            confidence_band(&toy_eic(), 1.0, 100, &mut rng).unwrap_err(),
            BandError::InvalidLevel(_)
        ));
        assert!(matches!(
            confidence_band(&toy_eic(), 0.95, 0, &mut rng).unwrap_err(),
            BandError::NoDraws
        ));
        let single = EicMatrix {
            values: array![[1.0, 2.0]],
            psi: array![0.5, 0.4],
            k_grid: vec![1, 2],
        };
        assert!(matches!(
            confidence_band(&single, 0.95, 100, &mut rng).unwrap_err(),
            BandError::TooFewSubjects
        ));
    }
}
