use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Survival values below this are treated as absorbed mass when inverting
/// the product-limit transform.
const ABSORPTION_EPS: f64 = 1e-300;

/// Errors surfaced while converting between hazard and survival scales or
/// rebasing a fit onto the canonical time grid.
#[derive(Debug, Error)]
pub enum CurveError {
    #[error("hazard value {value} for subject {subject} at time {time} is outside [0, 1]")]
    HazardOutOfRange {
        subject: usize,
        time: usize,
        value: f64,
    },
    #[error("survival value {value} for subject {subject} at time {time} is outside [0, 1]")]
    SurvivalOutOfRange {
        subject: usize,
        time: usize,
        value: f64,
    },
    #[error("survival for subject {subject} increases at time {time}; input is not a survival curve")]
    IncreasingSurvival { subject: usize, time: usize },
    #[error(
        "survival for subject {subject} is zero at time {time} but positive later; upstream fit is corrupted"
    )]
    ResurrectedSurvival { subject: usize, time: usize },
    #[error("grid rebasing requires at least one fitted time")]
    EmptyFittedTimes,
    #[error("fitted times must be strictly increasing")]
    UnsortedFittedTimes,
    #[error("fitted time {time} is outside the grid 1..={t_max}")]
    FittedTimeOutsideGrid { time: usize, t_max: usize },
    #[error("hazard fit has {found} columns but {expected} fitted times were supplied")]
    FittedShapeMismatch { found: usize, expected: usize },
}

/// Product-limit transform: `S(t) = prod_{s<=t} (1 - h(s))` per subject row.
///
/// A hazard of exactly 1 absorbs the subject: survival is 0 at that time and
/// stays 0 afterwards, with no NaN from further multiplication.
pub fn hazard_to_survival(hazard: ArrayView2<'_, f64>) -> Result<Array2<f64>, CurveError> {
    validate_unit_range(hazard, false)?;
    let (n, t_max) = hazard.dim();
    let mut survival = Array2::<f64>::zeros((n, t_max));
    for i in 0..n {
        let mut running = 1.0;
        for j in 0..t_max {
            if running > 0.0 {
                running *= 1.0 - hazard[[i, j]];
            }
            if running <= 0.0 {
                running = 0.0;
            }
            survival[[i, j]] = running;
        }
    }
    Ok(survival)
}

/// Inverse of [`hazard_to_survival`]: `h(t) = 1 - S(t)/S(t-1)` with `S(0) = 1`.
///
/// Once a subject's survival reaches zero the hazard is pinned at 1 for the
/// remaining times. A zero followed by a positive value indicates a corrupted
/// upstream fit and is rejected, never repaired.
pub fn survival_to_hazard(survival: ArrayView2<'_, f64>) -> Result<Array2<f64>, CurveError> {
    validate_unit_range(survival, true)?;
    let (n, t_max) = survival.dim();
    let mut hazard = Array2::<f64>::zeros((n, t_max));
    for i in 0..n {
        let mut previous = 1.0;
        for j in 0..t_max {
            let current = survival[[i, j]];
            // Absorption is checked first: a rise from (near-)zero is the
            // corrupted-fit case, not a generic monotonicity violation.
            if previous <= ABSORPTION_EPS {
                if current > ABSORPTION_EPS {
                    return Err(CurveError::ResurrectedSurvival {
                        subject: i,
                        time: j + 1,
                    });
                }
                hazard[[i, j]] = 1.0;
            } else {
                if current > previous {
                    return Err(CurveError::IncreasingSurvival {
                        subject: i,
                        time: j + 1,
                    });
                }
                hazard[[i, j]] = 1.0 - current / previous;
            }
            previous = current;
        }
    }
    Ok(hazard)
}

/// Left-limit censoring survival: column for time `t` holds
/// `prod_{s<t} (1 - h(s))`, so the first column is identically 1.
pub fn hazard_to_left_survival(hazard: ArrayView2<'_, f64>) -> Result<Array2<f64>, CurveError> {
    validate_unit_range(hazard, false)?;
    let (n, t_max) = hazard.dim();
    let mut left = Array2::<f64>::zeros((n, t_max));
    for i in 0..n {
        let mut running = 1.0;
        for j in 0..t_max {
            left[[i, j]] = running;
            if running > 0.0 {
                running *= 1.0 - hazard[[i, j]];
            }
            if running <= 0.0 {
                running = 0.0;
            }
        }
    }
    Ok(left)
}

/// Re-index a hazard fit defined on a sparse, strictly increasing set of
/// fitted times onto the canonical grid `1..=t_max`.
///
/// Missing entries carry the nearest earlier fitted hazard forward; times
/// before the first fitted time take the first fitted value. Sparse grids
/// arise when the upstream fit drops times with no observed events.
pub fn rebase_hazard(
    fitted: ArrayView2<'_, f64>,
    fitted_times: &[usize],
    t_max: usize,
) -> Result<Array2<f64>, CurveError> {
    if fitted_times.is_empty() {
        return Err(CurveError::EmptyFittedTimes);
    }
    if fitted.ncols() != fitted_times.len() {
        return Err(CurveError::FittedShapeMismatch {
            found: fitted.ncols(),
            expected: fitted_times.len(),
        });
    }
    for window in fitted_times.windows(2) {
        if window[1] <= window[0] {
            return Err(CurveError::UnsortedFittedTimes);
        }
    }
    for &time in fitted_times {
        if time == 0 || time > t_max {
            return Err(CurveError::FittedTimeOutsideGrid { time, t_max });
        }
    }
    validate_unit_range(fitted, false)?;

    let n = fitted.nrows();
    let mut rebased = Array2::<f64>::zeros((n, t_max));
    let mut source = 0usize;
    for t in 1..=t_max {
        while source + 1 < fitted_times.len() && fitted_times[source + 1] <= t {
            source += 1;
        }
        for i in 0..n {
            rebased[[i, t - 1]] = fitted[[i, source]];
        }
    }
    Ok(rebased)
}

fn validate_unit_range(values: ArrayView2<'_, f64>, survival_scale: bool) -> Result<(), CurveError> {
    for ((i, j), &value) in values.indexed_iter() {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(if survival_scale {
                CurveError::SurvivalOutOfRange {
                    subject: i,
                    time: j + 1,
                    value,
                }
            } else {
                CurveError::HazardOutOfRange {
                    subject: i,
                    time: j + 1,
                    value,
                }
            });
        }
    }
    Ok(())
}
