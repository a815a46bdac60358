use crate::data::SurvivalData;
use crate::nuisance::Arm;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use thiserror::Error;

/// Inverse-probability denominators (propensity and left-limit censoring
/// survival) are clipped at this floor. Bounds the variance inflation from
/// near-positivity violations at the price of a small bias.
pub const WEIGHT_FLOOR: f64 = 1e-2;

/// Survival values at or below this are treated as absorbed mass; ratio terms
/// against them contribute zero rather than dividing by zero.
const SURVIVAL_GUARD: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum EicError {
    #[error(
        "subject {subject} was observed under the target arm but has zero propensity for it; the clever covariate is undefined"
    )]
    ZeroPropensity { subject: usize },
    #[error("target grid must be nonempty")]
    EmptyTargetGrid,
    #[error("target grid must be strictly increasing")]
    UnsortedTargetGrid,
    #[error("target time {time} is outside the grid 1..={t_max}")]
    TargetTimeOutsideGrid { time: usize, t_max: usize },
    #[error("psi override has {found} entries but the target grid has {expected}")]
    PsiShapeMismatch { expected: usize, found: usize },
    #[error("direction vector has {found} entries but the target grid has {expected}")]
    DirectionShapeMismatch { expected: usize, found: usize },
}

/// Everything the influence-curve pass reads. All components refer to the
/// same subject set; `survival` and `failure_hazard` must be consistent with
/// each other (the engine recomputes survival after every hazard update).
#[derive(Debug, Clone, Copy)]
pub struct EicInputs<'a> {
    pub data: &'a SurvivalData,
    pub arm: Arm,
    /// `P(A=1 | W)` per subject.
    pub propensity: ArrayView1<'a, f64>,
    /// Left-limit censoring survival `S_c(t- | W)`, subjects by grid.
    pub censor_survival_left: ArrayView2<'a, f64>,
    /// Current conditional failure hazard for the target arm.
    pub failure_hazard: ArrayView2<'a, f64>,
    /// Conditional survival implied by `failure_hazard`.
    pub survival: ArrayView2<'a, f64>,
    /// Target times, a strictly increasing subset of `1..=t_max`.
    pub k_grid: &'a [usize],
    /// Centering estimate; defaults to the subject mean of `survival` on the
    /// target grid. Supplied externally when finalizing.
    pub psi_override: Option<ArrayView1<'a, f64>>,
}

/// Per-subject influence values over the target grid, together with the
/// marginal estimate the matrix was centered against.
#[derive(Debug, Clone)]
pub struct EicMatrix {
    /// Subjects by target times.
    pub values: Array2<f64>,
    pub psi: Array1<f64>,
    pub k_grid: Vec<usize>,
}

impl EicMatrix {
    /// Column means `P_n D(t0)`, the empirical efficient score.
    pub fn column_means(&self) -> Array1<f64> {
        let n = self.values.nrows() as f64;
        let mut means = Array1::<f64>::zeros(self.values.ncols());
        for (j, column) in self.values.columns().into_iter().enumerate() {
            means[j] = column.sum() / n;
        }
        means
    }
}

fn validate_grid(k_grid: &[usize], t_max: usize) -> Result<(), EicError> {
    if k_grid.is_empty() {
        return Err(EicError::EmptyTargetGrid);
    }
    for window in k_grid.windows(2) {
        if window[1] <= window[0] {
            return Err(EicError::UnsortedTargetGrid);
        }
    }
    for &time in k_grid {
        if time == 0 || time > t_max {
            return Err(EicError::TargetTimeOutsideGrid { time, t_max });
        }
    }
    Ok(())
}

/// Per-subject inverse-propensity factor `1{A_i = a} / clip(g_a(W_i))`.
///
/// An exact zero propensity under a matching treatment is a domain error;
/// clipping only applies to small positive values.
fn subject_weights(inputs: &EicInputs<'_>) -> Result<Array1<f64>, EicError> {
    let n = inputs.data.n_subjects();
    let mut weights = Array1::<f64>::zeros(n);
    for i in 0..n {
        if !inputs.arm.matches(inputs.data.treatment()[i]) {
            continue;
        }
        let g = inputs.arm.propensity(inputs.propensity[i]);
        if g == 0.0 {
            return Err(EicError::ZeroPropensity { subject: i });
        }
        weights[i] = 1.0 / g.max(WEIGHT_FLOOR);
    }
    Ok(weights)
}

fn resolve_psi(inputs: &EicInputs<'_>) -> Result<Array1<f64>, EicError> {
    if let Some(psi) = inputs.psi_override {
        if psi.len() != inputs.k_grid.len() {
            return Err(EicError::PsiShapeMismatch {
                expected: inputs.k_grid.len(),
                found: psi.len(),
            });
        }
        return Ok(psi.to_owned());
    }
    let n = inputs.data.n_subjects() as f64;
    let mut psi = Array1::<f64>::zeros(inputs.k_grid.len());
    for (k, &t0) in inputs.k_grid.iter().enumerate() {
        psi[k] = inputs.survival.column(t0 - 1).sum() / n;
    }
    Ok(psi)
}

/// Efficient influence curve of the arm-specific survival probabilities on
/// the target grid, one row per subject:
///
/// ```text
/// D_i(t0) = - sum_{t<=t0} [1{A_i=a} / (g_a(W_i) S_c(t-|W_i))]
///             * [S(t0|W_i)/S(t|W_i)] * (dN_i(t) - 1{T~_i>=t} h(t|W_i))
///           + S(t0|W_i) - psi(t0)
/// ```
///
/// Recomputed fresh each call; the matrix depends on the current hazard and
/// is never valid across an update.
pub fn compute_eic(inputs: &EicInputs<'_>) -> Result<EicMatrix, EicError> {
    validate_grid(inputs.k_grid, inputs.data.t_max())?;
    let weights = subject_weights(inputs)?;
    let psi = resolve_psi(inputs)?;

    let n = inputs.data.n_subjects();
    let t_max = inputs.data.t_max();
    let k = inputs.k_grid.len();
    let at_risk = inputs.data.at_risk_matrix();
    let increments = inputs.data.event_increment_matrix();

    // Subjects are independent; rows are computed in parallel and only the
    // shared read-only inputs are captured.
    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let weight = weights[i];
            let survival = inputs.survival.row(i);
            let mut row = vec![0.0; k];
            // Prefix sums of the standardized martingale residuals:
            // cum(t0) = sum_{t<=t0} resid(t) / (S_c(t-) S(t)).
            let hazard = inputs.failure_hazard.row(i);
            let censor_left = inputs.censor_survival_left.row(i);
            let mut cum = vec![0.0; t_max];
            let mut running = 0.0;
            for j in 0..t_max {
                let resid = increments[[i, j]] - at_risk[[i, j]] * hazard[j];
                let s_t = survival[j];
                if weight != 0.0 && resid != 0.0 && s_t > SURVIVAL_GUARD {
                    running += resid / (censor_left[j].max(WEIGHT_FLOOR) * s_t);
                }
                cum[j] = running;
            }
            for (slot, (&t0, &psi_t0)) in row
                .iter_mut()
                .zip(inputs.k_grid.iter().zip(psi.iter()))
            {
                let s_t0 = survival[t0 - 1];
                *slot = -weight * s_t0 * cum[t0 - 1] + s_t0 - psi_t0;
            }
            row
        })
        .collect();

    let mut values = Array2::<f64>::zeros((n, k));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, value) in row.into_iter().enumerate() {
            values[[i, j]] = value;
        }
    }
    Ok(EicMatrix {
        values,
        psi,
        k_grid: inputs.k_grid.to_vec(),
    })
}

/// Aggregated clever covariate for the fluctuation step, subjects by the full
/// grid:
///
/// ```text
/// H_i(t) = - [1{A_i=a} / (g_a(W_i) S_c(t-|W_i))]
///            * sum_{t0 in k_grid, t0>=t} d(t0) S(t0|W_i) / S(t|W_i)
/// ```
///
/// The inner sum is a per-subject suffix sum, so no subjects-by-grid-by-grid
/// tensor is ever materialized.
pub fn clever_covariate(
    inputs: &EicInputs<'_>,
    direction: ArrayView1<'_, f64>,
) -> Result<Array2<f64>, EicError> {
    validate_grid(inputs.k_grid, inputs.data.t_max())?;
    if direction.len() != inputs.k_grid.len() {
        return Err(EicError::DirectionShapeMismatch {
            expected: inputs.k_grid.len(),
            found: direction.len(),
        });
    }
    let weights = subject_weights(inputs)?;

    let n = inputs.data.n_subjects();
    let t_max = inputs.data.t_max();
    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let weight = weights[i];
            let mut row = vec![0.0; t_max];
            if weight == 0.0 {
                return row;
            }
            let survival = inputs.survival.row(i);
            let censor_left = inputs.censor_survival_left.row(i);
            let mut weighted = vec![0.0; t_max];
            for (k, &t0) in inputs.k_grid.iter().enumerate() {
                weighted[t0 - 1] = direction[k] * survival[t0 - 1];
            }
            let mut suffix = 0.0;
            for j in (0..t_max).rev() {
                suffix += weighted[j];
                let s_t = survival[j];
                if s_t > SURVIVAL_GUARD {
                    row[j] = -weight * suffix / (censor_left[j].max(WEIGHT_FLOOR) * s_t);
                }
            }
            row
        })
        .collect();

    let mut covariate = Array2::<f64>::zeros((n, t_max));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, value) in row.into_iter().enumerate() {
            covariate[[i, j]] = value;
        }
    }
    Ok(covariate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curves::{hazard_to_left_survival, hazard_to_survival};
    use crate::data::SurvivalData;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    struct Fixture {
        data: SurvivalData,
        propensity: Array1<f64>,
        censor_left: Array2<f64>,
        hazard: Array2<f64>,
        survival: Array2<f64>,
    }

    fn two_subject_fixture() -> Fixture {
        let data =
            SurvivalData::new(array![1, 0], array![2, 2], array![1, 0], 2).unwrap();
        let hazard = array![[0.5, 0.5], [0.5, 0.5]];
        let survival = hazard_to_survival(hazard.view()).unwrap();
        let censor_hazard = Array2::<f64>::zeros((2, 2));
        let censor_left = hazard_to_left_survival(censor_hazard.view()).unwrap();
        Fixture {
            data,
            propensity: array![0.5, 0.5],
            censor_left,
            hazard,
            survival,
        }
    }

    fn inputs<'a>(fixture: &'a Fixture, k_grid: &'a [usize]) -> EicInputs<'a> {
        EicInputs {
            data: &fixture.data,
            arm: Arm::Treated,
            propensity: fixture.propensity.view(),
            censor_survival_left: fixture.censor_left.view(),
            failure_hazard: fixture.hazard.view(),
            survival: fixture.survival.view(),
            k_grid,
            psi_override: None,
        }
    }

    #[test]
    fn matches_closed_form_on_two_subjects() {
        // Treated subject fails at t=2, control subject censored at t=2.
        // Constant hazard 0.5, no censoring hazard, propensity 0.5, so the
        // clever weight for the treated subject is exactly 2.
        let fixture = two_subject_fixture();
        let k_grid = [1usize, 2usize];
        let eic = compute_eic(&inputs(&fixture, &k_grid)).unwrap();

        assert_abs_diff_eq!(eic.psi[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(eic.psi[1], 0.25, epsilon = 1e-12);
        // Subject 0: resid(1) = -0.5, resid(2) = 0.5.
        // D(1) = -2 * (S(1)/S(1)) * (-0.5) = 1.
        assert_abs_diff_eq!(eic.values[[0, 0]], 1.0, epsilon = 1e-12);
        // D(2) = -2 * [0.5*(-0.5) + 1*0.5] = -0.5.
        assert_abs_diff_eq!(eic.values[[0, 1]], -0.5, epsilon = 1e-12);
        // Control subject carries only the centering term, which is zero
        // because both subjects share the same conditional survival.
        assert_abs_diff_eq!(eic.values[[1, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eic.values[[1, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn centering_term_has_zero_mean_without_matching_subjects() {
        let mut fixture = two_subject_fixture();
        // Distinct conditional survival per subject.
        fixture.hazard = array![[0.2, 0.2], [0.4, 0.4]];
        fixture.survival = hazard_to_survival(fixture.hazard.view()).unwrap();
        let data =
            SurvivalData::new(array![0, 0], array![2, 2], array![1, 0], 2).unwrap();
        fixture.data = data;
        let k_grid = [1usize, 2usize];
        // Target arm Treated has no matching subjects: only S - psi remains.
        let eic = compute_eic(&inputs(&fixture, &k_grid)).unwrap();
        let means = eic.column_means();
        assert_abs_diff_eq!(means[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(means[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn clever_covariate_matches_direct_double_sum() {
        let fixture = two_subject_fixture();
        let k_grid = [1usize, 2usize];
        let direction = array![0.3, -0.7];
        let covariate =
            clever_covariate(&inputs(&fixture, &k_grid), direction.view()).unwrap();

        // Subject 0, weight 2: H(1) = -2*(d1*S(1)/S(1) + d2*S(2)/S(1)),
        // H(2) = -2*d2.
        let s = fixture.survival.row(0);
        let expected_t1 = -2.0 * (direction[0] + direction[1] * s[1] / s[0]);
        let expected_t2 = -2.0 * direction[1];
        assert_abs_diff_eq!(covariate[[0, 0]], expected_t1, epsilon = 1e-12);
        assert_abs_diff_eq!(covariate[[0, 1]], expected_t2, epsilon = 1e-12);
        assert_abs_diff_eq!(covariate[[1, 0]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_propensity_with_matching_treatment_is_a_domain_error() {
        let mut fixture = two_subject_fixture();
        fixture.propensity = array![0.0, 0.5];
        let k_grid = [1usize, 2usize];
        let err = compute_eic(&inputs(&fixture, &k_grid)).unwrap_err();
        assert!(matches!(err, EicError::ZeroPropensity { subject: 0 }));
    }

    #[test]
    fn small_denominators_are_clipped_not_exploded() {
        let mut fixture = two_subject_fixture();
        fixture.propensity = array![1e-6, 0.5];
        let k_grid = [1usize, 2usize];
        let eic = compute_eic(&inputs(&fixture, &k_grid)).unwrap();
        // Weight is bounded by 1/WEIGHT_FLOOR, so the influence value is
        // bounded by 100 * |resid| contributions.
        assert!(eic.values[[0, 0]].abs() <= 1.0 / WEIGHT_FLOOR + 1.0);
    }

    #[test]
    fn grid_validation_rejects_bad_target_grids() {
        let fixture = two_subject_fixture();
        assert!(matches!(
            compute_eic(&inputs(&fixture, &[])).unwrap_err(),
            EicError::EmptyTargetGrid
        ));
        assert!(matches!(
            compute_eic(&inputs(&fixture, &[2, 1])).unwrap_err(),
            EicError::UnsortedTargetGrid
        ));
        assert!(matches!(
            compute_eic(&inputs(&fixture, &[1, 3])).unwrap_err(),
            EicError::TargetTimeOutsideGrid { time: 3, t_max: 2 }
        ));
    }

    #[test]
    fn psi_override_recenters_the_matrix() {
        let fixture = two_subject_fixture();
        let k_grid = [1usize, 2usize];
        let psi = array![0.4, 0.2];
        let mut shifted_inputs = inputs(&fixture, &k_grid);
        shifted_inputs.psi_override = Some(psi.view());
        let base = compute_eic(&inputs(&fixture, &k_grid)).unwrap();
        let shifted = compute_eic(&shifted_inputs).unwrap();
        assert_abs_diff_eq!(
            shifted.values[[1, 0]] - base.values[[1, 0]],
            0.5 - 0.4,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(shifted.psi[1], 0.2, epsilon = 1e-12);
    }
}
