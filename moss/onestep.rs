use crate::curves::{CurveError, hazard_to_left_survival, hazard_to_survival};
use crate::data::{DataError, SurvivalData};
use crate::eic::{EicError, EicInputs, EicMatrix, clever_covariate, compute_eic};
use crate::nuisance::{Arm, NuisanceBundle};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of epsilon candidates evaluated by the L2 line search, each half
/// the previous one.
const LINE_SEARCH_LADDER: usize = 5;

#[derive(Debug, Error)]
pub enum TargetingError {
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Eic(#[from] EicError),
    #[error(transparent)]
    Band(#[from] crate::band::BandError),
    #[error("epsilon must be positive and finite, got {0}")]
    InvalidEpsilon(f64),
    #[error("at least one iteration is required")]
    NoIterations,
}

/// Norm applied to the mean-EIC vector, both for the stopping rule and for
/// reporting the per-iteration trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormMethod {
    /// Summed absolute value.
    L1,
    /// Euclidean norm; also enables the epsilon line search.
    L2,
}

impl NormMethod {
    pub fn norm(self, values: ArrayView1<'_, f64>) -> f64 {
        match self {
            NormMethod::L1 => values.iter().map(|v| v.abs()).sum(),
            NormMethod::L2 => values.iter().map(|v| v * v).sum::<f64>().sqrt(),
        }
    }
}

/// Tuning knobs for the iterative fluctuation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TmleOptions {
    /// Base fluctuation step size.
    pub epsilon: f64,
    pub max_iterations: usize,
    pub method: NormMethod,
    /// Stopping threshold on the mean-EIC norm; defaults to `epsilon`.
    pub tolerance: Option<f64>,
    /// Iterations without improvement tolerated before the oscillation guard
    /// stops the run.
    pub patience: usize,
    /// Bound on step halvings when an update would leave the simplex.
    pub max_step_halvings: usize,
}

impl Default for TmleOptions {
    fn default() -> Self {
        Self {
            epsilon: 1e-3,
            max_iterations: 100,
            method: NormMethod::L2,
            tolerance: None,
            patience: 5,
            max_step_halvings: 10,
        }
    }
}

/// Non-fatal convergence diagnostics, returned alongside the best available
/// estimate rather than as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceWarning {
    /// The iteration cap was reached before the norm met the tolerance.
    IterationCapReached,
    /// The norm stopped improving for a full patience window; the usual
    /// symptom of an oversized epsilon.
    Oscillation,
}

/// Targeted survival-curve estimate for one arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetedEstimate {
    pub arm: Arm,
    pub k_grid: Vec<usize>,
    /// Marginal survival `psi(t0)` over the target grid.
    pub survival: Array1<f64>,
    /// Conditional survival per subject over the full grid, implied by the
    /// targeted hazard.
    pub conditional_survival: Array2<f64>,
    /// Mean-EIC norm per iteration.
    pub trace: Vec<f64>,
    pub converged: bool,
    pub warning: Option<ConvergenceWarning>,
}

/// The canonical target grid: every time in `1..=t_max`.
pub fn full_grid(t_max: usize) -> Vec<usize> {
    (1..=t_max).collect()
}

struct Engine<'a> {
    data: &'a SurvivalData,
    arm: Arm,
    propensity: Array1<f64>,
    censor_left: Array2<f64>,
    k_grid: &'a [usize],
}

impl Engine<'_> {
    fn inputs<'b>(
        &'b self,
        hazard: &'b Array2<f64>,
        survival: &'b Array2<f64>,
    ) -> EicInputs<'b> {
        EicInputs {
            data: self.data,
            arm: self.arm,
            propensity: self.propensity.view(),
            censor_survival_left: self.censor_left.view(),
            failure_hazard: hazard.view(),
            survival: survival.view(),
            k_grid: self.k_grid,
            psi_override: None,
        }
    }

    fn evaluate(&self, hazard: &Array2<f64>) -> Result<(Array2<f64>, EicMatrix), TargetingError> {
        let survival = hazard_to_survival(hazard.view())?;
        let eic = compute_eic(&self.inputs(hazard, &survival))?;
        Ok((survival, eic))
    }

    /// Bounded search over a halving ladder of epsilon candidates, picking
    /// the one whose post-update mean EIC has the smallest L2 norm.
    ///
    /// Ladder candidates are compared by their effective step after the
    /// simplex halving inside [`apply_fluctuation`]; candidates that collapse
    /// to an already-evaluated effective step are skipped, and the chosen
    /// effective step is returned.
    fn line_search(
        &self,
        hazard: &Array2<f64>,
        covariate: &Array2<f64>,
        options: &TmleOptions,
    ) -> Result<f64, TargetingError> {
        let mut best_step = options.epsilon;
        let mut best_norm = f64::INFINITY;
        let mut step = options.epsilon;
        let mut previous_effective = f64::INFINITY;
        for _ in 0..LINE_SEARCH_LADDER {
            let (candidate, effective) =
                apply_fluctuation(hazard, covariate, step, options.max_step_halvings);
            if effective < previous_effective {
                previous_effective = effective;
                let (_, eic) = self.evaluate(&candidate)?;
                let norm = NormMethod::L2.norm(eic.column_means().view());
                if norm < best_norm {
                    best_norm = norm;
                    best_step = effective;
                }
            }
            step *= 0.5;
        }
        Ok(best_step)
    }
}

/// One fluctuation step `h + epsilon * H * h * (1 - h)`, kept inside the
/// probability simplex.
///
/// If the step leaves `[0, 1]` anywhere, epsilon is halved and the step is
/// retried up to `max_halvings` times; the final attempt is clipped. The
/// bound keeps iterations near the boundary from looping forever. Returns the
/// updated hazard together with the effective step actually taken.
fn apply_fluctuation(
    hazard: &Array2<f64>,
    covariate: &Array2<f64>,
    epsilon: f64,
    max_halvings: usize,
) -> (Array2<f64>, f64) {
    let fluctuate = |step: f64| {
        let mut candidate = hazard.clone();
        for ((i, j), value) in candidate.indexed_iter_mut() {
            let h = hazard[[i, j]];
            *value = h + step * covariate[[i, j]] * h * (1.0 - h);
        }
        candidate
    };
    let within_simplex =
        |candidate: &Array2<f64>| candidate.iter().all(|&v| (0.0..=1.0).contains(&v));

    let mut step = epsilon;
    let mut candidate = fluctuate(step);
    let mut halvings = 0;
    while !within_simplex(&candidate) && halvings < max_halvings {
        step *= 0.5;
        halvings += 1;
        candidate = fluctuate(step);
    }
    if !within_simplex(&candidate) {
        candidate.mapv_inplace(|v| v.clamp(0.0, 1.0));
    }
    (candidate, step)
}

/// Iterative one-step TMLE for the arm-specific survival curve.
///
/// Each round recomputes survival and the EIC, normalizes the mean EIC into
/// a direction, and fluctuates the failure hazard along the aggregated
/// clever covariate until the efficient score equation is approximately
/// solved. The bundle's failure hazard for the target arm is replaced by the
/// targeted fit so downstream influence-curve passes see the updated
/// estimate; censoring and propensity components are never touched.
pub fn target(
    bundle: &mut NuisanceBundle,
    data: &SurvivalData,
    arm: Arm,
    k_grid: &[usize],
    options: &TmleOptions,
) -> Result<TargetedEstimate, TargetingError> {
    bundle.validate(data)?;
    if !options.epsilon.is_finite() || options.epsilon <= 0.0 {
        return Err(TargetingError::InvalidEpsilon(options.epsilon));
    }
    if options.max_iterations == 0 {
        return Err(TargetingError::NoIterations);
    }

    let engine = Engine {
        data,
        arm,
        propensity: bundle.propensity.clone(),
        censor_left: hazard_to_left_survival(bundle.arm(arm).censor_hazard.view())?,
        k_grid,
    };
    let tolerance = options.tolerance.unwrap_or(options.epsilon);
    let mut hazard = bundle.arm(arm).failure_hazard.clone();
    let mut best_hazard = hazard.clone();
    let mut best_norm = f64::INFINITY;
    let mut trace = Vec::with_capacity(options.max_iterations);
    let mut stall = 0usize;
    let mut converged = false;
    let mut warning = None;

    for iteration in 0..options.max_iterations {
        let (survival, eic) = engine.evaluate(&hazard)?;
        let means = eic.column_means();
        let norm = options.method.norm(means.view());
        trace.push(norm);
        debug!("one-step iteration {iteration}: mean-EIC norm {norm:.3e}");

        if norm < best_norm {
            best_norm = norm;
            best_hazard = hazard.clone();
            stall = 0;
        } else {
            stall += 1;
        }
        if norm <= tolerance {
            converged = true;
            break;
        }
        if stall >= options.patience {
            warning = Some(ConvergenceWarning::Oscillation);
            warn!(
                "mean-EIC norm stopped improving after {} iterations; epsilon {} is likely too large",
                trace.len(),
                options.epsilon
            );
            break;
        }

        let l2 = NormMethod::L2.norm(means.view());
        if l2 == 0.0 {
            converged = true;
            break;
        }
        let direction = means.mapv(|v| v / l2);
        let covariate = clever_covariate(&engine.inputs(&hazard, &survival), direction.view())?;
        let step = match options.method {
            NormMethod::L1 => options.epsilon,
            NormMethod::L2 => engine.line_search(&hazard, &covariate, options)?,
        };
        (hazard, _) = apply_fluctuation(&hazard, &covariate, step, options.max_step_halvings);
    }

    if !converged && warning.is_none() {
        warning = Some(ConvergenceWarning::IterationCapReached);
        warn!(
            "iteration cap {} reached with mean-EIC norm {:.3e} above tolerance {:.3e}",
            options.max_iterations, best_norm, tolerance
        );
    }
    if !converged {
        hazard = best_hazard;
    }

    let conditional_survival = hazard_to_survival(hazard.view())?;
    let n = data.n_subjects() as f64;
    let mut survival = Array1::<f64>::zeros(k_grid.len());
    for (k, &t0) in k_grid.iter().enumerate() {
        survival[k] = conditional_survival.column(t0 - 1).sum() / n;
    }
    bundle.arm_mut(arm).failure_hazard = hazard;

    Ok(TargetedEstimate {
        arm,
        k_grid: k_grid.to_vec(),
        survival,
        conditional_survival,
        trace,
        converged,
        warning,
    })
}
