//! One-step targeted maximum likelihood estimation of treatment-specific
//! survival curves from right-censored discrete-time data.
//!
//! The crate de-biases an externally fitted conditional-hazard estimate by
//! iteratively fluctuating it along the efficient influence curve until the
//! efficient score equation is approximately solved, then builds simultaneous
//! confidence bands from the influence values at the targeted estimate. The
//! machine-learning fit that produces the initial hazards lives behind
//! [`NuisanceEstimator`]; the core never learns which model family produced
//! them.

pub mod band;
pub mod curves;
pub mod data;
pub mod eic;
pub mod nuisance;
pub mod onestep;

pub use band::{BandError, ConfidenceBand, DEFAULT_BAND_DRAWS, confidence_band};
pub use curves::{
    CurveError, hazard_to_left_survival, hazard_to_survival, rebase_hazard, survival_to_hazard,
};
pub use data::{DataError, SurvivalData};
pub use eic::{EicError, EicInputs, EicMatrix, WEIGHT_FLOOR, clever_covariate, compute_eic};
pub use nuisance::{
    Arm, ArmNuisance, ConstantNuisance, NuisanceBundle, NuisanceEstimator, PROPENSITY_FLOOR,
    PooledEmpirical, fit_initial,
};
pub use onestep::{
    ConvergenceWarning, NormMethod, TargetedEstimate, TargetingError, TmleOptions, full_grid,
    target,
};

use rand::Rng;

/// Full estimation pipeline for one arm: initial nuisance fit, iterative
/// targeting, a final influence-curve pass at the targeted estimate, and the
/// simultaneous confidence band.
pub fn survival_curve<E, R>(
    estimator: &E,
    data: &SurvivalData,
    arm: Arm,
    k_grid: &[usize],
    options: &TmleOptions,
    level: f64,
    draws: usize,
    rng: &mut R,
) -> Result<(TargetedEstimate, ConfidenceBand), TargetingError>
where
    E: NuisanceEstimator,
    R: Rng + ?Sized,
{
    let mut bundle = fit_initial(estimator, data)?;
    let estimate = target(&mut bundle, data, arm, k_grid, options)?;

    let censor_left = hazard_to_left_survival(bundle.arm(arm).censor_hazard.view())?;
    let inputs = EicInputs {
        data,
        arm,
        propensity: bundle.propensity.view(),
        censor_survival_left: censor_left.view(),
        failure_hazard: bundle.arm(arm).failure_hazard.view(),
        survival: estimate.conditional_survival.view(),
        k_grid,
        psi_override: Some(estimate.survival.view()),
    };
    let eic = compute_eic(&inputs)?;
    let band = confidence_band(&eic, level, draws, rng)?;
    Ok((estimate, band))
}
