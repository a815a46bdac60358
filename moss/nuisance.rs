use crate::data::{DataError, SurvivalData};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Propensity estimates are clipped into `[FLOOR, 1 - FLOOR]` at fit time to
/// bound the inverse-probability weights downstream.
pub const PROPENSITY_FLOOR: f64 = 1e-2;

/// Treatment arm whose survival curve is targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arm {
    Control,
    Treated,
}

impl Arm {
    /// Whether the observed treatment matches this arm.
    #[inline]
    pub fn matches(self, treatment: u8) -> bool {
        match self {
            Arm::Treated => treatment == 1,
            Arm::Control => treatment == 0,
        }
    }

    /// Probability of receiving this arm given `g1 = P(A=1 | W)`.
    #[inline]
    pub fn propensity(self, g1: f64) -> f64 {
        match self {
            Arm::Treated => g1,
            Arm::Control => 1.0 - g1,
        }
    }
}

/// Conditional hazard fits for one arm, subjects by grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmNuisance {
    pub failure_hazard: Array2<f64>,
    pub censor_hazard: Array2<f64>,
}

/// The four inputs targeting needs: failure and censoring hazards for both
/// arms plus the propensity score `P(A=1 | W)` per subject.
///
/// The update engine exclusively owns and rewrites the target arm's failure
/// hazard; everything else is read-only throughout targeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NuisanceBundle {
    pub treated: ArmNuisance,
    pub control: ArmNuisance,
    pub propensity: Array1<f64>,
}

impl NuisanceBundle {
    pub fn arm(&self, arm: Arm) -> &ArmNuisance {
        match arm {
            Arm::Treated => &self.treated,
            Arm::Control => &self.control,
        }
    }

    pub fn arm_mut(&mut self, arm: Arm) -> &mut ArmNuisance {
        match arm {
            Arm::Treated => &mut self.treated,
            Arm::Control => &mut self.control,
        }
    }

    /// Checks every component against the subject set and grid of `data`.
    pub fn validate(&self, data: &SurvivalData) -> Result<(), DataError> {
        let n = data.n_subjects();
        let t_max = data.t_max();
        check_matrix("treated.failure_hazard", &self.treated.failure_hazard, n, t_max)?;
        check_matrix("treated.censor_hazard", &self.treated.censor_hazard, n, t_max)?;
        check_matrix("control.failure_hazard", &self.control.failure_hazard, n, t_max)?;
        check_matrix("control.censor_hazard", &self.control.censor_hazard, n, t_max)?;
        if self.propensity.len() != n {
            return Err(DataError::LengthMismatch {
                name: "propensity",
                expected: n,
                found: self.propensity.len(),
            });
        }
        for (subject, &value) in self.propensity.iter().enumerate() {
            if !value.is_finite() || value <= 0.0 || value >= 1.0 {
                return Err(DataError::DegeneratePropensity { subject, value });
            }
        }
        Ok(())
    }
}

fn check_matrix(
    name: &'static str,
    matrix: &Array2<f64>,
    rows: usize,
    cols: usize,
) -> Result<(), DataError> {
    if matrix.dim() != (rows, cols) {
        return Err(DataError::NuisanceShapeMismatch {
            name,
            rows,
            cols,
            found_rows: matrix.nrows(),
            found_cols: matrix.ncols(),
        });
    }
    for &value in matrix.iter() {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(DataError::NuisanceHazardOutOfRange { name, value });
        }
    }
    Ok(())
}

/// Boundary to the external machine-learning fit. The core never learns which
/// model family produced the hazards; it only consumes the bundle.
pub trait NuisanceEstimator {
    fn fit(&self, data: &SurvivalData) -> Result<NuisanceBundle, DataError>;
}

/// Fits the initial nuisance bundle and validates it against the data before
/// anything downstream touches it.
pub fn fit_initial<E: NuisanceEstimator>(
    estimator: &E,
    data: &SurvivalData,
) -> Result<NuisanceBundle, DataError> {
    let bundle = estimator.fit(data)?;
    bundle.validate(data)?;
    Ok(bundle)
}

/// Constant-hazard reference fit. Useful as a deliberately misspecified
/// initial estimate when exercising the targeting step.
#[derive(Debug, Clone, Copy)]
pub struct ConstantNuisance {
    pub failure_hazard: f64,
    pub censor_hazard: f64,
    pub propensity: f64,
}

impl NuisanceEstimator for ConstantNuisance {
    fn fit(&self, data: &SurvivalData) -> Result<NuisanceBundle, DataError> {
        let n = data.n_subjects();
        let t_max = data.t_max();
        let arm = ArmNuisance {
            failure_hazard: Array2::from_elem((n, t_max), self.failure_hazard),
            censor_hazard: Array2::from_elem((n, t_max), self.censor_hazard),
        };
        let propensity = clip_propensity(self.propensity);
        Ok(NuisanceBundle {
            treated: arm.clone(),
            control: arm,
            propensity: Array1::from_elem(n, propensity),
        })
    }
}

/// Arm-stratified empirical discrete hazards from event and at-risk counts,
/// with the empirical treatment frequency as propensity. Covariate-free, so
/// every subject shares the arm's marginal fit.
#[derive(Debug, Clone, Copy)]
pub struct PooledEmpirical;

impl PooledEmpirical {
    fn arm_hazards(&self, data: &SurvivalData, arm: Arm) -> (Array1<f64>, Array1<f64>) {
        let t_max = data.t_max();
        let mut failure = Array1::<f64>::zeros(t_max);
        let mut censor = Array1::<f64>::zeros(t_max);
        for j in 0..t_max {
            let t = j + 1;
            let mut at_risk = 0usize;
            let mut failures = 0usize;
            let mut censored = 0usize;
            for i in 0..data.n_subjects() {
                if !arm.matches(data.treatment()[i]) {
                    continue;
                }
                let time = data.time()[i];
                if time >= t {
                    at_risk += 1;
                }
                if time == t {
                    if data.event()[i] == 1 {
                        failures += 1;
                    } else {
                        censored += 1;
                    }
                }
            }
            if at_risk > 0 {
                failure[j] = failures as f64 / at_risk as f64;
                censor[j] = censored as f64 / at_risk as f64;
            }
        }
        (failure, censor)
    }
}

impl NuisanceEstimator for PooledEmpirical {
    fn fit(&self, data: &SurvivalData) -> Result<NuisanceBundle, DataError> {
        let n = data.n_subjects();
        let t_max = data.t_max();
        let broadcast = |failure: Array1<f64>, censor: Array1<f64>| {
            let mut failure_matrix = Array2::<f64>::zeros((n, t_max));
            let mut censor_matrix = Array2::<f64>::zeros((n, t_max));
            for i in 0..n {
                failure_matrix.row_mut(i).assign(&failure);
                censor_matrix.row_mut(i).assign(&censor);
            }
            ArmNuisance {
                failure_hazard: failure_matrix,
                censor_hazard: censor_matrix,
            }
        };
        let (treated_failure, treated_censor) = self.arm_hazards(data, Arm::Treated);
        let (control_failure, control_censor) = self.arm_hazards(data, Arm::Control);
        let treated = broadcast(treated_failure, treated_censor);
        let control = broadcast(control_failure, control_censor);
        let share_treated =
            data.treatment().iter().filter(|&&a| a == 1).count() as f64 / n as f64;
        let propensity = clip_propensity(share_treated);
        Ok(NuisanceBundle {
            treated,
            control,
            propensity: Array1::from_elem(n, propensity),
        })
    }
}

fn clip_propensity(value: f64) -> f64 {
    value.clamp(PROPENSITY_FLOOR, 1.0 - PROPENSITY_FLOOR)
}
