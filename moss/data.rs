use ndarray::{Array1, Array2};
use thiserror::Error;

/// Errors surfaced while validating observed data or nuisance inputs.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("at least one subject is required")]
    Empty,
    #[error("t_max must be positive")]
    EmptyGrid,
    #[error("array '{name}' has {found} entries but {expected} subjects were given")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("treatment indicators must be 0 or 1 (subject {subject} has {value})")]
    InvalidTreatment { subject: usize, value: u8 },
    #[error("event indicators must be 0 or 1 (subject {subject} has {value})")]
    InvalidEvent { subject: usize, value: u8 },
    #[error("observed time {time} for subject {subject} is outside the grid 1..={t_max}")]
    TimeOutsideGrid {
        subject: usize,
        time: usize,
        t_max: usize,
    },
    #[error("nuisance matrix '{name}' has shape {found_rows}x{found_cols}, expected {rows}x{cols}")]
    NuisanceShapeMismatch {
        name: &'static str,
        rows: usize,
        cols: usize,
        found_rows: usize,
        found_cols: usize,
    },
    #[error("nuisance hazard '{name}' contains {value}, outside [0, 1]")]
    NuisanceHazardOutOfRange { name: &'static str, value: f64 },
    #[error("propensity {value} for subject {subject} is outside (0, 1)")]
    DegeneratePropensity { subject: usize, value: f64 },
}

/// Right-censored discrete-time observations on the grid `1..=t_max`.
///
/// `time` is the last observed time `T~`; `event` is 1 when the failure was
/// observed at `time` and 0 when the subject was censored there. Covariates
/// never enter the targeting core; they belong to the external nuisance
/// estimator.
#[derive(Debug, Clone)]
pub struct SurvivalData {
    treatment: Array1<u8>,
    time: Array1<usize>,
    event: Array1<u8>,
    t_max: usize,
    at_risk: Array2<f64>,
    increments: Array2<f64>,
}

impl SurvivalData {
    /// Validates shapes and ranges up front; no computation runs on
    /// malformed inputs.
    pub fn new(
        treatment: Array1<u8>,
        time: Array1<usize>,
        event: Array1<u8>,
        t_max: usize,
    ) -> Result<Self, DataError> {
        let n = treatment.len();
        if n == 0 {
            return Err(DataError::Empty);
        }
        if t_max == 0 {
            return Err(DataError::EmptyGrid);
        }
        if time.len() != n {
            return Err(DataError::LengthMismatch {
                name: "time",
                expected: n,
                found: time.len(),
            });
        }
        if event.len() != n {
            return Err(DataError::LengthMismatch {
                name: "event",
                expected: n,
                found: event.len(),
            });
        }
        for (subject, &value) in treatment.iter().enumerate() {
            if value > 1 {
                return Err(DataError::InvalidTreatment { subject, value });
            }
        }
        for (subject, &value) in event.iter().enumerate() {
            if value > 1 {
                return Err(DataError::InvalidEvent { subject, value });
            }
        }
        for (subject, &value) in time.iter().enumerate() {
            if value == 0 || value > t_max {
                return Err(DataError::TimeOutsideGrid {
                    subject,
                    time: value,
                    t_max,
                });
            }
        }
        // Both risk-set matrices depend only on the observed data, so they
        // are built once here rather than on every influence-curve pass.
        let mut at_risk = Array2::<f64>::zeros((n, t_max));
        let mut increments = Array2::<f64>::zeros((n, t_max));
        for i in 0..n {
            for j in 0..time[i] {
                at_risk[[i, j]] = 1.0;
            }
            if event[i] == 1 {
                increments[[i, time[i] - 1]] = 1.0;
            }
        }
        Ok(Self {
            treatment,
            time,
            event,
            t_max,
            at_risk,
            increments,
        })
    }

    pub fn n_subjects(&self) -> usize {
        self.treatment.len()
    }

    pub fn t_max(&self) -> usize {
        self.t_max
    }

    pub fn treatment(&self) -> &Array1<u8> {
        &self.treatment
    }

    pub fn time(&self) -> &Array1<usize> {
        &self.time
    }

    pub fn event(&self) -> &Array1<u8> {
        &self.event
    }

    /// At-risk indicator matrix `1{T~_i >= t}`, subjects by grid.
    pub fn at_risk_matrix(&self) -> &Array2<f64> {
        &self.at_risk
    }

    /// Counting-process increments `dN_i(t) = 1{T~_i = t, Delta_i = 1}`.
    pub fn event_increment_matrix(&self) -> &Array2<f64> {
        &self.increments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy() -> SurvivalData {
        SurvivalData::new(array![1, 1, 0, 0], array![2, 5, 3, 5], array![1, 0, 1, 0], 5).unwrap()
    }

    #[test]
    fn shape_mismatch_fails_fast() {
        let err = SurvivalData::new(array![1, 0], array![1], array![1, 0], 3).unwrap_err();
        assert!(matches!(
            err,
            DataError::LengthMismatch {
                name: "time",
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn grid_must_cover_observed_times() {
        let err = SurvivalData::new(array![1, 0], array![2, 6], array![1, 0], 5).unwrap_err();
        assert!(matches!(
            err,
            DataError::TimeOutsideGrid {
                subject: 1,
                time: 6,
                t_max: 5
            }
        ));
    }

    #[test]
    fn indicator_flags_are_checked() {
        assert!(matches!(
            SurvivalData::new(array![2, 0], array![1, 1], array![0, 0], 2).unwrap_err(),
            DataError::InvalidTreatment { subject: 0, .. }
        ));
        assert!(matches!(
            SurvivalData::new(array![1, 0], array![1, 1], array![0, 3], 2).unwrap_err(),
            DataError::InvalidEvent { subject: 1, .. }
        ));
    }

    #[test]
    fn at_risk_matrix_tracks_follow_up() {
        let data = toy();
        let at_risk = data.at_risk_matrix();
        // Subject 0 leaves after t=2.
        assert_eq!(at_risk.row(0).to_vec(), vec![1.0, 1.0, 0.0, 0.0, 0.0]);
        // Subject 1 is at risk through the whole grid.
        assert_eq!(at_risk.row(1).to_vec(), vec![1.0; 5]);
    }

    #[test]
    fn risk_matrices_are_built_once() {
        let data = toy();
        assert!(std::ptr::eq(data.at_risk_matrix(), data.at_risk_matrix()));
        assert!(std::ptr::eq(
            data.event_increment_matrix(),
            data.event_increment_matrix()
        ));
    }

    #[test]
    fn event_increments_mark_observed_failures_only() {
        let data = toy();
        let increments = data.event_increment_matrix();
        assert_eq!(increments.row(0).to_vec(), vec![0.0, 1.0, 0.0, 0.0, 0.0]);
        // Subject 1 is censored: no increment anywhere.
        assert_eq!(increments.row(1).sum(), 0.0);
        assert_eq!(increments.row(2).to_vec(), vec![0.0, 0.0, 1.0, 0.0, 0.0]);
    }
}
