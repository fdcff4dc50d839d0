//! Secant updates of the tangent a proxy element reports to the solver.
//!
//! A remote element never learns its stiffness from the site, only forces. Starting from
//! the configured initial stiffness, an update folds each committed increment of
//! displacement and measured force back into the matrix.
use log::debug;
use serde::{Deserialize, Serialize};

/// Increments whose squared norm is below this carry no usable slope.
const MIN_DENOMINATOR: f64 = 1.0e-12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TangentUpdate {
    /// Keep the initial stiffness.
    #[default]
    Initial,
    /// Broyden rank-one update, `K += (df - K dd) ddᵀ / (ddᵀ dd)`.
    Broyden,
    /// BFGS rank-two update, `K += df dfᵀ / (dfᵀ dd) - K dd ddᵀ K / (ddᵀ K dd)`.
    Bfgs,
}

impl TangentUpdate {
    /// Folds the increment `(dd, df)` into `stiffness`.
    ///
    /// Returns whether the matrix changed; increments too small to define a slope leave
    /// it untouched.
    pub fn apply(self, stiffness: &mut [Vec<f64>], dd: &[f64], df: &[f64]) -> bool {
        match self {
            Self::Initial => false,
            Self::Broyden => broyden(stiffness, dd, df),
            Self::Bfgs => bfgs(stiffness, dd, df),
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn product(matrix: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    matrix.iter().map(|row| dot(row, v)).collect()
}

fn broyden(stiffness: &mut [Vec<f64>], dd: &[f64], df: &[f64]) -> bool {
    let norm = dot(dd, dd);
    if norm < MIN_DENOMINATOR {
        debug!("skipping Broyden update on a zero displacement increment");
        return false;
    }
    let kd = product(stiffness, dd);
    for (i, row) in stiffness.iter_mut().enumerate() {
        let residual = df[i] - kd[i];
        for (k, d) in row.iter_mut().zip(dd) {
            *k += residual * d / norm;
        }
    }
    true
}

fn bfgs(stiffness: &mut [Vec<f64>], dd: &[f64], df: &[f64]) -> bool {
    let kd = product(stiffness, dd);
    let curvature = dot(df, dd);
    let energy = dot(dd, &kd);
    // a rank-two update needs both denominators, and positive curvature to stay definite
    if curvature < MIN_DENOMINATOR || energy.abs() < MIN_DENOMINATOR {
        debug!("skipping BFGS update (curvature {curvature:e}, energy {energy:e})");
        return false;
    }
    for (i, row) in stiffness.iter_mut().enumerate() {
        for (j, k) in row.iter_mut().enumerate() {
            *k += df[i] * df[j] / curvature - kd[i] * kd[j] / energy;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_never_changes() {
        let mut k = vec![vec![10.0]];
        assert!(!TangentUpdate::Initial.apply(&mut k, &[0.1], &[5.0]));
        assert_eq!(k, vec![vec![10.0]]);
    }

    #[test]
    fn broyden_matches_secant_in_one_dof() {
        let mut k = vec![vec![10.0]];
        assert!(TangentUpdate::Broyden.apply(&mut k, &[0.1], &[2.5]));
        assert!((k[0][0] - 25.0).abs() < 1e-9);
    }

    #[test]
    fn broyden_satisfies_secant_condition() {
        let mut k = vec![vec![4.0, 1.0], vec![1.0, 3.0]];
        let dd = [0.2, -0.1];
        let df = [1.0, 0.5];
        TangentUpdate::Broyden.apply(&mut k, &dd, &df);

        let kd = product(&k, &dd);
        assert!((kd[0] - df[0]).abs() < 1e-9);
        assert!((kd[1] - df[1]).abs() < 1e-9);
    }

    #[test]
    fn bfgs_satisfies_secant_condition_and_symmetry() {
        let mut k = vec![vec![4.0, 1.0], vec![1.0, 3.0]];
        let dd = [0.2, 0.1];
        let df = [1.0, 0.5];
        assert!(TangentUpdate::Bfgs.apply(&mut k, &dd, &df));

        let kd = product(&k, &dd);
        assert!((kd[0] - df[0]).abs() < 1e-9);
        assert!((kd[1] - df[1]).abs() < 1e-9);
        assert!((k[0][1] - k[1][0]).abs() < 1e-12);
    }

    #[test]
    fn zero_increment_is_skipped() {
        let mut k = vec![vec![10.0]];
        assert!(!TangentUpdate::Broyden.apply(&mut k, &[0.0], &[1.0]));
        assert!(!TangentUpdate::Bfgs.apply(&mut k, &[0.0], &[1.0]));
        assert_eq!(k, vec![vec![10.0]]);
    }

    #[test]
    fn bfgs_skips_softening_increment() {
        let mut k = vec![vec![10.0]];
        assert!(!TangentUpdate::Bfgs.apply(&mut k, &[0.1], &[-1.0]));
        assert_eq!(k, vec![vec![10.0]]);
    }
}
