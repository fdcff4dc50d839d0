use log::trace;
use serde::{Deserialize, Serialize};

use crate::element::GenericClientElement;

use super::{CoordinationContext, DriverError, StructuralModel, TrialState};

const GAMMA: f64 = 0.5;
const BETA: f64 = 0.25;
const SAMPLE_TOLERANCE: f64 = 1.0e-9;

/// Uniform excitation: ground accelerations sampled every `dt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundMotion {
    pub dt: f64,
    pub accelerations: Vec<f64>,
    #[serde(default = "unit")]
    pub factor: f64,
    /// Influence vector: share of the ground acceleration felt by each global dof.
    pub direction: Vec<f64>,
}

fn unit() -> f64 {
    1.0
}

impl GroundMotion {
    /// Linearly interpolated acceleration at `time`; zero past the end of the record.
    pub fn at(&self, time: f64) -> f64 {
        if self.accelerations.is_empty() || self.dt <= 0.0 || time < 0.0 {
            return 0.0;
        }
        let mut position = time / self.dt;
        // Accumulated time lands a rounding error away from a sample instant.
        let nearest = position.round();
        if (position - nearest).abs() <= SAMPLE_TOLERANCE * nearest.max(1.0) {
            position = nearest;
        }
        let index = position.floor() as usize;
        if index + 1 >= self.accelerations.len() {
            return if index + 1 == self.accelerations.len() && position.fract() == 0.0 {
                self.factor * self.accelerations[index]
            } else {
                0.0
            };
        }
        let frac = position - index as f64;
        let a = self.accelerations[index];
        let b = self.accelerations[index + 1];
        self.factor * (a + (b - a) * frac)
    }
}

/// Description of a lumped-mass model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Dofs per node.
    pub ndf: usize,
    /// Mass of every global dof (`node * ndf + dof`).
    pub mass: Vec<f64>,
    /// Global dofs held at zero.
    #[serde(default)]
    pub fixed: Vec<usize>,
    /// Mass-proportional Rayleigh damping coefficient.
    #[serde(default)]
    pub alpha_m: f64,
    #[serde(default)]
    pub ground_motion: Option<GroundMotion>,
    /// Energy-increment convergence tolerance.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_tolerance() -> f64 {
    1.0e-12
}

/// Lumped-mass model integrated with Newmark's average-acceleration method.
///
/// Iterations use modified Newton on the initial-stiffness hints of the elements;
/// convergence is tested on the energy increment `|du . r|`.
#[derive(Debug, Clone)]
pub struct LumpedMassModel {
    config: ModelConfig,
    disp: Vec<f64>,
    vel: Vec<f64>,
    accel: Vec<f64>,
    committed_disp: Vec<f64>,
    committed_vel: Vec<f64>,
    committed_accel: Vec<f64>,
}

impl LumpedMassModel {
    pub fn new(config: ModelConfig) -> Result<Self, DriverError> {
        let n = config.mass.len();
        if config.ndf == 0 || n == 0 {
            return Err(DriverError::Model("model needs at least one dof".to_string()));
        }
        if config.fixed.iter().any(|dof| *dof >= n) {
            return Err(DriverError::Model("fixed dof outside the model".to_string()));
        }
        if let Some(motion) = &config.ground_motion {
            if motion.direction.len() != n {
                return Err(DriverError::Model(format!(
                    "ground motion direction has {} entries, model has {n} dofs",
                    motion.direction.len()
                )));
            }
        }

        Ok(Self {
            disp: vec![0.0; n],
            vel: vec![0.0; n],
            accel: vec![0.0; n],
            committed_disp: vec![0.0; n],
            committed_vel: vec![0.0; n],
            committed_accel: vec![0.0; n],
            config,
        })
    }

    pub fn dof_count(&self) -> usize {
        self.config.mass.len()
    }

    pub fn displacement(&self) -> &[f64] {
        &self.committed_disp
    }

    pub fn velocity(&self) -> &[f64] {
        &self.committed_vel
    }

    pub fn acceleration(&self) -> &[f64] {
        &self.committed_accel
    }

    fn external_load(&self, time: f64) -> Vec<f64> {
        match &self.config.ground_motion {
            Some(motion) => {
                let ag = motion.at(time);
                self.config
                    .mass
                    .iter()
                    .zip(&motion.direction)
                    .map(|(m, r)| -m * r * ag)
                    .collect()
            }
            None => vec![0.0; self.dof_count()],
        }
    }

    fn effective_stiffness(&self, dt: f64, elements: &[GenericClientElement]) -> Vec<Vec<f64>> {
        let n = self.dof_count();
        let c1 = GAMMA / (BETA * dt);
        let c2 = 1.0 / (BETA * dt * dt);

        let mut k = vec![vec![0.0; n]; n];
        for (i, m) in self.config.mass.iter().enumerate() {
            k[i][i] = c2 * m + c1 * self.config.alpha_m * m;
        }
        for element in elements {
            let Some(ke) = element.tangent_stiffness() else {
                continue;
            };
            let dofs = element.global_dofs(self.config.ndf);
            for (a, &i) in dofs.iter().enumerate() {
                for (b, &j) in dofs.iter().enumerate() {
                    if i < n && j < n {
                        k[i][j] += ke[a][b];
                    }
                }
            }
        }
        for &dof in &self.config.fixed {
            k[dof].iter_mut().for_each(|v| *v = 0.0);
            for row in k.iter_mut() {
                row[dof] = 0.0;
            }
            k[dof][dof] = 1.0;
        }
        k
    }
}

impl StructuralModel for LumpedMassModel {
    fn begin_step(&mut self, ctx: &CoordinationContext) -> Result<(), DriverError> {
        let dt = ctx.dt;
        if dt <= 0.0 {
            return Err(DriverError::Model(format!("invalid time step {dt}")));
        }
        for i in 0..self.dof_count() {
            let v = self.committed_vel[i];
            let a = self.committed_accel[i];
            self.disp[i] = self.committed_disp[i];
            self.vel[i] = (1.0 - GAMMA / BETA) * v + dt * (1.0 - GAMMA / (2.0 * BETA)) * a;
            self.accel[i] = -v / (BETA * dt) + (1.0 - 1.0 / (2.0 * BETA)) * a;
        }
        Ok(())
    }

    fn trial_state(&self, element: &GenericClientElement) -> TrialState {
        let dofs = element.global_dofs(self.config.ndf);
        let pick = |values: &[f64]| {
            dofs.iter()
                .map(|&d| values.get(d).copied().unwrap_or(0.0))
                .collect()
        };
        TrialState {
            displacement: pick(&self.disp),
            velocity: pick(&self.vel),
            acceleration: pick(&self.accel),
        }
    }

    fn update(
        &mut self,
        ctx: &CoordinationContext,
        elements: &[GenericClientElement],
    ) -> Result<bool, DriverError> {
        let n = self.dof_count();
        let mut residual = self.external_load(ctx.time);
        for i in 0..n {
            let m = self.config.mass[i];
            residual[i] -= m * self.accel[i] + self.config.alpha_m * m * self.vel[i];
        }
        for element in elements {
            let dofs = element.global_dofs(self.config.ndf);
            for (&dof, force) in dofs.iter().zip(element.resisting_force()) {
                if dof < n {
                    residual[dof] -= force;
                }
            }
        }
        for &dof in &self.config.fixed {
            residual[dof] = 0.0;
        }

        let k = self.effective_stiffness(ctx.dt, elements);
        let du = solve(k, residual.clone())?;
        let energy: f64 = du.iter().zip(&residual).map(|(d, r)| d * r).sum::<f64>().abs();
        trace!("{}: energy increment {energy:e}", ctx.sequence);
        if energy <= self.config.tolerance {
            return Ok(true);
        }

        let c1 = GAMMA / (BETA * ctx.dt);
        let c2 = 1.0 / (BETA * ctx.dt * ctx.dt);
        for i in 0..n {
            self.disp[i] += du[i];
            self.vel[i] += c1 * du[i];
            self.accel[i] += c2 * du[i];
        }
        Ok(false)
    }

    fn commit_step(&mut self, _ctx: &CoordinationContext) {
        self.committed_disp.clone_from(&self.disp);
        self.committed_vel.clone_from(&self.vel);
        self.committed_accel.clone_from(&self.accel);
    }

    fn revert_step(&mut self) {
        self.disp.clone_from(&self.committed_disp);
        self.vel.clone_from(&self.committed_vel);
        self.accel.clone_from(&self.committed_accel);
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, DriverError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < f64::EPSILON {
            return Err(DriverError::Model(format!(
                "singular effective stiffness at dof {col}"
            )));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
