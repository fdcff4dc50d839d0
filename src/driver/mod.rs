//! Coordination driver: step, iterate, commit.
//!
//! For every time step the driver asks the [`StructuralModel`] for the trial state of
//! each element, pushes it through the element to its site, and lets the model test
//! convergence on the collected resisting forces. Only a converged step is committed,
//! and only then does time advance.
//!
//! Sequence numbers come from the [`CoordinationContext`] threaded through every call:
//! steps count from 1, iterations restart at 0 with every step.
mod newmark;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{element::GenericClientElement, error::Error, protocol::Sequence};

pub use newmark::{GroundMotion, LumpedMassModel, ModelConfig};

/// Time and position of the exchange currently in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoordinationContext {
    /// Time of the step being solved.
    pub time: f64,
    pub dt: f64,
    pub sequence: Sequence,
}

/// Element trial state in element dof order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialState {
    pub displacement: Vec<f64>,
    pub velocity: Vec<f64>,
    pub acceleration: Vec<f64>,
}

/// The solver side the driver coordinates.
pub trait StructuralModel {
    /// Prepares the first iteration of the step described by `ctx`.
    fn begin_step(&mut self, ctx: &CoordinationContext) -> Result<(), DriverError>;

    fn trial_state(&self, element: &GenericClientElement) -> TrialState;

    /// Assembles the element responses; `true` once the step has converged.
    fn update(
        &mut self,
        ctx: &CoordinationContext,
        elements: &[GenericClientElement],
    ) -> Result<bool, DriverError>;

    fn commit_step(&mut self, ctx: &CoordinationContext);

    /// Drops the trial state of an abandoned step.
    fn revert_step(&mut self) {}
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("element {element_id} failed at {sequence}: {source}")]
    Element {
        element_id: u32,
        sequence: Sequence,
        #[source]
        source: Error,
    },

    #[error("step {step} did not converge within {iterations} iterations")]
    NotConverged { step: u64, iterations: u32 },

    #[error("model failure: {0}")]
    Model(String),
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    pub steps: u64,
    pub time: f64,
    pub stopped: bool,
}

pub struct Driver<M> {
    model: M,
    elements: Vec<GenericClientElement>,
    max_iterations: u32,
    ctx: CoordinationContext,
    stop: Arc<AtomicBool>,
}

impl<M: StructuralModel> Driver<M> {
    pub fn new(model: M, elements: Vec<GenericClientElement>, dt: f64, max_iterations: u32) -> Self {
        Self {
            model,
            elements,
            max_iterations: max_iterations.max(1),
            ctx: CoordinationContext {
                time: 0.0,
                dt,
                sequence: Sequence::default(),
            },
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends [`Driver::run`] before the next step when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn context(&self) -> &CoordinationContext {
        &self.ctx
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn elements(&self) -> &[GenericClientElement] {
        &self.elements
    }

    /// Solves and commits one step.
    pub fn step(&mut self) -> Result<u32, DriverError> {
        let mut ctx = CoordinationContext {
            time: self.ctx.time + self.ctx.dt,
            dt: self.ctx.dt,
            sequence: self.ctx.sequence.next_step(),
        };
        self.model.begin_step(&ctx)?;

        for iteration in 0..self.max_iterations {
            ctx.sequence.iteration = iteration;
            for element in &mut self.elements {
                let state = self.model.trial_state(element);
                element
                    .set_trial_state(
                        &ctx,
                        &state.displacement,
                        &state.velocity,
                        &state.acceleration,
                    )
                    .map_err(|source| DriverError::Element {
                        element_id: element.id(),
                        sequence: ctx.sequence,
                        source,
                    })?;
            }

            if self.model.update(&ctx, &self.elements)? {
                for element in &mut self.elements {
                    element
                        .commit_state(&ctx)
                        .map_err(|source| DriverError::Element {
                            element_id: element.id(),
                            sequence: ctx.sequence,
                            source,
                        })?;
                }
                self.model.commit_step(&ctx);
                self.ctx = ctx;
                debug!(
                    "step {} converged after {} iterations (t = {})",
                    ctx.sequence.step,
                    iteration + 1,
                    ctx.time
                );
                return Ok(iteration + 1);
            }
        }

        for element in &mut self.elements {
            if let Err(e) = element.revert_to_last_commit() {
                warn!("element {} failed to revert: {e}", element.id());
            }
        }
        self.model.revert_step();
        Err(DriverError::NotConverged {
            step: ctx.sequence.step,
            iterations: self.max_iterations,
        })
    }

    /// Runs up to `steps` steps, then closes every element.
    pub fn run(&mut self, steps: u64) -> Result<RunReport, DriverError> {
        info!(
            "running {steps} steps of {} s with {} elements",
            self.ctx.dt,
            self.elements.len()
        );
        let mut completed = 0;
        let mut stopped = false;
        let mut res = Ok(());

        while completed < steps {
            if self.stop.load(Ordering::SeqCst) {
                info!("stop requested after {completed} steps");
                stopped = true;
                break;
            }
            if let Err(e) = self.step() {
                res = Err(e);
                break;
            }
            completed += 1;
        }
        self.shutdown();

        res.map(|_| RunReport {
            steps: completed,
            time: self.ctx.time,
            stopped,
        })
    }

    /// Closes every element session; committed results stay valid.
    pub fn shutdown(&mut self) {
        for element in &mut self.elements {
            if let Err(e) = element.close() {
                warn!("element {} failed to close: {e}", element.id());
            }
        }
    }
}
