//! Solver-side proxy element.
//!
//! A [`GenericClientElement`] has no constitutive law of its own. Its resisting force is
//! whatever its site measures: the trial state is packed following the site's trial
//! layout, and the `force` slots of the daq layout are unpacked onto the element dofs.
//!
//! The tangent starts at the configured initial stiffness and, depending on the
//! [`TangentUpdate`], follows the committed increments of displacement and force.
use log::debug;

use crate::{
    driver::CoordinationContext,
    control::ResponseKind,
    error::{ConfigurationError, ElementError, Error, ensure_finite},
    protocol::{ResponseVector, TrialVector},
    site::{ExperimentalSite, RevertOutcome, SiteLayout, Slot},
    tangent::TangentUpdate,
};

pub struct GenericClientElement {
    id: u32,
    nodes: Vec<usize>,
    /// Node-local dofs used at each node; element dofs are numbered in this order.
    dof_map: Vec<Vec<usize>>,
    dof_count: usize,
    site: Box<dyn ExperimentalSite + Send>,
    layout: SiteLayout,
    stiffness: Option<Vec<Vec<f64>>>,
    tangent_update: TangentUpdate,
    trial_displacement: Vec<f64>,
    committed_displacement: Vec<f64>,
    committed_force: Vec<f64>,
    resisting_force: Vec<f64>,
    last_response: Option<ResponseVector>,
}

impl std::fmt::Debug for GenericClientElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericClientElement")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("dof_map", &self.dof_map)
            .field("site", &self.site.id())
            .finish_non_exhaustive()
    }
}

impl GenericClientElement {
    pub fn new(
        id: u32,
        nodes: Vec<usize>,
        dof_map: Vec<Vec<usize>>,
        site: Box<dyn ExperimentalSite + Send>,
    ) -> Result<Self, ConfigurationError> {
        if nodes.len() != dof_map.len() {
            return Err(ConfigurationError::SizeMismatch {
                what: "element dof map",
                expected: nodes.len(),
                received: dof_map.len(),
            });
        }
        let dof_count = dof_map.iter().map(Vec::len).sum();
        let layout = site.layout().clone();

        if let Some(slot) = layout
            .trial
            .iter()
            .chain(&layout.daq)
            .find(|slot| slot.dof_index() >= dof_count)
        {
            return Err(ConfigurationError::Invalid(format!(
                "element {id} has {dof_count} dofs, site '{}' uses dof {}",
                site.id(),
                slot.dof
            )));
        }
        if layout.trial.iter().any(|slot| slot.kind == ResponseKind::Force) {
            return Err(ConfigurationError::Invalid(format!(
                "element {id} cannot impose force trials on site '{}'",
                site.id()
            )));
        }

        Ok(Self {
            id,
            nodes,
            dof_map,
            dof_count,
            site,
            layout,
            stiffness: None,
            tangent_update: TangentUpdate::default(),
            trial_displacement: vec![0.0; dof_count],
            committed_displacement: vec![0.0; dof_count],
            committed_force: vec![0.0; dof_count],
            resisting_force: vec![0.0; dof_count],
            last_response: None,
        })
    }

    /// Sets the tangent reported to the solver, a `dof_count` square matrix.
    pub fn with_initial_stiffness(mut self, stiffness: Vec<Vec<f64>>) -> Result<Self, ConfigurationError> {
        let n = self.dof_count;
        if stiffness.len() != n || stiffness.iter().any(|row| row.len() != n) {
            return Err(ConfigurationError::SizeMismatch {
                what: "initial stiffness",
                expected: n * n,
                received: stiffness.iter().map(Vec::len).sum(),
            });
        }
        if stiffness.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ConfigurationError::Invalid(format!(
                "element {} has a non-finite initial stiffness",
                self.id
            )));
        }
        self.stiffness = Some(stiffness);
        Ok(self)
    }

    /// Chooses how commits update the tangent; needs an initial stiffness to act on.
    pub fn with_tangent_update(mut self, update: TangentUpdate) -> Self {
        self.tangent_update = update;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    pub fn dof_count(&self) -> usize {
        self.dof_count
    }

    pub fn site_id(&self) -> &str {
        self.site.id()
    }

    /// Global dof of every element dof, with `ndf` dofs per node.
    pub fn global_dofs(&self, ndf: usize) -> Vec<usize> {
        self.nodes
            .iter()
            .zip(&self.dof_map)
            .flat_map(|(node, dofs)| dofs.iter().map(move |dof| node * ndf + dof))
            .collect()
    }

    pub fn set_trial_state(
        &mut self,
        ctx: &CoordinationContext,
        displacement: &[f64],
        velocity: &[f64],
        acceleration: &[f64],
    ) -> Result<(), Error> {
        for (what, values) in [
            ("displacement", displacement),
            ("velocity", velocity),
            ("acceleration", acceleration),
        ] {
            if values.len() != self.dof_count {
                return Err(ElementError::SizeMismatch {
                    what,
                    expected: self.dof_count,
                    received: values.len(),
                }
                .into());
            }
            ensure_finite(what, values)?;
        }

        let values = self
            .layout
            .trial
            .iter()
            .map(|slot| {
                let source = match slot.kind {
                    ResponseKind::Displacement => displacement,
                    ResponseKind::Velocity => velocity,
                    _ => acceleration,
                };
                source[slot.dof_index()]
            })
            .collect();
        let trial = TrialVector::new(ctx.sequence, values);

        let response = self.site.exchange(&trial)?;
        self.apply_response(response)?;
        self.trial_displacement.copy_from_slice(displacement);
        debug!("element {} answered {}", self.id, ctx.sequence);
        Ok(())
    }

    fn apply_response(&mut self, response: ResponseVector) -> Result<(), ElementError> {
        if response.len() != self.layout.daq_size() {
            return Err(ElementError::SizeMismatch {
                what: "response",
                expected: self.layout.daq_size(),
                received: response.len(),
            });
        }
        ensure_finite("response", &response.values)?;

        self.resisting_force.fill(0.0);
        for (slot, value) in self.layout.daq.iter().zip(&response.values) {
            if slot.kind == ResponseKind::Force {
                self.resisting_force[slot.dof_index()] = *value;
            }
        }
        self.last_response = Some(response);
        Ok(())
    }

    pub fn resisting_force(&self) -> &[f64] {
        &self.resisting_force
    }

    pub fn tangent_stiffness(&self) -> Option<&[Vec<f64>]> {
        self.stiffness.as_deref()
    }

    /// Every measured value of the last response with its slot.
    pub fn measured(&self) -> Vec<(Slot, f64)> {
        match &self.last_response {
            Some(response) => self
                .layout
                .daq
                .iter()
                .copied()
                .zip(response.values.iter().copied())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn commit_state(&mut self, ctx: &CoordinationContext) -> Result<(), Error> {
        self.site.commit(ctx.sequence)?;

        if let Some(stiffness) = &mut self.stiffness {
            let dd: Vec<f64> = self
                .trial_displacement
                .iter()
                .zip(&self.committed_displacement)
                .map(|(trial, committed)| trial - committed)
                .collect();
            let df: Vec<f64> = self
                .resisting_force
                .iter()
                .zip(&self.committed_force)
                .map(|(trial, committed)| trial - committed)
                .collect();
            if self.tangent_update.apply(stiffness, &dd, &df) {
                debug!("element {} updated its tangent at {}", self.id, ctx.sequence);
            }
        }
        self.committed_displacement.copy_from_slice(&self.trial_displacement);
        self.committed_force.copy_from_slice(&self.resisting_force);
        Ok(())
    }

    /// Returns to the last committed response. The outcome tells whether the site could
    /// actually restore its backend.
    pub fn revert_to_last_commit(&mut self) -> Result<RevertOutcome, Error> {
        let outcome = self.site.revert()?;
        self.apply_response(outcome.response.clone())?;
        self.trial_displacement.copy_from_slice(&self.committed_displacement);
        Ok(outcome)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.site.close()
    }
}

impl Drop for GenericClientElement {
    fn drop(&mut self) {
        let _ = self.site.close();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        backend::{MaterialConfig, SimMaterials, shared},
        control::{ControlPoint, ControlPointRegistry},
        protocol::Sequence,
        setup::{ExperimentalSetup, SetupKind},
        site::LocalSite,
    };

    use super::*;

    fn local_site() -> LocalSite {
        let registry: ControlPointRegistry = vec![
            ControlPoint::new("cmd", 0, ResponseKind::Displacement),
            ControlPoint::new("disp", 0, ResponseKind::Displacement),
            ControlPoint::new("force", 0, ResponseKind::Force),
        ]
        .try_into()
        .unwrap();
        let backend = shared(
            SimMaterials::from_configs(&[MaterialConfig::Elastic {
                stiffness: 20.0,
                damping: 0.0,
            }])
            .unwrap(),
        );
        let setup = ExperimentalSetup::new(
            "setup",
            SetupKind::OneActuator,
            &registry,
            &["cmd"],
            &["disp", "force"],
            backend,
        )
        .unwrap();
        LocalSite::new("local", setup).unwrap()
    }

    fn ctx(step: u64, iteration: u32) -> CoordinationContext {
        CoordinationContext {
            time: 0.0,
            dt: 0.01,
            sequence: Sequence::new(step, iteration),
        }
    }

    #[test]
    fn force_slots_become_resisting_force() {
        let mut element =
            GenericClientElement::new(1, vec![1], vec![vec![0]], Box::new(local_site())).unwrap();

        element
            .set_trial_state(&ctx(1, 0), &[0.1], &[0.0], &[0.0])
            .unwrap();
        assert_eq!(element.resisting_force(), &[2.0]);
        assert_eq!(element.measured().len(), 2);
        element.commit_state(&ctx(1, 0)).unwrap();
    }

    #[test]
    fn wrong_vector_size_is_element_error() {
        let mut element =
            GenericClientElement::new(1, vec![1], vec![vec![0]], Box::new(local_site())).unwrap();
        let res = element.set_trial_state(&ctx(1, 0), &[0.1, 0.2], &[0.0], &[0.0]);
        assert!(matches!(
            res,
            Err(Error::Element(ElementError::SizeMismatch { .. }))
        ));
    }

    #[test]
    #[should_panic(expected = "NonFinite")]
    fn nan_displacement_fails_fast() {
        let mut element =
            GenericClientElement::new(1, vec![1], vec![vec![0]], Box::new(local_site())).unwrap();
        element
            .set_trial_state(&ctx(1, 0), &[f64::NAN], &[0.0], &[0.0])
            .unwrap();
    }

    #[test]
    fn layout_beyond_element_dofs_is_rejected() {
        let res = GenericClientElement::new(1, vec![], vec![], Box::new(local_site()));
        assert!(matches!(res, Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn revert_restores_committed_force() {
        let mut element =
            GenericClientElement::new(1, vec![1], vec![vec![0]], Box::new(local_site())).unwrap();
        element
            .set_trial_state(&ctx(1, 0), &[0.1], &[0.0], &[0.0])
            .unwrap();
        element.commit_state(&ctx(1, 0)).unwrap();
        element
            .set_trial_state(&ctx(2, 0), &[0.3], &[0.0], &[0.0])
            .unwrap();

        let outcome = element.revert_to_last_commit().unwrap();
        assert!(outcome.authoritative);
        assert_eq!(element.resisting_force(), &[2.0]);
    }

    #[test]
    fn global_dofs_follow_node_numbering() {
        let element = GenericClientElement::new(
            1,
            vec![1, 2],
            vec![vec![0], vec![0]],
            Box::new(local_site()),
        )
        .unwrap();
        assert_eq!(element.global_dofs(3), vec![3, 6]);
    }

    fn broyden_element() -> GenericClientElement {
        GenericClientElement::new(1, vec![1], vec![vec![0]], Box::new(local_site()))
            .unwrap()
            .with_initial_stiffness(vec![vec![5.0]])
            .unwrap()
            .with_tangent_update(TangentUpdate::Broyden)
    }

    #[test]
    fn broyden_tangent_follows_committed_secant() {
        let mut element = broyden_element();

        element
            .set_trial_state(&ctx(1, 0), &[0.1], &[0.0], &[0.0])
            .unwrap();
        // trials alone leave the tangent alone
        assert_eq!(element.tangent_stiffness(), Some(&[vec![5.0]][..]));
        element.commit_state(&ctx(1, 0)).unwrap();

        let k = element.tangent_stiffness().unwrap()[0][0];
        assert!((k - 20.0).abs() < 1e-9, "tangent {k}");
    }

    #[test]
    fn reverted_trial_does_not_enter_the_tangent() {
        let mut element = broyden_element();

        element
            .set_trial_state(&ctx(1, 0), &[0.4], &[0.0], &[0.0])
            .unwrap();
        element.revert_to_last_commit().unwrap();
        element.commit_state(&ctx(1, 0)).unwrap_err();
        assert_eq!(element.tangent_stiffness(), Some(&[vec![5.0]][..]));

        element
            .set_trial_state(&ctx(1, 1), &[0.2], &[0.0], &[0.0])
            .unwrap();
        element.commit_state(&ctx(1, 1)).unwrap();
        let k = element.tangent_stiffness().unwrap()[0][0];
        assert!((k - 20.0).abs() < 1e-9, "tangent {k}");
    }

    #[test]
    fn stiffness_hint_must_be_square() {
        let element =
            GenericClientElement::new(1, vec![1], vec![vec![0]], Box::new(local_site())).unwrap();
        assert!(element.with_initial_stiffness(vec![vec![1.0, 2.0]]).is_err());
    }
}
