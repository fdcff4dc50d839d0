use log::{debug, info, warn};

use crate::{
    backend::Capabilities,
    error::{Error, ProtocolError, ensure_finite},
    protocol::{ResponseVector, Sequence, TrialVector},
    setup::ExperimentalSetup,
};

use super::{ExperimentalSite, RevertOutcome, SiteLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    Idle,
    TrialSent,
    AwaitResponse,
    Committed,
    Closed,
}

/// Site running its setup in process.
#[derive(Debug)]
pub struct LocalSite {
    id: String,
    setup: ExperimentalSetup,
    layout: SiteLayout,
    capabilities: Capabilities,
    state: SiteState,
    /// Last trial imposed on the backend and answered.
    last_trial: Option<TrialVector>,
    pending: Option<ResponseVector>,
    last_response: ResponseVector,
    committed: Option<Sequence>,
    committed_response: ResponseVector,
}

impl LocalSite {
    /// Initializes `setup` and wraps it; the initial backend reading becomes the
    /// committed response.
    pub fn new(id: impl Into<String>, mut setup: ExperimentalSetup) -> Result<Self, Error> {
        let id = id.into();
        let capabilities = setup.capabilities()?;
        let initial = setup.initialize()?;
        info!(
            "site '{id}' ready on setup '{}' ({} trial, {} daq)",
            setup.id(),
            setup.trial_size(),
            setup.daq_size()
        );

        Ok(Self {
            id,
            layout: setup.layout(),
            setup,
            capabilities,
            state: SiteState::Idle,
            last_trial: None,
            pending: None,
            last_response: initial.clone(),
            committed: None,
            committed_response: initial,
        })
    }

    pub fn state(&self) -> SiteState {
        self.state
    }

    pub fn setup(&self) -> &ExperimentalSetup {
        &self.setup
    }

    pub fn last_committed(&self) -> Option<Sequence> {
        self.committed
    }

    pub fn last_response(&self) -> &ResponseVector {
        &self.last_response
    }

    /// Response for `sequence` without driving the backend: the pending one if any,
    /// otherwise the cached response when it answers `sequence`.
    pub fn response_for(&mut self, sequence: Sequence) -> Result<ResponseVector, Error> {
        if self.pending.is_some() {
            return self.get_daq_response();
        }
        if self.last_trial.is_some() && self.last_response.sequence == sequence {
            return Ok(self.last_response.clone());
        }
        Err(ProtocolError::NoPendingTrial.into())
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        match self.state {
            SiteState::Closed => Err(ProtocolError::Closed),
            _ => Ok(()),
        }
    }

    fn check_order(&self, sequence: Sequence) -> Result<(), ProtocolError> {
        if let Some(last) = &self.last_trial {
            if sequence <= last.sequence {
                return Err(ProtocolError::OutOfOrder {
                    expected: last.sequence.next_iteration(),
                    received: sequence,
                });
            }
        }
        if let Some(committed) = self.committed {
            if sequence.step <= committed.step {
                return Err(ProtocolError::OutOfOrder {
                    expected: committed.next_step(),
                    received: sequence,
                });
            }
        }
        Ok(())
    }

    fn drive(&mut self, trial: &TrialVector) -> Result<ResponseVector, Error> {
        self.state = SiteState::TrialSent;
        let res = self
            .setup
            .set_trial(trial)
            .and_then(|_| self.setup.get_daq_response(trial.sequence));
        match res {
            Ok(response) => {
                ensure_finite("response", &response.values)?;
                Ok(response)
            }
            Err(e) => {
                warn!("site '{}' failed to drive {}: {e}", self.id, trial.sequence);
                self.state = SiteState::Closed;
                Err(e)
            }
        }
    }
}

impl ExperimentalSite for LocalSite {
    fn id(&self) -> &str {
        &self.id
    }

    fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn set_trial(&mut self, trial: &TrialVector) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(pending) = &self.pending {
            return Err(ProtocolError::TrialOutstanding {
                pending: pending.sequence,
            }
            .into());
        }

        let duplicate = self
            .last_trial
            .as_ref()
            .is_some_and(|last| last.sequence == trial.sequence);
        if duplicate {
            let same = self
                .last_trial
                .as_ref()
                .is_some_and(|last| last.values == trial.values);
            if !same {
                return Err(ProtocolError::ConflictingDuplicate {
                    sequence: trial.sequence,
                }
                .into());
            }

            if self.capabilities.physical {
                debug!(
                    "site '{}' replays response for retransmitted {}",
                    self.id, trial.sequence
                );
            } else {
                debug!(
                    "site '{}' re-drives retransmitted {}",
                    self.id, trial.sequence
                );
                self.last_response = self.drive(trial)?;
            }
            self.pending = Some(self.last_response.clone());
            self.state = SiteState::AwaitResponse;
            return Ok(());
        }

        if trial.len() != self.layout.trial_size() {
            return Err(ProtocolError::SizeMismatch {
                expected: self.layout.trial_size(),
                received: trial.len(),
            }
            .into());
        }
        ensure_finite("trial", &trial.values)?;
        self.check_order(trial.sequence)?;

        let response = self.drive(trial)?;
        self.last_trial = Some(trial.clone());
        self.last_response = response.clone();
        self.pending = Some(response);
        self.state = SiteState::AwaitResponse;
        Ok(())
    }

    fn get_daq_response(&mut self) -> Result<ResponseVector, Error> {
        self.ensure_open()?;
        let response = self.pending.take().ok_or(ProtocolError::NoPendingTrial)?;
        self.state = SiteState::Idle;
        Ok(response)
    }

    fn commit(&mut self, sequence: Sequence) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(pending) = &self.pending {
            return Err(ProtocolError::TrialOutstanding {
                pending: pending.sequence,
            }
            .into());
        }
        if self.committed == Some(sequence) {
            debug!("site '{}' already committed {sequence}", self.id);
            return Ok(());
        }
        match &self.last_trial {
            Some(last) if last.sequence == sequence => {}
            _ => return Err(ProtocolError::CommitWithoutTrial { received: sequence }.into()),
        }

        if let Err(e) = self.setup.commit() {
            self.state = SiteState::Closed;
            return Err(e.into());
        }
        self.committed = Some(sequence);
        self.committed_response = self.last_response.clone();
        self.state = SiteState::Committed;
        debug!("site '{}' committed {sequence}", self.id);
        Ok(())
    }

    fn revert(&mut self) -> Result<RevertOutcome, Error> {
        self.ensure_open()?;
        self.pending = None;
        self.last_trial = None;
        self.state = match self.committed {
            Some(_) => SiteState::Committed,
            None => SiteState::Idle,
        };

        if self.capabilities.supports_revert && !self.capabilities.physical {
            if let Err(e) = self.setup.revert() {
                self.state = SiteState::Closed;
                return Err(e.into());
            }
            self.last_response = self.committed_response.clone();
            info!("site '{}' reverted to last commit", self.id);
            Ok(RevertOutcome {
                response: self.committed_response.clone(),
                authoritative: true,
            })
        } else {
            warn!(
                "site '{}' cannot revert its backend; reporting last response",
                self.id
            );
            Ok(RevertOutcome {
                response: self.last_response.clone(),
                authoritative: false,
            })
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state == SiteState::Closed {
            return Ok(());
        }
        self.state = SiteState::Closed;
        self.pending = None;
        self.setup.shutdown()?;
        info!("site '{}' closed", self.id);
        Ok(())
    }
}
