//! Experimental sites: the responders of the trial/response exchange.
//!
//! Every site follows the same per-session state machine:
//!
//! ```text
//!            set_trial              response delivered
//!   Idle ──────────────► TrialSent ─► AwaitResponse ──────────► Idle
//!    ▲                                                           │ commit
//!    └──────────────────────── set_trial ◄──── Committed ◄───────┘
//!
//!   any state ── stop / close ──► Closed
//! ```
//!
//! A second trial is refused while a response is outstanding, and a commit must name
//! the sequence of the last answered trial.
//!
//! - [`LocalSite`] owns an [`ExperimentalSetup`](crate::setup::ExperimentalSetup) in
//!   process.
//! - [`ActorSite`] serves a [`LocalSite`] to one remote session.
//! - [`RemoteSite`] is the solver-side proxy of an actor.
//! - [`LabServer`] runs several actors concurrently.
mod actor;
mod local;
mod remote;
mod server;

use bincode::{Decode, Encode};

use crate::{
    backend::Capabilities,
    control::ResponseKind,
    error::Error,
    protocol::{ResponseVector, Sequence, TrialVector},
};

pub use actor::{ActorSite, Listener, SessionReport};
pub use local::{LocalSite, SiteState};
pub use remote::RemoteSite;
pub use server::{LabServer, SiteOutcome};

/// One entry of a trial or daq vector: which dof, which quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Slot {
    pub dof: u32,
    pub kind: ResponseKind,
}

impl Slot {
    pub fn new(dof: usize, kind: ResponseKind) -> Self {
        Self {
            dof: dof as u32,
            kind,
        }
    }

    pub fn dof_index(&self) -> usize {
        self.dof as usize
    }
}

/// Ordered trial and daq slots of a site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct SiteLayout {
    pub trial: Vec<Slot>,
    pub daq: Vec<Slot>,
}

impl SiteLayout {
    pub fn trial_size(&self) -> usize {
        self.trial.len()
    }

    pub fn daq_size(&self) -> usize {
        self.daq.len()
    }

    /// Highest dof referenced by either vector.
    pub fn max_dof(&self) -> Option<usize> {
        self.trial
            .iter()
            .chain(&self.daq)
            .map(Slot::dof_index)
            .max()
    }
}

/// Result of a revert request.
#[derive(Debug, Clone, PartialEq)]
pub struct RevertOutcome {
    pub response: ResponseVector,
    /// `false` when the site could not return the backend to its committed state and
    /// `response` is only the last known measurement.
    pub authoritative: bool,
}

/// Common surface of local and remote sites.
pub trait ExperimentalSite {
    fn id(&self) -> &str;

    fn layout(&self) -> &SiteLayout;

    fn capabilities(&self) -> Capabilities;

    fn set_trial(&mut self, trial: &TrialVector) -> Result<(), Error>;

    fn get_daq_response(&mut self) -> Result<ResponseVector, Error>;

    fn commit(&mut self, sequence: Sequence) -> Result<(), Error>;

    fn revert(&mut self) -> Result<RevertOutcome, Error>;

    fn close(&mut self) -> Result<(), Error>;

    /// One complete round trip: impose `trial`, return its response.
    fn exchange(&mut self, trial: &TrialVector) -> Result<ResponseVector, Error> {
        self.set_trial(trial)?;
        self.get_daq_response()
    }
}
