//! Coordination protocol for hybrid simulation.
//!
//! A finite-element time integration runs on the solver side while part of the
//! structure lives at one or more experimental sites: a real specimen behind a
//! controller, or a simulated one. For every equilibrium iteration the solver sends each
//! site a trial command and waits for the measured response; only converged steps are
//! committed.
//!
//! The crate is organised leaves first:
//!
//! - [`protocol`]: frames, handshake and the stream/datagram [`Session`](protocol::Session).
//! - [`control`]: scaled, limited control points and their registry.
//! - [`backend`]: the hardware (or simulation) a site finally drives.
//! - [`filter`]: error simulation on the commands a setup sends.
//! - [`setup`]: conversion between generic vectors and backend channels.
//! - [`site`]: local sites, the network actor, its remote proxy and the lab server.
//! - [`element`]: the solver-side proxy element, with [`tangent`] updates.
//! - [`driver`]: step / iterate / commit orchestration.
pub mod backend;
pub mod config;
pub mod control;
pub mod driver;
pub mod echo;
pub mod element;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod setup;
pub mod site;
pub mod tangent;

pub use error::Error;
