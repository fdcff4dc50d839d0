use std::{net::SocketAddr, sync::mpsc};

use log::{info, warn};

use crate::{error::Error, protocol::ThreadPool};

use super::{ActorSite, SessionReport};

/// Result of one site once its session ended.
#[derive(Debug)]
pub struct SiteOutcome {
    pub site_id: String,
    pub result: Result<SessionReport, Error>,
}

/// Hosts several actor sites, each on its own worker.
///
/// Sites share nothing; one failing does not stop the others.
#[derive(Debug)]
pub struct LabServer {
    actors: Vec<ActorSite>,
    pool: ThreadPool,
}

impl LabServer {
    pub fn new(actors: Vec<ActorSite>) -> Self {
        let pool = ThreadPool::new(actors.len().max(1));
        Self { actors, pool }
    }

    /// Bound address of every site, in configuration order.
    pub fn addresses(&self) -> Vec<(String, SocketAddr)> {
        self.actors
            .iter()
            .filter_map(|actor| match actor.local_addr() {
                Ok(addr) => Some((actor.id().to_string(), addr)),
                Err(e) => {
                    warn!("site '{}' has no local address: {e}", actor.id());
                    None
                }
            })
            .collect()
    }

    /// Serves every site and returns once all sessions have ended.
    pub fn run(self) -> Vec<SiteOutcome> {
        let LabServer { actors, pool } = self;
        info!("lab server running {} sites", actors.len());

        let (sender, receiver) = mpsc::channel();
        for actor in actors {
            let sender = sender.clone();
            pool.execute(move || {
                let site_id = actor.id().to_string();
                let result = actor.run();
                if sender.send(SiteOutcome { site_id, result }).is_err() {
                    warn!("lab server stopped listening for site outcomes");
                }
            });
        }
        drop(sender);

        let outcomes: Vec<SiteOutcome> = receiver.iter().collect();
        for outcome in &outcomes {
            match &outcome.result {
                Ok(report) => info!(
                    "site '{}': {} trials, {} commits",
                    outcome.site_id, report.trials, report.commits
                ),
                Err(e) => warn!("site '{}' failed: {e}", outcome.site_id),
            }
        }
        outcomes
    }
}
