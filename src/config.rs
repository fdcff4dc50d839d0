//! JSON descriptions of a lab (the site side) and of a simulation (the solver side).
//!
//! ```json
//! { "sites": [{
//!     "id": "column",
//!     "bind": "0.0.0.0:8090",
//!     "mode": "stream",
//!     "control_points": [
//!         { "id": "cmd", "dof": 0, "kind": "displacement" },
//!         { "id": "force", "dof": 0, "kind": "force" }
//!     ],
//!     "setup": { "id": "one-actuator", "kind": "one_actuator",
//!                "trial": ["cmd"], "daq": ["force"] },
//!     "backend": { "type": "sim_materials",
//!                  "materials": [{ "type": "elastic", "stiffness": 2.8 }] }
//! }] }
//! ```
use std::{collections::HashSet, fs, path::Path, time::Duration};

use log::info;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    backend::ControlBackendKind,
    control::{ControlPoint, ControlPointRegistry},
    driver::ModelConfig,
    element::GenericClientElement,
    error::{ConfigurationError, Error},
    filter::SignalFilter,
    protocol::{Endpoint, TransportMode},
    setup::{ExperimentalSetup, SetupKind},
    site::{ActorSite, LabServer, LocalSite, RemoteSite},
    tangent::TangentUpdate,
};

fn from_path<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigurationError> {
    let text = fs::read_to_string(path)?;
    let config = serde_json::from_str(&text)?;
    info!("loaded configuration from {}", path.display());
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    pub id: String,
    #[serde(default)]
    pub kind: SetupKind,
    pub trial: Vec<String>,
    pub daq: Vec<String>,
    /// Applied to every command before it reaches the backend.
    #[serde(default)]
    pub filter: Option<SignalFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub id: String,
    /// Listening address, `host:port`.
    pub bind: String,
    #[serde(default)]
    pub mode: TransportMode,
    pub control_points: Vec<ControlPoint>,
    pub setup: SetupConfig,
    pub backend: ControlBackendKind,
}

impl SiteConfig {
    pub fn build_site(&self) -> Result<LocalSite, Error> {
        let registry = ControlPointRegistry::try_from(self.control_points.clone())?;
        let backend = self.backend.build()?;
        let setup = ExperimentalSetup::new(
            self.setup.id.clone(),
            self.setup.kind,
            &registry,
            &self.setup.trial,
            &self.setup.daq,
            backend,
        )?;
        let setup = match self.setup.filter {
            Some(filter) => setup.with_filter(filter)?,
            None => setup,
        };
        LocalSite::new(self.id.clone(), setup)
    }

    pub fn build_actor(&self) -> Result<ActorSite, Error> {
        ActorSite::bind(self.build_site()?, self.bind.as_str(), self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    pub sites: Vec<SiteConfig>,
}

impl LabConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let config: LabConfig = from_path(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.sites.is_empty() {
            return Err(ConfigurationError::Invalid("lab has no sites".to_string()));
        }
        let mut seen = HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.id.as_str()) {
                return Err(ConfigurationError::Invalid(format!(
                    "site '{}' is declared twice",
                    site.id
                )));
            }
        }
        Ok(())
    }

    pub fn build_server(&self) -> Result<LabServer, Error> {
        let actors = self
            .sites
            .iter()
            .map(SiteConfig::build_actor)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LabServer::new(actors))
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementConfig {
    pub id: u32,
    pub nodes: Vec<usize>,
    /// Node-local dofs used at each node.
    pub dofs: Vec<Vec<usize>>,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub mode: TransportMode,
    pub payload_size: usize,
    /// Response deadline of every exchange.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub initial_stiffness: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub tangent: TangentUpdate,
}

impl ElementConfig {
    pub fn dof_count(&self) -> usize {
        self.dofs.iter().map(Vec::len).sum()
    }

    /// Connects to the element's site and builds the element.
    pub fn connect(&self) -> Result<GenericClientElement, Error> {
        let site = RemoteSite::connect(
            &self.endpoint,
            self.mode,
            self.id,
            self.dof_count(),
            self.payload_size,
            Some(Duration::from_millis(self.timeout_ms)),
        )?;
        let element =
            GenericClientElement::new(self.id, self.nodes.clone(), self.dofs.clone(), Box::new(site))?;
        let element = match &self.initial_stiffness {
            Some(stiffness) => element.with_initial_stiffness(stiffness.clone())?,
            None => element,
        };
        Ok(element.with_tangent_update(self.tangent))
    }
}

fn default_max_iterations() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub dt: f64,
    pub steps: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub model: ModelConfig,
    pub elements: Vec<ElementConfig>,
    pub analysis: AnalysisConfig,
}

impl SimulationConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let config: SimulationConfig = from_path(path.as_ref())?;
        if !(config.analysis.dt > 0.0) {
            return Err(ConfigurationError::Invalid(format!(
                "analysis time step must be positive, got {}",
                config.analysis.dt
            )));
        }
        Ok(config)
    }

    pub fn connect_elements(&self) -> Result<Vec<GenericClientElement>, Error> {
        self.elements.iter().map(ElementConfig::connect).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempdir::TempDir;

    use crate::{control::ResponseKind, site::ExperimentalSite};

    use super::*;

    const LAB: &str = r#"{
        "sites": [{
            "id": "column",
            "bind": "127.0.0.1:0",
            "control_points": [
                { "id": "cmd", "dof": 0, "kind": "displacement", "scale": 1.0 },
                { "id": "force", "dof": 0, "kind": "force" }
            ],
            "setup": { "id": "one", "kind": "one_actuator", "trial": ["cmd"], "daq": ["force"] },
            "backend": { "type": "sim_materials",
                         "materials": [{ "type": "elastic", "stiffness": 2.8 }] }
        }]
    }"#;

    fn write(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn lab_config_from_file() {
        let dir = TempDir::new("lab").unwrap();
        let path = write(&dir, "lab.json", LAB);

        let config = LabConfig::from_path(&path).unwrap();
        assert_eq!(config.sites.len(), 1);
        let site = &config.sites[0];
        assert_eq!(site.mode, TransportMode::Stream);
        assert_eq!(site.setup.kind, SetupKind::OneActuator);
        assert_eq!(site.control_points[1].kind(), ResponseKind::Force);

        let site = site.build_site().unwrap();
        assert_eq!(site.layout().trial_size(), 1);
    }

    #[test]
    fn zero_scale_in_file_is_rejected() {
        let dir = TempDir::new("lab").unwrap();
        let path = write(&dir, "lab.json", &LAB.replace("\"scale\": 1.0", "\"scale\": 0.0"));
        assert!(matches!(
            LabConfig::from_path(&path),
            Err(ConfigurationError::Parse(_))
        ));
    }

    #[test]
    fn duplicate_site_ids_are_rejected() {
        let mut config: LabConfig = serde_json::from_str(LAB).unwrap();
        config.sites.push(config.sites[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new("lab").unwrap();
        assert!(matches!(
            LabConfig::from_path(dir.path().join("absent.json")),
            Err(ConfigurationError::Io(_))
        ));
    }

    #[test]
    fn simulation_config_defaults() {
        let dir = TempDir::new("sim").unwrap();
        let path = write(
            &dir,
            "sim.json",
            r#"{
                "model": { "ndf": 1, "mass": [0.0, 0.04], "fixed": [0] },
                "elements": [{
                    "id": 1, "nodes": [1], "dofs": [[0]],
                    "endpoint": { "host": "127.0.0.1", "port": 8090 },
                    "payload_size": 8
                }],
                "analysis": { "dt": 0.02, "steps": 100 }
            }"#,
        );

        let config = SimulationConfig::from_path(&path).unwrap();
        let element = &config.elements[0];
        assert_eq!(element.timeout_ms, 5000);
        assert_eq!(element.mode, TransportMode::Stream);
        assert_eq!(element.dof_count(), 1);
        assert_eq!(config.analysis.max_iterations, 10);
        assert_eq!(config.model.tolerance, 1.0e-12);
        assert_eq!(element.tangent, TangentUpdate::Initial);
    }

    #[test]
    fn tangent_update_and_filter_are_named_in_snake_case() {
        let element: ElementConfig = serde_json::from_str(
            r#"{
                "id": 1, "nodes": [1], "dofs": [[0]],
                "endpoint": { "host": "127.0.0.1", "port": 8090 },
                "payload_size": 8, "tangent": "bfgs"
            }"#,
        )
        .unwrap();
        assert_eq!(element.tangent, TangentUpdate::Bfgs);

        let lab = LAB.replace(
            r#""daq": ["force"] }"#,
            r#""daq": ["force"], "filter": { "type": "undershoot", "error": 0.01 } }"#,
        );
        let config: LabConfig = serde_json::from_str(&lab).unwrap();
        assert_eq!(
            config.sites[0].setup.filter,
            Some(SignalFilter::Undershoot { error: 0.01 })
        );
        config.sites[0].build_site().unwrap();
    }
}
