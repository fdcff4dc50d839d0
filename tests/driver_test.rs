use std::thread;

use hybridsim::{
    config::{ElementConfig, LabConfig},
    driver::{Driver, GroundMotion, LumpedMassModel, ModelConfig},
    element::GenericClientElement,
    protocol::{Endpoint, TransportMode},
    tangent::TangentUpdate,
};

const LAB: &str = r#"{
    "sites": [{
        "id": "spring",
        "bind": "127.0.0.1:0",
        "control_points": [
            { "id": "cmd", "dof": 0, "kind": "displacement" },
            { "id": "force", "dof": 0, "kind": "force" }
        ],
        "setup": { "id": "one", "kind": "one_actuator", "trial": ["cmd"], "daq": ["force"] },
        "backend": { "type": "sim_materials",
                     "materials": [{ "type": "elastic", "stiffness": 40.0 }] }
    }]
}"#;

const STIFFNESS: f64 = 40.0;
const STEPS: u64 = 20;

fn model() -> LumpedMassModel {
    LumpedMassModel::new(ModelConfig {
        ndf: 1,
        mass: vec![0.0, 1.0],
        fixed: vec![0],
        alpha_m: 0.0,
        ground_motion: Some(GroundMotion {
            dt: 0.01,
            accelerations: vec![0.0, 1.0, 0.5, -0.5, 0.0],
            factor: 1.0,
            direction: vec![0.0, 1.0],
        }),
        tolerance: 1.0e-12,
    })
    .unwrap()
}

#[test]
fn remote_run_matches_local_run() {
    let lab: LabConfig = serde_json::from_str(LAB).unwrap();
    let server = lab.build_server().unwrap();
    let (_, addr) = server.addresses()[0].clone();
    let handle = thread::spawn(move || server.run());

    let element = ElementConfig {
        id: 1,
        nodes: vec![1],
        dofs: vec![vec![0]],
        endpoint: Endpoint::from(addr),
        mode: TransportMode::Stream,
        payload_size: 8,
        timeout_ms: 2000,
        initial_stiffness: Some(vec![vec![STIFFNESS]]),
        tangent: TangentUpdate::Initial,
    }
    .connect()
    .unwrap();
    let mut remote = Driver::new(model(), vec![element], 0.01, 10);
    let report = remote.run(STEPS).unwrap();
    assert_eq!(report.steps, STEPS);
    assert!(!report.stopped);

    let local_site = lab.sites[0].build_site().unwrap();
    let element = GenericClientElement::new(1, vec![1], vec![vec![0]], Box::new(local_site))
        .unwrap()
        .with_initial_stiffness(vec![vec![STIFFNESS]])
        .unwrap();
    let mut local = Driver::new(model(), vec![element], 0.01, 10);
    local.run(STEPS).unwrap();

    assert_eq!(remote.model().displacement(), local.model().displacement());
    assert_eq!(remote.model().velocity(), local.model().velocity());
    assert!(remote.model().displacement()[1] != 0.0);

    let outcomes = handle.join().unwrap();
    assert_eq!(outcomes.len(), 1);
    let session = outcomes[0].result.as_ref().unwrap();
    assert_eq!(session.commits as u64, STEPS);
    assert!(session.stopped_by_peer);
}

#[test]
fn unreachable_site_fails_to_connect() {
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let res = ElementConfig {
        id: 7,
        nodes: vec![1],
        dofs: vec![vec![0]],
        endpoint: Endpoint::from(addr),
        mode: TransportMode::Stream,
        payload_size: 8,
        timeout_ms: 200,
        initial_stiffness: None,
        tangent: TangentUpdate::Initial,
    }
    .connect();
    assert!(res.is_err());
}
