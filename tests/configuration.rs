use std::fs;

use adaptivelearner::configuration::Configuration;
use adaptivelearner::learner::learner::Learner;
use adaptivelearner::manager::manager::IManager;
use adaptivelearner::manager::managererror::ManagerError;

const DOCUMENT: &str = r#"{
    "learner_1d": [
        { "name": "peak", "bounds": [-1.0, 1.0] },
        { "name": "grid", "bounds": [0.0, 10.0], "loss": "Uniform" }
    ],
    "integrator": [
        { "name": "fine", "bounds": [0.0, 1.0], "tol": 1e-10 },
        { "name": "capped", "bounds": [0.0, 1.0], "tol": 1e-6, "max_points": 50 }
    ]
}"#;

#[test]
fn loads_named_settings_from_a_file() {
    let path = std::env::temp_dir().join(format!("adaptivelearner-config-{}.json", std::process::id()));
    fs::write(&path, DOCUMENT).unwrap();

    let configuration = Configuration::new();
    configuration.from_reader(path.to_str().unwrap()).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(configuration.learner_1d_manager().names(), vec!["grid", "peak"]);
    assert_eq!(configuration.integrator_manager().get("capped").unwrap().max_points, 50);
}

#[test]
fn builds_working_learners_by_name() {
    let configuration = Configuration::new();
    configuration.from_json_str(DOCUMENT).unwrap();

    let mut grid = configuration.learner_1d("grid").unwrap();
    let (xs, _) = grid.ask(3).unwrap();
    assert_eq!(xs, vec![0.0, 10.0, 5.0]);

    let mut fine = configuration.integrator("fine").unwrap();
    while !fine.done() {
        let (xs, _) = fine.ask(8).unwrap();
        if xs.is_empty() {
            break;
        }
        for x in xs {
            fine.tell(x, 3.0 * x * x).unwrap();
        }
    }
    assert!((fine.igral() - 1.0).abs() < 1e-10);
}

#[test]
fn unknown_names_and_missing_files_are_errors() {
    let configuration = Configuration::new();
    configuration.from_json_str(DOCUMENT).unwrap();
    assert!(matches!(configuration.integrator("coarse"), Err(ManagerError::NameNotFoundError(_))));
    assert!(matches!(
        configuration.from_reader("/nonexistent/adaptivelearner.json"),
        Err(ManagerError::IOError(_))
    ));
}
