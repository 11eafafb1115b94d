use std::cell::{
    RefCell,
    RefMut
};
use std::fs::File;
use std::io::BufReader;

use serde::Deserialize;

use crate::learner::integratorlearner::IntegratorLearner;
use crate::learner::learner1d::{
    Learner1D,
    Learner1DSettings
};
use crate::learner::learnererror::LearnerError;
use crate::manager::managererror::ManagerError;
use crate::manager::manager::{
    IManager,
    Manager
};
use crate::manager::namedobject::NamedJsonObject;
use crate::math::quadrature::intervaltree::IntegratorSettings;

#[derive(Deserialize)]
struct ConfigurationJsonProp {
    #[serde(default)]
    learner_1d: Vec<serde_json::Value>,
    #[serde(default)]
    integrator: Vec<serde_json::Value>
}

fn learner_1d_settings_from_json(json_value: serde_json::Value) -> Result<Learner1DSettings, ManagerError> {
    let named: NamedJsonObject = ManagerError::from_json_or_json_parse_error(json_value.clone())?;
    let settings: Learner1DSettings = ManagerError::from_json_or_json_parse_error(json_value)?;
    LearnerError::check_bounds(settings.bounds)
        .map_err(|error| ManagerError::invalid_settings(named.name(), error))?;
    Ok(settings)
}

fn integrator_settings_from_json(json_value: serde_json::Value) -> Result<IntegratorSettings, ManagerError> {
    let named: NamedJsonObject = ManagerError::from_json_or_json_parse_error(json_value.clone())?;
    let settings: IntegratorSettings = ManagerError::from_json_or_json_parse_error(json_value)?;
    settings
        .validate()
        .map_err(|error| ManagerError::invalid_settings(named.name(), error))?;
    Ok(settings)
}

/// Named sampler settings loaded from one JSON document:
///
/// ```json
/// {
///     "learner_1d": [{ "name": "peak", "bounds": [-1.0, 1.0], "loss": "Default" }],
///     "integrator": [{ "name": "fine", "bounds": [0.0, 1.0], "tol": 1e-10 }]
/// }
/// ```
pub struct Configuration {
    learner_1d_manager_cell: RefCell<Manager<Learner1DSettings>>,
    integrator_manager_cell: RefCell<Manager<IntegratorSettings>>
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration {
            learner_1d_manager_cell: RefCell::new(Manager::new(learner_1d_settings_from_json)),
            integrator_manager_cell: RefCell::new(Manager::new(integrator_settings_from_json))
        }
    }

    pub fn learner_1d_manager(&self) -> RefMut<'_, Manager<Learner1DSettings>> {
        self.learner_1d_manager_cell.borrow_mut()
    }

    pub fn integrator_manager(&self) -> RefMut<'_, Manager<IntegratorSettings>> {
        self.integrator_manager_cell.borrow_mut()
    }

    fn insert_json_prop(&self, json_prop: ConfigurationJsonProp) -> Result<(), ManagerError> {
        self.learner_1d_manager().insert_obj_from_json_vec(&json_prop.learner_1d)?;
        self.integrator_manager().insert_obj_from_json_vec(&json_prop.integrator)?;
        Ok(())
    }

    pub fn from_reader(&self, file_path: &str) -> Result<(), ManagerError> {
        let file = File::open(file_path)?;
        let reader = BufReader::new(file);
        let json_prop: ConfigurationJsonProp = serde_json::from_reader(reader)?;
        self.insert_json_prop(json_prop)
    }

    pub fn from_json_str(&self, json: &str) -> Result<(), ManagerError> {
        let json_prop: ConfigurationJsonProp = serde_json::from_str(json)?;
        self.insert_json_prop(json_prop)
    }

    pub fn learner_1d(&self, name: &str) -> Result<Learner1D, ManagerError> {
        let settings = self.learner_1d_manager().get(name)?;
        Learner1D::from_settings(&settings).map_err(|error| ManagerError::invalid_settings(name, error))
    }

    pub fn integrator(&self, name: &str) -> Result<IntegratorLearner, ManagerError> {
        let settings = self.integrator_manager().get(name)?;
        IntegratorLearner::from_settings(&settings).map_err(|error| ManagerError::invalid_settings(name, error))
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner::lossfunction::LossFunctionType;

    #[test]
    fn sections_are_optional() {
        let configuration = Configuration::new();
        configuration
            .from_json_str(r#"{"integrator": [{"name": "fine", "bounds": [0.0, 1.0], "tol": 1e-10}]}"#)
            .unwrap();
        let settings = configuration.integrator_manager().get("fine").unwrap();
        assert_eq!(settings.max_ivals, 1000);
        assert_eq!(settings.max_points, 100_000);
        assert_eq!(settings.max_rdepth, 2098);
        assert!(configuration.learner_1d_manager().names().is_empty());
    }

    #[test]
    fn loss_defaults_and_overrides() {
        let configuration = Configuration::new();
        configuration
            .from_json_str(
                r#"{"learner_1d": [
                    {"name": "plain", "bounds": [-1.0, 1.0]},
                    {"name": "grid", "bounds": [0.0, 2.0], "loss": "Uniform"}
                ]}"#,
            )
            .unwrap();
        assert_eq!(configuration.learner_1d("plain").unwrap().loss_function(), LossFunctionType::Default);
        assert_eq!(configuration.learner_1d("grid").unwrap().loss_function(), LossFunctionType::Uniform);
        assert_eq!(configuration.learner_1d("grid").unwrap().bounds(), (0.0, 2.0));
    }

    #[test]
    fn invalid_entries_are_reported_by_name() {
        let configuration = Configuration::new();
        let error = configuration
            .from_json_str(r#"{"integrator": [{"name": "broken", "bounds": [0.0, 1.0], "tol": 0.0}]}"#)
            .unwrap_err();
        match error {
            ManagerError::InvalidSettingsError { name, source } => {
                assert_eq!(name, "broken");
                assert_eq!(source, LearnerError::InvalidTolerance(0.0));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
