//! Plugin surface: job classes and optimization algorithms.
//!
//! Plugin identity is the fully qualified class name. The registry is
//! populated from a [`PluginCatalog`] at startup and replaced wholesale on an
//! explicit reload command; the catalog is the seam where a deployment plugs
//! in its discovery mechanism (a class directory, static registration, ...).

pub mod builtin;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::common::error::{CoreError, CoreResult};
use crate::common::params::{ParameterList, ParameterStub};
use crate::optimize::OptimizationAlgorithm;

/// A load-generation job class: the code clients execute for a job.
///
/// The core never runs job-class logic itself; it validates parameters at
/// schedule time and ships the class name to the clients.
pub trait JobClass: Send + Sync {
    /// Fully qualified class name; the plugin's identity.
    fn class_name(&self) -> &str;

    fn display_name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Schema of the parameters this class accepts.
    fn parameter_stubs(&self) -> Vec<ParameterStub>;

    /// Validate schedule-time parameter values.
    fn validate_parameters(&self, _parameters: &ParameterList) -> CoreResult<()> {
        Ok(())
    }
}

/// Factory minting a fresh algorithm instance per optimizing job.
pub type AlgorithmFactory = Arc<dyn Fn() -> Box<dyn OptimizationAlgorithm> + Send + Sync>;

/// Source of plugins. Implementations decide where plugins come from.
pub trait PluginCatalog: Send + Sync {
    fn job_classes(&self) -> Vec<Arc<dyn JobClass>>;
    fn algorithms(&self) -> Vec<(String, AlgorithmFactory)>;
}

#[derive(Default)]
struct Tables {
    job_classes: HashMap<String, Arc<dyn JobClass>>,
    algorithms: HashMap<String, AlgorithmFactory>,
}

/// Registry of the currently loaded plugins.
#[derive(Default)]
pub struct PluginRegistry {
    tables: RwLock<Tables>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or reload) every plugin from the catalog, replacing the current
    /// tables. A catalog that yields duplicate names fails the whole load.
    pub fn load(&self, catalog: &dyn PluginCatalog) -> CoreResult<()> {
        let mut job_classes = HashMap::new();
        for class in catalog.job_classes() {
            let name = class.class_name().to_string();
            if job_classes.insert(name.clone(), class).is_some() {
                return Err(CoreError::PluginLoadFailed(format!(
                    "duplicate job class {}",
                    name
                )));
            }
        }

        let mut algorithms = HashMap::new();
        for (name, factory) in catalog.algorithms() {
            if algorithms.insert(name.clone(), factory).is_some() {
                return Err(CoreError::PluginLoadFailed(format!(
                    "duplicate algorithm {}",
                    name
                )));
            }
        }

        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.job_classes = job_classes;
        tables.algorithms = algorithms;

        tracing::info!(
            job_classes = tables.job_classes.len(),
            algorithms = tables.algorithms.len(),
            "plugin registry loaded"
        );
        Ok(())
    }

    pub fn job_class(&self, name: &str) -> Option<Arc<dyn JobClass>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .job_classes
            .get(name)
            .cloned()
    }

    pub fn has_job_class(&self, name: &str) -> bool {
        self.job_class(name).is_some()
    }

    /// Mint a fresh, uninitialized algorithm instance.
    pub fn new_algorithm(&self, name: &str) -> Option<Box<dyn OptimizationAlgorithm>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .algorithms
            .get(name)
            .map(|factory| factory())
    }

    pub fn job_class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .job_classes
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn algorithm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .algorithms
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
