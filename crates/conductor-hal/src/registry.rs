//! [`ModuleRegistry`] – id-keyed module registry with dependency validation.
//!
//! Registration rejects duplicate ids and any dependency edge that would close
//! a cycle, so the registry is a DAG at all times.  [`ModuleRegistry::plan`]
//! layers the graph with Kahn's algorithm: every module in level `n` depends
//! only on modules in levels `< n`, so a level can be started concurrently.
//!
//! Dependencies on ids that were never registered are allowed; such modules
//! (and anything depending on them) end up in [`StartPlan::blocked`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use conductor_types::{ModuleDescriptor, ModuleStatus, RegistryError};
use tracing::info;

use crate::module::{HardwareModule, ModuleConfig};

pub struct RegisteredModule {
    pub descriptor: ModuleDescriptor,
    pub config: ModuleConfig,
    pub module: Arc<dyn HardwareModule>,
}

/// Dependency-ordered start levels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartPlan {
    pub levels: Vec<Vec<String>>,
    /// Modules whose dependencies can never be satisfied.
    pub blocked: Vec<String>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<RegisteredModule>,
    index: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateModule`] – the id is taken.
    /// - [`RegistryError::DependencyCycle`] – the new edges close a cycle.
    pub fn register(
        &mut self,
        descriptor: ModuleDescriptor,
        module: Arc<dyn HardwareModule>,
        config: ModuleConfig,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.id) {
            return Err(RegistryError::DuplicateModule(descriptor.id));
        }
        if let Some(cycle) = self.cycle_through(&descriptor) {
            return Err(RegistryError::DependencyCycle { cycle });
        }

        info!(
            module = %descriptor.id,
            capabilities = ?descriptor.capabilities,
            dependencies = ?descriptor.dependencies,
            "module registered"
        );
        self.index.insert(descriptor.id.clone(), self.entries.len());
        self.entries.push(RegisteredModule {
            descriptor,
            config,
            module,
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredModule> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Position in registration order, used for tie-breaking.
    pub fn order_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredModule> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.descriptor.id.clone()).collect()
    }

    pub fn status(&self, id: &str) -> Option<ModuleStatus> {
        self.get(id).map(|e| e.descriptor.status)
    }

    /// Update a module's status, returning the previous one.
    pub fn set_status(&mut self, id: &str, status: ModuleStatus) -> Option<ModuleStatus> {
        let i = *self.index.get(id)?;
        let entry = &mut self.entries[i];
        let previous = entry.descriptor.status;
        entry.descriptor.status = status;
        Some(previous)
    }

    /// Snapshot copies of every descriptor, in registration order.
    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Layer the dependency graph into start levels.
    pub fn plan(&self) -> StartPlan {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&ModuleDescriptor> =
            self.entries.iter().map(|e| &e.descriptor).collect();
        let mut levels = Vec::new();

        loop {
            let (ready, rest): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|d| d.dependencies.iter().all(|dep| placed.contains(dep.as_str())));
            remaining = rest;
            if ready.is_empty() {
                break;
            }
            for d in &ready {
                placed.insert(d.id.as_str());
            }
            levels.push(ready.into_iter().map(|d| d.id.clone()).collect());
        }

        StartPlan {
            levels,
            blocked: remaining.into_iter().map(|d| d.id.clone()).collect(),
        }
    }

    /// Reverse of [`plan`](Self::plan): dependents before their dependencies.
    pub fn stop_order(&self) -> Vec<Vec<String>> {
        let plan = self.plan();
        let mut levels = plan.levels;
        if !plan.blocked.is_empty() {
            levels.push(plan.blocked);
        }
        levels.reverse();
        levels
    }

    fn dependencies_of<'a>(
        &'a self,
        id: &str,
        candidate: &'a ModuleDescriptor,
    ) -> Option<&'a BTreeSet<String>> {
        if id == candidate.id {
            Some(&candidate.dependencies)
        } else {
            self.get(id).map(|e| &e.descriptor.dependencies)
        }
    }

    /// The existing graph is acyclic, so any new cycle runs through the
    /// candidate.  Returns the cycle path starting and ending at it.
    fn cycle_through(&self, candidate: &ModuleDescriptor) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = vec![candidate.id.clone()];
        for dep in &candidate.dependencies {
            path.push(dep.clone());
            if self.reaches(dep, candidate, &mut visited, &mut path) {
                return Some(path);
            }
            path.pop();
        }
        None
    }

    fn reaches(
        &self,
        node: &str,
        candidate: &ModuleDescriptor,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if node == candidate.id {
            return true;
        }
        if !visited.insert(node.to_string()) {
            return false;
        }
        let Some(deps) = self.dependencies_of(node, candidate) else {
            return false;
        };
        for dep in deps {
            path.push(dep.clone());
            if self.reaches(dep, candidate, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }
}
