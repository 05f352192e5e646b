//! Registry of containers handed to node agents.
//!
//! Written by launcher tasks (insert) and the node agent listener (phase
//! updates, removal). Insertion is first-write-wins; a handle is never
//! replaced in place.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::records::{Container, ContainerId, ContainerPhase};

#[derive(Debug, Clone)]
struct Entry {
    container: Container,
    phase: ContainerPhase,
}

/// Thread-safe map from container id to container handle.
pub struct ContainerRegistry {
    containers: RwLock<HashMap<ContainerId, Entry>>,
}

impl ContainerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        ContainerRegistry {
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a container in the `Launching` phase.
    ///
    /// Returns false and leaves the existing handle untouched if the id is
    /// already registered.
    pub fn insert(&self, container: Container) -> bool {
        let mut containers = self
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if containers.contains_key(&container.id) {
            return false;
        }
        containers.insert(
            container.id,
            Entry {
                container,
                phase: ContainerPhase::Launching,
            },
        );
        true
    }

    /// Look up a registered container.
    pub fn get(&self, id: &ContainerId) -> Option<Container> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|e| e.container.clone())
    }

    /// Current phase of a registered container.
    pub fn phase(&self, id: &ContainerId) -> Option<ContainerPhase> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|e| e.phase)
    }

    /// Move a registered container to a new phase.
    ///
    /// Returns false if the container is not registered.
    pub fn set_phase(&self, id: &ContainerId, phase: ContainerPhase) -> bool {
        match self
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id)
        {
            Some(entry) => {
                entry.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Move a registered container to `Running` unless it already finished.
    ///
    /// A completion report can overtake the start notification; the finished
    /// phase then stays.
    pub fn mark_running(&self, id: &ContainerId) -> bool {
        let mut containers = self
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match containers.get_mut(id) {
            Some(entry) if !entry.phase.is_terminal() => {
                entry.phase = ContainerPhase::Running;
                true
            }
            _ => false,
        }
    }

    /// Remove a container, returning its handle if it was registered.
    pub fn remove(&self, id: &ContainerId) -> Option<Container> {
        self.containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .map(|e| e.container)
    }

    /// Get the number of registered containers.
    pub fn len(&self) -> usize {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
