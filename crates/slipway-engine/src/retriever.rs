//! Shipyard retrieval from the configuration store.
//!
//! The configuration store is an external collaborator; it exposes a
//! read-only "get shipyard for project at HEAD" call over the project's
//! default branch. The engine only depends on the [`ConfigurationStore`]
//! trait, so tests and single-process deployments can use
//! [`InMemoryConfigurationStore`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::shipyard::Shipyard;

/// A versioned resource read from the configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedResource {
    /// Raw resource content.
    pub content: String,
    /// Commit hash the content was read at.
    pub version: String,
}

/// Read-only client contract for the configuration store.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Reads the shipyard document for a project at the HEAD of its default
    /// branch.
    ///
    /// # Errors
    ///
    /// - [`Error::ShipyardNotFound`] when the project has no shipyard
    /// - [`Error::ConfigurationStoreUnreachable`] on transport failure
    async fn get_shipyard_yaml(&self, project: &str) -> Result<VersionedResource>;
}

/// In-memory configuration store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryConfigurationStore {
    shipyards: RwLock<HashMap<String, VersionedResource>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryConfigurationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits a shipyard document for a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_shipyard(
        &self,
        project: impl Into<String>,
        yaml: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<()> {
        let mut shipyards = self.shipyards.write().map_err(poison_err)?;
        shipyards.insert(
            project.into(),
            VersionedResource {
                content: yaml.into(),
                version: version.into(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ConfigurationStore for InMemoryConfigurationStore {
    async fn get_shipyard_yaml(&self, project: &str) -> Result<VersionedResource> {
        let resource = {
            let shipyards = self.shipyards.read().map_err(poison_err)?;
            shipyards.get(project).cloned()
        };
        resource.ok_or_else(|| Error::ShipyardNotFound {
            project: project.to_string(),
        })
    }
}

/// Reads and parses the pipeline specification for a project.
pub struct ShipyardRetriever {
    store: std::sync::Arc<dyn ConfigurationStore>,
}

impl ShipyardRetriever {
    /// Creates a retriever backed by the given configuration store.
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn ConfigurationStore>) -> Self {
        Self { store }
    }

    /// Returns the parsed shipyard and the commit hash it was read at.
    ///
    /// # Errors
    ///
    /// - [`Error::ShipyardNotFound`] when the project has no shipyard
    /// - [`Error::ShipyardInvalid`] when the document fails to parse or
    ///   validate
    /// - [`Error::ConfigurationStoreUnreachable`] on transport failure
    pub async fn get_shipyard(&self, project: &str) -> Result<(Shipyard, String)> {
        let resource = self.store.get_shipyard_yaml(project).await?;
        let shipyard = Shipyard::from_yaml(project, &resource.content)?;
        Ok((shipyard, resource.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const YAML: &str = r"
apiVersion: spec.keptn.sh/0.2.3
kind: Shipyard
metadata:
  name: shipyard-sockshop
spec:
  stages:
    - name: dev
      sequences:
        - name: delivery
          tasks:
            - name: deploy
";

    #[tokio::test]
    async fn retrieves_and_parses_shipyard() {
        let store = Arc::new(InMemoryConfigurationStore::new());
        store.put_shipyard("sockshop", YAML, "abc123").unwrap();

        let retriever = ShipyardRetriever::new(store);
        let (shipyard, version) = retriever.get_shipyard("sockshop").await.unwrap();
        assert_eq!(version, "abc123");
        assert!(shipyard.find_sequence("dev", "delivery").is_some());
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let retriever = ShipyardRetriever::new(Arc::new(InMemoryConfigurationStore::new()));
        let err = retriever.get_shipyard("ghost").await.unwrap_err();
        assert!(matches!(err, Error::ShipyardNotFound { .. }));
    }

    #[tokio::test]
    async fn unparseable_shipyard_is_invalid() {
        let store = Arc::new(InMemoryConfigurationStore::new());
        store.put_shipyard("sockshop", "not: [valid", "abc").unwrap();

        let retriever = ShipyardRetriever::new(store);
        let err = retriever.get_shipyard("sockshop").await.unwrap_err();
        assert!(matches!(err, Error::ShipyardInvalid { .. }));
    }
}
