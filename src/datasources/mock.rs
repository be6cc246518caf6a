//! Mock datasource for testing
//!
//! Provides a configurable mock datasource that can be used in unit tests.

use async_trait::async_trait;

use super::{Datasource, MetadataBundle};
use crate::CloudInitError;

/// Mock datasource for testing
///
/// # Example
/// ```
/// use cloud_init_engine::datasources::mock::MockDatasource;
///
/// let mock = MockDatasource::new()
///     .with_instance_id("test-123")
///     .with_userdata("#cloud-config\nhostname: mock");
/// ```
pub struct MockDatasource {
    name: String,
    claims: bool,
    disconnected: bool,
    error: Option<String>,
    staged: MetadataBundle,
    bundle: MetadataBundle,
}

impl MockDatasource {
    /// Create a mock that claims the environment with an empty bundle
    pub fn new() -> Self {
        Self {
            name: "Mock".to_string(),
            claims: true,
            disconnected: false,
            error: None,
            staged: MetadataBundle::default(),
            bundle: MetadataBundle::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set whether `fetch` claims the environment
    pub fn with_claim(mut self, claims: bool) -> Self {
        self.claims = claims;
        self
    }

    pub fn with_disconnected(mut self, disconnected: bool) -> Self {
        self.disconnected = disconnected;
        self
    }

    /// Make `fetch` fail with a datasource error
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_instance_id(self, id: &str) -> Self {
        self.with_metadata("instance-id", id)
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.staged.set(key, value);
        self
    }

    pub fn with_userdata(mut self, userdata: impl AsRef<[u8]>) -> Self {
        self.staged.set_userdata(userdata.as_ref().to_vec());
        self
    }
}

impl Default for MockDatasource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datasource for MockDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self) -> Result<bool, CloudInitError> {
        if let Some(error) = &self.error {
            return Err(CloudInitError::Datasource(error.clone()));
        }
        if self.claims {
            self.bundle = self.staged.clone();
        }
        Ok(self.claims)
    }

    fn bundle(&self) -> &MetadataBundle {
        &self.bundle
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_bundle_only_after_fetch() {
        let mut mock = MockDatasource::new()
            .with_instance_id("i-mock")
            .with_userdata("#!/bin/sh");

        assert!(mock.bundle().instance_id().is_none());
        assert!(mock.fetch().await.unwrap());
        assert_eq!(mock.instance_id(), "i-mock");
        assert_eq!(mock.bundle().userdata_raw(), Some(&b"#!/bin/sh"[..]));
    }

    #[tokio::test]
    async fn test_mock_error_and_decline() {
        let mut failing = MockDatasource::new().with_error("boom");
        assert!(failing.fetch().await.is_err());

        let mut declining = MockDatasource::new().with_claim(false);
        assert!(!declining.fetch().await.unwrap());
        assert_eq!(declining.instance_id(), "iid-datasource");
    }
}
