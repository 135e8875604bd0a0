use anyhow::Result;
use async_trait::async_trait;

/// Cloud API used by the launcher.
///
/// Both calls are awaited by a launch worker; implementations own their retries, credentials
/// and rate limiting.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Short provider code used in logs ("mock", "scaleway", ...).
    fn name(&self) -> &str;

    /// Create up to `count` nodes of `instance_type`.
    ///
    /// Partial fulfilment is normal (quota, capacity): the result may hold fewer than `count`
    /// entries but must never hold more. Returns an error when the request failed as a whole.
    async fn create_nodes(
        &self,
        instance_type: &str,
        count: usize,
    ) -> Result<Vec<inventory::CloudInstance>>;

    /// Best-effort release of cloud instances. Callers log failures and do not retry.
    async fn terminate_nodes(&self, cloud_instance_ids: &[String]) -> Result<()>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    /// A provisioned compute resource as reported by the provider.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CloudInstance {
        pub cloud_instance_id: String,
        pub internal_ip: Option<String>,
        pub external_ip: Option<String>,
    }

    impl CloudInstance {
        pub fn new(cloud_instance_id: impl Into<String>) -> Self {
            Self {
                cloud_instance_id: cloud_instance_id.into(),
                internal_ip: None,
                external_ip: None,
            }
        }

        pub fn with_ips(mut self, internal_ip: Option<String>, external_ip: Option<String>) -> Self {
            self.internal_ip = internal_ip;
            self.external_ip = external_ip;
            self
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;
