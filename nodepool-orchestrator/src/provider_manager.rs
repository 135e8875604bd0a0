use nodepool_providers::NodeProvider;
use std::sync::Arc;

use crate::config::OrchestratorSettings;

pub struct ProviderManager;

impl ProviderManager {
    /// Build the provider named by `settings.provider`. Returns None for unknown names and for
    /// providers not compiled into this binary.
    pub fn get_provider(settings: &OrchestratorSettings) -> Option<Arc<dyn NodeProvider>> {
        match settings.provider.as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => {
                use nodepool_providers::mock::MockProvider;

                let mut provider = MockProvider::new().with_latency(settings.mock.latency);
                if let Some(quota) = settings.mock.quota {
                    provider = provider.with_default_quota(quota);
                }
                Some(Arc::new(provider))
            }
            // Add other providers here:
            // "scaleway" => ...
            _ => None,
        }
    }
}
