//! The outbound collaborator the lifecycle layer polls for forced
//! rediscovery. Production callers wire this to their HTTP client; the
//! core never speaks HTTP itself.

use modelmesh_types::{Descriptor, Result};

#[async_trait::async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn discover_models(&self, endpoint: &str) -> Result<Vec<Descriptor>>;
}
