//! Model unification core: a concurrent, in-memory catalog that ingests
//! model descriptors from heterogeneous inference-backend endpoints,
//! deduplicates and canonicalizes them into one `UnifiedModel` per
//! distinct model, and tracks endpoint health with circuit breaking and
//! TTL-driven cleanup on top.
//!
//! `Unifier` is the single entry point most callers need: construct one
//! from a [`Config`], `start()` its background tasks, and call
//! `unify_models` as each endpoint's descriptors arrive. A caller that
//! only wants the dedup/merge/resolve core without endpoint health or
//! background tasks can depend on `modelmesh-unify` directly and use
//! [`DefaultUnifier`].
//!
//! This crate has no HTTP or CLI surface; wiring it to a transport is
//! left to the embedding application.

pub use modelmesh_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use modelmesh_config::{Config, RetryPolicyConfig};
pub use modelmesh_lifecycle::{DiscoveryClient, LifecycleUnifier as Unifier, StateTransitionEvent, EVENT_CHANNEL_CAPACITY};
pub use modelmesh_rules::UnificationRule;
pub use modelmesh_types::{
    AliasEntry, CircuitBreakerStats, CircuitState, Clock, Descriptor, Error, EndpointState, EndpointStateInfo, Metadata,
    MergeStats, MetadataValue, Result, SourceEndpoint, Stats, SystemClock, UnifiedModel, VirtualClock,
};
pub use modelmesh_unify::DefaultUnifier;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn unifier_ingests_resolves_and_shuts_down_cleanly() {
        let unifier = Arc::new(Unifier::with_clock(Config::default(), Arc::new(VirtualClock::new(0))));
        unifier.start().await.unwrap();

        let descriptor = Descriptor { name: "llama3:8b".to_string(), ..Default::default() };
        let models = unifier.unify_models("http://a:11434", vec![descriptor]).unwrap();
        assert_eq!(models.len(), 1);
        assert!(unifier.resolve("llama3:8b").is_ok());
        assert_eq!(unifier.stats().total_models, 1);

        unifier.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }
}
