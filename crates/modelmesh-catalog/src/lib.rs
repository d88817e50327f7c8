//! Thread-safe, indexed store of `UnifiedModel`s. One exclusive writer or
//! many shared readers at a time; every read returns an independent deep
//! copy so a caller can never observe or cause a mutation through the
//! catalog's back door.
//!
//! The catalog knows nothing about merge semantics, digests-as-identity,
//! or platform rules — that orchestration lives one layer up. It only
//! offers the primitives (`upsert`, `remove`, indexed lookup, sweep) that
//! layer needs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use modelmesh_normalize::normalize_alias;
use modelmesh_types::UnifiedModel;
use parking_lot::RwLock;

struct Inner {
    models: HashMap<String, UnifiedModel>,
    digest_index: HashMap<String, HashSet<String>>,
    alias_index: HashMap<String, HashSet<String>>,
    endpoint_index: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            models: HashMap::new(),
            digest_index: HashMap::new(),
            alias_index: HashMap::new(),
            endpoint_index: HashMap::new(),
        }
    }

    fn index_model(&mut self, id: &str, model: &UnifiedModel) {
        if let Some(digest) = model.metadata.get("digest").and_then(|v| v.as_str()) {
            self.digest_index.entry(digest.to_string()).or_default().insert(id.to_string());
        }
        for alias in &model.aliases {
            self.alias_index.entry(normalize_alias(&alias.name)).or_default().insert(id.to_string());
        }
        for endpoint in &model.source_endpoints {
            self.endpoint_index.entry(endpoint.url.clone()).or_default().insert(id.to_string());
        }
    }

    fn unindex_model(&mut self, id: &str, model: &UnifiedModel) {
        if let Some(digest) = model.metadata.get("digest").and_then(|v| v.as_str()) {
            if let Some(set) = self.digest_index.get_mut(digest) {
                set.remove(id);
                if set.is_empty() {
                    self.digest_index.remove(digest);
                }
            }
        }
        for alias in &model.aliases {
            let key = normalize_alias(&alias.name);
            if let Some(set) = self.alias_index.get_mut(&key) {
                set.remove(id);
                if set.is_empty() {
                    self.alias_index.remove(&key);
                }
            }
        }
        for endpoint in &model.source_endpoints {
            if let Some(set) = self.endpoint_index.get_mut(&endpoint.url) {
                set.remove(id);
                if set.is_empty() {
                    self.endpoint_index.remove(&endpoint.url);
                }
            }
        }
    }
}

/// Structural counters the catalog can answer without help from the
/// layer above (which tracks its own merge/create counters).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructuralStats {
    pub total_models: usize,
    pub total_aliases: usize,
    pub total_endpoints: usize,
}

pub struct Catalog {
    inner: RwLock<Inner>,
    last_swept_at: AtomicI64,
    cleanup_interval_ms: i64,
}

impl Catalog {
    pub fn new(cleanup_interval_ms: i64) -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            last_swept_at: AtomicI64::new(0),
            cleanup_interval_ms: cleanup_interval_ms.max(1),
        }
    }

    /// Inserts `model`, replacing any prior version under the same id.
    /// Index entries for the prior version (if any) are purged first, so
    /// index mutation and the primary-map mutation happen atomically
    /// under the same write-lock acquisition.
    pub fn upsert(&self, model: UnifiedModel) {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.models.remove(&model.id) {
            inner.unindex_model(&model.id, &previous);
        }
        inner.index_model(&model.id, &model);
        inner.models.insert(model.id.clone(), model);
    }

    pub fn remove(&self, id: &str) -> Option<UnifiedModel> {
        let mut inner = self.inner.write();
        let removed = inner.models.remove(id)?;
        inner.unindex_model(id, &removed);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<UnifiedModel> {
        self.inner.read().models.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().models.contains_key(id)
    }

    pub fn get_all(&self) -> Vec<UnifiedModel> {
        self.inner.read().models.values().cloned().collect()
    }

    pub fn get_aliases(&self, id: &str) -> Option<Vec<String>> {
        self.inner.read().models.get(id).map(|m| m.aliases.iter().map(|a| a.name.clone()).collect())
    }

    /// Lookup order: exact id, then exact normalized alias, then a
    /// case-insensitive linear scan over every alias in the catalog.
    pub fn resolve(&self, name_or_id: &str) -> Option<UnifiedModel> {
        let inner = self.inner.read();

        if let Some(model) = inner.models.get(name_or_id) {
            return Some(model.clone());
        }

        let normalized = normalize_alias(name_or_id);
        if let Some(ids) = inner.alias_index.get(&normalized) {
            if let Some(id) = ids.iter().next() {
                return inner.models.get(id).cloned();
            }
        }

        let lowered = name_or_id.to_lowercase();
        inner
            .models
            .values()
            .find(|model| model.aliases.iter().any(|a| a.name.to_lowercase() == lowered))
            .cloned()
    }

    pub fn find_by_digest(&self, digest: &str) -> Vec<UnifiedModel> {
        let inner = self.inner.read();
        inner
            .digest_index
            .get(digest)
            .map(|ids| ids.iter().filter_map(|id| inner.models.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Ids whose alias set contains a name that normalizes to `name`.
    pub fn find_ids_by_normalized_alias(&self, name: &str) -> Vec<String> {
        let normalized = normalize_alias(name);
        self.inner.read().alias_index.get(&normalized).map(|ids| ids.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn ids_for_endpoint(&self, url: &str) -> HashSet<String> {
        self.inner.read().endpoint_index.get(url).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = Inner::new();
    }

    pub fn len(&self) -> usize {
        self.inner.read().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn structural_stats(&self) -> StructuralStats {
        let inner = self.inner.read();
        StructuralStats {
            total_models: inner.models.len(),
            total_aliases: inner.models.values().map(|m| m.aliases.len()).sum(),
            total_endpoints: inner.endpoint_index.len(),
        }
    }

    /// Cheap, lock-free(ish) check of whether `cleanup_interval_ms` has
    /// elapsed since the last sweep.
    pub fn needs_cleanup(&self, now: i64) -> bool {
        now - self.last_swept_at.load(Ordering::Relaxed) >= self.cleanup_interval_ms
    }

    /// Scans for models whose `last_seen` is older than `ttl_ms`, then
    /// deletes them and purges every index entry, all under one
    /// exclusive-lock acquisition. Returns the removed ids.
    pub fn sweep(&self, now: i64, ttl_ms: i64) -> Vec<String> {
        let mut inner = self.inner.write();

        let stale: Vec<String> = inner
            .models
            .values()
            .filter(|model| now - model.last_seen > ttl_ms)
            .map(|model| model.id.clone())
            .collect();

        for id in &stale {
            if let Some(model) = inner.models.remove(id) {
                inner.unindex_model(id, &model);
            }
        }

        self.last_swept_at.store(now, Ordering::Relaxed);
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelmesh_types::{AliasEntry, EndpointState, SourceEndpoint};

    fn model(id: &str, alias: &str, url: &str, last_seen: i64) -> UnifiedModel {
        UnifiedModel {
            id: id.to_string(),
            family: "llama".into(),
            variant: String::new(),
            parameter_size: "8b".into(),
            parameter_count: 8_000_000_000,
            quantization: "q4km".into(),
            format: "gguf".into(),
            aliases: vec![AliasEntry::new(alias, "ollama")],
            source_endpoints: vec![SourceEndpoint {
                url: url.to_string(),
                display_name: url.to_string(),
                native_name: alias.to_string(),
                state: EndpointState::Online,
                disk_size: 10,
                last_seen,
                last_state_check: last_seen,
                state_info: None,
            }],
            capabilities: vec!["chat".into()],
            max_context_length: None,
            disk_size: 10,
            last_seen,
            metadata: modelmesh_types::Metadata::new(),
            prompt_template_id: String::new(),
        }
    }

    #[test]
    fn resolve_finds_by_id_then_alias() {
        let catalog = Catalog::new(1000);
        catalog.upsert(model("llama/3:8b-q4km", "llama3:latest", "http://a", 1));
        assert!(catalog.resolve("llama/3:8b-q4km").is_some());
        assert!(catalog.resolve("llama3:latest").is_some());
        assert!(catalog.resolve("LLAMA3:LATEST").is_some());
        assert!(catalog.resolve("nope").is_none());
    }

    #[test]
    fn upsert_replaces_prior_index_entries() {
        let catalog = Catalog::new(1000);
        catalog.upsert(model("id1", "alias-old", "http://a", 1));
        let mut updated = model("id1", "alias-new", "http://a", 2);
        updated.metadata.insert("digest".into(), modelmesh_types::MetadataValue::String("sha256:x".into()));
        catalog.upsert(updated);

        assert!(catalog.resolve("alias-old").is_none());
        assert!(catalog.resolve("alias-new").is_some());
        assert_eq!(catalog.find_by_digest("sha256:x").len(), 1);
    }

    #[test]
    fn remove_purges_all_indices() {
        let catalog = Catalog::new(1000);
        catalog.upsert(model("id1", "alias1", "http://a", 1));
        catalog.remove("id1");
        assert!(catalog.get("id1").is_none());
        assert!(catalog.ids_for_endpoint("http://a").is_empty());
        assert!(catalog.find_ids_by_normalized_alias("alias1").is_empty());
    }

    #[test]
    fn sweep_removes_only_stale_models() {
        let catalog = Catalog::new(1000);
        catalog.upsert(model("stale", "a1", "http://a", 0));
        catalog.upsert(model("fresh", "a2", "http://a", 150));
        let removed = catalog.sweep(200, 100);
        assert_eq!(removed, vec!["stale".to_string()]);
        assert!(catalog.get("stale").is_none());
        assert!(catalog.get("fresh").is_some());
    }

    #[test]
    fn needs_cleanup_tracks_interval() {
        let catalog = Catalog::new(100);
        assert!(catalog.needs_cleanup(50));
        catalog.sweep(50, 1_000_000);
        assert!(!catalog.needs_cleanup(100));
        assert!(catalog.needs_cleanup(151));
    }

    #[test]
    fn copy_on_read_prevents_mutation_leak() {
        let catalog = Catalog::new(1000);
        catalog.upsert(model("id1", "alias1", "http://a", 1));
        let mut read = catalog.get("id1").unwrap();
        read.capabilities.push("mutated".into());
        let second_read = catalog.get("id1").unwrap();
        assert!(!second_read.capabilities.contains(&"mutated".to_string()));
    }
}
