//! Orchestrates the normalizer, rule pipeline, and metadata extractor
//! against the catalog: per-endpoint diffing, dedup/merge-on-conflict,
//! alias union, and prompt-template assignment.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use modelmesh_catalog::Catalog;
use modelmesh_normalize::normalize_alias;
use modelmesh_rules::{detect_platform, MetadataExtractor, MetadataExtractorConfig, RulePipeline, UnificationRule};
use modelmesh_types::{AliasEntry, Clock, Descriptor, Error, MergeStats, MetadataValue, Result, Stats, SystemClock, UnifiedModel};
use parking_lot::RwLock;

#[derive(Default)]
struct MergeCounters {
    digest_matches: AtomicU64,
    name_matches: AtomicU64,
    conflicts_split: AtomicU64,
    creates: AtomicU64,
}

impl MergeCounters {
    fn snapshot(&self) -> MergeStats {
        MergeStats {
            digest_matches: self.digest_matches.load(Ordering::Relaxed),
            name_matches: self.name_matches.load(Ordering::Relaxed),
            conflicts_split: self.conflicts_split.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
        }
    }
}

/// Orchestrates C1 (normalizer, via the rule pipeline), C2 (rule
/// pipeline), C3 (metadata extractor) against C5 (the catalog). Owns no
/// endpoint-health or circuit-breaker state — that is the lifecycle
/// layer's job, one level up.
pub struct DefaultUnifier {
    catalog: Catalog,
    pipeline: RwLock<RulePipeline>,
    extractor: MetadataExtractor,
    clock: Arc<dyn Clock>,
    merge_counters: MergeCounters,
    // Ingest is coarse-grained-serialized: a single batch's dedup probe
    // and subsequent catalog write must be atomic with respect to other
    // concurrent batches, and the catalog's own per-call locking doesn't
    // give us that across a probe-then-upsert sequence.
    ingest_lock: parking_lot::Mutex<()>,
}

impl DefaultUnifier {
    pub fn new(cleanup_interval_ms: i64) -> Self {
        Self::with_clock(cleanup_interval_ms, Arc::new(SystemClock))
    }

    pub fn with_clock(cleanup_interval_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog: Catalog::new(cleanup_interval_ms),
            pipeline: RwLock::new(RulePipeline::default()),
            extractor: MetadataExtractor::new(MetadataExtractorConfig::default()),
            clock,
            merge_counters: MergeCounters::default(),
            ingest_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn register_rule(&self, platform_tag: impl Into<String>, rule: Arc<dyn UnificationRule>) {
        self.pipeline.write().register(platform_tag, rule);
    }

    pub fn unify(&self, descriptor: Descriptor, endpoint: &str) -> Result<UnifiedModel> {
        if descriptor.name.trim().is_empty() {
            return Err(Error::invalid_input("descriptor name is empty"));
        }
        let mut models = self.unify_batch(vec![descriptor], endpoint)?;
        models.pop().ok_or_else(|| Error::invalid_input("descriptor produced no model"))
    }

    /// Nil (empty-name) descriptors are silently skipped; an empty
    /// `endpoint` is an error. Returns the models created or touched by
    /// this batch, in no particular order.
    pub fn unify_batch(&self, descriptors: Vec<Descriptor>, endpoint: &str) -> Result<Vec<UnifiedModel>> {
        if endpoint.trim().is_empty() {
            return Err(Error::invalid_input("endpoint is empty"));
        }
        if descriptors.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.ingest_lock.lock();
        let now = self.clock.now_ms();
        let prior_ids = self.catalog.ids_for_endpoint(endpoint);
        let mut touched_ids = HashSet::new();
        let mut results = Vec::new();

        for descriptor in &descriptors {
            if descriptor.name.trim().is_empty() {
                continue;
            }

            let platform = detect_platform(descriptor);
            let provisional = {
                let pipeline = self.pipeline.read();
                pipeline.apply(descriptor, &platform, &self.extractor)?
            };

            let model = self.reconcile(provisional, descriptor, endpoint, now);
            touched_ids.insert(model.id.clone());
            results.push(model);
        }

        for id in prior_ids.difference(&touched_ids) {
            self.drop_endpoint_from_model(id, endpoint);
        }

        Ok(results)
    }

    fn reconcile(&self, provisional: UnifiedModel, descriptor: &Descriptor, endpoint: &str, now: i64) -> UnifiedModel {
        let digest = provisional.metadata.get("digest").and_then(|v| v.as_str()).map(str::to_string);

        if let Some(digest) = &digest {
            if let Some(existing) = self.catalog.find_by_digest(digest).into_iter().next() {
                self.merge_counters.digest_matches.fetch_add(1, Ordering::Relaxed);
                return self.merge_into(existing, provisional, descriptor, endpoint, now);
            }
        }

        let normalized_native = normalize_alias(&descriptor.name);
        for id in self.catalog.find_ids_by_normalized_alias(&normalized_native) {
            let Some(existing) = self.catalog.get(&id) else { continue };
            let existing_digest = existing.metadata.get("digest").and_then(|v| v.as_str());

            if let (Some(existing_digest), Some(digest)) = (existing_digest, digest.as_deref()) {
                if existing_digest != digest {
                    continue; // digest conflict: no merge, even though names match.
                }
            }

            let has_exact_native_name = existing.aliases.iter().any(|a| a.name.eq_ignore_ascii_case(&descriptor.name));
            if has_exact_native_name {
                self.merge_counters.name_matches.fetch_add(1, Ordering::Relaxed);
                return self.merge_into(existing, provisional, descriptor, endpoint, now);
            }
        }

        self.create(provisional, descriptor, endpoint, now, digest.as_deref())
    }

    fn create(&self, mut model: UnifiedModel, descriptor: &Descriptor, endpoint: &str, now: i64, digest: Option<&str>) -> UnifiedModel {
        if let Some(existing) = self.catalog.get(&model.id) {
            let existing_digest = existing.metadata.get("digest").and_then(|v| v.as_str());
            if existing_digest != digest {
                self.merge_counters.conflicts_split.fetch_add(1, Ordering::Relaxed);
                let suffixed = format!("{}-{}", model.id, digest_suffix(digest));
                log::warn!(id = model.id.as_str(), suffixed_id = suffixed.as_str(); "id conflict on create, suffixing by digest");
                model.id = suffixed;
            }
        }

        log::debug!(id = model.id.as_str(), endpoint; "creating new unified model");
        self.merge_counters.creates.fetch_add(1, Ordering::Relaxed);
        self.attach_endpoint(&mut model, descriptor, endpoint, now);
        assign_prompt_template(&mut model);
        self.catalog.upsert(model.clone());
        model
    }

    fn merge_into(&self, existing: UnifiedModel, provisional: UnifiedModel, descriptor: &Descriptor, endpoint: &str, now: i64) -> UnifiedModel {
        log::debug!(id = existing.id.as_str(), endpoint; "merging descriptor into existing model");
        let mut model = existing;

        union_aliases(&mut model.aliases, provisional.aliases);
        for capability in provisional.capabilities {
            if !model.capabilities.contains(&capability) {
                model.capabilities.push(capability);
            }
        }
        model.capabilities.sort();
        model.capabilities.dedup();

        if model.max_context_length.is_none() {
            model.max_context_length = provisional.max_context_length;
        }

        self.attach_endpoint(&mut model, descriptor, endpoint, now);
        assign_prompt_template(&mut model);
        self.catalog.upsert(model.clone());
        model
    }

    fn attach_endpoint(&self, model: &mut UnifiedModel, descriptor: &Descriptor, endpoint: &str, now: i64) {
        let display_name = descriptor.display_name.clone().unwrap_or_else(|| descriptor.name.clone());
        let disk_size = descriptor.disk_size.unwrap_or(0);

        if let Some(existing) = model.source_endpoints.iter_mut().find(|e| e.url == endpoint) {
            existing.display_name = display_name;
            existing.native_name = descriptor.name.clone();
            existing.disk_size = disk_size;
            existing.last_seen = now;
        } else {
            model.source_endpoints.push(modelmesh_types::SourceEndpoint {
                url: endpoint.to_string(),
                display_name,
                native_name: descriptor.name.clone(),
                state: modelmesh_types::EndpointState::Online,
                disk_size,
                last_seen: now,
                last_state_check: now,
                state_info: None,
            });
        }

        if let Some(platform) = provisional_platform(descriptor) {
            record_platform(model, &platform);
        }

        model.recompute_disk_size();
        model.recompute_last_seen();
    }

    fn drop_endpoint_from_model(&self, id: &str, endpoint: &str) {
        let Some(mut model) = self.catalog.get(id) else { return };
        model.source_endpoints.retain(|e| e.url != endpoint);
        if model.source_endpoints.is_empty() {
            self.catalog.remove(id);
        } else {
            model.recompute_disk_size();
            model.recompute_last_seen();
            self.catalog.upsert(model);
        }
    }

    pub fn resolve(&self, name_or_id: &str) -> Result<UnifiedModel> {
        self.catalog.resolve(name_or_id).ok_or_else(|| Error::not_found(name_or_id))
    }

    pub fn get_all(&self) -> Vec<UnifiedModel> {
        self.catalog.get_all()
    }

    pub fn get_aliases(&self, id: &str) -> Result<Vec<String>> {
        self.catalog.get_aliases(id).ok_or_else(|| Error::not_found(id))
    }

    pub fn clear(&self) {
        self.catalog.clear();
    }

    pub fn stats(&self) -> Stats {
        let structural = self.catalog.structural_stats();
        Stats {
            total_models: structural.total_models,
            total_aliases: structural.total_aliases,
            total_endpoints: structural.total_endpoints,
            merge_stats: self.merge_counters.snapshot(),
        }
    }

    /// Cross-endpoint reconciliation outside the ingest path. Groups by
    /// `metadata.digest`, preferring the element whose first alias
    /// carries source `ollama`, then `lmstudio`, then any other; unions
    /// aliases/endpoints/capabilities/metadata.
    pub fn merge(&self, models: Vec<UnifiedModel>) -> Result<UnifiedModel> {
        if models.is_empty() {
            return Err(Error::invalid_input("merge requires at least one model"));
        }

        let mut ordered = models;
        ordered.sort_by_key(|m| source_preference_rank(m));
        let mut iter = ordered.into_iter();
        let mut result = iter.next().expect("checked non-empty above");

        for other in iter {
            union_aliases(&mut result.aliases, other.aliases);

            for endpoint in other.source_endpoints {
                match result.source_endpoints.iter_mut().find(|e| e.url == endpoint.url) {
                    Some(existing) if endpoint.last_seen > existing.last_seen => *existing = endpoint,
                    Some(_) => {}
                    None => result.source_endpoints.push(endpoint),
                }
            }

            for capability in other.capabilities {
                if !result.capabilities.contains(&capability) {
                    result.capabilities.push(capability);
                }
            }

            if let Some(platform) = other.metadata.get("platform").and_then(|v| v.as_str()) {
                record_platform(&mut result, platform);
            }
            for (key, value) in other.metadata {
                if key != "platforms" {
                    result.metadata.entry(key).or_insert(value);
                }
            }
        }

        result.capabilities.sort();
        result.capabilities.dedup();
        result.recompute_disk_size();
        result.recompute_last_seen();
        Ok(result)
    }
}

fn provisional_platform(descriptor: &Descriptor) -> Option<String> {
    Some(detect_platform(descriptor))
}

fn record_platform(model: &mut UnifiedModel, platform: &str) {
    let entry = model.metadata.entry("platforms".to_string()).or_insert_with(|| MetadataValue::Array(Vec::new()));
    if let MetadataValue::Array(values) = entry {
        let already_present = values.iter().any(|v| v.as_str() == Some(platform));
        if !already_present {
            values.push(MetadataValue::String(platform.to_string()));
        }
    }
}

fn source_preference_rank(model: &UnifiedModel) -> u8 {
    match model.aliases.first().map(|a| a.source.as_str()) {
        Some("ollama") => 0,
        Some("lmstudio") => 1,
        _ => 2,
    }
}

fn union_aliases(existing: &mut Vec<AliasEntry>, incoming: Vec<AliasEntry>) {
    for alias in incoming {
        let key = normalize_alias(&alias.name);
        let already_present = existing.iter().any(|a| normalize_alias(&a.name) == key);
        if !already_present {
            existing.push(alias);
        }
    }
}

fn digest_suffix(digest: Option<&str>) -> String {
    match digest {
        Some(digest) => {
            let stripped = digest.rsplit(':').next().unwrap_or(digest);
            let len = stripped.len();
            if len <= 8 { stripped.to_string() } else { stripped[len - 8..].to_string() }
        }
        None => "00000000".to_string(),
    }
}

/// Assigns `prompt_template_id` when it is still empty, per the
/// family/variant/alias/capability rules. `code`-typed metadata and a
/// `code`/`code-generation` capability both route to `plain` — the two
/// precedents the source carried are reconciled into this one rule.
fn assign_prompt_template(model: &mut UnifiedModel) {
    if !model.prompt_template_id.is_empty() {
        return;
    }

    let has_instruct_alias = model.has_alias_containing("instruct");
    let has_chat_alias = model.has_alias_containing("chat") && !has_instruct_alias;
    let variant_has_chat = model.variant.to_lowercase().contains("chat");
    let is_code_typed = model.metadata.get("type").and_then(|v| v.as_str()) == Some("code");
    let is_code_capable = model.has_capability("code") || model.has_capability("code-generation");

    model.prompt_template_id = if model.family == "llama" && has_instruct_alias {
        "llama3-instruct".to_string()
    } else if variant_has_chat || has_chat_alias {
        "chatml".to_string()
    } else if is_code_typed || is_code_capable {
        "plain".to_string()
    } else if model.has_capability("chat") {
        "chatml".to_string()
    } else {
        String::new()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelmesh_types::VirtualClock;

    fn descriptor(name: &str) -> Descriptor {
        Descriptor { name: name.to_string(), ..Default::default() }
    }

    fn unifier() -> DefaultUnifier {
        DefaultUnifier::with_clock(300_000, Arc::new(VirtualClock::new(1000)))
    }

    #[test]
    fn s1_family_rescue() {
        let unifier = unifier();
        let mut d = descriptor("phi4:latest");
        d.family = Some("phi3".into());
        d.parameter_size = Some("14.7B".into());
        d.quantization_level = Some("Q4_K_M".into());

        let model = unifier.unify(d, "http://a:11434").unwrap();
        assert_eq!(model.id, "phi/4:14.7b-q4km");
        assert_eq!(model.family, "phi");
        assert_eq!(model.variant, "4");
        assert_eq!(model.parameter_size, "14.7b");
        assert_eq!(model.quantization, "q4km");
        assert!(model.has_capability("chat"));
        assert!(model.has_capability("completion"));
        assert_eq!(model.prompt_template_id, "chatml");
    }

    #[test]
    fn s2_cross_endpoint_merge_by_digest() {
        let unifier = unifier();
        let mut a = descriptor("llama3:8b");
        a.digest = Some("sha256:abc".into());
        unifier.unify(a, "http://ollama:11434").unwrap();

        let mut b = descriptor("llama3-8b");
        b.digest = Some("sha256:abc".into());
        unifier.unify(b, "http://lmstudio:1234").unwrap();

        let models = unifier.get_all();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].source_endpoints.len(), 2);
        assert_eq!(unifier.stats().merge_stats.digest_matches, 1);
    }

    #[test]
    fn s3_digest_conflict_splits() {
        let unifier = unifier();
        let mut a = descriptor("llama3:8b");
        a.digest = Some("sha256:abcdef00".into());
        unifier.unify(a, "http://a").unwrap();

        let mut b = descriptor("llama3:8b");
        b.digest = Some("sha256:00def456".into());
        let model_b = unifier.unify(b, "http://b").unwrap();

        assert_eq!(unifier.get_all().len(), 2);
        assert!(model_b.id.ends_with("00def456"));
    }

    #[test]
    fn s6_endpoint_removal_cascades() {
        let unifier = unifier();
        let a = descriptor("llama3:8b");
        unifier.unify(a, "http://a").unwrap();
        let b = descriptor("LLAMA3:8B");
        unifier.unify(b, "http://b").unwrap();

        let models = unifier.get_all();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].source_endpoints.len(), 2);

        // Endpoint removal is a lifecycle-layer concern; exercise the
        // primitive it calls directly here.
        unifier.drop_endpoint_from_model(&models[0].id, "http://a");
        let model = unifier.resolve(&models[0].id).unwrap();
        assert_eq!(model.source_endpoints.len(), 1);
        assert_eq!(model.source_endpoints[0].url, "http://b");
    }

    #[test]
    fn idempotent_ingest_is_stable() {
        let unifier = unifier();
        let d = descriptor("llama3:8b");
        let first = unifier.unify(d.clone(), "http://a").unwrap();
        let second = unifier.unify(d, "http://a").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(unifier.get_all().len(), 1);
    }

    #[test]
    fn copy_on_read_resolve_does_not_leak_mutation() {
        let unifier = unifier();
        unifier.unify(descriptor("llama3:8b"), "http://a").unwrap();
        let mut model = unifier.resolve("llama3:8b").unwrap();
        model.capabilities.push("mutated".into());
        let again = unifier.resolve("llama3:8b").unwrap();
        assert!(!again.capabilities.contains(&"mutated".to_string()));
    }

    #[test]
    fn empty_batch_entries_are_skipped_without_error() {
        let unifier = unifier();
        let models = unifier.unify_batch(vec![Descriptor::default()], "http://a").unwrap();
        assert!(models.is_empty());
    }

    #[test]
    fn empty_endpoint_is_an_error() {
        let unifier = unifier();
        let result = unifier.unify_batch(vec![descriptor("a")], "");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn merge_prefers_ollama_alias_source_and_unions_platforms() {
        let unifier = unifier();
        let mut ollama_model = UnifiedModel {
            id: "llama/3:8b-q4km".into(),
            family: "llama".into(),
            variant: "3".into(),
            parameter_size: "8b".into(),
            parameter_count: 8_000_000_000,
            quantization: "q4km".into(),
            format: "gguf".into(),
            aliases: vec![AliasEntry::new("llama3:latest", "ollama")],
            source_endpoints: Vec::new(),
            capabilities: vec!["chat".into()],
            max_context_length: None,
            disk_size: 0,
            last_seen: 0,
            metadata: modelmesh_types::Metadata::new(),
            prompt_template_id: String::new(),
        };
        record_platform(&mut ollama_model, "ollama");

        let mut lmstudio_model = ollama_model.clone();
        lmstudio_model.aliases = vec![AliasEntry::new("llama3-8b", "lmstudio")];
        lmstudio_model.capabilities = vec!["completion".into()];
        lmstudio_model.metadata = modelmesh_types::Metadata::new();
        record_platform(&mut lmstudio_model, "lmstudio");

        let merged = unifier.merge(vec![lmstudio_model, ollama_model]).unwrap();
        assert_eq!(merged.aliases[0].source, "ollama");
        assert!(merged.has_capability("chat"));
        assert!(merged.has_capability("completion"));
        let platforms = merged.metadata.get("platforms").unwrap();
        if let MetadataValue::Array(values) = platforms {
            assert_eq!(values.len(), 2);
        } else {
            panic!("expected platforms array");
        }
    }
}
