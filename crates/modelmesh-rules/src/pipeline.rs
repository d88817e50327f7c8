//! The ordered, priority-sorted set of platform-specific unification
//! rules. Each rule decides whether it can handle a raw descriptor and,
//! if so, produces a provisional `UnifiedModel`; the pipeline walks rules
//! for the detected platform tag (then `*`) in descending priority order
//! and takes the first hit.

use std::collections::HashMap;
use std::sync::Arc;

use modelmesh_normalize as normalize;
use modelmesh_types::{Descriptor, Error, Result, UnifiedModel};

use crate::metadata::MetadataExtractor;

/// Contract for a single platform rule. `priority` breaks ties when more
/// than one rule in a group could handle the same descriptor; higher
/// wins.
pub trait UnificationRule: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn can_handle(&self, descriptor: &Descriptor, platform: &str) -> bool;
    fn apply(&self, descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel>;
}

/// Builds the provisional `UnifiedModel` shared by every builtin rule:
/// normalize family/size/quantization via C1, infer capabilities and
/// publisher via C3. The builtin rules below differ only in when they
/// apply, not in how they build — the rescue/expand/strip behavior they
/// are named for already lives in the normalizer's priority auction.
fn build_unified_model(descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel> {
    if descriptor.name.trim().is_empty() {
        return Err(Error::invalid_input("descriptor name is empty"));
    }

    let pattern_hint = extractor.match_family_pattern(&descriptor.name);
    let platform_family = pattern_hint
        .as_ref()
        .map(|(family, _, _)| family.as_str())
        .or(descriptor.family.as_deref());

    let (family, mut variant) = normalize::normalize_family(&descriptor.name, platform_family);
    if variant.is_empty() || variant.eq_ignore_ascii_case("unknown") {
        if let Some((_, pattern_variant, _)) = pattern_hint.filter(|(f, _, _)| f.eq_ignore_ascii_case(&family)) {
            if !pattern_variant.is_empty() {
                variant = pattern_variant;
            }
        }
    }

    let family_from_name = descriptor.family.is_none();

    let raw_size = descriptor.parameter_size.clone().unwrap_or_default();
    let size_from_name = descriptor.parameter_size.is_none();
    let (parameter_size, parameter_count) = normalize::normalize_size(&raw_size);

    let quantization = normalize::normalize_quantization(descriptor.quantization_level.as_deref().unwrap_or_default());

    let format = descriptor
        .format
        .clone()
        .map(|f| f.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    let id = normalize::generate_canonical_id(&family, &variant, &parameter_size, &quantization);

    let extracted = extractor.extract(descriptor, &family, family_from_name, size_from_name);

    let generated_aliases = normalize::generate_aliases(
        &descriptor.name,
        platform,
        &family,
        &parameter_size,
        extracted.publisher.as_deref(),
    );
    let aliases = generated_aliases
        .into_iter()
        .map(|(name, source)| modelmesh_types::AliasEntry::new(name, source))
        .collect();

    let mut metadata = descriptor.metadata.clone();
    metadata.insert("platform".to_string(), modelmesh_types::MetadataValue::String(platform.to_string()));
    metadata.insert(
        "metadata_confidence".to_string(),
        modelmesh_types::MetadataValue::Float(extracted.confidence),
    );
    if let Some(digest) = &descriptor.digest {
        metadata.insert("digest".to_string(), modelmesh_types::MetadataValue::String(digest.clone()));
    }
    if let Some(publisher) = &extracted.publisher {
        metadata.insert("publisher".to_string(), modelmesh_types::MetadataValue::String(publisher.clone()));
    }
    if let Some(model_type) = &descriptor.r#type {
        metadata.insert("type".to_string(), modelmesh_types::MetadataValue::String(model_type.clone()));
    }

    Ok(UnifiedModel {
        id,
        family,
        variant,
        parameter_size,
        parameter_count,
        quantization,
        format,
        aliases,
        source_endpoints: Vec::new(),
        capabilities: extracted.capabilities,
        max_context_length: descriptor.max_context_length,
        disk_size: 0,
        last_seen: 0,
        metadata,
        prompt_template_id: String::new(),
    })
}

/// Always applicable; lowest priority. This is the "default rule logic"
/// the ingest algorithm falls back to when no platform-specific rule
/// claims the descriptor.
pub struct GenericFallback;

impl UnificationRule for GenericFallback {
    fn name(&self) -> &str {
        "generic-fallback"
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn can_handle(&self, _descriptor: &Descriptor, _platform: &str) -> bool {
        true
    }

    fn apply(&self, descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel> {
        build_unified_model(descriptor, platform, extractor)
    }
}

/// Claims every descriptor detected as belonging to `tag`. Registered
/// once per well-known platform so a caller's custom rules for that
/// platform can outrank it without also outranking every other
/// platform's rules.
pub struct PlatformSpecific {
    tag: String,
}

impl PlatformSpecific {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl UnificationRule for PlatformSpecific {
    fn name(&self) -> &str {
        "platform-specific"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn can_handle(&self, _descriptor: &Descriptor, platform: &str) -> bool {
        platform == self.tag
    }

    fn apply(&self, descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel> {
        build_unified_model(descriptor, platform, extractor)
    }
}

/// Claims descriptors whose platform-declared family looks stale next to
/// a family/version pattern found directly in the name (the `phi4:latest`
/// reported with `family: "phi3"` case). The rescue itself is the
/// normalizer's priority auction; this rule only decides it should run
/// ahead of a generic platform rule.
pub struct FamilyRescue;

impl UnificationRule for FamilyRescue {
    fn name(&self) -> &str {
        "family-rescue"
    }

    fn priority(&self) -> i32 {
        9
    }

    fn can_handle(&self, descriptor: &Descriptor, _platform: &str) -> bool {
        let Some(declared) = descriptor.family.as_deref() else { return false };
        let (detected, _) = normalize::normalize_family(&descriptor.name, None);
        !detected.eq_ignore_ascii_case("unknown") && !detected.eq_ignore_ascii_case(declared)
    }

    fn apply(&self, descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel> {
        build_unified_model(descriptor, platform, extractor)
    }
}

/// Claims `huggingface`-platform descriptors shaped `publisher/repo`.
pub struct HuggingFaceExpand;

impl UnificationRule for HuggingFaceExpand {
    fn name(&self) -> &str {
        "huggingface-expand"
    }

    fn priority(&self) -> i32 {
        8
    }

    fn can_handle(&self, descriptor: &Descriptor, platform: &str) -> bool {
        platform == "huggingface" && descriptor.name.contains('/')
    }

    fn apply(&self, descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel> {
        let mut expanded = descriptor.clone();
        if expanded.publisher.is_none() {
            if let Some((publisher, _)) = descriptor.name.split_once('/') {
                expanded.publisher = Some(publisher.to_string());
            }
        }
        build_unified_model(&expanded, platform, extractor)
    }
}

/// Claims descriptors whose name is prefixed with their own declared
/// publisher (e.g. `mistralai-mistral-7b` reported with
/// `publisher: "mistralai"`) and strips the prefix before normalizing, so
/// the publisher token doesn't pollute the derived family.
pub struct VendorPrefixStrip;

impl UnificationRule for VendorPrefixStrip {
    fn name(&self) -> &str {
        "vendor-prefix-strip"
    }

    fn priority(&self) -> i32 {
        9
    }

    fn can_handle(&self, descriptor: &Descriptor, _platform: &str) -> bool {
        let Some(publisher) = descriptor.publisher.as_deref() else { return false };
        let lower_name = descriptor.name.to_lowercase();
        let lower_publisher = publisher.to_lowercase();
        lower_name.starts_with(&format!("{lower_publisher}-")) || lower_name.starts_with(&format!("{lower_publisher}_"))
    }

    fn apply(&self, descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel> {
        let publisher = descriptor.publisher.clone().unwrap_or_default();
        let stripped = descriptor
            .name
            .strip_prefix(&format!("{publisher}-"))
            .or_else(|| descriptor.name.strip_prefix(&format!("{publisher}_")))
            .unwrap_or(&descriptor.name)
            .to_string();

        let mut stripped_descriptor = descriptor.clone();
        stripped_descriptor.name = stripped;
        build_unified_model(&stripped_descriptor, platform, extractor)
    }
}

/// An ordered set of rules, grouped by platform tag plus a wildcard `"*"`
/// group. `GenericFallback` is registered under `"*"` by default so there
/// is always a match.
pub struct RulePipeline {
    groups: HashMap<String, Vec<Arc<dyn UnificationRule>>>,
}

impl Default for RulePipeline {
    fn default() -> Self {
        let mut pipeline = Self { groups: HashMap::new() };
        pipeline.register("*", Arc::new(GenericFallback));
        pipeline.register("*", Arc::new(FamilyRescue));
        pipeline.register("huggingface", Arc::new(HuggingFaceExpand));
        pipeline.register("*", Arc::new(VendorPrefixStrip));
        for tag in ["ollama", "lmstudio", "huggingface"] {
            pipeline.register(tag, Arc::new(PlatformSpecific::new(tag)));
        }
        pipeline
    }
}

impl RulePipeline {
    pub fn new() -> Self {
        Self { groups: HashMap::new() }
    }

    /// Registers a rule under `platform_tag` (use `"*"` for a rule that
    /// should be considered regardless of detected platform). Groups are
    /// kept sorted by descending priority after every insert.
    pub fn register(&mut self, platform_tag: impl Into<String>, rule: Arc<dyn UnificationRule>) {
        let group = self.groups.entry(platform_tag.into()).or_default();
        group.push(rule);
        group.sort_by_key(|rule| std::cmp::Reverse(rule.priority()));
    }

    /// Walks the platform-specific group in descending priority, then the
    /// `"*"` group, returning the first rule whose `can_handle` matches.
    pub fn select(&self, descriptor: &Descriptor, platform: &str) -> Option<&Arc<dyn UnificationRule>> {
        if let Some(group) = self.groups.get(platform) {
            if let Some(rule) = group.iter().find(|rule| rule.can_handle(descriptor, platform)) {
                return Some(rule);
            }
        }
        self.groups
            .get("*")
            .and_then(|group| group.iter().find(|rule| rule.can_handle(descriptor, platform)))
    }

    pub fn apply(&self, descriptor: &Descriptor, platform: &str, extractor: &MetadataExtractor) -> Result<UnifiedModel> {
        match self.select(descriptor, platform) {
            Some(rule) => rule.apply(descriptor, platform, extractor),
            None => build_unified_model(descriptor, platform, extractor),
        }
    }
}
