//! Config-driven inference of family, capabilities, publisher, and a
//! confidence score from name patterns, architecture hints, and
//! context-length thresholds.

use std::collections::HashMap;

use modelmesh_types::Descriptor;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One entry of `family_patterns`: a regex with named capture groups for
/// family and (optionally) variant, plus the priority it contributes to
/// the normalizer's candidate auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyPattern {
    pub regex: String,
    pub family_group: usize,
    pub variant_group: Option<usize>,
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextThresholds {
    pub extended_context: i64,
    pub long_context: i64,
    pub ultra_long_context: i64,
}

impl Default for ContextThresholds {
    fn default() -> Self {
        Self {
            extended_context: 32_000,
            long_context: 100_000,
            ultra_long_context: 500_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    /// model type -> base capability set.
    pub type_capabilities: HashMap<String, Vec<String>>,
    /// regex -> capabilities added when the name matches.
    pub name_patterns: Vec<(String, Vec<String>)>,
    pub context_thresholds: ContextThresholds,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecialRules {
    /// Names considered generic enough to carry no family information
    /// (e.g. `"model"`, `"default"`).
    pub generic_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataExtractorConfig {
    pub family_patterns: Vec<FamilyPattern>,
    pub architecture_mappings: HashMap<String, String>,
    pub publisher_mappings: HashMap<String, String>,
    pub quantization_mappings: HashMap<String, String>,
    pub capabilities: CapabilitiesConfig,
    pub special_rules: SpecialRules,
}

impl Default for MetadataExtractorConfig {
    fn default() -> Self {
        let mut architecture_mappings = HashMap::new();
        architecture_mappings.insert("llama".to_string(), "llama".to_string());
        architecture_mappings.insert("phi3".to_string(), "phi".to_string());
        architecture_mappings.insert("qwen2".to_string(), "qwen".to_string());
        architecture_mappings.insert("gemma2".to_string(), "gemma".to_string());

        let mut publisher_mappings = HashMap::new();
        publisher_mappings.insert("llama".to_string(), "meta".to_string());
        publisher_mappings.insert("mistral".to_string(), "mistralai".to_string());
        publisher_mappings.insert("phi".to_string(), "microsoft".to_string());
        publisher_mappings.insert("gemma".to_string(), "google".to_string());
        publisher_mappings.insert("qwen".to_string(), "qwen".to_string());

        let mut type_capabilities = HashMap::new();
        type_capabilities.insert("llm".to_string(), vec!["chat".to_string(), "completion".to_string()]);
        type_capabilities.insert("vlm".to_string(), vec!["chat".to_string(), "vision".to_string(), "multimodal".to_string()]);
        type_capabilities.insert("embeddings".to_string(), vec!["embeddings".to_string()]);

        Self {
            family_patterns: Vec::new(),
            architecture_mappings,
            publisher_mappings,
            quantization_mappings: HashMap::new(),
            capabilities: CapabilitiesConfig {
                type_capabilities,
                name_patterns: vec![
                    (r"(?i)code".to_string(), vec!["code-generation".to_string()]),
                    (r"(?i)vision|vl\b".to_string(), vec!["vision".to_string(), "multimodal".to_string()]),
                    (r"(?i)reason|r1\b".to_string(), vec!["reasoning".to_string()]),
                ],
                context_thresholds: ContextThresholds::default(),
            },
            special_rules: SpecialRules {
                generic_names: vec!["model".to_string(), "default".to_string(), "latest".to_string()],
            },
        }
    }
}

/// Output of `MetadataExtractor::extract`: everything derivable from a
/// descriptor alone, before the rule pipeline builds a `UnifiedModel`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMetadata {
    pub publisher: Option<String>,
    pub capabilities: Vec<String>,
    pub confidence: f64,
}

static DEFAULT_EXTRACTOR: OnceCell<MetadataExtractor> = OnceCell::new();

/// Infers family, capabilities, publisher, and a confidence score from a
/// descriptor. Constructed once per config and reused; the compiled regex
/// cache built from `config.capabilities.name_patterns` lives for the
/// lifetime of the extractor.
pub struct MetadataExtractor {
    config: MetadataExtractorConfig,
    name_pattern_regexes: Vec<(Regex, Vec<String>)>,
    family_pattern_regexes: Vec<(Regex, FamilyPattern)>,
}

impl MetadataExtractor {
    pub fn new(config: MetadataExtractorConfig) -> Self {
        let name_pattern_regexes = config
            .capabilities
            .name_patterns
            .iter()
            .filter_map(|(pattern, caps)| Regex::new(pattern).ok().map(|re| (re, caps.clone())))
            .collect();

        let family_pattern_regexes = config
            .family_patterns
            .iter()
            .filter_map(|pattern| Regex::new(&pattern.regex).ok().map(|re| (re, pattern.clone())))
            .collect();

        Self { config, name_pattern_regexes, family_pattern_regexes }
    }

    /// Matches `name` against the configured `family_patterns`, returning
    /// the highest-priority hit as `(family, variant)`. Used by the unify
    /// crate as an extra candidate fed into the normalizer's priority
    /// auction alongside the hardcoded family-version regexes.
    pub fn match_family_pattern(&self, name: &str) -> Option<(String, String, u8)> {
        let mut best: Option<(u8, String, String)> = None;

        for (regex, pattern) in &self.family_pattern_regexes {
            let Some(caps) = regex.captures(name) else { continue };
            let Some(family) = caps.get(pattern.family_group).map(|m| m.as_str().to_string()) else { continue };
            let variant = pattern
                .variant_group
                .and_then(|g| caps.get(g))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            let beats_current = match &best {
                Some((priority, _, _)) => pattern.priority > *priority,
                None => true,
            };
            if beats_current {
                best = Some((pattern.priority, family, variant));
            }
        }

        best.map(|(priority, family, variant)| (family, variant, priority))
    }

    /// The process-wide default extractor, built once from
    /// `MetadataExtractorConfig::default()` and thereafter read-only — the
    /// one ambient singleton this crate allows, mirroring the config
    /// cache's run-once lifecycle.
    pub fn shared() -> &'static MetadataExtractor {
        DEFAULT_EXTRACTOR.get_or_init(|| MetadataExtractor::new(MetadataExtractorConfig::default()))
    }

    pub fn config(&self) -> &MetadataExtractorConfig {
        &self.config
    }

    pub fn is_generic_name(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.config.special_rules.generic_names.iter().any(|g| g == &lower)
    }

    pub fn architecture_family(&self, architecture: &str) -> Option<String> {
        self.config.architecture_mappings.get(&architecture.to_lowercase()).cloned()
    }

    pub fn publisher_for_family(&self, family: &str) -> Option<String> {
        self.config.publisher_mappings.get(&family.to_lowercase()).cloned()
    }

    /// Infers capabilities and publisher, and computes the confidence
    /// score, for a descriptor whose family/variant have already been
    /// normalized by C1.
    pub fn extract(&self, descriptor: &Descriptor, family: &str, family_from_name: bool, size_from_name: bool) -> ExtractedMetadata {
        let publisher = descriptor
            .publisher
            .clone()
            .or_else(|| self.publisher_for_family(family));

        let mut capabilities = self.base_capabilities(descriptor);
        self.apply_name_patterns(descriptor, &mut capabilities);
        self.apply_context_thresholds(descriptor, &mut capabilities);
        capabilities.sort();
        capabilities.dedup();

        let confidence = self.compute_confidence(descriptor, family_from_name, size_from_name);

        ExtractedMetadata { publisher, capabilities, confidence }
    }

    fn base_capabilities(&self, descriptor: &Descriptor) -> Vec<String> {
        let model_type = descriptor.r#type.as_deref().unwrap_or("llm").to_lowercase();

        if let Some(caps) = self.config.capabilities.type_capabilities.get(&model_type) {
            return caps.clone();
        }

        if model_type == "embeddings" || model_type == "embedding" {
            return vec!["embeddings".to_string(), "similarity".to_string(), "vector-search".to_string()];
        }

        vec!["text-generation".to_string()]
    }

    fn apply_name_patterns(&self, descriptor: &Descriptor, capabilities: &mut Vec<String>) {
        for (regex, caps) in &self.name_pattern_regexes {
            if regex.is_match(&descriptor.name) {
                capabilities.extend(caps.iter().cloned());
            }
        }
    }

    fn apply_context_thresholds(&self, descriptor: &Descriptor, capabilities: &mut Vec<String>) {
        let Some(context) = descriptor.max_context_length else { return };
        let thresholds = &self.config.capabilities.context_thresholds;

        if context >= thresholds.ultra_long_context {
            capabilities.push("ultra-long-context".to_string());
        } else if context >= thresholds.long_context {
            capabilities.push("long-context".to_string());
        } else if context >= thresholds.extended_context {
            capabilities.push("extended-context".to_string());
        }
    }

    /// `matched_high_confidence_fields / total_field_slots`. The five
    /// high-confidence slots are direct metadata (digest, parameter-size,
    /// quantization, family, context length); a family or size value we
    /// had to infer from the raw name earns half credit instead of zero.
    fn compute_confidence(&self, descriptor: &Descriptor, family_from_name: bool, size_from_name: bool) -> f64 {
        const TOTAL_SLOTS: f64 = 5.0;
        let mut score = 0.0;

        score += if descriptor.digest.is_some() { 1.0 } else { 0.0 };
        score += if descriptor.parameter_size.is_some() {
            1.0
        } else if size_from_name {
            0.5
        } else {
            0.0
        };
        score += if descriptor.quantization_level.is_some() { 1.0 } else { 0.0 };
        score += if descriptor.family.is_some() {
            1.0
        } else if family_from_name {
            0.5
        } else {
            0.0
        };
        score += if descriptor.max_context_length.is_some() { 1.0 } else { 0.0 };

        score / TOTAL_SLOTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelmesh_types::MetadataValue;

    fn descriptor() -> Descriptor {
        Descriptor { name: "phi4:latest".into(), ..Default::default() }
    }

    #[test]
    fn embeddings_type_swaps_capabilities() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        let mut descriptor = descriptor();
        descriptor.r#type = Some("embeddings".into());
        let extracted = extractor.extract(&descriptor, "phi", false, false);
        assert!(extracted.capabilities.contains(&"embeddings".to_string()));
        assert!(!extracted.capabilities.contains(&"text-generation".to_string()));
    }

    #[test]
    fn default_type_gets_chat_and_completion() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        let descriptor = descriptor();
        let extracted = extractor.extract(&descriptor, "phi", false, false);
        assert!(extracted.capabilities.contains(&"chat".to_string()));
        assert!(extracted.capabilities.contains(&"completion".to_string()));
    }

    #[test]
    fn context_thresholds_are_monotonic() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        let mut descriptor = descriptor();
        descriptor.max_context_length = Some(600_000);
        let extracted = extractor.extract(&descriptor, "phi", false, false);
        assert!(extracted.capabilities.contains(&"ultra-long-context".to_string()));
        assert!(!extracted.capabilities.contains(&"long-context".to_string()));
    }

    #[test]
    fn confidence_counts_direct_fields_full_and_inferred_half() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        let mut descriptor = descriptor();
        descriptor.digest = Some("sha256:abc".into());
        descriptor.quantization_level = Some("Q4_K_M".into());
        let extracted = extractor.extract(&descriptor, "phi", true, true);
        // digest(1) + quant(1) + size(0.5) + family(0.5) + context(0) = 3 / 5
        assert!((extracted.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn publisher_falls_back_to_family_mapping() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        let descriptor = descriptor();
        let extracted = extractor.extract(&descriptor, "phi", true, true);
        assert_eq!(extracted.publisher.as_deref(), Some("microsoft"));
    }

    #[test]
    fn explicit_publisher_wins_over_mapping() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        let mut descriptor = descriptor();
        descriptor.publisher = Some("custom-org".into());
        let extracted = extractor.extract(&descriptor, "phi", true, true);
        assert_eq!(extracted.publisher.as_deref(), Some("custom-org"));
    }

    #[test]
    fn generic_names_are_recognized() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        assert!(extractor.is_generic_name("Model"));
        assert!(!extractor.is_generic_name("phi4"));
    }

    #[test]
    fn shared_extractor_is_reused() {
        let a = MetadataExtractor::shared() as *const _;
        let b = MetadataExtractor::shared() as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn family_pattern_picks_highest_priority_match() {
        let config = MetadataExtractorConfig {
            family_patterns: vec![
                FamilyPattern { regex: r"(?i)^(phi)(\d+)".into(), family_group: 1, variant_group: Some(2), priority: 6 },
                FamilyPattern { regex: r"(?i)^(\w+)".into(), family_group: 1, variant_group: None, priority: 1 },
            ],
            ..MetadataExtractorConfig::default()
        };
        let extractor = MetadataExtractor::new(config);
        let (family, variant, priority) = extractor.match_family_pattern("phi4").unwrap();
        assert_eq!(family, "phi");
        assert_eq!(variant, "4");
        assert_eq!(priority, 6);
    }

    #[test]
    fn name_pattern_adds_code_generation_capability() {
        let extractor = MetadataExtractor::new(MetadataExtractorConfig::default());
        let mut descriptor = descriptor();
        descriptor.name = "codestral-22b".into();
        descriptor.metadata.insert("probe".into(), MetadataValue::Bool(true));
        let extracted = extractor.extract(&descriptor, "mistral", false, false);
        assert!(extracted.capabilities.contains(&"code-generation".to_string()));
    }
}
