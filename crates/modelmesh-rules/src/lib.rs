//! Platform detection, config-driven metadata extraction, and the
//! priority-ordered unification rule pipeline (C2/C3/platform-detector
//! from the unification core).

pub mod metadata;
pub mod pipeline;
pub mod platform;

pub use metadata::{CapabilitiesConfig, ContextThresholds, ExtractedMetadata, FamilyPattern, MetadataExtractor, MetadataExtractorConfig, SpecialRules};
pub use pipeline::{FamilyRescue, GenericFallback, HuggingFaceExpand, PlatformSpecific, RulePipeline, UnificationRule, VendorPrefixStrip};
pub use platform::detect_platform;
