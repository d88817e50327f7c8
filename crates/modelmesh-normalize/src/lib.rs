//! Pure, deterministic functions that turn noisy per-endpoint metadata into
//! canonical identity tokens. Nothing here touches the catalog, performs
//! I/O, or holds state beyond the static rule tables below; every function
//! is safe to call concurrently from any number of threads.

use once_cell::sync::Lazy;
use regex::Regex;

/// A single candidate proposed by one of the family heuristics.
struct Candidate {
    family: String,
    variant: String,
    priority: u8,
}

const PUBLISHER_PREFIXES: &[(&str, &str)] = &[
    ("mistralai", "mistral"),
    ("meta-llama", "llama"),
    ("meta", "llama"),
    ("google", "gemma"),
    ("microsoft", "phi"),
    ("deepseek-ai", "deepseek"),
    ("qwen", "qwen"),
    ("nousresearch", "nous-hermes"),
    ("bigcode", "starcoder"),
    ("tiiuae", "falcon"),
];

/// `(substring to look for, family, variant)`. Checked in order; the first
/// match wins within this tier.
const NAME_PATTERNS: &[(&str, &str, &str)] = &[
    ("devstral", "mistral", "devstral"),
    ("codestral", "mistral", "codestral"),
    ("mixtral", "mistral", "mixtral"),
    ("llava", "llava", ""),
    ("starcoder", "starcoder", ""),
    ("wizardlm", "wizardlm", ""),
    ("dolphin", "dolphin", ""),
    ("vicuna", "vicuna", ""),
    ("orca", "orca", ""),
];

/// Families whose version number we try to rescue directly out of the raw
/// name, overriding a noisy or stale platform-reported family.
const FAMILY_KEYWORDS: &[&str] = &[
    "llama", "phi", "qwen", "gemma", "granite", "deepseek", "command", "falcon", "yi", "solar", "olmo", "nemotron",
];

static FAMILY_VERSION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    FAMILY_KEYWORDS
        .iter()
        .map(|family| {
            let pattern = format!(r"(?i)\b{family}[-_]?(\d+(?:\.\d+)?)\b");
            (*family, Regex::new(&pattern).expect("static pattern is valid"))
        })
        .collect()
});

static MOE_SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(\d+)\s*x\s*(\d+(?:\.\d+)?)\s*b\s*$").unwrap());

static PLAIN_SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*([bmkt])?\s*$").unwrap());

/// Derives `(family, variant)` from a raw reported name and an optional
/// platform-supplied family hint, via a priority auction between
/// heuristics. The highest-priority candidate wins; see the module-level
/// priority constants in the specification this module implements.
pub fn normalize_family(raw_name: &str, platform_family: Option<&str>) -> (String, String) {
    let mut candidates = Vec::new();
    let lower = raw_name.to_lowercase();

    if let Some((prefix, _)) = raw_name.split_once('/') {
        let prefix_lower = prefix.to_lowercase();
        if let Some((_, family)) = PUBLISHER_PREFIXES.iter().find(|(p, _)| *p == prefix_lower) {
            candidates.push(Candidate {
                family: (*family).to_string(),
                variant: String::new(),
                priority: 10,
            });
        }
    }

    for (needle, family, variant) in NAME_PATTERNS {
        if lower.contains(needle) {
            candidates.push(Candidate {
                family: (*family).to_string(),
                variant: (*variant).to_string(),
                priority: 9,
            });
            break;
        }
    }

    for (family, re) in FAMILY_VERSION_PATTERNS.iter() {
        if let Some(caps) = re.captures(raw_name) {
            candidates.push(Candidate {
                family: (*family).to_string(),
                variant: caps[1].to_string(),
                priority: 7,
            });
            break;
        }
    }

    if let Some(pf) = platform_family {
        let pf = pf.trim();
        if !pf.is_empty() {
            candidates.push(Candidate {
                family: pf.to_lowercase(),
                variant: String::new(),
                priority: 5,
            });
        }
    }

    if let Some(token) = first_token(raw_name) {
        candidates.push(Candidate {
            family: token.to_lowercase(),
            variant: String::new(),
            priority: 3,
        });
    }

    candidates
        .into_iter()
        .max_by_key(|c| c.priority)
        .filter(|c| !c.family.is_empty())
        .map(|c| (c.family, c.variant))
        .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()))
}

fn first_token(raw_name: &str) -> Option<String> {
    let token = raw_name
        .split(|c: char| matches!(c, '/' | ':' | '-' | '_' | ' '))
        .find(|s| !s.is_empty())?;
    Some(token.to_string())
}

/// Derives `(normalized_size, parameter_count)` from a raw size string.
/// Accepts `"7B"`, `"14.7b"`, `"350M"`, `"540 M"`, `"7"` (unit defaults to
/// billions), and mixture-of-experts notation like `"8x7b"`. Empty or
/// unparseable input yields `("unknown", 0)`; non-standard units are passed
/// through lowercased with a zero parameter count.
pub fn normalize_size(raw: &str) -> (String, i64) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ("unknown".to_string(), 0);
    }

    if let Some(caps) = MOE_SIZE_RE.captures(trimmed) {
        let experts: f64 = caps[1].parse().unwrap_or(0.0);
        let per_expert: f64 = caps[2].parse().unwrap_or(0.0);
        let count = (experts * per_expert * 1_000_000_000.0).round() as i64;
        return (trimmed.to_lowercase().replace(' ', ""), count);
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if let Some(caps) = PLAIN_SIZE_RE.captures(&compact) {
        let value: f64 = caps[1].parse().unwrap_or(0.0);
        let unit = caps.get(2).map(|m| m.as_str().to_lowercase());
        let (multiplier, in_billions) = match unit.as_deref() {
            Some("m") => (1_000_000.0, value / 1_000.0),
            Some("k") => (1_000.0, value / 1_000_000.0),
            Some("t") => (1_000_000_000_000.0, value * 1_000.0),
            Some("b") | None => (1_000_000_000.0, value),
            Some(_) => (0.0, 0.0),
        };
        let parameter_count = (value * multiplier).round() as i64;
        return (format_billions(in_billions), parameter_count);
    }

    (compact.to_lowercase(), 0)
}

fn format_billions(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    if (rounded.fract()).abs() < f64::EPSILON {
        format!("{}b", rounded as i64)
    } else {
        let mut s = format!("{rounded:.2}");
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        format!("{s}b")
    }
}

const QUANT_TABLE: &[(&str, &str)] = &[
    ("Q4_K_M", "q4km"),
    ("Q4_K_S", "q4ks"),
    ("Q5_K_M", "q5km"),
    ("Q5_K_S", "q5ks"),
    ("Q3_K_M", "q3km"),
    ("Q3_K_S", "q3ks"),
    ("Q6_K", "q6k"),
    ("Q8_0", "q8"),
    ("Q4_0", "q4"),
    ("Q4_1", "q41"),
    ("Q5_0", "q5"),
    ("Q5_1", "q51"),
    ("F16", "f16"),
    ("FP16", "f16"),
    ("F32", "f32"),
    ("FP32", "f32"),
    ("BF16", "bf16"),
    ("IQ2_XXS", "iq2xxs"),
    ("IQ3_XS", "iq3xs"),
    ("IQ4_NL", "iq4nl"),
];

/// Derives a canonical quantization token from a raw label. Unknown or
/// empty input yields `"unk"`.
pub fn normalize_quantization(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unk".to_string();
    }

    let canonical_key = trimmed.to_uppercase().replace('-', "_");
    if let Some((_, token)) = QUANT_TABLE.iter().find(|(key, _)| *key == canonical_key) {
        return (*token).to_string();
    }

    if let Some(rest) = canonical_key.strip_prefix('Q') {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let suffix: String = rest[digits.len()..]
                .chars()
                .filter(|c| *c != '_')
                .collect::<String>()
                .to_lowercase();
            return format!("q{digits}{suffix}");
        }
    }

    "unk".to_string()
}

/// Formats the canonical id: `family[/variant]:size-quant`, omitting
/// `/variant` when it is empty or `"unknown"`.
pub fn generate_canonical_id(family: &str, variant: &str, size: &str, quant: &str) -> String {
    let family = if family.is_empty() { "unknown" } else { family };
    let size = if size.is_empty() { "unknown" } else { size };
    let quant = if quant.is_empty() { "unk" } else { quant };

    if variant.is_empty() || variant.eq_ignore_ascii_case("unknown") {
        format!("{}:{}-{}", family.to_lowercase(), size.to_lowercase(), quant.to_lowercase())
    } else {
        format!(
            "{}/{}:{}-{}",
            family.to_lowercase(),
            variant.to_lowercase(),
            size.to_lowercase(),
            quant.to_lowercase()
        )
    }
}

/// Normalizes an alias for index lookups: lowercase, `-` folded to `:`.
/// Two aliases differing only in case or in that substitution are treated
/// as the same alias.
pub fn normalize_alias(s: &str) -> String {
    s.to_lowercase().replace('-', ":")
}

/// Generates the native name plus a platform-specific alias set for a
/// model, in priority order (native name first). Callers are responsible
/// for deduplicating by `normalize_alias` against any existing alias set;
/// within the set returned here duplicates by normalized name are already
/// removed.
pub fn generate_aliases(
    native_name: &str,
    platform: &str,
    family: &str,
    size: &str,
    publisher: Option<&str>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut push = |name: String, source: &str, seen: &mut std::collections::HashSet<String>, out: &mut Vec<(String, String)>| {
        if name.is_empty() {
            return;
        }
        let key = normalize_alias(&name);
        if seen.insert(key) {
            out.push((name, source.to_string()));
        }
    };

    push(native_name.to_string(), platform, &mut seen, &mut out);

    match platform {
        "ollama" => {
            push(format!("{family}:latest"), "generated", &mut seen, &mut out);
            push(format!("{family}:{size}"), "generated", &mut seen, &mut out);
        }
        "lmstudio" => {
            if let Some(publisher) = publisher.filter(|p| !p.is_empty()) {
                push(format!("{publisher}/{family}"), "generated", &mut seen, &mut out);
                push(format!("{publisher}/{family}-{size}"), "generated", &mut seen, &mut out);
            }
        }
        _ => {}
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_rescue_prefers_regex_over_stale_platform_hint() {
        let (family, variant) = normalize_family("phi4:latest", Some("phi3"));
        assert_eq!(family, "phi");
        assert_eq!(variant, "4");
    }

    #[test]
    fn family_falls_back_to_platform_hint() {
        let (family, _) = normalize_family("custom-net", Some("llama"));
        assert_eq!(family, "llama");
    }

    #[test]
    fn family_falls_back_to_first_token() {
        let (family, _) = normalize_family("totally-unknown-net", None);
        assert_eq!(family, "totally");
    }

    #[test]
    fn family_unknown_on_empty_name() {
        let (family, variant) = normalize_family("", None);
        assert_eq!(family, "unknown");
        assert_eq!(variant, "unknown");
    }

    #[test]
    fn publisher_prefix_wins() {
        let (family, _) = normalize_family("mistralai/devstral-small", None);
        assert_eq!(family, "mistral");
    }

    #[test]
    fn size_parses_standard_forms() {
        assert_eq!(normalize_size("7B"), ("7b".to_string(), 7_000_000_000));
        assert_eq!(normalize_size("14.7b"), ("14.7b".to_string(), 14_700_000_000));
        assert_eq!(normalize_size("7"), ("7b".to_string(), 7_000_000_000));
        assert_eq!(normalize_size("540 M"), ("0.54b".to_string(), 540_000_000));
    }

    #[test]
    fn size_handles_moe_notation() {
        let (size, count) = normalize_size("8x7b");
        assert_eq!(size, "8x7b");
        assert_eq!(count, 56_000_000_000);
    }

    #[test]
    fn size_empty_is_unknown() {
        assert_eq!(normalize_size(""), ("unknown".to_string(), 0));
        assert_eq!(normalize_size("   "), ("unknown".to_string(), 0));
    }

    #[test]
    fn size_nonstandard_unit_passes_through() {
        let (size, count) = normalize_size("medium");
        assert_eq!(size, "medium");
        assert_eq!(count, 0);
    }

    #[test]
    fn quantization_maps_known_tokens() {
        assert_eq!(normalize_quantization("Q4_K_M"), "q4km");
        assert_eq!(normalize_quantization("q4-k-m"), "q4km");
        assert_eq!(normalize_quantization("F16"), "f16");
    }

    #[test]
    fn quantization_empty_is_unk() {
        assert_eq!(normalize_quantization(""), "unk");
    }

    #[test]
    fn quantization_unknown_q_pattern_builds_token() {
        assert_eq!(normalize_quantization("Q5_K_S_XYZ"), "q5ksxyz");
    }

    #[test]
    fn quantization_totally_unknown_is_unk() {
        assert_eq!(normalize_quantization("zstd"), "unk");
    }

    #[test]
    fn canonical_id_omits_unknown_variant() {
        assert_eq!(generate_canonical_id("phi", "4", "14.7b", "q4km"), "phi/4:14.7b-q4km");
        assert_eq!(generate_canonical_id("llama", "", "8b", "q4km"), "llama:8b-q4km");
        assert_eq!(
            generate_canonical_id("llama", "unknown", "8b", "q4km"),
            "llama:8b-q4km"
        );
    }

    #[test]
    fn alias_normalization_folds_case_and_hyphen() {
        assert_eq!(normalize_alias("Llama-3-8B"), "llama:3:8b");
        assert_eq!(normalize_alias("llama:3:8b"), "llama:3:8b");
    }

    #[test]
    fn generated_aliases_dedupe_by_normalized_name() {
        let aliases = generate_aliases("llama:8b", "ollama", "llama", "8b", None);
        let names: Vec<_> = aliases.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&"llama:8b".to_string()));
        assert!(names.contains(&"llama:latest".to_string()));
        // native name and generated "family:size" collide when normalized.
        assert_eq!(aliases.iter().filter(|(n, _)| n == "llama:8b").count(), 1);
    }

    proptest::proptest! {
        #[test]
        fn normalize_family_never_panics(name in ".*", platform in proptest::option::of(".*")) {
            let _ = normalize_family(&name, platform.as_deref());
        }

        #[test]
        fn normalize_size_never_panics(raw in ".*") {
            let _ = normalize_size(&raw);
        }
    }
}
