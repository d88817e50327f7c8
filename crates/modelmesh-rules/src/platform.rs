//! Guesses which backend produced a descriptor, so the rule pipeline can
//! pick the right platform-tagged rule group.

use modelmesh_types::Descriptor;

/// Detects the platform tag for a descriptor. A caller-supplied
/// `platform_hint` overrides every name/format-based heuristic below, but
/// never the two metadata-driven rules that run first.
pub fn detect_platform(descriptor: &Descriptor) -> String {
    if descriptor.metadata.contains_key("ollama.version") {
        return "ollama".to_string();
    }
    if descriptor.metadata.contains_key("lmstudio.version") {
        return "lmstudio".to_string();
    }

    let is_llm_or_vlm = matches!(descriptor.r#type.as_deref(), Some("llm") | Some("vlm"));
    if is_llm_or_vlm && descriptor.max_context_length.is_some() {
        return "lmstudio".to_string();
    }

    if let Some(hint) = descriptor.platform_hint.as_deref().filter(|h| !h.is_empty()) {
        return hint.to_string();
    }

    let name = descriptor.name.as_str();
    if name.contains("hf.co/") {
        return "huggingface".to_string();
    }
    if name.contains(':') {
        return "ollama".to_string();
    }
    if name.contains('/') {
        return "huggingface".to_string();
    }
    if descriptor.format.as_deref().is_some_and(|f| f.to_lowercase().contains("gguf")) {
        return "ollama".to_string();
    }

    "ollama".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Descriptor {
        Descriptor { name: "placeholder".into(), ..Default::default() }
    }

    #[test]
    fn metadata_keys_win_over_everything() {
        let mut descriptor = base();
        descriptor.name = "publisher/repo".into();
        descriptor.metadata.insert(
            "lmstudio.version".into(),
            modelmesh_types::MetadataValue::String("0.3".into()),
        );
        assert_eq!(detect_platform(&descriptor), "lmstudio");
    }

    #[test]
    fn llm_type_with_context_length_is_lmstudio() {
        let mut descriptor = base();
        descriptor.r#type = Some("llm".into());
        descriptor.max_context_length = Some(4096);
        assert_eq!(detect_platform(&descriptor), "lmstudio");
    }

    #[test]
    fn platform_hint_overrides_name_heuristics() {
        let mut descriptor = base();
        descriptor.name = "family:latest".into();
        descriptor.platform_hint = Some("custom-backend".into());
        assert_eq!(detect_platform(&descriptor), "custom-backend");
    }

    #[test]
    fn hf_co_prefix_detected() {
        let mut descriptor = base();
        descriptor.name = "hf.co/TheBloke/model-GGUF".into();
        assert_eq!(detect_platform(&descriptor), "huggingface");
    }

    #[test]
    fn colon_implies_ollama() {
        let mut descriptor = base();
        descriptor.name = "llama3:8b".into();
        assert_eq!(detect_platform(&descriptor), "ollama");
    }

    #[test]
    fn slash_implies_huggingface() {
        let mut descriptor = base();
        descriptor.name = "mistralai/Mistral-7B".into();
        assert_eq!(detect_platform(&descriptor), "huggingface");
    }

    #[test]
    fn gguf_format_implies_ollama() {
        let mut descriptor = base();
        descriptor.name = "plainname".into();
        descriptor.format = Some("GGUF".into());
        assert_eq!(detect_platform(&descriptor), "ollama");
    }

    #[test]
    fn default_is_ollama() {
        let descriptor = base();
        assert_eq!(detect_platform(&descriptor), "ollama");
    }
}
