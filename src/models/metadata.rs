//! Model metadata parsing
//!
//! Reads the model's `config.json`. A config that does not parse as a JSON
//! object fails the integrity check before the engine ever sees the model.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fields of interest from config.json
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelMetadata {
    /// Architecture family (e.g., "gpt2", "bert")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub architectures: Vec<String>,

    /// Hidden size / embedding dimension
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<u32>,

    /// Maximum sequence length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_position_embeddings: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_hidden_layers: Option<u32>,

    /// Storage dtype declared by the publisher
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torch_dtype: Option<String>,
}

/// Raw config.json structure (partial)
#[derive(Debug, Deserialize)]
struct RawConfig {
    model_type: Option<String>,
    #[serde(default)]
    architectures: Vec<String>,
    hidden_size: Option<u32>,
    max_position_embeddings: Option<u32>,
    vocab_size: Option<u32>,
    num_hidden_layers: Option<u32>,
    torch_dtype: Option<String>,
    // GPT-2 style names
    n_embd: Option<u32>,
    n_positions: Option<u32>,
    n_layer: Option<u32>,
}

/// Parse config.json at `path`, describing what is wrong on failure
pub fn read_model_config(path: &Path) -> Result<ModelMetadata, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("cannot read config: {}", e))?;
    let raw: RawConfig =
        serde_json::from_str(&content).map_err(|e| format!("config is not valid JSON: {}", e))?;

    Ok(ModelMetadata {
        model_type: raw.model_type,
        architectures: raw.architectures,
        hidden_size: raw.hidden_size.or(raw.n_embd),
        max_position_embeddings: raw.max_position_embeddings.or(raw.n_positions),
        vocab_size: raw.vocab_size,
        num_hidden_layers: raw.num_hidden_layers.or(raw.n_layer),
        torch_dtype: raw.torch_dtype,
    })
}

/// Metadata from `<model_dir>/config.json`, if present and valid
pub fn parse_model_config(model_dir: &Path) -> Option<ModelMetadata> {
    read_model_config(&model_dir.join("config.json")).ok()
}

/// Rough transformer parameter count
pub fn estimate_parameters(metadata: &ModelMetadata) -> Option<u64> {
    let hidden = metadata.hidden_size? as u64;
    let layers = metadata.num_hidden_layers? as u64;
    let vocab = metadata.vocab_size? as u64;

    // Embedding plus ~12 * hidden^2 per layer (attention + FFN)
    Some(vocab * hidden + layers * 12 * hidden * hidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_gpt2_config() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"{
                "model_type": "gpt2",
                "architectures": ["GPT2LMHeadModel"],
                "n_embd": 1024,
                "n_positions": 1024,
                "n_layer": 24,
                "vocab_size": 50257
            }"#,
        );

        let metadata = parse_model_config(dir.path()).unwrap();
        assert_eq!(metadata.model_type.as_deref(), Some("gpt2"));
        assert_eq!(metadata.architectures, vec!["GPT2LMHeadModel"]);
        assert_eq!(metadata.hidden_size, Some(1024));
        assert_eq!(metadata.num_hidden_layers, Some(24));

        // ~355M for gpt2-medium
        let params = estimate_parameters(&metadata).unwrap();
        assert!(params > 300_000_000 && params < 400_000_000);
    }

    #[test]
    fn test_parse_bert_config() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"{"model_type": "bert", "hidden_size": 384, "max_position_embeddings": 512,
                "vocab_size": 30522, "num_hidden_layers": 6, "torch_dtype": "float32"}"#,
        );
        let metadata = parse_model_config(dir.path()).unwrap();
        assert_eq!(metadata.hidden_size, Some(384));
        assert_eq!(metadata.torch_dtype.as_deref(), Some("float32"));
    }

    #[test]
    fn test_empty_object_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{}");
        assert_eq!(read_model_config(&path).unwrap(), ModelMetadata::default());
    }

    #[test]
    fn test_invalid_json_reports_reason() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "<html>rate limited</html>");
        let err = read_model_config(&path).unwrap_err();
        assert!(err.contains("not valid JSON"));
        assert!(parse_model_config(dir.path()).is_none());
    }

    #[test]
    fn test_missing_config() {
        let dir = TempDir::new().unwrap();
        assert!(read_model_config(&dir.path().join("config.json"))
            .unwrap_err()
            .contains("cannot read"));
    }
}
