//! session and provider configuration.
//!
//! values come from `Default`, a json file/string, the environment (native), or
//! the page url (wasm). later sources override earlier ones field by field.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::GenerateOptions;
use crate::error::ConfigError;
use crate::LLMBackend;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer concisely.";
pub const DEFAULT_SUMMARIZE_PROMPT: &str =
    "Summarize the text the user sends as a TL;DR. Reply in plain text.";

/// an entry of the model selector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOption {
    pub id: String,
    pub label: String,
}

impl ModelOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self { id: id.into(), label: label.into() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// every send carries the whole history.
    #[default]
    Chat,
    /// every send summarizes the submitted text on its own.
    Summarize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub models: Vec<ModelOption>,
    /// model loaded when the session starts.
    pub initial_model: String,
    pub system_prompt: String,
    /// per-model system prompt, keyed by model id.
    pub system_prompts: HashMap<String, String>,
    pub summarize_prompt: String,
    pub mode: SessionMode,
    pub streaming: bool,
    /// prefer the engine's final transcript over the locally streamed text.
    pub reconcile_final_transcript: bool,
    pub temperature: f32,
    pub include_usage: bool,
    /// log prompt and reply text at debug level, not just lengths.
    pub log_content: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let models = vec![
            ModelOption::new("llama3.2:1b", "Llama 3.2 1B"),
            ModelOption::new("qwen2.5:1.5b", "Qwen 2.5 1.5B"),
            ModelOption::new("gemma2:2b", "Gemma 2 2B"),
        ];
        Self {
            initial_model: models[0].id.clone(),
            models,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            system_prompts: HashMap::new(),
            summarize_prompt: DEFAULT_SUMMARIZE_PROMPT.to_string(),
            mode: SessionMode::Chat,
            streaming: true,
            reconcile_final_transcript: false,
            temperature: 0.7,
            include_usage: false,
            log_content: false,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// apply `LLM_MODEL`, `LLM_STREAM`, `LLM_RECONCILE` and `LLM_TEMPERATURE`.
    pub fn with_env(self) -> Self {
        self.with_vars(|k| std::env::var(k).ok())
    }

    /// apply the `?model=` query parameter of the current page.
    #[cfg(target_arch = "wasm32")]
    pub fn with_location(self) -> Self {
        let model = web_sys::window()
            .and_then(|w| w.location().search().ok())
            .and_then(|q| web_sys::UrlSearchParams::new_with_str(&q).ok())
            .and_then(|p| p.get("model"));
        match model {
            Some(m) if !m.is_empty() => self.with_initial_model(m),
            _ => self,
        }
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(m) = var("LLM_MODEL").filter(|m| !m.is_empty()) {
            self = self.with_initial_model(m);
        }
        if let Some(v) = var("LLM_STREAM").and_then(|v| parse_flag(&v)) {
            self.streaming = v;
        }
        if let Some(v) = var("LLM_RECONCILE").and_then(|v| parse_flag(&v)) {
            self.reconcile_final_transcript = v;
        }
        if let Some(t) = var("LLM_TEMPERATURE").and_then(|v| v.parse::<f32>().ok()) {
            self.temperature = t;
        }
        self
    }

    /// select `model` at startup, adding it to the list if it is not there yet.
    pub fn with_initial_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if self.option(&model).is_none() {
            self.models.push(ModelOption::new(model.clone(), model.clone()));
        }
        self.initial_model = model;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        if self.option(&self.initial_model).is_none() {
            return Err(ConfigError::UnknownModel(self.initial_model.clone()));
        }
        Ok(())
    }

    pub fn option(&self, id: &str) -> Option<&ModelOption> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn system_prompt_for(&self, model: &str) -> &str {
        self.system_prompts
            .get(model)
            .map(String::as_str)
            .unwrap_or(&self.system_prompt)
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions { temperature: self.temperature, include_usage: self.include_usage }
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// connection settings for [`crate::provider::ProviderEngine`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// `openai` (any openai-compatible server), `ollama` or `anthropic`.
    pub backend: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            base_url: Some("http://localhost:11434".to_string()),
            api_key: None,
        }
    }
}

impl ProviderConfig {
    /// apply `LLM_BACKEND`, `LLM_BASE_URL` and `OPENAI_API_KEY`.
    pub fn with_env(mut self) -> Self {
        if let Ok(b) = std::env::var("LLM_BACKEND") {
            self.backend = b;
        }
        if let Ok(u) = std::env::var("LLM_BASE_URL") {
            self.base_url = Some(u);
        }
        if let Ok(k) = std::env::var("OPENAI_API_KEY") {
            self.api_key = Some(k).filter(|k| !k.is_empty());
        }
        self
    }

    pub fn llm_backend(&self) -> LLMBackend {
        match self.backend.to_ascii_lowercase().as_str() {
            "openai" => LLMBackend::OpenAI,
            "anthropic" => LLMBackend::Anthropic,
            _ => LLMBackend::Ollama,
        }
    }

    /// base url as the provider expects it. openai-compatible servers need
    /// the `/v1/` suffix (endpoints are joined onto it) or chat requests 404.
    pub fn normalized_base_url(&self) -> Option<String> {
        let base = self.base_url.as_deref()?.trim_end_matches('/');
        if matches!(self.llm_backend(), LLMBackend::OpenAI) {
            let base = base.strip_suffix("/v1").unwrap_or(base);
            return Some(format!("{}/v1/", base));
        }
        Some(base.to_string())
    }

    /// openai-style model listing endpoint.
    pub fn models_url(&self) -> Option<String> {
        match self.llm_backend() {
            LLMBackend::OpenAI => self.normalized_base_url().map(|b| format!("{}models", b)),
            LLMBackend::Ollama => self.normalized_base_url().map(|b| format!("{}/v1/models", b)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_is_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = SessionConfig::from_json_str(
            r#"{
                "models": [{ "id": "m1", "label": "Model One" }, { "id": "m2", "label": "Model Two" }],
                "initial_model": "m2",
                "system_prompts": { "m2": "talk like a pirate" },
                "reconcile_final_transcript": true
            }"#,
        )
        .unwrap();
        assert_eq!(c.initial_model, "m2");
        assert!(c.streaming);
        assert!(c.reconcile_final_transcript);
        assert_eq!(c.system_prompt_for("m2"), "talk like a pirate");
        assert_eq!(c.system_prompt_for("m1"), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn unknown_initial_model_is_rejected() {
        let err = SessionConfig::from_json_str(r#"{ "initial_model": "nope" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModel(m) if m == "nope"));
        let err = SessionConfig::from_json_str(r#"{ "models": [] }"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoModels));
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "mode": "summarize", "streaming": false }}"#).unwrap();
        let c = SessionConfig::from_path(f.path()).unwrap();
        assert_eq!(c.mode, SessionMode::Summarize);
        assert!(!c.streaming);
    }

    #[test]
    fn vars_override_fields() {
        let vars: HashMap<&str, &str> = [
            ("LLM_MODEL", "phi3:mini"),
            ("LLM_STREAM", "off"),
            ("LLM_RECONCILE", "1"),
            ("LLM_TEMPERATURE", "0.2"),
        ]
        .into_iter()
        .collect();
        let c = SessionConfig::default().with_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.initial_model, "phi3:mini");
        assert!(c.option("phi3:mini").is_some());
        assert!(!c.streaming);
        assert!(c.reconcile_final_transcript);
        assert_eq!(c.temperature, 0.2);
        c.validate().unwrap();
    }

    #[test]
    fn openai_base_gets_v1_prefix() {
        let p = ProviderConfig {
            backend: "openai".into(),
            base_url: Some("https://api.openai.com/".into()),
            api_key: None,
        };
        assert_eq!(p.normalized_base_url().as_deref(), Some("https://api.openai.com/v1/"));
        assert_eq!(p.models_url().as_deref(), Some("https://api.openai.com/v1/models"));
        let p = ProviderConfig { base_url: Some("http://localhost:8080/v1".into()), ..p };
        assert_eq!(p.normalized_base_url().as_deref(), Some("http://localhost:8080/v1/"));

        let p = ProviderConfig::default();
        assert_eq!(p.normalized_base_url().as_deref(), Some("http://localhost:11434"));
        assert_eq!(p.models_url().as_deref(), Some("http://localhost:11434/v1/models"));
    }
}
