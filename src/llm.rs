use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::AuditError;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").expect("static regex")
});

pub trait LanguageModel: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, AuditError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints.
///
/// One `ureq::Agent` is kept for the whole run so keep-alive connections are
/// reused across sessions and threads.
pub struct ChatClient {
    agent: ureq::Agent,
    settings: ChatSettings,
}

impl ChatClient {
    pub fn new(settings: ChatSettings) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self { agent, settings }
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn endpoint(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

impl LanguageModel for ChatClient {
    fn complete(&self, prompt: &str) -> Result<String, AuditError> {
        let body = json!({
            "model": self.settings.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
        });

        let mut request = self.agent.post(&self.endpoint());
        if let Some(key) = &self.settings.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        let response = match request.send_json(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                let reason = format!("status={code} body={}", detail.trim());
                return Err(if code == 429 || code >= 500 {
                    AuditError::transient("llm", reason)
                } else {
                    AuditError::Llm { reason }
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(AuditError::transient("llm", transport.to_string()));
            }
        };

        let payload: serde_json::Value = response
            .into_json()
            .map_err(|error| AuditError::malformed(format!("response is not json: {error}")))?;

        let content = payload["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .unwrap_or_default()
            .to_string();

        if content.trim().is_empty() {
            return Err(AuditError::malformed("model returned an empty completion"));
        }

        debug!(model = %self.settings.model, chars = content.len(), "llm completion received");
        Ok(content)
    }
}

/// Strips markdown fences and surrounding chatter so the JSON object can be parsed.
pub fn extract_json_object(raw: &str) -> &str {
    let unfenced = CODE_FENCE
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map_or(raw, |body| body.as_str());

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> ChatClient {
        ChatClient::new(ChatSettings {
            base_url: base_url.to_string(),
            model: "test-model".to_string(),
            temperature: 0.0,
            max_tokens: 256,
            timeout: Duration::from_secs(1),
            api_key: None,
        })
    }

    #[test]
    fn endpoint_accepts_common_base_url_shapes() {
        assert_eq!(
            client("http://127.0.0.1:1234/v1").endpoint(),
            "http://127.0.0.1:1234/v1/chat/completions"
        );
        assert_eq!(
            client("http://127.0.0.1:1234/").endpoint(),
            "http://127.0.0.1:1234/v1/chat/completions"
        );
        assert_eq!(
            client("https://api.example.test/v1/chat/completions").endpoint(),
            "https://api.example.test/v1/chat/completions"
        );
    }

    #[test]
    fn extract_json_object_handles_fences_and_chatter() {
        assert_eq!(
            extract_json_object("```json\n{\"status\": \"PRESENT\"}\n```"),
            "{\"status\": \"PRESENT\"}"
        );
        assert_eq!(
            extract_json_object("Sure! Here it is: {\"a\": 1} hope that helps"),
            "{\"a\": 1}"
        );
        assert_eq!(extract_json_object("  no json here "), "no json here");
    }
}
