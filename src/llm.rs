use crate::config::{LlmConfig, Provider};
use crate::error::GenerationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

const COMMAND_SYSTEM_PROMPT: &str = "You are a Linux expert. Output only a JSON object with keys: cmd, risk. \
cmd must be a single shell command string. risk must be one of: safe, risky. \
Use risky for anything that deletes, stops, restarts or modifies state. Do not include any extra text.";

const ALIAS_SYSTEM_PROMPT: &str = "You are a Linux assistant. Choose the best matching host alias from the list. \
Output JSON only: {\"alias\": \"...\"}. If unsure, return an empty alias.";

/// The command-generation service. `generate` returns the raw response text;
/// nothing it says is trusted until `payload::validate` accepts it.
pub trait CommandGenerator: Send + Sync {
    fn generate(&self, request: &str, host_alias: &str) -> Result<String, GenerationError>;

    /// Picks one of `aliases` for the request, or `None` when unsure.
    fn select_alias(
        &self,
        request: &str,
        aliases: &[String],
    ) -> Result<Option<String>, GenerationError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Serialize)]
struct OllamaGenerate<'a> {
    model: &'a str,
    system: &'a str,
    prompt: String,
    format: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct AliasReply {
    #[serde(default)]
    alias: Option<String>,
}

pub struct LlmClient {
    provider: Provider,
    base_url: String,
    model: String,
    api_key_env: String,
    redact_hosts: bool,
    client: reqwest::blocking::Client,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, GenerationError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            provider: config.provider,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
            redact_hosts: config.redact_hosts,
            client,
        })
    }

    /// Read per request, so a missing key fails the attempt rather than the
    /// client.
    fn api_key(&self) -> Result<String, GenerationError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GenerationError::MissingApiKey(self.api_key_env.clone()))
    }

    pub fn has_api_key(&self) -> bool {
        self.provider == Provider::Ollama || self.api_key().is_ok()
    }

    fn complete(&self, system: &str, user: String) -> Result<String, GenerationError> {
        match self.provider {
            Provider::OpenRouter => {
                let key = self.api_key()?;
                let url = format!("{}/chat/completions", self.base_url);
                let body = ChatRequest {
                    model: &self.model,
                    messages: vec![
                        ChatMessage {
                            role: "system",
                            content: system.to_string(),
                        },
                        ChatMessage {
                            role: "user",
                            content: user,
                        },
                    ],
                };
                let resp: ChatResponse = self
                    .client
                    .post(&url)
                    .bearer_auth(key)
                    .json(&body)
                    .send()?
                    .error_for_status()?
                    .json()?;
                resp.choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| GenerationError::Malformed("no choices in response".to_string()))
            }
            Provider::Ollama => {
                let url = format!("{}/api/generate", self.base_url);
                let body = OllamaGenerate {
                    model: &self.model,
                    system,
                    prompt: user,
                    format: "json",
                    stream: false,
                };
                let resp: OllamaGenerateResponse = self
                    .client
                    .post(&url)
                    .json(&body)
                    .send()?
                    .error_for_status()?
                    .json()?;
                Ok(resp.response)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        let url = match self.provider {
            Provider::OpenRouter => format!("{}/models", self.base_url),
            Provider::Ollama => format!("{}/api/tags", self.base_url),
        };
        self.client.get(&url).send().is_ok()
    }
}

impl CommandGenerator for LlmClient {
    fn generate(&self, request: &str, host_alias: &str) -> Result<String, GenerationError> {
        let request = if self.redact_hosts {
            redact_hosts(request, host_alias)
        } else {
            request.to_string()
        };
        tracing::debug!(host = host_alias, "requesting command");
        self.complete(
            COMMAND_SYSTEM_PROMPT,
            format!("Target: {host_alias}. Task: {request}"),
        )
    }

    fn select_alias(
        &self,
        request: &str,
        aliases: &[String],
    ) -> Result<Option<String>, GenerationError> {
        let request = if self.redact_hosts {
            redact_hosts(request, "HOST_ALIAS")
        } else {
            request.to_string()
        };
        let content = self.complete(
            ALIAS_SYSTEM_PROMPT,
            format!("Aliases: {aliases:?}. Task: {request}"),
        )?;
        parse_alias_reply(&content, aliases)
    }
}

fn parse_alias_reply(
    content: &str,
    aliases: &[String],
) -> Result<Option<String>, GenerationError> {
    let reply: AliasReply = serde_json::from_str(content.trim())
        .map_err(|e| GenerationError::Malformed(format!("alias reply is not JSON: {e}")))?;
    Ok(reply
        .alias
        .map(|a| a.trim().to_string())
        .filter(|a| aliases.contains(a)))
}

fn host_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 pattern"),
            Regex::new(r"\b(?:[0-9a-fA-F]{0,4}:){2,7}[0-9a-fA-F]{0,4}\b").expect("ipv6 pattern"),
            Regex::new(r"\b(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}\b").expect("domain pattern"),
        ]
    })
}

/// Replaces IP addresses and domain names in `text` with `alias`.
pub fn redact_hosts(text: &str, alias: &str) -> String {
    let mut redacted = text.to_string();
    for re in host_patterns() {
        redacted = re
            .replace_all(&redacted, regex::NoExpand(alias))
            .into_owned();
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_addresses_and_domains() {
        let text = "check 10.0.0.5 and db.internal.example.com and fe80::1:2";
        let redacted = redact_hosts(text, "db1");
        assert!(!redacted.contains("10.0.0.5"));
        assert!(!redacted.contains("example.com"));
        assert!(!redacted.contains("fe80"));
        assert!(redacted.starts_with("check db1 and db1"));
    }

    #[test]
    fn leaves_plain_requests_alone() {
        assert_eq!(redact_hosts("check disk space", "db1"), "check disk space");
    }

    #[test]
    fn alias_reply_must_name_a_known_alias() {
        let aliases = vec!["db1".to_string(), "web".to_string()];
        assert_eq!(
            parse_alias_reply(r#"{"alias": "web"}"#, &aliases).unwrap(),
            Some("web".to_string())
        );
        assert_eq!(parse_alias_reply(r#"{"alias": ""}"#, &aliases).unwrap(), None);
        assert_eq!(parse_alias_reply(r#"{"alias": "mail"}"#, &aliases).unwrap(), None);
        assert_eq!(parse_alias_reply("{}", &aliases).unwrap(), None);
        assert!(parse_alias_reply("web", &aliases).is_err());
    }

    #[test]
    fn missing_api_key_fails_generation_not_construction() {
        let config = LlmConfig {
            api_key_env: "OPSH_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmConfig::default()
        };
        let client = LlmClient::new(&config).unwrap();
        assert!(!client.has_api_key());
        assert!(matches!(
            client.generate("check disk space", "db1"),
            Err(GenerationError::MissingApiKey(_))
        ));
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = LlmConfig {
            provider: Provider::Ollama,
            endpoint: "http://localhost:11434/".to_string(),
            ..LlmConfig::default()
        };
        let client = LlmClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
    }
}
