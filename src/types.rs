use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Exit status recorded when no remote exit status exists: the attempt failed
/// before execution, or the transport dropped mid-command.
pub const FAILURE_EXIT_STATUS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Safe,
    Risky,
}

impl RiskClass {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "safe" => Some(RiskClass::Safe),
            "risky" => Some(RiskClass::Risky),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskClass::Safe => "safe",
            RiskClass::Risky => "risky",
        }
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated generator response. Only `payload::validate` builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPayload {
    pub cmd: String,
    pub risk: RiskClass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_status: i32,
    /// stdout and stderr chunks concatenated in arrival order.
    pub transcript: String,
}

impl ExecutionResult {
    pub fn failed(transcript: String) -> Self {
        Self {
            exit_status: FAILURE_EXIT_STATUS,
            transcript,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Key,
    Password,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Key => f.write_str("key"),
            AuthMode::Password => f.write_str("password"),
        }
    }
}

/// One inventory entry. Secrets are referenced, never stored inline: a key
/// file path, or the name of an environment variable holding the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub alias: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Decrypted secret material for one attempt.
#[derive(Clone, PartialEq, Eq)]
pub enum SessionCredentials {
    KeyFile(PathBuf),
    Password(String),
}

impl SessionCredentials {
    pub fn auth_mode(&self) -> AuthMode {
        match self {
            SessionCredentials::KeyFile(_) => AuthMode::Key,
            SessionCredentials::Password(_) => AuthMode::Password,
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCredentials::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            SessionCredentials::Password(_) => f.debug_tuple("Password").field(&"***").finish(),
        }
    }
}

/// An audit record before the sink assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    pub host: String,
    pub request: String,
    pub command: String,
    pub exit_status: i32,
    pub transcript: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub id: i64,
    pub host: String,
    pub request: String,
    pub command: String,
    pub exit_status: i32,
    pub transcript: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_redacted_in_debug_output() {
        let creds = SessionCredentials::Password("hunter2".to_string());
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn host_port_defaults_to_22() {
        let host: Host = toml::from_str(
            r#"
            alias = "db1"
            hostname = "10.0.0.5"
            username = "ops"
            auth = "key"
            key_path = "/home/ops/.ssh/id_ed25519"
            "#,
        )
        .unwrap();
        assert_eq!(host.port, 22);
        assert_eq!(host.auth, AuthMode::Key);
    }

    #[test]
    fn risk_parse_is_exact() {
        assert_eq!(RiskClass::parse("safe"), Some(RiskClass::Safe));
        assert_eq!(RiskClass::parse("risky"), Some(RiskClass::Risky));
        assert_eq!(RiskClass::parse("Safe"), None);
        assert_eq!(RiskClass::parse("maybe"), None);
    }
}
