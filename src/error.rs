use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generator returned an unexpected response: {0}")]
    Malformed(String),

    #[error("environment variable {0} holding the generator api key is not set")]
    MissingApiKey(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("response is not valid JSON: {0}")]
    NotJson(String),

    #[error("response is not a JSON object")]
    NotObject,

    #[error("response is missing a non-empty `cmd`")]
    MissingCmd,

    #[error("response is missing `risk` or it is not one of safe, risky")]
    InvalidRisk,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("host {0} uses key auth but has no key_path")]
    MissingKeyPath(String),

    #[error("key file {} is not readable", .0.display())]
    KeyFileUnreadable(PathBuf),

    #[error("host {0} uses password auth but has no password_env")]
    MissingPasswordEnv(String),

    #[error("environment variable {0} holding the password is not set")]
    PasswordUnset(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SshError {
    #[error("ssh connection error: {0}")]
    Connection(String),

    #[error("ssh authentication rejected: {0}")]
    Auth(String),

    #[error("ssh execution error: {0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("audit database lock poisoned")]
    Poisoned,
}

/// Why an attempt stopped before producing a remote exit status.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("invalid generator response: {0}")]
    Validation(#[from] ValidationError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Remote(#[from] SshError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error("unknown host alias: {0}")]
    UnknownHost(String),

    #[error("no target host: name one with --host, in the request, or set default_host")]
    NoTargetHost,
}

pub type Result<T> = std::result::Result<T, AppError>;
