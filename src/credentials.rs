use crate::error::CredentialError;
use crate::types::{AuthMode, Host, SessionCredentials};
use std::path::{Path, PathBuf};

/// Supplies the secret material for one host, matching its auth mode.
pub trait CredentialStore: Send + Sync {
    fn credentials(&self, host: &Host) -> Result<SessionCredentials, CredentialError>;
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves credentials from the host inventory: key auth reads the
/// configured key file path, password auth reads the environment variable the
/// host names.
pub struct InventoryCredentials {
    env: EnvLookup,
}

impl InventoryCredentials {
    pub fn new() -> Self {
        Self::with_env(|name| std::env::var(name).ok())
    }

    pub fn with_env(env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self { env: Box::new(env) }
    }
}

impl Default for InventoryCredentials {
    fn default() -> Self {
        Self::new()
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl CredentialStore for InventoryCredentials {
    fn credentials(&self, host: &Host) -> Result<SessionCredentials, CredentialError> {
        match host.auth {
            AuthMode::Key => {
                let path = host
                    .key_path
                    .as_deref()
                    .map(expand_home)
                    .ok_or_else(|| CredentialError::MissingKeyPath(host.alias.clone()))?;
                if std::fs::File::open(&path).is_err() {
                    return Err(CredentialError::KeyFileUnreadable(path));
                }
                Ok(SessionCredentials::KeyFile(path))
            }
            AuthMode::Password => {
                let var = host
                    .password_env
                    .as_deref()
                    .ok_or_else(|| CredentialError::MissingPasswordEnv(host.alias.clone()))?;
                (self.env)(var)
                    .filter(|p| !p.is_empty())
                    .map(SessionCredentials::Password)
                    .ok_or_else(|| CredentialError::PasswordUnset(var.to_string()))
            }
        }
    }
}
