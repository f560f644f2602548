use crate::config::Config;
use crate::error::{AppError, Result};
use crate::llm::CommandGenerator;
use crate::types::Host;
use tracing::{debug, warn};

/// First configured alias that appears verbatim in the request.
pub fn find_alias_in_request<'a>(request: &str, hosts: &'a [Host]) -> Option<&'a Host> {
    hosts
        .iter()
        .find(|h| !h.alias.is_empty() && request.contains(h.alias.as_str()))
}

/// Picks the target host: an explicit alias, then an alias named in the
/// request, then the generator's pick, then `default_host`.
pub fn resolve_target<'a>(
    config: &'a Config,
    request: &str,
    explicit: Option<&str>,
    generator: &dyn CommandGenerator,
) -> Result<&'a Host> {
    if let Some(alias) = explicit {
        return config
            .host(alias)
            .ok_or_else(|| AppError::UnknownHost(alias.to_string()));
    }
    if let Some(host) = find_alias_in_request(request, &config.hosts) {
        debug!(alias = %host.alias, "alias named in request");
        return Ok(host);
    }
    if !config.hosts.is_empty() {
        let aliases: Vec<String> = config.hosts.iter().map(|h| h.alias.clone()).collect();
        match generator.select_alias(request, &aliases) {
            Ok(Some(alias)) => {
                if let Some(host) = config.host(&alias) {
                    debug!(alias = %host.alias, "alias picked by generator");
                    return Ok(host);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "alias selection failed, falling back to default host"),
        }
    }
    config
        .default_host
        .as_deref()
        .and_then(|alias| config.host(alias))
        .ok_or(AppError::NoTargetHost)
}
