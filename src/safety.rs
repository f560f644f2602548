use crate::types::{CommandPayload, RiskClass};

/// Lowercase fragments that mark a command as destructive or disruptive.
/// Matched as plain substrings, so `pkill` and `skill` count too.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "rm ",
    "rmdir",
    "kill",
    "shutdown",
    "reboot",
    "poweroff",
    "halt",
    "mkfs",
    "dd if=",
    "docker stop",
    "docker kill",
    "systemctl stop",
];

pub fn is_destructive(cmd: &str) -> bool {
    let lowered = cmd.to_lowercase();
    DESTRUCTIVE_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Keyword match beats the declared risk, an unknown declared risk is risky,
/// and only then is the declared value trusted.
pub fn classify(cmd: &str, declared_risk: &str) -> RiskClass {
    if is_destructive(cmd) {
        return RiskClass::Risky;
    }
    RiskClass::parse(declared_risk).unwrap_or(RiskClass::Risky)
}

pub fn classify_payload(payload: &CommandPayload) -> RiskClass {
    classify(&payload.cmd, payload.risk.as_str())
}
