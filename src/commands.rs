use crate::config::{save_config, Config};
use crate::confirm::{Confirmer, DeclineAll, TerminalConfirmer};
use crate::credentials::InventoryCredentials;
use crate::db::SqliteAuditLog;
use crate::error::Result;
use crate::hosts::resolve_target;
use crate::llm::LlmClient;
use crate::orchestrator::{
    AttemptOutcome, AttemptRequest, ChannelSink, ExecutionHandle, Orchestrator, ProgressEvent,
};
use crate::ssh::SshExecutor;
use crate::types::{AuthMode, ExecutionResult, RiskClass, FAILURE_EXIT_STATUS};
use chrono::{Local, TimeZone};
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::{env, fs, process::Command};
use tracing::debug;

/// Runs one request end to end. Returns the process exit code.
pub fn cmd_run(config: &Config, request: &str, host: Option<&str>, no_input: bool) -> Result<i32> {
    let generator = Arc::new(LlmClient::new(&config.llm)?);
    let target = resolve_target(config, request, host, generator.as_ref())?.clone();
    let audit = Arc::new(SqliteAuditLog::open(&config.audit_path())?);

    let orchestrator = Orchestrator::new(
        generator,
        Arc::new(InventoryCredentials::new()),
        Arc::new(SshExecutor::new(config.ssh.clone())),
        audit,
    )
    .record_declined(config.audit.record_declined);

    let confirmer: Box<dyn Confirmer> = if no_input || !std::io::stdin().is_terminal() {
        Box::new(DeclineAll)
    } else {
        Box::new(TerminalConfirmer)
    };

    let (sink, events) = ChannelSink::new();
    let attempt = AttemptRequest {
        host: target,
        text: request.to_string(),
    };

    eprint!("thinking...");
    std::io::stderr().flush().ok();
    let outcome = orchestrator.drive(&attempt, confirmer.as_ref(), Box::new(sink));
    eprint!("\r           \r");

    match outcome {
        AttemptOutcome::Failed { error, record_id } => {
            debug!(?record_id, "failed attempt recorded");
            Err(error.into())
        }
        AttemptOutcome::Declined { command, record_id } => {
            debug!(?record_id, "declined attempt");
            println!("  {}", command);
            println!("cancelled.");
            Ok(1)
        }
        AttemptOutcome::Dispatched(handle) => {
            let marker = match handle.risk {
                RiskClass::Safe => "$",
                RiskClass::Risky => "!",
            };
            println!("[{}] {} {}", attempt.host.alias, marker, handle.command);
            Ok(stream_until_done(handle, events))
        }
    }
}

fn stream_until_done(handle: ExecutionHandle, events: Receiver<ProgressEvent>) -> i32 {
    let mut stdout = std::io::stdout();
    let mut printed = 0;
    let mut finished: Option<ExecutionResult> = None;

    for event in events.iter() {
        match event {
            ProgressEvent::Output(transcript) => {
                if let Some(delta) = transcript.get(printed..) {
                    print!("{}", delta);
                    stdout.flush().ok();
                }
                printed = transcript.len();
            }
            ProgressEvent::Finished(result) => {
                finished = Some(result);
                break;
            }
        }
    }

    let report = handle.join();
    if report.record_id.is_none() {
        eprintln!("warning: attempt was not written to the audit log");
    }
    let result = finished.unwrap_or(report.result);
    if printed > 0 && !result.transcript.ends_with('\n') {
        println!();
    }

    if result.exit_status == FAILURE_EXIT_STATUS {
        if printed == 0 {
            eprintln!("{}", result.transcript);
        }
        eprintln!("error: no exit status from remote command");
        1
    } else if result.succeeded() {
        0
    } else {
        eprintln!("exit status {}", result.exit_status);
        result.exit_status.clamp(1, 255)
    }
}

pub fn cmd_history(config: &Config, limit: usize, full: bool) -> Result<()> {
    let db_path = config.audit_path();

    if !db_path.exists() {
        println!("no history yet.");
        return Ok(());
    }

    let audit = SqliteAuditLog::open(&db_path)?;
    let records = audit.recent(limit)?;

    if records.is_empty() {
        println!("no history yet.");
        return Ok(());
    }

    for record in &records {
        let status = if record.exit_status == 0 { "+" } else { "x" };
        let when = Local
            .timestamp_opt(record.created_at, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| record.created_at.to_string());

        println!("{} #{} {} [{}] {}", status, record.id, when, record.host, record.request);
        if !record.command.is_empty() {
            println!("    $ {}  (exit {})", record.command, record.exit_status);
        }
        if full || record.command.is_empty() {
            for line in record.transcript.lines() {
                println!("    | {}", line);
            }
        }
        println!();
    }

    Ok(())
}

pub fn cmd_hosts(config: &Config) -> Result<()> {
    if config.hosts.is_empty() {
        println!("no hosts configured. add [[hosts]] entries with 'opsh config'.");
        return Ok(());
    }

    for host in &config.hosts {
        let marker = if config.default_host.as_deref() == Some(host.alias.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<12} {}@{}:{}  ({})",
            marker, host.alias, host.username, host.hostname, host.port, host.auth
        );
    }

    Ok(())
}

pub fn cmd_doctor(config: &Config, config_path: &Path) -> Result<()> {
    println!("diagnostics:");
    println!();

    print!("  generator ({}) ... ", config.llm.model);
    std::io::stdout().flush().ok();
    match LlmClient::new(&config.llm) {
        Ok(client) if !client.has_api_key() => {
            println!("failed");
            println!("    set {} to the api key", config.llm.api_key_env);
        }
        Ok(client) if client.is_available() => println!("ok"),
        Ok(_) => {
            println!("failed");
            println!("    url: {}", config.llm.endpoint);
        }
        Err(e) => {
            println!("failed");
            println!("    error: {}", e);
        }
    }

    print!("  ssh ... ");
    std::io::stdout().flush().ok();
    if binary_responds("ssh") {
        println!("ok");
    } else {
        println!("not found");
        println!("    install an OpenSSH client");
    }

    if config.hosts.iter().any(|h| h.auth == AuthMode::Password) {
        print!("  sshpass ... ");
        std::io::stdout().flush().ok();
        if binary_responds("sshpass") {
            println!("ok");
        } else {
            println!("not found");
            println!("    password hosts need sshpass on PATH");
        }
    }

    let db_path = config.audit_path();
    print!("  audit log ... ");
    std::io::stdout().flush().ok();
    if db_path.exists() {
        match SqliteAuditLog::open(&db_path).and_then(|log| log.count()) {
            Ok(count) => println!("ok ({} attempts)", count),
            Err(e) => {
                println!("failed");
                println!("    error: {}", e);
            }
        }
    } else {
        println!("empty");
    }

    print!("  config ... ");
    std::io::stdout().flush().ok();
    if config_path.exists() {
        println!("ok ({} hosts)", config.hosts.len());
    } else {
        println!("using defaults");
    }

    println!();
    Ok(())
}

fn binary_responds(program: &str) -> bool {
    Command::new(program)
        .arg("-V")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}

pub fn cmd_config(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        save_config(&Config::default(), config_path)?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    Command::new(&editor).arg(config_path).status()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::types::Host;

    #[test]
    fn run_without_api_key_is_audited_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.llm.api_key_env = "OPSH_TEST_RUN_KEY_NEVER_SET".to_string();
        config.audit.path = Some(dir.path().join("audit.db"));
        config.hosts.push(Host {
            alias: "db1".to_string(),
            hostname: "10.0.0.5".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: AuthMode::Key,
            key_path: None,
            password_env: None,
        });

        let result = cmd_run(&config, "check disk space", Some("db1"), true);
        assert!(matches!(result, Err(AppError::Attempt(_))));

        let records = SqliteAuditLog::open(&config.audit_path())
            .unwrap()
            .recent(10)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host, "db1");
        assert_eq!(records[0].command, "");
        assert_eq!(records[0].exit_status, FAILURE_EXIT_STATUS);
        assert!(records[0].transcript.contains("OPSH_TEST_RUN_KEY_NEVER_SET"));
    }
}
