use crate::confirm::{self, Confirmer, Decision};
use crate::credentials::CredentialStore;
use crate::db::AuditSink;
use crate::error::{AttemptError, SshError};
use crate::llm::CommandGenerator;
use crate::payload;
use crate::safety;
use crate::ssh::RemoteExecutor;
use crate::types::{
    ExecutionResult, Host, NewAttempt, RiskClass, SessionCredentials, FAILURE_EXIT_STATUS,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

const DECLINED_TRANSCRIPT: &str = "declined by operator";
const NO_EXIT_STATUS_NOTE: &str = "execution error: no exit status received from the remote command";

/// Receives live output of one attempt.
pub trait OutputSink: Send {
    /// Called with the whole transcript so far, every time it grows.
    fn update(&self, transcript: &str);

    /// Called exactly once with the final result of the execution stage.
    fn finish(&self, _result: &ExecutionResult) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Output(String),
    Finished(ExecutionResult),
}

/// Forwards progress over a channel so the caller can render it however it
/// likes.
pub struct ChannelSink(mpsc::Sender<ProgressEvent>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self(tx), rx)
    }
}

impl OutputSink for ChannelSink {
    fn update(&self, transcript: &str) {
        let _ = self.0.send(ProgressEvent::Output(transcript.to_string()));
    }

    fn finish(&self, result: &ExecutionResult) {
        let _ = self.0.send(ProgressEvent::Finished(result.clone()));
    }
}

#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub host: Host,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub result: ExecutionResult,
    /// `None` when the audit write itself failed.
    pub record_id: Option<i64>,
}

pub struct ExecutionHandle {
    pub command: String,
    pub risk: RiskClass,
    handle: JoinHandle<ExecutionReport>,
}

impl ExecutionHandle {
    pub fn join(self) -> ExecutionReport {
        self.handle.join().unwrap_or_else(|_| ExecutionReport {
            result: ExecutionResult::failed("execution unit aborted".to_string()),
            record_id: None,
        })
    }
}

pub enum AttemptOutcome {
    /// Stopped before execution; the failure is already audited.
    Failed {
        error: AttemptError,
        record_id: Option<i64>,
    },
    Declined {
        command: String,
        record_id: Option<i64>,
    },
    /// Running on its own thread, which writes the audit record when done.
    Dispatched(ExecutionHandle),
}

pub struct Orchestrator {
    generator: Arc<dyn CommandGenerator>,
    credentials: Arc<dyn CredentialStore>,
    executor: Arc<dyn RemoteExecutor>,
    audit: Arc<dyn AuditSink>,
    record_declined: bool,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn CommandGenerator>,
        credentials: Arc<dyn CredentialStore>,
        executor: Arc<dyn RemoteExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            generator,
            credentials,
            executor,
            audit,
            record_declined: false,
        }
    }

    pub fn record_declined(mut self, record: bool) -> Self {
        self.record_declined = record;
        self
    }

    /// Runs one attempt. Every path except a plain decline ends in exactly one
    /// audit record: written here for failures up to credential lookup, and
    /// by the execution thread once it is dispatched.
    pub fn drive(
        &self,
        request: &AttemptRequest,
        confirmer: &dyn Confirmer,
        sink: Box<dyn OutputSink>,
    ) -> AttemptOutcome {
        let host = &request.host;

        let raw = match self.generator.generate(&request.text, &host.alias) {
            Ok(raw) => raw,
            Err(e) => return self.fail(request, String::new(), e.into(), None),
        };

        let payload = match payload::validate(&raw) {
            Ok(payload) => payload,
            Err(e) => return self.fail(request, String::new(), e.into(), Some(&raw)),
        };

        let risk = safety::classify_payload(&payload);
        info!(host = %host.alias, command = %payload.cmd, %risk, "command generated");

        if confirm::await_decision(risk, &payload.cmd, confirmer) == Decision::Decline {
            info!(host = %host.alias, "attempt declined");
            let record_id = if self.record_declined {
                self.record(&NewAttempt {
                    host: host.alias.clone(),
                    request: request.text.clone(),
                    command: payload.cmd.clone(),
                    exit_status: FAILURE_EXIT_STATUS,
                    transcript: DECLINED_TRANSCRIPT.to_string(),
                })
            } else {
                None
            };
            return AttemptOutcome::Declined {
                command: payload.cmd,
                record_id,
            };
        }

        let credentials = match self.credentials.credentials(host) {
            Ok(credentials) => credentials,
            Err(e) => return self.fail(request, payload.cmd, e.into(), None),
        };

        self.dispatch(request, payload.cmd, risk, credentials, sink)
    }

    fn dispatch(
        &self,
        request: &AttemptRequest,
        command: String,
        risk: RiskClass,
        credentials: SessionCredentials,
        sink: Box<dyn OutputSink>,
    ) -> AttemptOutcome {
        let executor = Arc::clone(&self.executor);
        let audit = Arc::clone(&self.audit);
        let owned_request = request.clone();
        let owned_command = command.clone();

        let spawned = thread::Builder::new()
            .name(format!("attempt-{}", request.host.alias))
            .spawn(move || {
                execute_attempt(
                    executor.as_ref(),
                    audit.as_ref(),
                    &owned_request,
                    &owned_command,
                    &credentials,
                    sink.as_ref(),
                )
            });

        match spawned {
            Ok(handle) => AttemptOutcome::Dispatched(ExecutionHandle {
                command,
                risk,
                handle,
            }),
            Err(e) => {
                let error = SshError::Execution(format!("cannot start execution thread: {e}"));
                self.fail(request, command, error.into(), None)
            }
        }
    }

    fn fail(
        &self,
        request: &AttemptRequest,
        command: String,
        error: AttemptError,
        raw_response: Option<&str>,
    ) -> AttemptOutcome {
        warn!(host = %request.host.alias, error = %error, "attempt failed");
        let mut transcript = error.to_string();
        if let Some(raw) = raw_response {
            transcript.push_str("\nraw response: ");
            transcript.push_str(raw);
        }
        let record_id = self.record(&NewAttempt {
            host: request.host.alias.clone(),
            request: request.text.clone(),
            command,
            exit_status: FAILURE_EXIT_STATUS,
            transcript,
        });
        AttemptOutcome::Failed { error, record_id }
    }

    fn record(&self, attempt: &NewAttempt) -> Option<i64> {
        append_logged(self.audit.as_ref(), attempt)
    }
}

fn append_logged(audit: &dyn AuditSink, attempt: &NewAttempt) -> Option<i64> {
    match audit.append(attempt) {
        Ok(id) => Some(id),
        Err(e) => {
            error!(host = %attempt.host, error = %e, "failed to write audit record");
            None
        }
    }
}

fn execute_attempt(
    executor: &dyn RemoteExecutor,
    audit: &dyn AuditSink,
    request: &AttemptRequest,
    command: &str,
    credentials: &SessionCredentials,
    sink: &dyn OutputSink,
) -> ExecutionReport {
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        executor.run(&request.host, credentials, command, &mut |transcript: &str| {
            sink.update(transcript)
        })
    }));

    let (result, audit_transcript) = match run {
        Ok(Ok(result)) if result.exit_status == FAILURE_EXIT_STATUS => {
            let mut annotated = result.transcript.clone();
            if !annotated.is_empty() && !annotated.ends_with('\n') {
                annotated.push('\n');
            }
            annotated.push_str(NO_EXIT_STATUS_NOTE);
            (result, annotated)
        }
        Ok(Ok(result)) => {
            let transcript = result.transcript.clone();
            (result, transcript)
        }
        Ok(Err(e)) => {
            warn!(host = %request.host.alias, error = %e, "remote execution failed");
            let result = ExecutionResult::failed(e.to_string());
            let transcript = result.transcript.clone();
            (result, transcript)
        }
        Err(_) => {
            error!(host = %request.host.alias, "remote execution panicked");
            let result = ExecutionResult::failed("execution aborted unexpectedly".to_string());
            let transcript = result.transcript.clone();
            (result, transcript)
        }
    };

    info!(host = %request.host.alias, exit_status = result.exit_status, "attempt finished");
    let record_id = append_logged(
        audit,
        &NewAttempt {
            host: request.host.alias.clone(),
            request: request.text.clone(),
            command: command.to_string(),
            exit_status: result.exit_status,
            transcript: audit_transcript,
        },
    );
    sink.finish(&result);
    ExecutionReport { result, record_id }
}
