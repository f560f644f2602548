use crate::config::SshConfig;
use crate::error::SshError;
use crate::types::{ExecutionResult, Host, SessionCredentials};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 4096;
/// OpenSSH reports its own failures with 255.
const SSH_CLIENT_FAILURE: i32 = 255;
/// sshpass exit codes for a rejected password and an unknown host key.
const SSHPASS_BAD_PASSWORD: i32 = 5;
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPoll {
    Data(OutputStream, String),
    /// Nothing arrived within the wait.
    Idle,
    /// Both streams reached end of file.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    Pending,
    Exited(i32),
    /// The channel went away without delivering an exit status.
    Lost(String),
}

/// One remote command's output streams and exit status.
pub trait ExecChannel {
    /// Waits at most `wait` for the next chunk from either stream.
    fn poll_output(&mut self, wait: Duration) -> ChannelPoll;
    fn exit_state(&mut self) -> ExitState;
    fn terminate(&mut self);
}

/// Runs one command on one host and reports the cumulative transcript through
/// `on_output` as it grows.
pub trait RemoteExecutor: Send + Sync {
    fn run(
        &self,
        host: &Host,
        credentials: &SessionCredentials,
        command: &str,
        on_output: &mut dyn FnMut(&str),
    ) -> Result<ExecutionResult, SshError>;
}

/// Polls `channel` until the exit status is known and both streams are
/// drained. An exit status alone does not end the loop: the remote side may
/// still flush output after it.
pub fn drain_channel(
    channel: &mut dyn ExecChannel,
    poll_interval: Duration,
    deadline: Option<Duration>,
    on_output: &mut dyn FnMut(&str),
) -> ExecutionResult {
    let started = Instant::now();
    let mut transcript = String::new();
    let mut streams_open = true;
    let mut status: Option<ExitState> = None;

    loop {
        if streams_open {
            match channel.poll_output(poll_interval) {
                ChannelPoll::Data(stream, chunk) => {
                    trace!(?stream, bytes = chunk.len(), "remote output");
                    transcript.push_str(&chunk);
                    on_output(&transcript);
                }
                ChannelPoll::Idle => {}
                ChannelPoll::Closed => streams_open = false,
            }
        }

        if status.is_none() {
            match channel.exit_state() {
                ExitState::Pending => {}
                state => status = Some(state),
            }
        }

        if !streams_open {
            match status {
                Some(ExitState::Exited(code)) => {
                    return ExecutionResult {
                        exit_status: code,
                        transcript,
                    };
                }
                Some(ExitState::Lost(ref reason)) => {
                    warn!(%reason, "channel closed before exit status");
                    return ExecutionResult::failed(transcript);
                }
                _ => {}
            }
        }

        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                warn!(secs = limit.as_secs(), "remote command timed out, terminating");
                channel.terminate();
                return ExecutionResult::failed(transcript);
            }
        }

        // With the streams open, poll_output already waited.
        if !streams_open {
            thread::sleep(poll_interval);
        }
    }
}

/// Decodes a byte stream chunk by chunk without splitting multibyte
/// characters across chunks.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Invalid bytes mid-stream: replace them, keep going.
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Truncated character at the end: wait for the rest.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut source: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        let mut carry = Utf8Carry::default();
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = carry.decode(&buf[..n]);
                    if !text.is_empty() && tx.send((stream, text)).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(?stream, error = %e, "stream read failed");
                    break;
                }
            }
        }
        let tail = carry.finish();
        if !tail.is_empty() {
            let _ = tx.send((stream, tail));
        }
    })
}

/// A local client process whose stdout and stderr carry the remote streams.
pub struct ProcessChannel {
    child: Child,
    rx: Receiver<(OutputStream, String)>,
}

impl ProcessChannel {
    pub fn spawn(mut cmd: Command) -> std::io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, tx.clone());
        }
        drop(tx);

        Ok(Self { child, rx })
    }
}

impl ExecChannel for ProcessChannel {
    fn poll_output(&mut self, wait: Duration) -> ChannelPoll {
        match self.rx.recv_timeout(wait) {
            Ok((stream, chunk)) => ChannelPoll::Data(stream, chunk),
            Err(RecvTimeoutError::Timeout) => ChannelPoll::Idle,
            Err(RecvTimeoutError::Disconnected) => ChannelPoll::Closed,
        }
    }

    fn exit_state(&mut self) -> ExitState {
        match self.child.try_wait() {
            Ok(None) => ExitState::Pending,
            Ok(Some(status)) => match status.code() {
                Some(SSH_CLIENT_FAILURE) => {
                    ExitState::Lost("ssh client exited with status 255".to_string())
                }
                Some(code) => ExitState::Exited(code),
                None => ExitState::Lost("ssh client terminated by signal".to_string()),
            },
            Err(e) => ExitState::Lost(e.to_string()),
        }
    }

    fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.terminate();
        }
    }
}

fn control_path(dir: &Path, host: &Host) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    format!("{}@{}:{}", host.username, host.hostname, host.port).hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    dir.join(format!("opsh-{:x}", hasher.finish()))
}

fn ensure_control_dir(dir: &Path) -> Result<(), SshError> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| {
        SshError::Connection(format!(
            "cannot create control directory {}: {e}",
            dir.display()
        ))
    })
}

/// Maps a failed session setup to an auth or connection error.
fn classify_open_failure(exit_code: Option<i32>, stderr: &str, via_sshpass: bool) -> SshError {
    let stderr = stderr.trim();
    if via_sshpass && exit_code == Some(SSHPASS_BAD_PASSWORD) {
        return SshError::Auth("password rejected".to_string());
    }
    if via_sshpass && exit_code == Some(SSHPASS_HOST_KEY_UNKNOWN) {
        return SshError::Connection("host key is unknown".to_string());
    }
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission denied")
        || lowered.contains("authentication failed")
        || lowered.contains("too many authentication failures")
    {
        return SshError::Auth(stderr.to_string());
    }
    if stderr.is_empty() {
        let code = exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return SshError::Connection(format!("ssh exited with status {code}"));
    }
    SshError::Connection(stderr.to_string())
}

/// An authenticated connection to one host, held by an OpenSSH control
/// master. Commands run over it without authenticating again.
pub struct SshSession {
    master: Child,
    control_path: PathBuf,
    destination: String,
    port: u16,
    config: SshConfig,
}

impl SshSession {
    pub fn open(
        host: &Host,
        credentials: &SessionCredentials,
        config: &SshConfig,
    ) -> Result<Self, SshError> {
        let dir = config.control_dir();
        ensure_control_dir(&dir)?;
        let control_path = control_path(&dir, host);
        let destination = format!("{}@{}", host.username, host.hostname);

        let via_sshpass = matches!(credentials, SessionCredentials::Password(_));
        let mut cmd = match credentials {
            SessionCredentials::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            SessionCredentials::KeyFile(_) => Command::new("ssh"),
        };
        cmd.arg("-M")
            .arg("-N")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                config.connect_timeout().as_secs()
            ))
            .arg("-o")
            .arg(format!(
                "StrictHostKeyChecking={}",
                config.strict_host_key_checking
            ))
            .arg("-p")
            .arg(host.port.to_string());
        match credentials {
            SessionCredentials::KeyFile(path) => {
                cmd.arg("-i")
                    .arg(path)
                    .arg("-o")
                    .arg("IdentitiesOnly=yes")
                    .arg("-o")
                    .arg("BatchMode=yes");
            }
            SessionCredentials::Password(_) => {
                cmd.arg("-o")
                    .arg("PreferredAuthentications=password,keyboard-interactive")
                    .arg("-o")
                    .arg("PubkeyAuthentication=no")
                    .arg("-o")
                    .arg("NumberOfPasswordPrompts=1");
            }
        }
        cmd.arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(host = %host.alias, auth = %credentials.auth_mode(), "opening ssh session");
        let mut master = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                let program = if via_sshpass { "sshpass" } else { "ssh" };
                SshError::Connection(format!("{program} is not installed"))
            } else {
                SshError::Connection(format!("failed to launch ssh: {e}"))
            }
        })?;

        // The control socket appears once the master has authenticated.
        let setup_limit = config.connect_timeout() * 3;
        let started = Instant::now();
        loop {
            match master.try_wait() {
                Ok(Some(status)) => {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = master.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr);
                    }
                    return Err(classify_open_failure(status.code(), &stderr, via_sshpass));
                }
                Ok(None) => {}
                Err(e) => return Err(SshError::Connection(e.to_string())),
            }
            if control_path.exists() {
                break;
            }
            if started.elapsed() >= setup_limit {
                let _ = master.kill();
                let _ = master.wait();
                return Err(SshError::Connection(format!(
                    "session setup timed out after {}s",
                    setup_limit.as_secs()
                )));
            }
            thread::sleep(config.poll_interval());
        }

        debug!(host = %host.alias, "ssh session established");
        Ok(Self {
            master,
            control_path,
            destination,
            port: host.port,
            config: config.clone(),
        })
    }

    /// Opens one exec channel (no login shell, no tty) for `command`.
    pub fn execute(
        &self,
        command: &str,
        on_output: &mut dyn FnMut(&str),
    ) -> Result<ExecutionResult, SshError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-T")
            .arg("-p")
            .arg(self.port.to_string())
            .arg(&self.destination)
            .arg(command);

        let mut channel = ProcessChannel::spawn(cmd)
            .map_err(|e| SshError::Execution(format!("failed to open exec channel: {e}")))?;
        Ok(drain_channel(
            &mut channel,
            self.config.poll_interval(),
            self.config.command_timeout(),
            on_output,
        ))
    }
}

/// Asks the control master to exit. With sshpass in front, killing the child
/// only kills the wrapper, so the master has to be told directly.
fn request_master_exit(control_path: &Path, port: u16, destination: &str) -> bool {
    Command::new("ssh")
        .arg("-o")
        .arg(format!("ControlPath={}", control_path.display()))
        .arg("-O")
        .arg("exit")
        .arg("-p")
        .arg(port.to_string())
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Stops `master`, politely first: when `request_exit` succeeds the process
/// gets `grace` to go away on its own before it is killed.
fn shutdown_master(
    master: &mut Child,
    grace: Duration,
    poll: Duration,
    request_exit: impl FnOnce() -> bool,
) -> Option<ExitStatus> {
    if let Ok(Some(status)) = master.try_wait() {
        return Some(status);
    }
    if request_exit() {
        let started = Instant::now();
        while started.elapsed() < grace {
            match master.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => thread::sleep(poll),
                Err(_) => break,
            }
        }
        debug!("control master ignored exit request, killing it");
    }
    let _ = master.kill();
    master.wait().ok()
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let grace = self.config.connect_timeout();
        let poll = self.config.poll_interval();
        shutdown_master(&mut self.master, grace, poll, || {
            request_master_exit(&self.control_path, self.port, &self.destination)
        });
        let _ = std::fs::remove_file(&self.control_path);
        debug!(destination = %self.destination, "ssh session closed");
    }
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

impl RemoteExecutor for SshExecutor {
    fn run(
        &self,
        host: &Host,
        credentials: &SessionCredentials,
        command: &str,
        on_output: &mut dyn FnMut(&str),
    ) -> Result<ExecutionResult, SshError> {
        let session = SshSession::open(host, credentials, &self.config)?;
        session.execute(command, on_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FAILURE_EXIT_STATUS;
    use std::collections::VecDeque;

    struct ScriptedChannel {
        polls: VecDeque<ChannelPoll>,
        exit_after: usize,
        exit: ExitState,
        exit_calls: usize,
        terminated: bool,
    }

    impl ScriptedChannel {
        fn new(polls: Vec<ChannelPoll>, exit_after: usize, exit: ExitState) -> Self {
            Self {
                polls: polls.into(),
                exit_after,
                exit,
                exit_calls: 0,
                terminated: false,
            }
        }
    }

    impl ExecChannel for ScriptedChannel {
        fn poll_output(&mut self, _wait: Duration) -> ChannelPoll {
            self.polls.pop_front().unwrap_or(ChannelPoll::Closed)
        }

        fn exit_state(&mut self) -> ExitState {
            self.exit_calls += 1;
            if self.exit_calls > self.exit_after {
                self.exit.clone()
            } else {
                ExitState::Pending
            }
        }

        fn terminate(&mut self) {
            self.terminated = true;
        }
    }

    fn out(text: &str) -> ChannelPoll {
        ChannelPoll::Data(OutputStream::Stdout, text.to_string())
    }

    fn err(text: &str) -> ChannelPoll {
        ChannelPoll::Data(OutputStream::Stderr, text.to_string())
    }

    fn run(channel: &mut ScriptedChannel, deadline: Option<Duration>) -> (ExecutionResult, Vec<String>) {
        let mut seen = Vec::new();
        let result = drain_channel(channel, Duration::from_millis(1), deadline, &mut |t: &str| {
            seen.push(t.to_string())
        });
        (result, seen)
    }

    #[test]
    fn silent_command_has_empty_transcript() {
        let mut channel = ScriptedChannel::new(vec![], 0, ExitState::Exited(0));
        let (result, seen) = run(&mut channel, None);
        assert_eq!(result.exit_status, 0);
        assert_eq!(result.transcript, "");
        assert!(seen.is_empty());
    }

    #[test]
    fn chunks_are_concatenated_in_arrival_order() {
        let mut channel = ScriptedChannel::new(
            vec![out("a"), ChannelPoll::Idle, err("b"), out("c")],
            2,
            ExitState::Exited(0),
        );
        let (result, seen) = run(&mut channel, None);
        assert_eq!(result.transcript, "abc");
        assert_eq!(seen, vec!["a", "ab", "abc"]);
    }

    #[test]
    fn output_after_exit_status_is_kept() {
        let mut channel = ScriptedChannel::new(
            vec![out("first\n"), ChannelPoll::Idle, out("late\n")],
            0,
            ExitState::Exited(0),
        );
        let (result, _) = run(&mut channel, None);
        assert_eq!(result.transcript, "first\nlate\n");
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let mut channel = ScriptedChannel::new(vec![err("nope\n")], 0, ExitState::Exited(2));
        let (result, _) = run(&mut channel, None);
        assert_eq!(result.exit_status, 2);
        assert_eq!(result.transcript, "nope\n");
    }

    #[test]
    fn lost_channel_returns_partial_transcript_and_sentinel() {
        let mut channel = ScriptedChannel::new(
            vec![out("partial")],
            1,
            ExitState::Lost("connection reset".to_string()),
        );
        let (result, _) = run(&mut channel, None);
        assert_eq!(result.exit_status, FAILURE_EXIT_STATUS);
        assert_eq!(result.transcript, "partial");
    }

    #[test]
    fn waits_for_status_after_streams_close() {
        let mut channel = ScriptedChannel::new(vec![out("x")], 5, ExitState::Exited(0));
        let (result, _) = run(&mut channel, None);
        assert_eq!(result.exit_status, 0);
        assert_eq!(channel.exit_calls, 6);
    }

    #[test]
    fn deadline_terminates_hung_command() {
        let mut channel =
            ScriptedChannel::new(vec![out("started\n")], usize::MAX, ExitState::Exited(0));
        let (result, _) = run(&mut channel, Some(Duration::from_millis(20)));
        assert!(channel.terminated);
        assert_eq!(result.exit_status, FAILURE_EXIT_STATUS);
        assert_eq!(result.transcript, "started\n");
    }

    #[test]
    fn utf8_carry_joins_split_characters() {
        let bytes = "héllo".as_bytes();
        let mut carry = Utf8Carry::default();
        let mut text = carry.decode(&bytes[..2]);
        text.push_str(&carry.decode(&bytes[2..]));
        text.push_str(&carry.finish());
        assert_eq!(text, "héllo");
    }

    #[test]
    fn utf8_carry_replaces_bad_bytes_but_keeps_split_tail() {
        let e_acute = "é".as_bytes();
        let mut carry = Utf8Carry::default();
        let first = carry.decode(&[b'a', 0xff, b'b', e_acute[0]]);
        assert_eq!(first, "a\u{fffd}b");
        let second = carry.decode(&e_acute[1..]);
        assert_eq!(second, "é");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn utf8_carry_flushes_truncated_tail_on_finish() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(&"é".as_bytes()[..1]), "");
        assert_eq!(carry.finish(), "\u{fffd}");
    }

    #[cfg(unix)]
    #[test]
    fn master_that_honours_exit_request_is_not_killed() {
        let mut master = Command::new("sh").arg("-c").arg("sleep 0.2").spawn().unwrap();
        let status = shutdown_master(
            &mut master,
            Duration::from_secs(10),
            Duration::from_millis(10),
            || true,
        )
        .unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[test]
    fn master_is_killed_when_exit_request_fails() {
        let mut master = Command::new("sleep").arg("30").spawn().unwrap();
        let started = Instant::now();
        let mut asked = false;
        let status = shutdown_master(
            &mut master,
            Duration::from_secs(10),
            Duration::from_millis(10),
            || {
                asked = true;
                false
            },
        )
        .unwrap();
        assert!(asked);
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn open_failures_are_classified() {
        assert_eq!(
            classify_open_failure(Some(255), "user@h: Permission denied (publickey).", false),
            SshError::Auth("user@h: Permission denied (publickey).".to_string())
        );
        assert!(matches!(
            classify_open_failure(Some(5), "", true),
            SshError::Auth(_)
        ));
        assert!(matches!(
            classify_open_failure(Some(255), "ssh: connect to host h port 22: Connection refused", false),
            SshError::Connection(_)
        ));
        assert_eq!(
            classify_open_failure(Some(255), "", false),
            SshError::Connection("ssh exited with status 255".to_string())
        );
    }

    #[test]
    fn control_paths_are_unique_per_session() {
        let host = Host {
            alias: "db1".to_string(),
            hostname: "10.0.0.5".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: crate::types::AuthMode::Key,
            key_path: None,
            password_env: None,
        };
        let dir = Path::new("/tmp/opsh-test");
        assert_ne!(control_path(dir, &host), control_path(dir, &host));
    }

    #[cfg(unix)]
    #[test]
    fn process_channel_streams_both_pipes() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf out; printf err >&2; exit 3");
        let mut channel = ProcessChannel::spawn(cmd).unwrap();
        let result = drain_channel(&mut channel, Duration::from_millis(10), None, &mut |_: &str| {});
        assert_eq!(result.exit_status, 3);
        assert_eq!(result.transcript.len(), 6);
        assert!(result.transcript.contains("out"));
        assert!(result.transcript.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn process_channel_reports_signal_as_lost() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf partial; kill -9 $$");
        let mut channel = ProcessChannel::spawn(cmd).unwrap();
        let result = drain_channel(&mut channel, Duration::from_millis(10), None, &mut |_: &str| {});
        assert_eq!(result.exit_status, FAILURE_EXIT_STATUS);
        assert_eq!(result.transcript, "partial");
    }
}
