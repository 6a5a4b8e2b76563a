//! Process spawning and lifecycle for the test harness: background every
//! server command, run the client to completion, then kill every server's
//! process group and diff each command's captured stdout against its
//! fixture.

use crate::diff;
use crate::spec::{CommandSpec, Spec};
use corral2_error::{Error, Kind};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::warn;

/// Exit codes for the harness binary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    ValidationFailure = 1,
    Timeout = 2,
    StartupFailure = 3,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// One command's captured result, diffed against its fixture expectation.
pub struct CommandOutcome {
    pub command: String,
    pub stdout: String,
    pub matched: bool,
}

/// The outcome of an entire sequence, in the order the commands were
/// declared.
pub struct Report {
    pub outcomes: Vec<CommandOutcome>,
}

impl Report {
    /// `Success` iff every command's captured stdout matched its fixture
    /// (or had none); `ValidationFailure` otherwise.
    pub fn exit_code(&self) -> ExitCode {
        if self.outcomes.iter().all(|o| o.matched) {
            ExitCode::Success
        } else {
            ExitCode::ValidationFailure
        }
    }
}

/// Why a sequence didn't produce a [`Report`] at all -- distinct from a
/// `Report` whose commands failed validation: startup failure and timeout
/// are their own exit codes, separate from "ran, but mismatched".
#[derive(Debug)]
pub enum RunError {
    Startup(Error),
    Timeout,
}

impl RunError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunError::Startup(_) => ExitCode::StartupFailure,
            RunError::Timeout => ExitCode::Timeout,
        }
    }
}

struct SpawnedServer {
    spec: CommandSpec,
    child: Child,
    stdout: Arc<Mutex<String>>,
}

/// Runs `spec`'s command sequence, enforcing `overall_timeout` across the
/// whole thing.
pub async fn run(spec: &Spec, overall_timeout: Duration) -> Result<Report, RunError> {
    match tokio::time::timeout(overall_timeout, run_inner(spec)).await {
        Ok(result) => result,
        Err(_) => Err(RunError::Timeout),
    }
}

async fn run_inner(spec: &Spec) -> Result<Report, RunError> {
    let mut servers = Vec::with_capacity(spec.servers().len());
    for server_spec in spec.servers() {
        let spawned = spawn_server(server_spec).await.map_err(RunError::Startup)?;
        servers.push(spawned);
        if let Some(ms) = server_spec.sleep_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    let client_stdout = match spec.client() {
        Some(client_spec) => Some(run_client(client_spec).await.map_err(RunError::Startup)?),
        None => None,
    };

    for server in &servers {
        kill_group(&server.child);
    }

    let mut outcomes = Vec::with_capacity(spec.commands.len());
    for mut server in servers {
        let _ = server.child.wait().await;
        let stdout = server.stdout.lock().await.clone();
        outcomes.push(CommandOutcome {
            matched: diff::matches(server.spec.output.as_deref(), &stdout),
            command: server.spec.command,
            stdout,
        });
    }
    if let (Some(client_spec), Some(stdout)) = (spec.client(), client_stdout) {
        outcomes.push(CommandOutcome {
            matched: diff::matches(client_spec.output.as_deref(), &stdout),
            command: client_spec.command.clone(),
            stdout,
        });
    }

    Ok(Report { outcomes })
}

fn program_and_args(spec: &CommandSpec) -> Result<(String, Vec<String>), Error> {
    let argv = spec.argv();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::new(Kind::BadRequest, "command must not be empty"))?;
    Ok((program.to_string(), args.iter().map(|s| s.to_string()).collect()))
}

async fn spawn_server(spec: &CommandSpec) -> Result<SpawnedServer, Error> {
    let (program, args) = program_and_args(spec)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    new_process_group(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::with_cause(Kind::Unavailable, format!("failed to start \"{}\"", spec.command), e))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(input) = spec.input.clone() {
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }
    }

    let stdout_buf = Arc::new(Mutex::new(String::new()));
    if let Some(stdout) = child.stdout.take() {
        spawn_capture(stdout, stdout_buf.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_discard(stderr, spec.command.clone());
    }

    Ok(SpawnedServer {
        spec: spec.clone(),
        child,
        stdout: stdout_buf,
    })
}

async fn run_client(spec: &CommandSpec) -> Result<String, Error> {
    let (program, args) = program_and_args(spec)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    new_process_group(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::with_cause(Kind::Unavailable, format!("failed to start \"{}\"", spec.command), e))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(input) = &spec.input {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::with_cause(Kind::Unavailable, "failed writing client stdin", e))?;
        }
        // dropped here: closes the pipe so the client sees EOF on stdin.
    }

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout).await;
    }
    if let Some(mut err) = child.stderr.take() {
        let mut s = String::new();
        let _ = err.read_to_string(&mut s).await;
        if !s.trim().is_empty() {
            warn!(stderr = %s, command = %spec.command, "client stderr");
        }
    }
    let _ = child.wait().await;
    Ok(stdout)
}

fn spawn_capture(mut stdout: tokio::process::ChildStdout, buf: Arc<Mutex<String>>) {
    tokio::spawn(async move {
        let mut s = String::new();
        let _ = stdout.read_to_string(&mut s).await;
        *buf.lock().await = s;
    });
}

fn spawn_discard(mut stderr: tokio::process::ChildStderr, command: String) {
    tokio::spawn(async move {
        let mut s = String::new();
        let _ = stderr.read_to_string(&mut s).await;
        if !s.trim().is_empty() {
            warn!(stderr = %s, %command, "server stderr");
        }
    });
}

#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_group(child: &Child) {
    if let Some(pid) = child.id() {
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}
