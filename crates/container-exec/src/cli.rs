use crate::{
    CommandSpec, ContainerRunner, EngineError, ImageBuilder, ImageHandle, ProcessFailure,
    RunIdentity, Volumes,
};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

pub const DEFAULT_RUNTIME: &str = "docker";

/// Exit status the runtime CLI uses only for its own failures (daemon, image
/// or mount errors).
pub const RUNTIME_ERROR_STATUS: i32 = 125;

/// Statuses shared between the runtime (entrypoint not executable or missing)
/// and the container process itself (`sh` command not executable or not found).
pub const RUNTIME_AMBIGUOUS_STATUSES: [i32; 2] = [126, 127];

/// Stderr prefixes the runtime writes when it fails to start the entrypoint.
const RUNTIME_STDERR_MARKERS: [&str; 2] = ["docker: Error response from daemon", "OCI runtime"];

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Container engine driven through a docker-compatible command line.
#[derive(Debug, Clone)]
pub struct ContainerCli {
    runtime: String,
    stage_timeout: Option<Duration>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for ContainerCli {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME)
    }
}

impl ContainerCli {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            stage_timeout: None,
            cancel: None,
        }
    }

    /// Wall-clock limit applied to every build and run call.
    pub fn with_stage_timeout(mut self, limit: Option<Duration>) -> Self {
        self.stage_timeout = limit;
        self
    }

    /// Flag that, once set, interrupts the current call and removes its container.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn cancel_flag(&self) -> Option<&Arc<AtomicBool>> {
        self.cancel.as_ref()
    }

    fn spawn(&self, command: &mut Command) -> Result<Child, EngineError> {
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.spawn().map_err(|source| EngineError::Spawn {
            runtime: self.runtime.clone(),
            source,
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn supervise(&self, mut child: Child) -> Result<Supervised, EngineError> {
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);
        let start = Instant::now();

        let status = loop {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                break status;
            }

            let interrupt = if self.cancelled() {
                Some(Interrupt::Cancelled)
            } else {
                match self.stage_timeout {
                    Some(limit) if start.elapsed() >= limit => Some(Interrupt::TimedOut(limit)),
                    _ => None,
                }
            };

            if let Some(interrupt) = interrupt {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(Supervised::Interrupted(interrupt));
            }
        };

        Ok(Supervised::Exited(CapturedOutput {
            status,
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            elapsed: start.elapsed(),
        }))
    }

    fn force_remove(&self, container: &str) {
        let result = Command::new(&self.runtime)
            .arg("rm")
            .arg("-f")
            .arg(container)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => debug!(container, "removed interrupted container"),
            Ok(status) => warn!(container, %status, "failed to remove interrupted container"),
            Err(err) => warn!(container, error = %err, "failed to remove interrupted container"),
        }
    }
}

impl ImageBuilder for ContainerCli {
    fn build(
        &self,
        source_dir: &Path,
        tag: &str,
        remove_intermediate: bool,
    ) -> Result<ImageHandle, EngineError> {
        info!(image = tag, source = %source_dir.display(), "Creating image");

        let mut command = Command::new(&self.runtime);
        configure_build(&mut command, source_dir, tag, remove_intermediate);
        let child = self.spawn(&mut command)?;

        let output = match self.supervise(child)? {
            Supervised::Exited(output) => output,
            Supervised::Interrupted(interrupt) => return Err(interrupt.into_error(tag)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!(image = tag, stderr = %stderr.trim(), "image build failed");
            return Err(EngineError::BuildFailed {
                tag: tag.to_string(),
                source_dir: source_dir.to_path_buf(),
                status: output.status.code(),
                stderr,
            });
        }

        info!(
            image = tag,
            duration = %format_secs(output.elapsed),
            "Image ready"
        );
        Ok(ImageHandle::new(tag))
    }
}

impl ContainerRunner for ContainerCli {
    fn run(
        &self,
        image: &ImageHandle,
        command: &CommandSpec,
        volumes: &Volumes,
        identity: &RunIdentity,
    ) -> Result<(), EngineError> {
        let container = container_name();
        info!(image = %image, command = %command, container = %container, "Running container");

        let mut runtime_command = Command::new(&self.runtime);
        configure_run(
            &mut runtime_command,
            &container,
            image,
            command,
            volumes,
            identity,
        );
        let child = self.spawn(&mut runtime_command)?;

        let output = match self.supervise(child)? {
            Supervised::Exited(output) => output,
            Supervised::Interrupted(interrupt) => {
                self.force_remove(&container);
                return Err(interrupt.into_error(image.tag()));
            }
        };

        if !output.stdout.is_empty() {
            debug!(
                image = %image,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "container stdout"
            );
        }

        translate_exit(image.tag(), command, output.status.code(), output.stderr)?;

        info!(
            image = %image,
            duration = %format_secs(output.elapsed),
            "Container finished"
        );
        Ok(())
    }
}

/// Map the runtime's exit status onto the error taxonomy.
///
/// Runtime failures and undecodable stderr both surface the raw output
/// untouched; a non-zero exit of the container process becomes a
/// [`ProcessFailure`]. 126 and 127 count as runtime failures only when the
/// runtime itself wrote the stderr.
pub(crate) fn translate_exit(
    image: &str,
    command: &CommandSpec,
    status: Option<i32>,
    stderr: Vec<u8>,
) -> Result<(), EngineError> {
    match status {
        Some(0) => Ok(()),
        Some(code) if is_runtime_failure(code, &stderr) => Err(EngineError::Runtime {
            image: image.to_string(),
            status: Some(code),
            stderr,
        }),
        Some(code) => match String::from_utf8(stderr) {
            Ok(text) => Err(ProcessFailure {
                command: command.to_string(),
                image: image.to_string(),
                exit_status: code,
                stderr: text,
            }
            .into()),
            Err(err) => Err(EngineError::Runtime {
                image: image.to_string(),
                status: Some(code),
                stderr: err.into_bytes(),
            }),
        },
        None => Err(EngineError::Runtime {
            image: image.to_string(),
            status: None,
            stderr,
        }),
    }
}

fn is_runtime_failure(code: i32, stderr: &[u8]) -> bool {
    if code == RUNTIME_ERROR_STATUS {
        return true;
    }
    if !RUNTIME_AMBIGUOUS_STATUSES.contains(&code) {
        return false;
    }
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .any(|line| RUNTIME_STDERR_MARKERS.iter().any(|marker| line.trim_start().starts_with(marker)))
}

fn configure_build(command: &mut Command, source_dir: &Path, tag: &str, remove_intermediate: bool) {
    command.arg("build");
    command.arg("--tag").arg(tag);
    command.arg(format!("--rm={}", remove_intermediate));
    command.arg(source_dir);
}

fn configure_run(
    command: &mut Command,
    container: &str,
    image: &ImageHandle,
    spec: &CommandSpec,
    volumes: &Volumes,
    identity: &RunIdentity,
) {
    command.arg("run");
    command.arg("--rm");
    command.arg("--name").arg(container);
    command.arg("--user").arg(identity.user_arg());
    if identity.host_userns {
        command.arg("--userns").arg("host");
    }
    for (host, binding) in volumes {
        command.arg("--volume").arg(format!(
            "{}:{}:{}",
            host.display(),
            binding.bind,
            binding.mode.as_str()
        ));
    }
    command.arg(image.tag());
    for part in spec.args() {
        command.arg(part);
    }
}

fn container_name() -> String {
    format!("runlocal-{}", Uuid::new_v4().simple())
}

fn format_secs(elapsed: Duration) -> String {
    format!("{:.2} s", elapsed.as_secs_f64())
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[derive(Debug)]
struct CapturedOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    elapsed: Duration,
}

#[derive(Debug)]
enum Supervised {
    Exited(CapturedOutput),
    Interrupted(Interrupt),
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    TimedOut(Duration),
    Cancelled,
}

impl Interrupt {
    fn into_error(self, image: &str) -> EngineError {
        match self {
            Interrupt::TimedOut(limit) => EngineError::Timeout {
                image: image.to_string(),
                limit,
            },
            Interrupt::Cancelled => EngineError::Cancelled {
                image: image.to_string(),
            },
        }
    }
}
