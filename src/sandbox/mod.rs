//! Container sandbox for untrusted and secret-bearing skills.
//!
//! Every run gets the same hardened policy, whatever the caller asks for:
//!
//! 1. All Linux capabilities dropped, `no-new-privileges` set
//! 2. Read-only root filesystem (writable only while injecting an upload)
//! 3. Runs as `nobody`, with a small `noexec` tmpfs on `/tmp`
//! 4. Memory ceiling and CPU quota (half a core by default)
//! 5. Wall-clock timeout on the whole run
//!
//! I/O contract: the container receives `{"function", "arguments"}` as JSON
//! in the `SENTI_INPUT` environment variable and prints `{"result": "..."}`
//! on stdout before exiting 0. Anything else on stdout is returned as the
//! raw trimmed text.
//!
//! Engine calls are blocking; [`SandboxExecutor::run`] moves the whole
//! lifecycle onto the blocking thread pool so a hung container never
//! stalls other conversations.

pub mod docker;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxError;

pub use docker::DockerCli;

/// Environment variable carrying the JSON input document.
pub const INPUT_ENV_VAR: &str = "SENTI_INPUT";

/// Directory inside the container where uploaded files are injected.
pub const UPLOAD_DIR: &str = "/data/upload";

/// Network mode meaning "no network at all".
pub const NETWORK_NONE: &str = "none";

/// Account the container process runs as.
const SANDBOX_USER: &str = "nobody";

/// tmpfs mounted on /tmp: size-capped, always `noexec`.
const TMPFS_PATH: &str = "/tmp";

/// How much stderr is kept in the error returned to callers.
const STDERR_PREVIEW_CHARS: usize = 200;

/// How much stderr is written to the log on failure.
const STDERR_LOG_CHARS: usize = 500;

// ── Run description ──────────────────────────────────────

/// Resource limits applied to sandbox runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub mem_limit: String,
    /// Memory ceiling used instead of `mem_limit` when a file is injected.
    pub upload_mem_limit: String,
    /// CFS quota in microseconds per 100ms period (50_000 = half a core).
    pub cpu_quota: i64,
    pub tmpfs_size: String,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            mem_limit: "128m".to_string(),
            upload_mem_limit: "256m".to_string(),
            cpu_quota: 50_000,
            tmpfs_size: "10m".to_string(),
        }
    }
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            mem_limit: config.mem_limit.clone(),
            upload_mem_limit: config.upload_mem_limit.clone(),
            cpu_quota: config.cpu_quota,
            tmpfs_size: config.tmpfs_size.clone(),
        }
    }
}

/// A file handed to the sandbox alongside the call.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
        }
    }

    /// File name with any directory components stripped.
    pub fn safe_name(&self) -> String {
        Path::new(&self.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("upload.bin")
            .to_string()
    }
}

/// One container invocation. Never persisted.
#[derive(Debug, Clone)]
pub struct SandboxRunSpec {
    pub image: String,
    pub input: Value,
    pub network_mode: String,
    pub mem_limit: String,
    pub cpu_quota: i64,
    pub tmpfs_size: String,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub upload: Option<Upload>,
}

impl SandboxRunSpec {
    /// Fully isolated run of `image` with the given limits.
    pub fn new(image: impl Into<String>, input: Value, limits: &SandboxLimits) -> Self {
        Self {
            image: image.into(),
            input,
            network_mode: NETWORK_NONE.to_string(),
            mem_limit: limits.mem_limit.clone(),
            cpu_quota: limits.cpu_quota,
            tmpfs_size: limits.tmpfs_size.clone(),
            timeout: limits.timeout,
            env: BTreeMap::new(),
            upload: None,
        }
    }

    pub fn with_network(mut self, network_mode: impl Into<String>) -> Self {
        self.network_mode = network_mode.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Attaches a file and raises the memory ceiling for it.
    pub fn with_upload(mut self, upload: Upload, limits: &SandboxLimits) -> Self {
        self.upload = Some(upload);
        self.mem_limit = limits.upload_mem_limit.clone();
        self
    }
}

/// Container settings derived from a [`SandboxRunSpec`] plus the fixed
/// security policy. This is what the engine actually applies.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub network_mode: String,
    pub read_only: bool,
    pub cap_drop_all: bool,
    pub no_new_privileges: bool,
    pub user: String,
    pub tmpfs: (String, String),
    pub mem_limit: String,
    pub cpu_quota: i64,
}

impl ContainerConfig {
    /// Applies the non-negotiable security policy to a run spec.
    pub fn hardened(spec: &SandboxRunSpec, name: String) -> Self {
        let mut env: Vec<(String, String)> = spec
            .env
            .iter()
            .filter(|(k, _)| k.as_str() != INPUT_ENV_VAR)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push((INPUT_ENV_VAR.to_string(), spec.input.to_string()));

        Self {
            name,
            image: spec.image.clone(),
            env,
            network_mode: spec.network_mode.clone(),
            read_only: spec.upload.is_none(),
            cap_drop_all: true,
            no_new_privileges: true,
            user: SANDBOX_USER.to_string(),
            tmpfs: (TMPFS_PATH.to_string(), format!("size={},noexec", spec.tmpfs_size)),
            mem_limit: spec.mem_limit.clone(),
            cpu_quota: spec.cpu_quota,
        }
    }
}

/// Raw outcome of a finished container.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl SandboxResult {
    /// Reduces the container output to a single result string.
    ///
    /// Non-zero exit is a failure carrying truncated stderr. On success the
    /// stdout `{"result": ...}` document is unwrapped; stdout that is not a
    /// JSON object, or has no `result` key, is returned trimmed as-is.
    pub fn into_output(self) -> Result<String, SandboxError> {
        if self.exit_code != 0 {
            error!(
                "Sandbox container exited {}: {}",
                self.exit_code,
                truncate_chars(&self.stderr, STDERR_LOG_CHARS)
            );
            return Err(SandboxError::NonZeroExit {
                exit_code: self.exit_code,
                stderr: truncate_chars(&self.stderr, STDERR_PREVIEW_CHARS),
            });
        }

        let trimmed = self.stdout.trim();
        let output = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => match map.get("result") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => trimmed.to_string(),
            },
            _ => {
                debug!("Sandbox stdout is not a JSON object, returning raw output");
                trimmed.to_string()
            }
        };
        Ok(output)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ── Engine seam ──────────────────────────────────────────

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    Api(String),
}

/// Captured output streams of a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Blocking client for a container engine.
///
/// Implementations are called from the blocking thread pool only.
pub trait ContainerEngine: Send + Sync {
    fn network_exists(&self, name: &str) -> Result<bool, EngineError>;

    fn create_network(&self, name: &str) -> Result<(), EngineError>;

    /// Creates (but does not start) a container; returns its id.
    fn create(&self, config: &ContainerConfig) -> Result<String, EngineError>;

    /// Extracts a tar archive into `dir` inside a created container.
    fn put_archive(&self, id: &str, dir: &str, archive: &[u8]) -> Result<(), EngineError>;

    fn start(&self, id: &str) -> Result<(), EngineError>;

    /// Blocks until the container exits or `timeout` elapses; returns the
    /// exit code.
    fn wait(&self, id: &str, timeout: Duration) -> Result<i64, EngineError>;

    fn logs(&self, id: &str) -> Result<ContainerLogs, EngineError>;

    /// Force-removes the container.
    fn remove(&self, id: &str) -> Result<(), EngineError>;
}

/// Removes the container when dropped, so every exit path (including
/// early returns and panics) cleans up.
struct ContainerGuard<'a> {
    engine: &'a dyn ContainerEngine,
    id: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.engine.remove(&self.id) {
            warn!("Failed to remove container {}: {e}", short_id(&self.id));
        } else {
            debug!("Removed container {}", short_id(&self.id));
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

// ── SandboxExecutor ──────────────────────────────────────

/// Runs skill invocations in hardened, single-use containers.
pub struct SandboxExecutor {
    engine: Arc<dyn ContainerEngine>,
    ensured_networks: Arc<Mutex<HashSet<String>>>,
}

impl SandboxExecutor {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            ensured_networks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs one container to completion and returns its result string.
    pub async fn run(&self, spec: SandboxRunSpec) -> Result<String, SandboxError> {
        let engine = Arc::clone(&self.engine);
        let networks = Arc::clone(&self.ensured_networks);

        tokio::task::spawn_blocking(move || run_blocking(engine.as_ref(), &networks, &spec))
            .await
            .map_err(|e| SandboxError::Execution(format!("sandbox worker failed: {e}")))?
    }
}

/// Creates `name` once per process. The set is held locked across the
/// check-and-create so concurrent runs cannot both create it.
fn ensure_network(
    engine: &dyn ContainerEngine,
    ensured: &Mutex<HashSet<String>>,
    name: &str,
) -> Result<(), EngineError> {
    if name == NETWORK_NONE {
        return Ok(());
    }
    let mut ensured = ensured.lock().unwrap_or_else(PoisonError::into_inner);
    if ensured.contains(name) {
        return Ok(());
    }
    if !engine.network_exists(name)? {
        engine.create_network(name)?;
        info!("Created container network: {name}");
    }
    ensured.insert(name.to_string());
    Ok(())
}

fn run_blocking(
    engine: &dyn ContainerEngine,
    networks: &Mutex<HashSet<String>>,
    spec: &SandboxRunSpec,
) -> Result<String, SandboxError> {
    let timeout_secs = spec.timeout.as_secs();
    let map_engine = |e: EngineError| match e {
        EngineError::ImageNotFound(_) => SandboxError::ImageNotFound(spec.image.clone()),
        EngineError::Timeout => SandboxError::Timeout(timeout_secs),
        EngineError::Api(msg) => SandboxError::Engine(msg),
    };

    ensure_network(engine, networks, &spec.network_mode).map_err(map_engine)?;

    let name = format!("senti-sbx-{}", uuid::Uuid::new_v4().simple());
    let config = ContainerConfig::hardened(spec, name);

    let id = engine.create(&config).map_err(map_engine)?;
    let _guard = ContainerGuard { engine, id: id.clone() };

    debug!(
        "Created sandbox container {} from {} (network: {})",
        short_id(&id),
        spec.image,
        spec.network_mode
    );

    if let Some(upload) = &spec.upload {
        let filename = upload.safe_name();
        let archive = upload_archive(&filename, &upload.data)
            .map_err(|e| SandboxError::Execution(format!("could not build upload archive: {e}")))?;
        engine.put_archive(&id, UPLOAD_DIR, &archive).map_err(map_engine)?;
        info!(
            "Injected {filename} ({} bytes) into container {UPLOAD_DIR}/",
            upload.data.len()
        );
    }

    engine.start(&id).map_err(map_engine)?;
    let exit_code = engine.wait(&id, spec.timeout).map_err(map_engine)?;
    let logs = engine.logs(&id).map_err(map_engine)?;

    SandboxResult {
        exit_code,
        stdout: logs.stdout,
        stderr: logs.stderr,
    }
    .into_output()
}

/// Builds an in-memory tar archive holding one read-only file.
fn upload_archive(filename: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o444);
    builder.append_data(&mut header, filename, data)?;
    builder.into_inner()
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory container engine used by sandbox and router tests.

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum EngineCall {
        NetworkExists(String),
        CreateNetwork(String),
        Create(String),
        PutArchive(String, String),
        Start(String),
        Wait(String),
        Logs(String),
        Remove(String),
    }

    /// How the fake's `wait` behaves.
    pub enum WaitBehavior {
        Exit(i64),
        Timeout,
        Panic,
    }

    pub struct FakeEngine {
        pub calls: Mutex<Vec<EngineCall>>,
        pub created: Mutex<Vec<ContainerConfig>>,
        pub archives: Mutex<Vec<Vec<u8>>>,
        pub existing_networks: Mutex<HashSet<String>>,
        pub wait_behavior: Mutex<WaitBehavior>,
        pub logs: Mutex<ContainerLogs>,
        pub create_error: Mutex<Option<EngineError>>,
        pub start_error: Mutex<Option<EngineError>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                archives: Mutex::new(Vec::new()),
                existing_networks: Mutex::new(HashSet::new()),
                wait_behavior: Mutex::new(WaitBehavior::Exit(0)),
                logs: Mutex::new(ContainerLogs {
                    stdout: "{\"result\": \"ok\"}\n".to_string(),
                    stderr: String::new(),
                }),
                create_error: Mutex::new(None),
                start_error: Mutex::new(None),
            }
        }

        pub fn with_output(self, exit_code: i64, stdout: &str, stderr: &str) -> Self {
            *self.wait_behavior.lock().unwrap() = WaitBehavior::Exit(exit_code);
            *self.logs.lock().unwrap() = ContainerLogs {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            };
            self
        }

        pub fn with_wait(self, behavior: WaitBehavior) -> Self {
            *self.wait_behavior.lock().unwrap() = behavior;
            self
        }

        pub fn calls(&self) -> Vec<EngineCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }

        pub fn removals(&self) -> usize {
            self.count(|c| matches!(c, EngineCall::Remove(_)))
        }

        pub fn last_config(&self) -> ContainerConfig {
            self.created.lock().unwrap().last().cloned().expect("no container created")
        }

        /// The JSON document passed through `SENTI_INPUT` to the last container.
        pub fn last_input(&self) -> Value {
            let config = self.last_config();
            let (_, raw) = config
                .env
                .iter()
                .find(|(k, _)| k == INPUT_ENV_VAR)
                .expect("input env var missing");
            serde_json::from_str(raw).unwrap()
        }

        fn record(&self, call: EngineCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ContainerEngine for FakeEngine {
        fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
            self.record(EngineCall::NetworkExists(name.to_string()));
            Ok(self.existing_networks.lock().unwrap().contains(name))
        }

        fn create_network(&self, name: &str) -> Result<(), EngineError> {
            self.record(EngineCall::CreateNetwork(name.to_string()));
            self.existing_networks.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        fn create(&self, config: &ContainerConfig) -> Result<String, EngineError> {
            self.record(EngineCall::Create(config.name.clone()));
            if let Some(err) = self.create_error.lock().unwrap().take() {
                return Err(err);
            }
            self.created.lock().unwrap().push(config.clone());
            Ok(format!("id-{}", config.name))
        }

        fn put_archive(&self, id: &str, dir: &str, archive: &[u8]) -> Result<(), EngineError> {
            self.record(EngineCall::PutArchive(id.to_string(), dir.to_string()));
            self.archives.lock().unwrap().push(archive.to_vec());
            Ok(())
        }

        fn start(&self, id: &str) -> Result<(), EngineError> {
            self.record(EngineCall::Start(id.to_string()));
            match self.start_error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn wait(&self, id: &str, _timeout: Duration) -> Result<i64, EngineError> {
            self.record(EngineCall::Wait(id.to_string()));
            match *self.wait_behavior.lock().unwrap() {
                WaitBehavior::Exit(code) => Ok(code),
                WaitBehavior::Timeout => Err(EngineError::Timeout),
                WaitBehavior::Panic => panic!("engine connection dropped"),
            }
        }

        fn logs(&self, id: &str) -> Result<ContainerLogs, EngineError> {
            self.record(EngineCall::Logs(id.to_string()));
            Ok(self.logs.lock().unwrap().clone())
        }

        fn remove(&self, id: &str) -> Result<(), EngineError> {
            self.record(EngineCall::Remove(id.to_string()));
            Ok(())
        }
    }
}
