//! [`ContainerEngine`] backed by the `docker` command-line client.
//!
//! Secret environment values are handed to `docker create` through the
//! child process environment (`-e KEY` without a value), so they never
//! show up in the process list.

use std::io::Write;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{ContainerConfig, ContainerEngine, ContainerLogs, EngineError};

/// CFS period matching the quota semantics (microseconds).
const CPU_PERIOD: i64 = 100_000;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn spawn_err(&self, e: std::io::Error) -> EngineError {
        EngineError::Api(format!("failed to run {}: {e}", self.binary))
    }

    /// Runs a command to completion, returning trimmed stdout on success.
    fn run(&self, mut cmd: Command) -> Result<String, EngineError> {
        let output = cmd.output().map_err(|e| self.spawn_err(e))?;
        check(output)
    }
}

fn check(output: Output) -> Result<String, EngineError> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)))
    }
}

/// Maps docker CLI error output to an [`EngineError`].
pub fn classify_stderr(stderr: &str) -> EngineError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("no such image")
        || lower.contains("unable to find image")
        || lower.contains("pull access denied")
    {
        EngineError::ImageNotFound(message)
    } else {
        EngineError::Api(message)
    }
}

/// Arguments for `docker create` enforcing the container policy.
pub fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--pull".into(),
        "never".into(),
        "--name".into(),
        config.name.clone(),
        "--network".into(),
        config.network_mode.clone(),
        "--user".into(),
        config.user.clone(),
        "--memory".into(),
        config.mem_limit.clone(),
        "--cpu-period".into(),
        CPU_PERIOD.to_string(),
        "--cpu-quota".into(),
        config.cpu_quota.to_string(),
        "--tmpfs".into(),
        format!("{}:{}", config.tmpfs.0, config.tmpfs.1),
    ];
    if config.cap_drop_all {
        args.extend(["--cap-drop".into(), "ALL".into()]);
    }
    if config.no_new_privileges {
        args.extend(["--security-opt".into(), "no-new-privileges".into()]);
    }
    if config.read_only {
        args.push("--read-only".into());
    }
    for (key, _) in &config.env {
        args.extend(["-e".into(), key.clone()]);
    }
    args.push(config.image.clone());
    args
}

fn is_missing_network(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such network") || lower.contains("not found")
}

impl ContainerEngine for DockerCli {
    fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        let mut cmd = self.command();
        cmd.args(["network", "inspect", name]);
        let output = cmd.output().map_err(|e| self.spawn_err(e))?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_network(&stderr) {
            Ok(false)
        } else {
            Err(classify_stderr(&stderr))
        }
    }

    fn create_network(&self, name: &str) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.args(["network", "create", "--driver", "bridge", name]);
        self.run(cmd).map(|_| ())
    }

    fn create(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        let mut cmd = self.command();
        cmd.args(create_args(config));
        cmd.envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let id = self.run(cmd)?;
        if id.is_empty() {
            return Err(EngineError::Api("docker create returned no container id".into()));
        }
        Ok(id)
    }

    fn put_archive(&self, id: &str, dir: &str, archive: &[u8]) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.args(["cp", "-", &format!("{id}:{dir}")])
            .stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_err(e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(archive)
                .map_err(|e| EngineError::Api(format!("failed to stream archive: {e}")))?;
        }
        let output = child.wait_with_output().map_err(|e| self.spawn_err(e))?;
        check(output).map(|_| ())
    }

    fn start(&self, id: &str) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.args(["start", id]);
        self.run(cmd).map(|_| ())
    }

    fn wait(&self, id: &str, timeout: Duration) -> Result<i64, EngineError> {
        let mut cmd = self.command();
        cmd.args(["wait", id]);
        let mut child = cmd.spawn().map_err(|e| self.spawn_err(e))?;
        let deadline = Instant::now() + timeout;

        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    kill(&mut child);
                    debug!("docker wait for {id} exceeded {}s", timeout.as_secs());
                    return Err(EngineError::Timeout);
                }
                Ok(None) => std::thread::sleep(WAIT_POLL_INTERVAL),
                Err(e) => {
                    kill(&mut child);
                    return Err(EngineError::Api(format!("docker wait failed: {e}")));
                }
            }
        }

        let output = child.wait_with_output().map_err(|e| self.spawn_err(e))?;
        let stdout = check(output)?;
        stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .ok_or_else(|| EngineError::Api(format!("unexpected docker wait output: {stdout:?}")))
    }

    fn logs(&self, id: &str) -> Result<ContainerLogs, EngineError> {
        let mut cmd = self.command();
        cmd.args(["logs", id]);
        let output = cmd.output().map_err(|e| self.spawn_err(e))?;
        if !output.status.success() {
            return Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn remove(&self, id: &str) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", id]);
        self.run(cmd).map(|_| ())
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to stop docker client process: {e}");
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{SandboxLimits, SandboxRunSpec, Upload};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn config(upload: bool) -> ContainerConfig {
        let limits = SandboxLimits::default();
        let mut env = BTreeMap::new();
        env.insert("BRAVE_API_KEY".to_string(), "super-secret".to_string());
        let mut spec = SandboxRunSpec::new("senti-search:latest", json!({"function": "web_search"}), &limits)
            .with_network("senti_search_net")
            .with_env(env);
        if upload {
            spec = spec.with_upload(Upload::new("a.txt", b"x".to_vec()), &limits);
        }
        ContainerConfig::hardened(&spec, "senti-sbx-test".to_string())
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_create_args_apply_policy() {
        let args = create_args(&config(false));
        assert_eq!(args.first().map(String::as_str), Some("create"));
        assert!(has_pair(&args, "--pull", "never"));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(has_pair(&args, "--user", "nobody"));
        assert!(has_pair(&args, "--tmpfs", "/tmp:size=10m,noexec"));
        assert!(has_pair(&args, "--memory", "128m"));
        assert!(has_pair(&args, "--cpu-quota", "50000"));
        assert!(has_pair(&args, "--network", "senti_search_net"));
        assert!(args.contains(&"--read-only".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("senti-search:latest"));
    }

    #[test]
    fn test_create_args_keep_secret_values_out_of_argv() {
        let args = create_args(&config(false));
        assert!(has_pair(&args, "-e", "BRAVE_API_KEY"));
        assert!(has_pair(&args, "-e", "SENTI_INPUT"));
        assert!(!args.iter().any(|a| a.contains("super-secret")));
    }

    #[test]
    fn test_upload_run_is_writable_with_more_memory() {
        let args = create_args(&config(true));
        assert!(!args.contains(&"--read-only".to_string()));
        assert!(has_pair(&args, "--memory", "256m"));
    }

    #[test]
    fn test_classify_missing_image() {
        let err = classify_stderr("Error response from daemon: No such image: senti-python:latest\n");
        assert!(matches!(err, EngineError::ImageNotFound(_)));
    }

    #[test]
    fn test_classify_other_errors() {
        let err = classify_stderr("Cannot connect to the Docker daemon at unix:///var/run/docker.sock");
        match err {
            EngineError::Api(msg) => assert!(msg.starts_with("Cannot connect")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_missing_network_detection() {
        assert!(is_missing_network("Error: No such network: senti_search_net"));
        assert!(is_missing_network("Error response from daemon: network senti_x not found"));
        assert!(!is_missing_network("permission denied while trying to connect"));
    }
}
