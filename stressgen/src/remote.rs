//! Remote execution of a load test
//!
//! A load test can ship itself to a disposable sandbox (a pod, a VM) and run
//! there. The sandbox platform is pluggable through [`RemoteBackend`]; building
//! the test binary for the sandbox's platform goes through [`ArtifactBuilder`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::types::StressError;

/// Environment variable telling a shipped binary it already runs remotely
pub const REMOTE_ENV: &str = "STRESS_ENV";
pub const REMOTE_ENV_VALUE: &str = "remote";

/// True when the current process was launched by [`run_remote`]
pub fn is_remote_env() -> bool {
    std::env::var(REMOTE_ENV).is_ok_and(|v| v == REMOTE_ENV_VALUE)
}

/// Lowercase `s` and replace `/`, `.` and `_` with `-`
pub fn normalize_name(s: &str) -> String {
    s.replace(['/', '.', '_'], "-").to_lowercase()
}

/// Resources and identity of the sandbox to provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub name: String,
    pub metrics_port: u16,
    pub cpu: String,
    pub memory: String,
    /// Hard limit on the sandbox lifetime
    pub timeout: Duration,
    pub labels: BTreeMap<String, String>,
}

impl SandboxSpec {
    pub fn new(stress_name: &str, nonce: &str) -> Self {
        let labels = BTreeMap::from([
            ("app".to_string(), "stressgen".to_string()),
            ("stress-name".to_string(), normalize_name(stress_name)),
        ]);
        Self {
            name: normalize_name(&format!("stressgen-{}-{}", stress_name, nonce)),
            metrics_port: 3000,
            cpu: "1".to_string(),
            memory: "1Gi".to_string(),
            timeout: Duration::from_secs(5 * 60 * 60), // 5 hours
            labels,
        }
    }
}

/// Target platform reported by a provisioned sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

/// Command executed inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: PathBuf,
}

/// Builds the load test binary for a given platform
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build the artifact and return its local path
    async fn build(&self, name: &str, platform: &Platform) -> Result<PathBuf, StressError>;
}

/// Sandbox provider
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    type Sandbox: Send + Sync;

    /// Create the sandbox and wait until it is ready
    async fn provision(&self, spec: &SandboxSpec) -> Result<Self::Sandbox, StressError>;

    async fn platform(&self, sandbox: &Self::Sandbox) -> Result<Platform, StressError>;

    /// Copy a local directory tree into the sandbox; returns the remote directory
    async fn copy_tree(
        &self,
        sandbox: &Self::Sandbox,
        root: &Path,
    ) -> Result<PathBuf, StressError>;

    /// Run a command to completion and return its output
    async fn run_command(
        &self,
        sandbox: &Self::Sandbox,
        command: &RemoteCommand,
    ) -> Result<String, StressError>;

    async fn teardown(&self, sandbox: Self::Sandbox) -> Result<(), StressError>;
}

/// Nearest ancestor of `start` holding a `Cargo.lock` or a workspace `Cargo.toml`
pub fn find_workspace_root(start: &Path) -> Result<PathBuf, StressError> {
    for dir in start.ancestors() {
        if dir.join("Cargo.lock").is_file() {
            return Ok(dir.to_path_buf());
        }
        let manifest = dir.join("Cargo.toml");
        if manifest.is_file() && std::fs::read_to_string(&manifest)?.contains("[workspace]") {
            return Ok(dir.to_path_buf());
        }
    }
    Err(StressError::Remote(format!(
        "unable to find a cargo workspace above {}",
        start.display()
    )))
}

/// Run one remote step unless `cancel` fires first
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T, StressError>>,
) -> Result<T, StressError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StressError::Cancelled),
        result = step => result,
    }
}

/// Ship the load test named `stress_name` to a fresh sandbox and run it there.
///
/// Every step is abandoned with [`StressError::Cancelled`] once `cancel`
/// fires. The sandbox is torn down whether or not the run succeeded.
pub async fn run_remote<B, A>(
    backend: &B,
    builder: &A,
    cancel: &CancellationToken,
    stress_name: &str,
    spec: &SandboxSpec,
    cwd: &Path,
) -> Result<String, StressError>
where
    B: RemoteBackend,
    A: ArtifactBuilder,
{
    info!("ready to provision sandbox {}", spec.name);
    let sandbox = until_cancelled(cancel, backend.provision(spec)).await?;
    info!("sandbox {} is ready", spec.name);

    let result = run_in_sandbox(backend, builder, cancel, &sandbox, stress_name, spec, cwd).await;
    if matches!(result, Err(StressError::Cancelled)) {
        warn!("remote run of {} cancelled, tearing down sandbox", stress_name);
    }

    if let Err(e) = backend.teardown(sandbox).await {
        warn!("failed to tear down sandbox {}: {}", spec.name, e);
    }
    result
}

async fn run_in_sandbox<B, A>(
    backend: &B,
    builder: &A,
    cancel: &CancellationToken,
    sandbox: &B::Sandbox,
    stress_name: &str,
    spec: &SandboxSpec,
    cwd: &Path,
) -> Result<String, StressError>
where
    B: RemoteBackend,
    A: ArtifactBuilder,
{
    let platform = until_cancelled(cancel, backend.platform(sandbox)).await?;
    info!(
        "determined platform of sandbox {}: os={}, arch={}",
        spec.name, platform.os, platform.arch
    );

    let artifact = until_cancelled(cancel, builder.build(&spec.name, &platform)).await?;
    let root = find_workspace_root(cwd)?;
    info!("found cargo workspace root at {}", root.display());

    let relative_artifact = artifact.strip_prefix(&root).map_err(|_| {
        StressError::Remote(format!(
            "artifact {} is outside workspace {}",
            artifact.display(),
            root.display()
        ))
    })?;
    let relative_cwd = cwd.strip_prefix(&root).unwrap_or(Path::new(""));

    let remote_root = until_cancelled(cancel, backend.copy_tree(sandbox, &root)).await?;
    let command = RemoteCommand {
        program: remote_root.join(relative_artifact),
        args: vec![
            stress_name.to_string(),
            "--exact".to_string(),
            "--nocapture".to_string(),
        ],
        env: vec![(REMOTE_ENV.to_string(), REMOTE_ENV_VALUE.to_string())],
        workdir: remote_root.join(relative_cwd),
    };
    until_cancelled(cancel, backend.run_command(sandbox, &command)).await
}

/// Remote runner bound to a backend, a builder and a working directory
pub struct Remote<B, A> {
    backend: B,
    builder: A,
    cwd: PathBuf,
}

impl<B, A> Remote<B, A> {
    pub fn new(backend: B, builder: A, cwd: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            builder,
            cwd: cwd.into(),
        }
    }
}

/// Object-safe entry point used by the harness
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run_stress(
        &self,
        cancel: &CancellationToken,
        stress_name: &str,
        spec: &SandboxSpec,
    ) -> Result<String, StressError>;
}

#[async_trait]
impl<B, A> RemoteRunner for Remote<B, A>
where
    B: RemoteBackend,
    A: ArtifactBuilder,
{
    async fn run_stress(
        &self,
        cancel: &CancellationToken,
        stress_name: &str,
        spec: &SandboxSpec,
    ) -> Result<String, StressError> {
        run_remote(
            &self.backend,
            &self.builder,
            cancel,
            stress_name,
            spec,
            &self.cwd,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBackend {
        calls: Mutex<Vec<String>>,
        commands: Mutex<Vec<RemoteCommand>>,
        fail_platform: bool,
        hang_command: bool,
    }

    impl MockBackend {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteBackend for MockBackend {
        type Sandbox = String;

        async fn provision(&self, spec: &SandboxSpec) -> Result<String, StressError> {
            self.record("provision");
            Ok(spec.name.clone())
        }

        async fn platform(&self, _sandbox: &String) -> Result<Platform, StressError> {
            self.record("platform");
            if self.fail_platform {
                return Err(StressError::Remote("sandbox unreachable".to_string()));
            }
            Ok(Platform {
                os: "linux".to_string(),
                arch: "amd64".to_string(),
            })
        }

        async fn copy_tree(&self, _sandbox: &String, _root: &Path) -> Result<PathBuf, StressError> {
            self.record("copy_tree");
            Ok(PathBuf::from("/workspace"))
        }

        async fn run_command(
            &self,
            _sandbox: &String,
            command: &RemoteCommand,
        ) -> Result<String, StressError> {
            self.record("run_command");
            self.commands.lock().unwrap().push(command.clone());
            if self.hang_command {
                std::future::pending::<()>().await;
            }
            Ok("ok".to_string())
        }

        async fn teardown(&self, _sandbox: String) -> Result<(), StressError> {
            self.record("teardown");
            Ok(())
        }
    }

    struct TargetDirBuilder {
        root: PathBuf,
    }

    #[async_trait]
    impl ArtifactBuilder for TargetDirBuilder {
        async fn build(&self, name: &str, platform: &Platform) -> Result<PathBuf, StressError> {
            Ok(self
                .root
                .join("target")
                .join(format!("{}-{}", platform.os, platform.arch))
                .join(name))
        }
    }

    fn crate_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Checkout/Flow_v1.2"), "checkout-flow-v1-2");
    }

    #[test]
    fn test_sandbox_spec_defaults() {
        let spec = SandboxSpec::new("api/Login", "1a2b3c4d");
        assert_eq!(spec.name, "stressgen-api-login-1a2b3c4d");
        assert_eq!(spec.cpu, "1");
        assert_eq!(spec.memory, "1Gi");
        assert_eq!(spec.metrics_port, 3000);
        assert_eq!(spec.timeout, Duration::from_secs(18000));
        assert_eq!(spec.labels["stress-name"], "api-login");
    }

    #[test]
    fn test_find_workspace_root() {
        let crate_dir = crate_dir();
        let root = find_workspace_root(&crate_dir.join("src")).unwrap();
        assert!(crate_dir.starts_with(&root));
        assert!(root.join("Cargo.toml").is_file());
    }

    #[tokio::test]
    async fn test_run_remote_happy_path() {
        let backend = MockBackend::default();
        let cwd = crate_dir();
        let root = find_workspace_root(&cwd).unwrap();
        let builder = TargetDirBuilder { root: root.clone() };
        let spec = SandboxSpec::new("api/login", "abcd1234");

        let cancel = CancellationToken::new();
        let output = run_remote(&backend, &builder, &cancel, "api_login", &spec, &cwd)
            .await
            .unwrap();
        assert_eq!(output, "ok");
        assert_eq!(
            backend.calls(),
            vec!["provision", "platform", "copy_tree", "run_command", "teardown"]
        );

        let commands = backend.commands.lock().unwrap();
        let command = &commands[0];
        assert!(command.program.starts_with("/workspace/target/linux-amd64"));
        assert_eq!(command.args[0], "api_login");
        assert!(
            command
                .env
                .contains(&(REMOTE_ENV.to_string(), REMOTE_ENV_VALUE.to_string()))
        );
        assert_eq!(
            command.workdir,
            Path::new("/workspace").join(cwd.strip_prefix(&root).unwrap())
        );
    }

    #[tokio::test]
    async fn test_run_remote_tears_down_on_failure() {
        let backend = MockBackend {
            fail_platform: true,
            ..Default::default()
        };
        let builder = TargetDirBuilder {
            root: PathBuf::from("/nowhere"),
        };
        let spec = SandboxSpec::new("api/login", "abcd1234");

        let result = run_remote(
            &backend,
            &builder,
            &CancellationToken::new(),
            "api_login",
            &spec,
            &crate_dir(),
        )
        .await;
        assert!(matches!(result, Err(StressError::Remote(_))));
        assert_eq!(backend.calls(), vec!["provision", "platform", "teardown"]);
    }

    #[tokio::test]
    async fn test_artifact_outside_workspace_is_rejected() {
        let backend = MockBackend::default();
        let builder = TargetDirBuilder {
            root: PathBuf::from("/nowhere"),
        };
        let spec = SandboxSpec::new("api/login", "abcd1234");

        let result = run_remote(
            &backend,
            &builder,
            &CancellationToken::new(),
            "api_login",
            &spec,
            &crate_dir(),
        )
        .await;
        assert!(matches!(result, Err(StressError::Remote(_))));
        assert_eq!(backend.calls().last().map(String::as_str), Some("teardown"));
    }

    #[tokio::test]
    async fn test_remote_runner_object() {
        let root = find_workspace_root(&crate_dir()).unwrap();
        let remote = Remote::new(
            MockBackend::default(),
            TargetDirBuilder { root },
            crate_dir(),
        );
        let runner: &dyn RemoteRunner = &remote;

        let output = runner
            .run_stress(
                &CancellationToken::new(),
                "api_login",
                &SandboxSpec::new("api/login", "abcd1234"),
            )
            .await
            .unwrap();
        assert_eq!(output, "ok");
        assert_eq!(remote.backend.calls().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_remote_command_and_tears_down() {
        let backend = MockBackend {
            hang_command: true,
            ..Default::default()
        };
        let cwd = crate_dir();
        let builder = TargetDirBuilder {
            root: find_workspace_root(&cwd).unwrap(),
        };
        let spec = SandboxSpec::new("api/login", "abcd1234");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(60),
            run_remote(&backend, &builder, &cancel, "api_login", &spec, &cwd),
        )
        .await
        .expect("cancellation should interrupt the remote command");
        assert!(matches!(result, Err(StressError::Cancelled)));
        assert_eq!(
            backend.calls(),
            vec!["provision", "platform", "copy_tree", "run_command", "teardown"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_provision_skips_sandbox() {
        let backend = MockBackend::default();
        let builder = TargetDirBuilder {
            root: PathBuf::from("/nowhere"),
        };
        let spec = SandboxSpec::new("api/login", "abcd1234");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result =
            run_remote(&backend, &builder, &cancel, "api_login", &spec, &crate_dir()).await;
        assert!(matches!(result, Err(StressError::Cancelled)));
        assert!(backend.calls().is_empty());
    }
}
