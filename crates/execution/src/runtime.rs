use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use utils::log_msg::StreamKind;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(
        "Docker is not installed. Install Docker (https://docs.docker.com/get-docker/) and try again."
    )]
    NotInstalled,
    #[error("The Docker daemon is not reachable. Start Docker and try again: {0}")]
    DaemonUnreachable(String),
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Command contains unsupported characters")]
    InvalidCommand,
    #[error("Image build failed: {0}")]
    BuildFailed(String),
    #[error(transparent)]
    Api(#[from] bollard::errors::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to create one tenant container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host-side project directory, bind-mounted read-write.
    pub project_dir: PathBuf,
    /// Fixed path the project directory appears at inside the container.
    pub mount_target: String,
    /// Internal network shared with the reverse proxy. No host ports are
    /// published; the proxy addresses the container by name.
    pub network: Option<String>,
    pub memory_limit_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub internal_port: u16,
    pub labels: HashMap<String, String>,
}

/// A started in-container exec with its attached output stream.
pub struct ExecHandle {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<(StreamKind, String), RuntimeError>>,
}

/// Seam over the container runtime. The production implementation talks to
/// the Docker daemon; tests substitute a scripted fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Whether the runtime binary exists on this host at all. Cheap and
    /// synchronous; does not touch the daemon.
    fn installed(&self) -> bool;

    /// Round-trip to the daemon. Distinguishes "daemon down" from
    /// "not installed".
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pull an image, reporting human-readable progress lines.
    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), RuntimeError>;

    /// Build `image` from a Dockerfile, using the Dockerfile's directory as
    /// the build context. Progress lines come from the build output.
    async fn build_image(
        &self,
        image: &str,
        dockerfile: &Path,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), RuntimeError>;

    /// Best local image whose repo tag starts with `family` (for example
    /// "node"), used as the last-resort fallback when pulls fail offline.
    async fn find_local_image(&self, family: &str) -> Result<Option<String>, RuntimeError>;

    /// Create and start a detached container; returns the runtime id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn force_remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Start a shell command inside a running container and attach to its
    /// output streams.
    async fn exec_stream(
        &self,
        container: &str,
        shell_command: &str,
        workdir: &str,
    ) -> Result<ExecHandle, RuntimeError>;

    /// Exit code of a finished exec, `None` while it is still running.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError>;

    /// Fire-and-forget exec with no attached streams (signal delivery,
    /// pid-file cleanup).
    async fn exec_detached(&self, container: &str, shell_command: &str)
    -> Result<(), RuntimeError>;
}

impl RuntimeError {
    /// Environment errors need different user remediation than transport
    /// errors; the web layer uses this to pick a status code.
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            RuntimeError::NotInstalled | RuntimeError::DaemonUnreachable(_)
        )
    }
}
