//! Docker-backed [`ContainerRuntime`] implementation.
//!
//! Talks to the local daemon over bollard. Containers are created detached
//! with the tenant project directory bind-mounted and no published host
//! ports; commands run through the exec API with attached output streams.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
        StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{CreateImageOptions, ListImagesOptions},
    models::HostConfig,
};
use futures::StreamExt;
use utils::log_msg::StreamKind;

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecHandle, RuntimeError};

/// Seconds Docker waits between SIGTERM and SIGKILL when stopping a
/// container.
const STOP_TIMEOUT_SECS: i64 = 5;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the default socket. Fails with an actionable error when
    /// the docker binary is missing entirely, or when the daemon does not
    /// answer.
    pub fn connect() -> Result<Self, RuntimeError> {
        if which::which("docker").is_err() {
            return Err(RuntimeError::NotInstalled);
        }
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::DaemonUnreachable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn map_container_error(name: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::ContainerNotFound(name.to_string()),
        other => RuntimeError::Api(other),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn installed(&self) -> bool {
        which::which("docker").is_ok()
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::DaemonUnreachable(e.to_string()))
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Api(e)),
        }
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), RuntimeError> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(status) = info.status {
                        progress(status);
                    }
                }
                // Individual layer errors ("already exists" and friends) are
                // not fatal; the final image_present check decides.
                Err(e) => tracing::debug!("image pull stream item for {image}: {e}"),
            }
        }

        if self.image_present(image).await? {
            Ok(())
        } else {
            Err(RuntimeError::Api(bollard::errors::Error::IOError {
                err: std::io::Error::other(format!("pull of {image} produced no local image")),
            }))
        }
    }

    async fn build_image(
        &self,
        image: &str,
        dockerfile: &Path,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), RuntimeError> {
        let context = dockerfile.parent().unwrap_or(Path::new("."));
        progress(format!("Building {image}"));

        // The CLI handles the build-context upload; the daemon API would
        // require tarring the context ourselves.
        let output = tokio::process::Command::new("docker")
            .args(["build", "-t", image, "-f"])
            .arg(dockerfile)
            .arg(context)
            .output()
            .await?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            progress(line.to_string());
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::BuildFailed(format!(
                "{image}: {}",
                stderr.trim()
            )));
        }

        if self.image_present(image).await? {
            Ok(())
        } else {
            Err(RuntimeError::BuildFailed(format!(
                "build of {image} produced no local image"
            )))
        }
    }

    async fn find_local_image(&self, family: &str) -> Result<Option<String>, RuntimeError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        let tag = images
            .into_iter()
            .flat_map(|img| img.repo_tags)
            .find(|tag| tag.starts_with(family));
        Ok(tag)
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let bind = format!("{}:{}", spec.project_dir.display(), spec.mount_target);
        let exposed: HashMap<String, HashMap<(), ()>> =
            HashMap::from([(format!("{}/tcp", spec.internal_port), HashMap::new())]);

        let host_config = HostConfig {
            binds: Some(vec![bind]),
            network_mode: spec.network.clone(),
            memory: spec.memory_limit_bytes,
            nano_cpus: spec.nano_cpus,
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            // The container idles; every command arrives through exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(spec.mount_target.clone()),
            exposed_ports: Some(exposed),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await?;

        Ok(created.id)
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_container(name, None).await {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Api(e)),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .map_err(|e| map_container_error(name, e))
    }

    async fn force_remove(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone is the desired end state.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Api(e)),
        }
    }

    async fn exec_stream(
        &self,
        container: &str,
        shell_command: &str,
        workdir: &str,
    ) -> Result<ExecHandle, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", shell_command]),
                    working_dir: Some(workdir),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_container_error(container, e))?;

        let exec_id = exec.id.clone();
        let output = match self.docker.start_exec(&exec_id, None).await? {
            StartExecResults::Attached { output, .. } => output
                .filter_map(|chunk| async move {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => Some(Ok((
                            StreamKind::Stdout,
                            String::from_utf8_lossy(&message).into_owned(),
                        ))),
                        Ok(bollard::container::LogOutput::StdErr { message }) => Some(Ok((
                            StreamKind::Stderr,
                            String::from_utf8_lossy(&message).into_owned(),
                        ))),
                        Ok(_) => None,
                        Err(e) => Some(Err(RuntimeError::Api(e))),
                    }
                })
                .boxed(),
            StartExecResults::Detached => futures::stream::empty().boxed(),
        };

        Ok(ExecHandle { exec_id, output })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn exec_detached(
        &self,
        container: &str,
        shell_command: &str,
    ) -> Result<(), RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", shell_command]),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_container_error(container, e))?;

        self.docker.start_exec(&exec.id, None).await?;
        Ok(())
    }
}
