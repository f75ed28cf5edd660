//! Scripted [`ContainerRuntime`] double for tests. No Docker daemon needed:
//! exec output, exit codes, image availability, and daemon health are all
//! configured up front and interactions are recorded for assertions.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::Path,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use utils::log_msg::StreamKind;

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecHandle, RuntimeError};

#[derive(Debug, Clone)]
pub enum ScriptedChunk {
    Stdout(String),
    Stderr(String),
    Delay(Duration),
}

impl ScriptedChunk {
    pub fn stdout(s: &str) -> Self {
        Self::Stdout(s.to_string())
    }

    pub fn stderr(s: &str) -> Self {
        Self::Stderr(s.to_string())
    }

    pub fn delay(ms: u64) -> Self {
        Self::Delay(Duration::from_millis(ms))
    }
}

#[derive(Default)]
struct FakeState {
    scripts: VecDeque<(Vec<ScriptedChunk>, Option<i64>)>,
    exit_codes: HashMap<String, Option<i64>>,
    next_exec: u64,
    next_container: u64,
    containers: HashMap<String, bool>,
    detached: Vec<String>,
    created: Vec<String>,
    removed: Vec<String>,
    images: HashSet<String>,
    pullable: HashSet<String>,
    buildable: HashSet<String>,
    built: Vec<String>,
    local_fallback: Option<String>,
    daemon_down: bool,
    not_installed: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue output and exit code for the next attached exec. `None` exit
    /// code means the exec never reports one (still running / killed).
    pub fn script_exec(&self, chunks: Vec<ScriptedChunk>, exit_code: Option<i64>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .push_back((chunks, exit_code));
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().unwrap().images.insert(image.to_string());
    }

    pub fn allow_pull(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .pullable
            .insert(image.to_string());
    }

    pub fn allow_build(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .buildable
            .insert(image.to_string());
    }

    pub fn built_images(&self) -> Vec<String> {
        self.state.lock().unwrap().built.clone()
    }

    pub fn set_local_fallback(&self, image: Option<&str>) {
        self.state.lock().unwrap().local_fallback = image.map(str::to_string);
    }

    pub fn set_daemon_down(&self, down: bool) {
        self.state.lock().unwrap().daemon_down = down;
    }

    pub fn set_not_installed(&self, missing: bool) {
        self.state.lock().unwrap().not_installed = missing;
    }

    pub fn mark_stopped(&self, name: &str) {
        if let Some(running) = self.state.lock().unwrap().containers.get_mut(name) {
            *running = false;
        }
    }

    pub fn insert_stale_container(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(name.to_string(), false);
    }

    pub fn detached_commands(&self) -> Vec<String> {
        self.state.lock().unwrap().detached.clone()
    }

    pub fn created_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn running_containers(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|(_, running)| **running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn check_daemon(&self) -> Result<(), RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.not_installed {
            return Err(RuntimeError::NotInstalled);
        }
        if state.daemon_down {
            return Err(RuntimeError::DaemonUnreachable("fake daemon down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn installed(&self) -> bool {
        !self.state.lock().unwrap().not_installed
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_daemon()
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        self.check_daemon()?;
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), RuntimeError> {
        self.check_daemon()?;
        let pullable = self.state.lock().unwrap().pullable.contains(image);
        if pullable {
            progress(format!("Pulling {image}"));
            self.state.lock().unwrap().images.insert(image.to_string());
            Ok(())
        } else {
            Err(RuntimeError::Io(std::io::Error::other(format!(
                "fake pull failure for {image}"
            ))))
        }
    }

    async fn build_image(
        &self,
        image: &str,
        _dockerfile: &Path,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), RuntimeError> {
        self.check_daemon()?;
        let buildable = self.state.lock().unwrap().buildable.contains(image);
        if buildable {
            progress(format!("Building {image}"));
            let mut state = self.state.lock().unwrap();
            state.images.insert(image.to_string());
            state.built.push(image.to_string());
            Ok(())
        } else {
            Err(RuntimeError::BuildFailed(format!(
                "fake build failure for {image}"
            )))
        }
    }

    async fn find_local_image(&self, family: &str) -> Result<Option<String>, RuntimeError> {
        self.check_daemon()?;
        let state = self.state.lock().unwrap();
        if let Some(fallback) = &state.local_fallback
            && fallback.starts_with(family)
        {
            return Ok(Some(fallback.clone()));
        }
        Ok(None)
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_daemon()?;
        let mut state = self.state.lock().unwrap();
        state.next_container += 1;
        let id = format!("fake-container-{}", state.next_container);
        state.containers.insert(spec.name.clone(), true);
        state.created.push(spec.name.clone());
        Ok(id)
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        self.check_daemon()?;
        Ok(*self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .unwrap_or(&false))
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.check_daemon()?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(name) {
            Some(running) => {
                *running = false;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(name.to_string())),
        }
    }

    async fn force_remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.check_daemon()?;
        let mut state = self.state.lock().unwrap();
        state.containers.remove(name);
        state.removed.push(name.to_string());
        Ok(())
    }

    async fn exec_stream(
        &self,
        _container: &str,
        _shell_command: &str,
        _workdir: &str,
    ) -> Result<ExecHandle, RuntimeError> {
        self.check_daemon()?;
        let (exec_id, chunks) = {
            let mut state = self.state.lock().unwrap();
            state.next_exec += 1;
            let exec_id = format!("fake-exec-{}", state.next_exec);
            let (chunks, exit_code) = state.scripts.pop_front().unwrap_or((Vec::new(), Some(0)));
            state.exit_codes.insert(exec_id.clone(), exit_code);
            (exec_id, chunks)
        };

        let output = futures::stream::iter(chunks)
            .filter_map(|chunk| async move {
                match chunk {
                    ScriptedChunk::Stdout(s) => Some(Ok((StreamKind::Stdout, s))),
                    ScriptedChunk::Stderr(s) => Some(Ok((StreamKind::Stderr, s))),
                    ScriptedChunk::Delay(d) => {
                        tokio::time::sleep(d).await;
                        None
                    }
                }
            })
            .boxed();

        Ok(ExecHandle { exec_id, output })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        self.check_daemon()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .exit_codes
            .get(exec_id)
            .copied()
            .flatten())
    }

    async fn exec_detached(
        &self,
        _container: &str,
        shell_command: &str,
    ) -> Result<(), RuntimeError> {
        self.check_daemon()?;
        self.state
            .lock()
            .unwrap()
            .detached
            .push(shell_command.to_string());
        Ok(())
    }
}
