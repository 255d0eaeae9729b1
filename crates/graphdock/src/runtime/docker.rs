//! Docker backend over the engine API.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::volume::RemoveVolumeOptions;
use futures::StreamExt;
use graphdock_common::{HarnessError, HarnessResult, RunId};

use super::{ContainerHandle, ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState, ExecResult};

/// Seconds a container gets to shut down before it is killed.
const STOP_GRACE_SECS: i64 = 60;

/// [`ContainerRuntime`] backed by a local Docker engine.
pub struct DockerRuntime {
    docker: Docker,
    host: String,
    run_id: RunId,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the local socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine client cannot be configured.
    pub fn connect() -> HarnessResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(api_error)?;
        let host = std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|uri| host_from_uri(&uri))
            .unwrap_or_else(|| "localhost".to_string());
        let run_id = RunId::generate();
        tracing::info!(%host, run = %run_id, "Connected to Docker");
        Ok(Self {
            docker,
            host,
            run_id,
        })
    }

    /// Id labelled onto every container this runtime creates.
    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        &self.run_id
    }

    async fn ensure_image(&self, image: &str) -> HarnessResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(api_error)?;
            if let Some(status) = info.status {
                tracing::debug!(image, %status, "Pull progress");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> HarnessResult<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let mut labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(RunId::LABEL.to_string(), self.run_id.to_string());

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(|m| m.to_bind_string()).collect()),
            publish_all_ports: Some(!spec.exposed_ports.is_empty()),
            network_mode: spec.network_mode.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            cmd: spec.command.clone(),
            user: spec.user.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|err| HarnessError::ContainerLaunch {
                container: spec.image.clone(),
                message: err.to_string(),
                logs: String::new(),
            })?;

        tracing::info!(id = %response.id, image = %spec.image, "Created container");
        Ok(ContainerHandle {
            id: response.id,
            image: spec.image.clone(),
        })
    }

    async fn start(&self, container: &ContainerHandle) -> HarnessResult<()> {
        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(api_error)
    }

    async fn stop(&self, container: &ContainerHandle) -> HarnessResult<()> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.docker.stop_container(&container.id, Some(options)).await {
            // 304: already stopped
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                tracing::info!(container = %container, "Stopped container");
                Ok(())
            }
            Err(err) => Err(api_error(err)),
        }
    }

    async fn remove(&self, container: &ContainerHandle) -> HarnessResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&container.id, Some(options))
            .await
            .map_err(api_error)
    }

    async fn exec(&self, container: &ContainerHandle, command: &[String]) -> HarnessResult<ExecResult> {
        tracing::debug!(container = %container, ?command, "Executing command");

        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&container.id, options)
            .await
            .map_err(api_error)?;

        let mut result = ExecResult::default();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await.map_err(api_error)?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(api_error)? {
                    LogOutput::StdOut { message } => {
                        result.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        result.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(api_error)?;
        result.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(result)
    }

    async fn logs(&self, container: &ContainerHandle) -> HarnessResult<ContainerLogs> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut logs = ContainerLogs::default();
        let mut stream = self.docker.logs(&container.id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(api_error)? {
                LogOutput::StdErr { message } => {
                    logs.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    logs.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(logs)
    }

    async fn state(&self, container: &ContainerHandle) -> HarnessResult<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await
            .map_err(api_error)?;
        let Some(state) = inspect.state else {
            return Ok(ContainerState::Created);
        };
        Ok(match state.status {
            Some(
                ContainerStateStatusEnum::RUNNING
                | ContainerStateStatusEnum::RESTARTING
                | ContainerStateStatusEnum::PAUSED,
            ) => ContainerState::Running,
            Some(
                ContainerStateStatusEnum::EXITED
                | ContainerStateStatusEnum::DEAD
                | ContainerStateStatusEnum::REMOVING,
            ) => ContainerState::Exited(state.exit_code.unwrap_or(-1)),
            _ => ContainerState::Created,
        })
    }

    async fn mapped_port(&self, container: &ContainerHandle, port: u16) -> HarnessResult<u16> {
        let inspect = self
            .docker
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await
            .map_err(api_error)?;
        let key = format!("{port}/tcp");
        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .into_iter()
            .flatten()
            .find_map(|binding| binding.host_port.and_then(|p| p.parse().ok()))
            .ok_or_else(|| HarnessError::Runtime {
                message: format!("port {port} of {container} is not published"),
            })
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    async fn remove_volume(&self, name: &str) -> HarnessResult<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(api_error)?;
        tracing::info!(volume = name, "Removed volume");
        Ok(())
    }
}

fn api_error(err: bollard::errors::Error) -> HarnessError {
    HarnessError::Runtime {
        message: err.to_string(),
    }
}

// `tcp://10.0.0.5:2375` -> `10.0.0.5`; unix sockets publish on localhost.
fn host_from_uri(uri: &str) -> Option<String> {
    let rest = uri
        .strip_prefix("tcp://")
        .or_else(|| uri.strip_prefix("http://"))
        .or_else(|| uri.strip_prefix("https://"))?;
    let host = rest.split([':', '/']).next()?;
    (!host.is_empty()).then(|| host.to_string())
}
