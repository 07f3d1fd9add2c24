//! Docker runtime backed by bollard.
//!
//! Every API call runs under the configured deadline and transient failures
//! (daemon unreachable, busy, restarting) are retried with backoff. Errors
//! the daemon answers with a 4xx status are permanent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::network::CreateNetworkOptions;
use bollard::models::{HostConfig, PortBinding as DockerPortBinding};
use bollard::Docker;
use futures_util::TryStreamExt;
use manman_bus::BackoffPolicy;
use manman_id::ServerId;
use tracing::{debug, info};

use crate::runtime::{
    with_retry, ContainerRuntime, ContainerSpec, ContainerState, HostInfo, ManagedContainer,
    RuntimeError, LABEL_MANAGED, LABEL_SERVER_ID,
};

const MAX_ATTEMPTS: u32 = 4;

/// Image pulls get a longer deadline than ordinary calls.
const PULL_TIMEOUT_FACTOR: u32 = 10;

fn classify(err: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error;
    match err {
        Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            if status_code >= 500 || status_code == 408 || status_code == 429 {
                RuntimeError::Transient(format!("{status_code}: {message}"))
            } else {
                RuntimeError::Permanent(format!("{status_code}: {message}"))
            }
        }
        other => RuntimeError::Transient(other.to_string()),
    }
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

pub struct DockerRuntime {
    docker: Docker,
    call_timeout: Duration,
    backoff: BackoffPolicy,
}

impl DockerRuntime {
    /// Connects to the local daemon using `DOCKER_HOST` or the default socket.
    pub fn connect(call_timeout: Duration) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(classify)?;
        Ok(Self {
            docker,
            call_timeout,
            backoff: BackoffPolicy::default(),
        })
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling image");
        with_retry(
            "pull_image",
            &self.backoff,
            MAX_ATTEMPTS,
            self.call_timeout * PULL_TIMEOUT_FACTOR,
            || async {
                self.docker
                    .create_image(
                        Some(CreateImageOptions {
                            from_image: image,
                            ..Default::default()
                        }),
                        None,
                        None,
                    )
                    .try_collect::<Vec<_>>()
                    .await
                    .map(|_| ())
                    .map_err(classify)
            },
        )
        .await
    }

    async fn create_once(&self, spec: &ContainerSpec) -> Result<String, bollard::errors::Error> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for binding in &spec.ports {
            let key = format!("{}/{}", binding.container_port, binding.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![DockerPortBinding {
                    host_ip: None,
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            open_stdin: Some(false),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                port_bindings: Some(port_bindings),
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(response.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn info(&self) -> Result<HostInfo, RuntimeError> {
        let info = with_retry("info", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            self.docker.info().await.map_err(classify)
        })
        .await?;

        Ok(HostInfo {
            cpu_cores: info.ncpu.unwrap_or(0).max(0) as u32,
            memory_bytes: info.mem_total.unwrap_or(0).max(0) as u64,
            docker_version: info.server_version.unwrap_or_default(),
        })
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        with_retry("create_network", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            let options = CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                labels: labels.clone(),
                ..Default::default()
            };
            match self.docker.create_network(options).await {
                Ok(_) => Ok(()),
                Err(e) if is_status(&e, 409) => {
                    debug!(network = name, "Network already exists");
                    Ok(())
                }
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        with_retry("remove_network", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            match self.docker.remove_network(name).await {
                Ok(()) => Ok(()),
                Err(e) if is_status(&e, 404) => Ok(()),
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let created = with_retry("create_container", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            match self.create_once(spec).await {
                Ok(id) => Ok(Some(id)),
                // Image missing locally.
                Err(e) if is_status(&e, 404) => Ok(None),
                Err(e) => Err(classify(e)),
            }
        })
        .await?;

        if let Some(id) = created {
            return Ok(id);
        }

        self.pull_image(&spec.image).await?;
        with_retry("create_container", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            self.create_once(spec).await.map_err(classify)
        })
        .await
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        with_retry("start_container", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            match self
                .docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(()) => Ok(()),
                // Already started.
                Err(e) if is_status(&e, 304) => Ok(()),
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let deadline = self.call_timeout + timeout;
        with_retry("stop_container", &self.backoff, MAX_ATTEMPTS, deadline, || async {
            let options = StopContainerOptions {
                t: timeout.as_secs() as i64,
            };
            match self.docker.stop_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                Err(e) if is_status(&e, 304) || is_status(&e, 404) => Ok(()),
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        with_retry("kill_container", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            let options = KillContainerOptions { signal: "SIGKILL" };
            match self.docker.kill_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                // Not running or already gone.
                Err(e) if is_status(&e, 404) || is_status(&e, 409) => Ok(()),
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        with_retry("remove_container", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.docker.remove_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                Err(e) if is_status(&e, 404) => Ok(()),
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let inspected = with_retry("inspect_container", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            match self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
            {
                Ok(response) => Ok(Some(response)),
                Err(e) if is_status(&e, 404) => Ok(None),
                Err(e) => Err(classify(e)),
            }
        })
        .await?;

        Ok(inspected.map(|response| {
            let state = response.state.unwrap_or_default();
            let ip_address = response
                .network_settings
                .and_then(|n| n.networks)
                .and_then(|networks| {
                    networks
                        .into_values()
                        .filter_map(|endpoint| endpoint.ip_address)
                        .find(|ip| !ip.is_empty())
                });
            ContainerState {
                running: state.running.unwrap_or(false),
                exit_code: state.exit_code,
                ip_address,
            }
        }))
    }

    async fn list_managed(&self, server_id: ServerId) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{LABEL_MANAGED}=true"),
                format!("{LABEL_SERVER_ID}={server_id}"),
            ],
        )]);

        let summaries = with_retry("list_containers", &self.backoff, MAX_ATTEMPTS, self.call_timeout, || async {
            self.docker
                .list_containers(Some(ListContainersOptions {
                    all: true,
                    filters: filters.clone(),
                    ..Default::default()
                }))
                .await
                .map_err(classify)
        })
        .await?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let labels = summary.labels.unwrap_or_default();
                let running = summary.state == Some(bollard::models::ContainerSummaryStateEnum::RUNNING);
                Some(ManagedContainer::from_labels(id, &labels, running))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::errors::Error;
    use rstest::rstest;

    fn server_error(status_code: u16) -> Error {
        Error::DockerResponseServerError {
            status_code,
            message: "boom".to_string(),
        }
    }

    #[rstest]
    #[case(500, true)]
    #[case(503, true)]
    #[case(408, true)]
    #[case(429, true)]
    #[case(400, false)]
    #[case(404, false)]
    #[case(409, false)]
    fn test_classify_server_errors(#[case] status_code: u16, #[case] transient: bool) {
        assert_eq!(classify(server_error(status_code)).is_transient(), transient);
    }

    #[test]
    fn test_is_status() {
        assert!(is_status(&server_error(409), 409));
        assert!(!is_status(&server_error(404), 409));
    }
}
