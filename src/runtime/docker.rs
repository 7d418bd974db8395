use super::ImageRuntime;
use crate::error::ImageError;
use crate::types::{ImageRef, Reference};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::time::Duration;

/// Seconds bollard waits on a single daemon request.
const DAEMON_TIMEOUT_SECS: u64 = 120;

/// Phrases the daemon uses when a repository or tag does not exist.
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "does not exist",
    "manifest unknown",
    "pull access denied",
    "no such image",
];

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `docker_host` (`unix://` socket or `tcp://`/`http://`
    /// address), or to the local daemon with default settings when unset.
    pub fn connect(docker_host: Option<&str>) -> Result<Self, ImageError> {
        let docker = match docker_host {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => {
                Docker::connect_with_http(host, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| ImageError::Runtime(format!("failed to connect to Docker: {}", e)))?;
        Ok(Self { docker })
    }

    fn create_image_options(image: &ImageRef) -> CreateImageOptions<'static, String> {
        match &image.reference {
            Reference::Tag(tag) => CreateImageOptions {
                from_image: image.repository.clone(),
                tag: tag.clone(),
                ..Default::default()
            },
            // A digest travels inside fromImage; the tag must stay empty.
            Reference::Digest(_) => CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            },
        }
    }

    async fn collect_logs(&self, id: &str) -> Result<(String, String), ImageError> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(opts));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| ImageError::Runtime(e.to_string()))? {
                LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                _ => {}
            }
        }
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    async fn start_and_collect(&self, id: &str, image: &ImageRef) -> Result<String, ImageError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| run_failure(image, e))?;

        let mut exit_code = 0;
        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        while let Some(res) = wait.next().await {
            match res {
                Ok(resp) => exit_code = resp.status_code,
                Err(BollardError::DockerContainerWaitError { code, .. }) => exit_code = code,
                Err(e) => return Err(run_failure(image, e)),
            }
        }

        let (stdout, stderr) = self.collect_logs(id).await?;
        if exit_code != 0 {
            return Err(ImageError::Runtime(format!(
                "{} exited with status {}: {}",
                image,
                exit_code,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl ImageRuntime for DockerRuntime {
    async fn image_exists(&self, image: &ImageRef) -> Result<bool, ImageError> {
        match self.docker.inspect_image(&image.to_string()).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify(image, e)),
        }
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), ImageError> {
        info!("Pulling image {}", image);
        let mut stream =
            self.docker
                .create_image(Some(Self::create_image_options(image)), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("{}: {}", image, status);
                    }
                }
                Err(e) => return Err(classify(image, e)),
            }
        }
        Ok(())
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<(), ImageError> {
        let opts = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(&image.to_string(), Some(opts), None)
            .await
            .map_err(|e| classify(image, e))?;
        info!("Removed image {} from local cache", image);
        Ok(())
    }

    async fn run(
        &self,
        image: &ImageRef,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, ImageError> {
        let config = ContainerConfig {
            image: Some(image.to_string()),
            cmd: Some(args.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| run_failure(image, e))?;
        debug!("Running {} {:?} in container {}", image, args, created.id);

        let outcome = tokio::time::timeout(timeout, self.start_and_collect(&created.id, image)).await;

        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&created.id, Some(opts)).await {
            warn!("Failed to remove container {}: {}", created.id, e);
        }

        match outcome {
            Ok(res) => res,
            Err(_) => Err(ImageError::Timeout(timeout.as_secs())),
        }
    }
}

/// Errors while running a CLI inside an image that is already cached. A
/// missing executable is reported as "not found" by the daemon but is a
/// broken image, not a missing one.
fn run_failure(image: &ImageRef, err: BollardError) -> ImageError {
    let message = match err {
        BollardError::DockerResponseServerError { message, .. } => message,
        BollardError::DockerStreamError { error } => error,
        other => other.to_string(),
    };
    ImageError::Runtime(format!("{}: {}", image, message))
}

/// Sort a daemon error into not-found, transient or fatal.
fn classify(image: &ImageRef, err: BollardError) -> ImageError {
    let is_missing = |msg: &str| {
        let msg = msg.to_lowercase();
        NOT_FOUND_MARKERS.iter().any(|m| msg.contains(m))
    };
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            if status_code == 404 || is_missing(&message) {
                ImageError::NotFound(image.to_string())
            } else if status_code >= 500 {
                ImageError::Transient {
                    image: image.to_string(),
                    reason: message,
                }
            } else {
                ImageError::Runtime(message)
            }
        }
        BollardError::DockerStreamError { error } => {
            if is_missing(&error) {
                ImageError::NotFound(image.to_string())
            } else {
                ImageError::Transient {
                    image: image.to_string(),
                    reason: error,
                }
            }
        }
        other => ImageError::Transient {
            image: image.to_string(),
            reason: other.to_string(),
        },
    }
}
