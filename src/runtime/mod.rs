use std::time::Duration;

use async_trait::async_trait;

use crate::error::ImageError;
use crate::types::ImageRef;

pub mod docker;
pub use docker::DockerRuntime;

/// The subset of a container engine the service needs.
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Whether the image is present in the local cache.
    async fn image_exists(&self, image: &ImageRef) -> Result<bool, ImageError>;

    /// Pull the image from its registry.
    /// Must return [`ImageError::NotFound`] when the repository or tag does not exist.
    async fn pull_image(&self, image: &ImageRef) -> Result<(), ImageError>;

    /// Remove the image from the local cache.
    async fn remove_image(&self, image: &ImageRef) -> Result<(), ImageError>;

    /// Run the image once with `args` in an isolated container and return
    /// its stdout. The container is removed afterwards.
    async fn run(
        &self,
        image: &ImageRef,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, ImageError>;
}
