//! Pull-or-skip access to the local image cache.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::sleep;

use crate::error::ImageError;
use crate::runtime::ImageRuntime;
use crate::types::ImageRef;

/// Proof that an image is present locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub image: ImageRef,
    /// True when this call fetched the image from the network.
    pub pulled: bool,
}

#[derive(Clone)]
pub struct ImagePuller {
    runtime: Arc<dyn ImageRuntime>,
    retries: u32,
    backoff: Duration,
}

impl ImagePuller {
    pub fn new(runtime: Arc<dyn ImageRuntime>, retries: u32, backoff: Duration) -> Self {
        Self {
            runtime,
            retries,
            backoff,
        }
    }

    /// Ensure `image` is in the local cache, pulling it if needed.
    ///
    /// [`ImageError::NotFound`] is returned at once. Transient failures are
    /// retried up to `retries` more times with linear backoff.
    pub async fn pull(&self, image: &ImageRef) -> Result<ImageHandle, ImageError> {
        if self.runtime.image_exists(image).await? {
            info!("Image {} already present locally", image);
            return Ok(ImageHandle {
                image: image.clone(),
                pulled: false,
            });
        }

        let mut attempt = 0;
        loop {
            match self.runtime.pull_image(image).await {
                Ok(()) => {
                    return Ok(ImageHandle {
                        image: image.clone(),
                        pulled: true,
                    })
                }
                Err(ImageError::Transient { reason, .. }) if attempt < self.retries => {
                    attempt += 1;
                    let delay = self.backoff * attempt;
                    warn!(
                        "Pull of {} failed ({}). Retry {}/{} in {:?}...",
                        image, reason, attempt, self.retries, delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether the image is currently in the local cache.
    pub async fn inspect(&self, image: &ImageRef) -> Result<bool, ImageError> {
        self.runtime.image_exists(image).await
    }

    /// Delete the image from the local cache.
    pub async fn remove(&self, image: &ImageRef) -> Result<(), ImageError> {
        self.runtime.remove_image(image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;

    fn puller(mock: &Arc<MockRuntime>, retries: u32) -> ImagePuller {
        ImagePuller::new(mock.clone(), retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn skips_pull_when_cached() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/tools", "v1");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        mock.cache_locally(&image);

        let handle = puller(&mock, 0).pull(&image).await.unwrap();
        assert!(!handle.pulled);
        assert_eq!(mock.pull_count(&image), 0);
        assert_eq!(mock.get_commands(), vec!["inspect:org/tools:v1".to_string()]);
    }

    #[tokio::test]
    async fn pulls_missing_image() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/tools", "v1");
        mock.add_remote_image(&image, MockRuntime::sample_clis());

        let p = puller(&mock, 0);
        let handle = p.pull(&image).await.unwrap();
        assert!(handle.pulled);
        assert!(p.inspect(&image).await.unwrap());
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("null/null", "null");

        let err = puller(&mock, 3).pull(&image).await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
        assert_eq!(mock.pull_count(&image), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/tools", "v1");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        mock.fail_pulls_transiently(2);

        let handle = puller(&mock, 2).pull(&image).await.unwrap();
        assert!(handle.pulled);
        assert_eq!(mock.pull_count(&image), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/tools", "v1");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        mock.fail_pulls_transiently(5);

        let err = puller(&mock, 1).pull(&image).await.unwrap_err();
        assert!(matches!(err, ImageError::Transient { .. }));
        assert_eq!(mock.pull_count(&image), 2);
    }
}
