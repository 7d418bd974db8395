//! Enumerates the CLIs packaged in an image.
//!
//! An image following the slicer CLI convention answers two invocations:
//! `--list_cli` prints a JSON object keyed by CLI name, and
//! `<name> --xml` prints that CLI's execution-model XML.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::DiscoveryError;
use crate::puller::ImageHandle;
use crate::routes;
use crate::runtime::ImageRuntime;
use crate::types::CliEntry;
use crate::xmlspec;

#[derive(Debug, Deserialize)]
struct ListedCli {
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub struct Discovery {
    runtime: Arc<dyn ImageRuntime>,
    run_timeout: Duration,
    route_prefix: String,
}

impl Discovery {
    pub fn new(runtime: Arc<dyn ImageRuntime>, run_timeout: Duration, route_prefix: &str) -> Self {
        Self {
            runtime,
            run_timeout,
            route_prefix: route_prefix.to_string(),
        }
    }

    /// Entries come back sorted by CLI name.
    pub async fn discover(&self, handle: &ImageHandle) -> Result<Vec<CliEntry>, DiscoveryError> {
        let image = &handle.image;
        let listing = self
            .runtime
            .run(image, &["--list_cli".to_string()], self.run_timeout)
            .await?;

        let listed: BTreeMap<String, ListedCli> =
            serde_json::from_str(listing.trim()).map_err(|e| DiscoveryError::ListOutput {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        if listed.is_empty() {
            return Err(DiscoveryError::EmptyManifest(image.to_string()));
        }
        info!("{} declares {} CLI(s)", image, listed.len());

        let mut entries = Vec::with_capacity(listed.len());
        for (name, cli) in listed {
            let args = [name.clone(), "--xml".to_string()];
            let xml = self.runtime.run(image, &args, self.run_timeout).await?;
            let xml = xml.trim().to_string();
            if xml.is_empty() {
                return Err(DiscoveryError::XmlOutput {
                    image: image.to_string(),
                    cli: name,
                });
            }
            let spec = xmlspec::parse(&xml).map_err(|reason| DiscoveryError::Xml {
                cli: name.clone(),
                reason,
            })?;

            entries.push(CliEntry {
                xmlspec: routes::xmlspec_path(&self.route_prefix, image, &name),
                spec_route: routes::spec_path(&self.route_prefix, image, &name),
                digest: hex::encode(Sha256::digest(xml.as_bytes())),
                image: image.clone(),
                kind: cli.kind,
                name,
                xml,
                spec,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;
    use crate::types::ImageRef;

    fn discovery(mock: &Arc<MockRuntime>) -> Discovery {
        Discovery::new(mock.clone(), Duration::from_secs(5), "/cli")
    }

    fn handle(image: &ImageRef) -> ImageHandle {
        ImageHandle {
            image: image.clone(),
            pulled: true,
        }
    }

    #[tokio::test]
    async fn discovers_sorted_entries_with_routes() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("dsarchive/histomicstk", "v0.1.3");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        mock.cache_locally(&image);

        let entries = discovery(&mock).discover(&handle(&image)).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ColorDeconvolution", "NucleiDetection"]);

        let first = &entries[0];
        assert_eq!(
            first.xmlspec,
            "/cli/dsarchive/histomicstk/v0.1.3/ColorDeconvolution/xmlspec"
        );
        assert_eq!(first.kind.as_deref(), Some("python"));
        assert_eq!(first.spec.title, "ColorDeconvolution");
        assert_eq!(first.digest.len(), 64);
    }

    #[tokio::test]
    async fn image_without_manifest_is_a_discovery_error() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("library/hello-world", "latest");
        mock.add_plain_image(&image, "\nHello from Docker!\n");
        mock.cache_locally(&image);

        let err = discovery(&mock).discover(&handle(&image)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::ListOutput { .. }));
    }

    #[tokio::test]
    async fn empty_listing_is_rejected() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/empty", "1");
        mock.add_remote_image(&image, Vec::new());
        mock.cache_locally(&image);

        let err = discovery(&mock).discover(&handle(&image)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::EmptyManifest(_)));
    }

    #[tokio::test]
    async fn invalid_xml_fails_the_whole_image() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/broken", "1");
        mock.add_remote_image(
            &image,
            vec![
                ("Good".to_string(), MockRuntime::sample_xml("Good")),
                ("Bad".to_string(), "<html/>".to_string()),
            ],
        );
        mock.cache_locally(&image);

        let err = discovery(&mock).discover(&handle(&image)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Xml { ref cli, .. } if cli == "Bad"));
    }
}
