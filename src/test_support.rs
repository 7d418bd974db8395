use crate::error::ImageError;
use crate::runtime::ImageRuntime;
use crate::types::ImageRef;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// What running a scripted image prints.
#[derive(Debug, Clone)]
enum MockImage {
    /// Answers `--list_cli` and `<cli> --xml` like a real CLI image.
    Clis(BTreeMap<String, String>),
    /// Prints the same text whatever the arguments.
    Plain(String),
}

/// In-memory [`ImageRuntime`] with a scripted remote registry, a local
/// cache, failure injection and a log of every call.
pub struct MockRuntime {
    remote: RwLock<HashMap<String, MockImage>>,
    local: RwLock<HashSet<String>>,
    pulls: RwLock<HashMap<String, usize>>,
    commands: RwLock<Vec<String>>,
    transient_failures: AtomicU32,
    fail_remove: AtomicBool,
    pull_delay: RwLock<Duration>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            remote: RwLock::new(HashMap::new()),
            local: RwLock::new(HashSet::new()),
            pulls: RwLock::new(HashMap::new()),
            commands: RwLock::new(Vec::new()),
            transient_failures: AtomicU32::new(0),
            fail_remove: AtomicBool::new(false),
            pull_delay: RwLock::new(Duration::ZERO),
        }
    }

    /// Two CLIs with small but valid XML specs.
    pub fn sample_clis() -> Vec<(String, String)> {
        ["ColorDeconvolution", "NucleiDetection"]
            .iter()
            .map(|name| (name.to_string(), Self::sample_xml(name)))
            .collect()
    }

    pub fn sample_xml(title: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<executable>
  <title>{}</title>
  <description>scripted</description>
  <parameters>
    <label>IO</label>
    <image><name>inputImageFile</name><label>Input Image</label><index>0</index></image>
    <double><longflag>sigma</longflag><default>1.5</default></double>
  </parameters>
</executable>"#,
            title
        )
    }

    /// Make `image` pullable; runs answer the CLI protocol with `clis`.
    pub fn add_remote_image(&self, image: &ImageRef, clis: Vec<(String, String)>) {
        self.remote
            .write()
            .unwrap()
            .insert(image.to_string(), MockImage::Clis(clis.into_iter().collect()));
    }

    /// Make `image` pullable; every run prints `stdout`.
    pub fn add_plain_image(&self, image: &ImageRef, stdout: &str) {
        self.remote
            .write()
            .unwrap()
            .insert(image.to_string(), MockImage::Plain(stdout.to_string()));
    }

    pub fn cache_locally(&self, image: &ImageRef) {
        self.local.write().unwrap().insert(image.to_string());
    }

    pub fn is_cached(&self, image: &ImageRef) -> bool {
        self.local.read().unwrap().contains(&image.to_string())
    }

    pub fn pull_count(&self, image: &ImageRef) -> usize {
        self.pulls
            .read()
            .unwrap()
            .get(&image.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// The next `n` pulls fail with a transient error.
    pub fn fail_pulls_transiently(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.write().unwrap() = delay;
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    fn record_command(&self, cmd: String) {
        self.commands.write().unwrap().push(cmd);
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageRuntime for MockRuntime {
    async fn image_exists(&self, image: &ImageRef) -> Result<bool, ImageError> {
        self.record_command(format!("inspect:{}", image));
        Ok(self.is_cached(image))
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), ImageError> {
        self.record_command(format!("pull:{}", image));
        *self
            .pulls
            .write()
            .unwrap()
            .entry(image.to_string())
            .or_insert(0) += 1;

        let delay = *self.pull_delay.read().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ImageError::Transient {
                image: image.to_string(),
                reason: "connection reset".to_string(),
            });
        }

        if !self.remote.read().unwrap().contains_key(&image.to_string()) {
            return Err(ImageError::NotFound(image.to_string()));
        }
        self.cache_locally(image);
        Ok(())
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<(), ImageError> {
        self.record_command(format!("remove:{}", image));
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ImageError::Runtime("image is in use".to_string()));
        }
        if !self.local.write().unwrap().remove(&image.to_string()) {
            return Err(ImageError::NotFound(image.to_string()));
        }
        Ok(())
    }

    async fn run(
        &self,
        image: &ImageRef,
        args: &[String],
        _timeout: Duration,
    ) -> Result<String, ImageError> {
        self.record_command(format!("run:{}:{}", image, args.join(" ")));
        if !self.is_cached(image) {
            return Err(ImageError::Runtime(format!("No such image: {}", image)));
        }
        let script = self
            .remote
            .read()
            .unwrap()
            .get(&image.to_string())
            .cloned()
            .ok_or_else(|| ImageError::Runtime(format!("No such image: {}", image)))?;

        match script {
            MockImage::Plain(stdout) => Ok(stdout),
            MockImage::Clis(clis) => match args {
                [flag] if flag == "--list_cli" => {
                    let listing: BTreeMap<&String, serde_json::Value> = clis
                        .keys()
                        .map(|name| (name, serde_json::json!({ "type": "python" })))
                        .collect();
                    Ok(serde_json::to_string(&listing).unwrap_or_default())
                }
                [cli, flag] if flag == "--xml" => clis
                    .get(cli)
                    .cloned()
                    .ok_or_else(|| ImageError::Runtime(format!("unknown cli {}", cli))),
                _ => Err(ImageError::Runtime(format!("unexpected args {:?}", args))),
            },
        }
    }
}
