//! Dynamic routes derived from discovered CLIs.

use std::collections::HashMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::types::{CliEntry, ImageRef};

/// Characters left as-is in a path segment; `:` keeps digests readable.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b':');

/// What a published route serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Raw XML spec.
    XmlSpec,
    /// Parsed spec as JSON.
    Spec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub image: ImageRef,
    pub cli: String,
    pub kind: RouteKind,
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

fn base_path(prefix: &str, image: &ImageRef, cli: &str) -> String {
    let repository: Vec<String> = image.repository.split('/').map(encode).collect();
    format!(
        "{}/{}/{}/{}",
        prefix.trim_end_matches('/'),
        repository.join("/"),
        encode(image.version()),
        encode(cli)
    )
}

/// Re-encode every segment of a request path the way routes are built, so
/// `My Cli` and `My%20Cli` resolve to the same key.
pub fn canonical_path(path: &str) -> String {
    path.split('/')
        .map(|segment| encode(&percent_decode_str(segment).decode_utf8_lossy()))
        .collect::<Vec<_>>()
        .join("/")
}

pub fn xmlspec_path(prefix: &str, image: &ImageRef, cli: &str) -> String {
    format!("{}/xmlspec", base_path(prefix, image, cli))
}

pub fn spec_path(prefix: &str, image: &ImageRef, cli: &str) -> String {
    format!("{}/spec", base_path(prefix, image, cli))
}

/// Route path -> descriptor. Lives inside the registry so that routes
/// change in the same write as the metadata they belong to.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: HashMap<String, RouteDescriptor>,
}

impl RouteTable {
    pub fn publish(&mut self, entries: &[CliEntry]) {
        for entry in entries {
            self.routes.insert(
                entry.xmlspec.clone(),
                RouteDescriptor {
                    image: entry.image.clone(),
                    cli: entry.name.clone(),
                    kind: RouteKind::XmlSpec,
                },
            );
            self.routes.insert(
                entry.spec_route.clone(),
                RouteDescriptor {
                    image: entry.image.clone(),
                    cli: entry.name.clone(),
                    kind: RouteKind::Spec,
                },
            );
        }
    }

    /// Drop every route owned by `image`; returns how many were removed.
    pub fn unpublish(&mut self, image: &ImageRef) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, d| &d.image != image);
        before - self.routes.len()
    }

    pub fn lookup(&self, path: &str) -> Option<&RouteDescriptor> {
        self.routes.get(&canonical_path(path))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
