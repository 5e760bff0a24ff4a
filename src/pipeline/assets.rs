//! Asset fetching (meshes, textures, robot descriptions).
//!
//! Resolution order: the active player if it serves the URI, then a fetcher
//! registered for the URI scheme. `file://` is registered by default.

use crate::error::{PlayerError, Result};
use crate::player::Player;
use crate::types::{Asset, FetchAssetOptions, PlayerCapability};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::debug;

/// Fetches an absolute URI of one scheme.
pub type AssetFetcher = Arc<dyn Fn(&str) -> Result<Asset> + Send + Sync>;

/// Scheme-keyed asset fetchers.
pub struct AssetResolver {
    fetchers: RwLock<BTreeMap<String, AssetFetcher>>,
}

impl AssetResolver {
    /// A resolver with the built-in `file` fetcher.
    pub fn new() -> Self {
        let resolver = Self {
            fetchers: RwLock::new(BTreeMap::new()),
        };
        resolver.register("file", fetch_file);
        resolver
    }

    /// Register (or replace) the fetcher for `scheme`.
    pub fn register(
        &self,
        scheme: impl Into<String>,
        fetcher: impl Fn(&str) -> Result<Asset> + Send + Sync + 'static,
    ) {
        self.fetchers
            .write()
            .insert(scheme.into().to_ascii_lowercase(), Arc::new(fetcher));
    }

    pub fn schemes(&self) -> Vec<String> {
        self.fetchers.read().keys().cloned().collect()
    }

    /// Fetch `uri`, resolving relative references against
    /// `options.reference_url`.
    pub fn fetch(
        &self,
        player: Option<&dyn Player>,
        uri: &str,
        options: &FetchAssetOptions,
    ) -> Result<Asset> {
        let uri = resolve_uri(uri, options.reference_url.as_deref())?;

        if let Some(player) = player {
            if player.capabilities().contains(&PlayerCapability::Assets) {
                if let Some(result) = player.fetch_asset(&uri) {
                    debug!(%uri, "Asset served by player");
                    return result;
                }
            }
        }

        let scheme = scheme_of(&uri)
            .ok_or_else(|| PlayerError::InvalidArgument(format!("not an absolute URI: {uri}")))?
            .to_ascii_lowercase();
        let fetcher = self.fetchers.read().get(&scheme).cloned();
        match fetcher {
            Some(fetcher) => fetcher(&uri),
            None => Err(PlayerError::UnsupportedScheme(scheme)),
        }
    }
}

impl Default for AssetResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheme of an absolute URI (`package` for `package://robot/mesh.stl`).
fn scheme_of(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Make `uri` absolute. Absolute URIs are returned as-is; relative ones
/// are joined to `reference` with `.` and `..` segments collapsed.
pub fn resolve_uri(uri: &str, reference: Option<&str>) -> Result<String> {
    if scheme_of(uri).is_some() {
        return Ok(uri.to_string());
    }
    let reference = reference.ok_or_else(|| {
        PlayerError::InvalidArgument(format!("relative asset URI without a reference: {uri}"))
    })?;
    let Some((scheme, rest)) = reference.split_once("://") else {
        return Err(PlayerError::InvalidArgument(format!(
            "reference URL is not absolute: {reference}"
        )));
    };
    let (authority, base_path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, "/"),
    };

    let joined = if uri.starts_with('/') {
        uri.to_string()
    } else {
        let dir = &base_path[..base_path.rfind('/').map_or(0, |i| i + 1)];
        format!("{dir}{uri}")
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/').skip(1) {
        match segment {
            "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    Ok(format!("{scheme}://{authority}/{}", segments.join("/")))
}

/// Media type guessed from the path extension.
pub fn media_type_for(path: &str) -> Option<&'static str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, extension) = file.rsplit_once('.')?;
    let media_type = match extension.to_ascii_lowercase().as_str() {
        "stl" => "model/stl",
        "dae" => "model/vnd.collada+xml",
        "glb" => "model/gltf-binary",
        "gltf" => "model/gltf+json",
        "obj" => "model/obj",
        "urdf" | "xacro" | "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "json" => "application/json",
        _ => return None,
    };
    Some(media_type)
}

fn fetch_file(uri: &str) -> Result<Asset> {
    let path = uri
        .strip_prefix("file://")
        .ok_or_else(|| PlayerError::UnsupportedScheme(uri.to_string()))?;
    let data = std::fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => PlayerError::AssetNotFound(uri.to_string()),
        _ => PlayerError::Io(e),
    })?;
    Ok(Asset {
        uri: uri.to_string(),
        data,
        media_type: media_type_for(path).map(str::to_string),
    })
}
