//! Connection discovery — finds the build server a project advertises in
//! `<root>/.bsp/*.json`.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use serde::Deserialize;

use crate::error::DiscoveryError;

const BSP_DIR: &str = ".bsp";

const CONNECTION_FILE_GLOB: &str = "*.json";

/// Contents of a BSP connection file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    /// Display name of the build server.
    pub name: String,
    /// Build server version.
    #[serde(default)]
    pub version: String,
    /// Protocol version the server speaks.
    #[serde(default)]
    pub bsp_version: String,
    /// Languages the server supports.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Command line that starts the server; `argv[0]` is the executable.
    pub argv: Vec<String>,
}

impl ConnectionDescriptor {
    /// Split `argv` into program and arguments. `None` when empty.
    #[must_use]
    pub fn command(&self) -> Option<(&str, &[String])> {
        self.argv
            .split_first()
            .map(|(program, args)| (program.as_str(), args))
    }
}

fn connection_file_matcher() -> Result<GlobMatcher, DiscoveryError> {
    let mut builder = GlobBuilder::new(CONNECTION_FILE_GLOB);
    builder.case_insensitive(true).literal_separator(true);
    let glob = builder.build().map_err(DiscoveryError::Pattern)?;
    Ok(glob.compile_matcher())
}

/// Connection files under `<project_root>/.bsp`, sorted by file name.
fn candidates(project_root: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let dir = project_root.join(BSP_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(DiscoveryError::Io { path: dir, source }),
    };

    let matcher = connection_file_matcher()?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DiscoveryError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.file_name().is_some_and(|name| matcher.is_match(name)) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Locate and parse the project's connection descriptor.
///
/// Returns `Ok(None)` when the project has no `.bsp` directory or no
/// `*.json` file in it. With several candidates the lexicographically
/// first file name wins.
pub fn discover(project_root: &Path) -> Result<Option<ConnectionDescriptor>, DiscoveryError> {
    let Some(path) = candidates(project_root)?.into_iter().next() else {
        tracing::debug!(root = %project_root.display(), "No BSP connection file found");
        return Ok(None);
    };

    let bytes = std::fs::read(&path).map_err(|source| DiscoveryError::Io {
        path: path.clone(),
        source,
    })?;
    let descriptor: ConnectionDescriptor =
        serde_json::from_slice(&bytes).map_err(|source| DiscoveryError::Parse {
            path: path.clone(),
            source,
        })?;

    tracing::debug!(
        path = %path.display(),
        server = %descriptor.name,
        "Discovered BSP connection file"
    );
    Ok(Some(descriptor))
}
