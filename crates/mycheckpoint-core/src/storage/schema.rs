//! Store column layout and deploy metadata.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::StoreError;

/// Bumped whenever the on-disk layout changes incompatibly.
pub const SCHEMA_REVISION: u32 = 1;

/// Ordered column list plus the identity counter.
///
/// Columns are only ever appended, so existing rows keep their positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub columns: Vec<String>,
    pub last_id: u64,
}

/// Which build deployed the data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub revision: u32,
    pub build: String,
    pub version: String,
    pub deployed_at: i64,
}

impl Metadata {
    pub fn current(now: i64) -> Self {
        Self {
            revision: SCHEMA_REVISION,
            build: env!("MYCHECKPOINT_BUILD").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            deployed_at: now,
        }
    }

    /// True when this binary should redeploy before collecting.
    pub fn needs_redeploy(&self) -> bool {
        self.revision < SCHEMA_REVISION || self.version != env!("CARGO_PKG_VERSION")
    }

    /// True when the directory was deployed by a newer, incompatible build.
    pub fn is_newer_than_binary(&self) -> bool {
        self.revision > SCHEMA_REVISION
    }

    pub fn load(base_path: &Path) -> Result<Option<Self>, StoreError> {
        read_json(&base_path.join(METADATA_FILE))
    }

    pub fn save(&self, base_path: &Path) -> Result<(), StoreError> {
        write_json_atomic(&base_path.join(METADATA_FILE), self)
    }
}

pub(crate) const METADATA_FILE: &str = "metadata.json";

/// Reads a JSON file, `Ok(None)` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes JSON via a `.tmp` sibling and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
