//! Persistence for the last visited location.
//!
//! Only the URL is stored: tab and selection are re-derived from it on the
//! next start, exactly as a page reload would. A stored location that is
//! no longer a project route is an error, not a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use url::Url;

use crate::nav::ProjectRoute;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub location: String,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(location: &Url) -> Self {
        Self {
            location: location.to_string(),
            saved_at: Utc::now(),
        }
    }

    /// The stored location as a project route.
    pub fn restore(&self) -> Result<Url, PersistenceError> {
        Url::parse(&self.location)
            .ok()
            .filter(|url| ProjectRoute::parse(url).is_some())
            .ok_or_else(|| PersistenceError::NotAProjectRoute {
                location: self.location.clone(),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Could not access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} does not hold a saved location: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Saved location {location} is not a project route")]
    NotAProjectRoute { location: String },
}

impl PersistenceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The saved location, or `None` when nothing was saved yet.
pub fn load(path: &Path) -> Result<Option<Url>, PersistenceError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PersistenceError::io(path, err)),
    };
    let state: PersistedState =
        serde_json::from_str(&contents).map_err(|source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    state.restore().map(Some)
}

/// Save `location`, replacing the previous file in one rename.
pub fn save(path: &Path, location: &Url) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| PersistenceError::io(parent, err))?;
    }
    let contents = serde_json::to_vec_pretty(&PersistedState::new(location)).map_err(|source| {
        PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let staging = path.with_extension("tmp");
    std::fs::write(&staging, contents).map_err(|err| PersistenceError::io(&staging, err))?;
    std::fs::rename(&staging, path).map_err(|err| PersistenceError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rejects_non_project_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.json");
        std::fs::write(&path, r#"{"location":"https://console.test/settings"}"#).unwrap();

        match load(&path) {
            Err(PersistenceError::NotAProjectRoute { location }) => {
                assert_eq!(location, "https://console.test/settings");
            }
            other => panic!("expected a non-project location error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load(&path), Err(PersistenceError::Corrupt { .. })));
    }

    #[test]
    fn test_save_overwrites_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.json");
        let first = Url::parse("https://console.test/projects/7/services").unwrap();
        let second = Url::parse("https://console.test/projects/7/reviews?sel=review%3A12").unwrap();

        save(&path, &first).unwrap();
        save(&path, &second).unwrap();
        assert_eq!(load(&path).unwrap(), Some(second));
        assert!(!path.with_extension("tmp").exists());
    }
}
