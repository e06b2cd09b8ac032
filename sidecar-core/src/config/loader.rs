use super::Config;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "sidecar.json";

/// Config loader with auto-discovery
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("./config"),
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            ],
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader that only looks in the given directories, in order.
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// First `sidecar.json` found along the search paths.
    pub fn discover(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
    }

    pub async fn load(&self) -> crate::Result<Config> {
        match self.discover() {
            Some(path) => self.load_from(&path).await,
            None => Err(crate::Error::Config(format!(
                "No {} found in {:?}",
                CONFIG_FILE_NAME, self.search_paths
            ))),
        }
    }

    pub async fn load_from(&self, path: &Path) -> crate::Result<Config> {
        debug!("Loading config from {}", path.display());
        Config::load(path).await
    }
}
