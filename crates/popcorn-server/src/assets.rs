use std::collections::HashMap;
use std::path::PathBuf;

/// Maps a machine name to the directory holding its static assets.
pub trait AssetResolver: Send + Sync {
    fn resolve_assets_dir(&self, machine: &str) -> Option<PathBuf>;
}

/// Resolver backed by a fixed name → directory table.
#[derive(Clone, Debug, Default)]
pub struct StaticAssetResolver {
    dirs: HashMap<String, PathBuf>,
}

impl StaticAssetResolver {
    pub fn new(dirs: HashMap<String, PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn with_dir(mut self, machine: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.dirs.insert(machine.into(), dir.into());
        self
    }
}

impl AssetResolver for StaticAssetResolver {
    fn resolve_assets_dir(&self, machine: &str) -> Option<PathBuf> {
        self.dirs.get(machine).cloned()
    }
}
