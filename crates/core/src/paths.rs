use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".conductor"))
            .unwrap_or_else(|| PathBuf::from(".conductor"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Where `conductor demo --dump` writes exported diagnostic snapshots.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base.join("snapshots")
    }

    pub fn snapshot_file(&self, label: &str) -> PathBuf {
        let safe = label.replace([':', '/', '\\', ' '], "_");
        self.snapshots_dir().join(format!("{}.json", safe))
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_file_is_sanitized() {
        let paths = Paths::with_base(PathBuf::from("/tmp/conductor-test"));
        assert_eq!(
            paths.snapshot_file("demo run:1"),
            PathBuf::from("/tmp/conductor-test/snapshots/demo_run_1.json")
        );
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/conductor-test/config.json"));
    }
}
