pub mod models;

use std::path::Path;

use anyhow::{Context, Result};

pub use models::{DEFAULT_CHUNK_SIZE, LogRotation, ManagerConfig, PoolConfig};

/// Load a JSON configuration file.
pub async fn load(path: &Path) -> Result<ManagerConfig> {
    if !path.exists() {
        anyhow::bail!(
            "Configuration file not found: {}\n\nExample:\n{}",
            path.display(),
            example_config()
        );
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read config file")?;

    let config: ManagerConfig =
        serde_json::from_str(&content).context("Failed to parse config file")?;

    Ok(config)
}

pub fn example_config() -> &'static str {
    r#"{
  "chunk_size": 65536,
  "max_workers": 4,
  "pool": {
    "max_per_authority": 4,
    "idle_ttl_secs": 60
  },
  "log_level": "info",
  "log_directory": "./logs",
  "log_rotation": {
    "type": "daily"
  }
}"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = load(&temp.path().join("absent.json")).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_load_example() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("filemux.json");
        tokio::fs::write(&path, example_config()).await.unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(config.max_workers, 4);
        assert!(config.log_directory.is_some());
    }

    #[tokio::test]
    async fn test_load_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(load(&path).await.is_err());
    }
}
