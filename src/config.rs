use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const API_URL_ENV: &str = "CHATRELAY_API_URL";
pub const STORE_ENV: &str = "CHATRELAY_STORE";
pub const LOG_ENV: &str = "CHATRELAY_LOG";

const CONFIG_FILE: &str = "config/relay.toml";

/// 執行期設定，通常從 `config/relay.toml` 載入。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 聊天服務的 API 根網址，不含結尾的 `/`。
    pub api_base_url: String,
    /// 持久化儲存檔案；相對路徑以工作目錄為基準。
    pub store_path: PathBuf,
    pub log_path: PathBuf,
    /// `error`、`warn`、`info`、`debug` 或 `trace`。
    pub log_level: String,
    /// 介面重繪間隔（毫秒）。
    pub tick_rate_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::from("http://localhost:8000/api"),
            store_path: PathBuf::from("data/store.json"),
            log_path: PathBuf::from("logs/chatrelay.log"),
            log_level: String::from("info"),
            tick_rate_ms: 100,
        }
    }
}

impl RelayConfig {
    /// 從工作目錄讀取設定。
    /// 檔案不存在時寫出一份預設設定，之後再套用環境變數覆寫。
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("讀取設定失敗: {}", config_path.display()))?;
            toml::from_str(&raw).with_context(|| format!("解析設定失敗: {}", config_path.display()))?
        } else {
            let config = Self::default();
            config.save_to_file(root)?;
            config
        };
        Ok(config.with_env_overrides(|key| env::var(key).ok()).resolve(root))
    }

    pub fn save_to_file(&self, root: &Path) -> Result<()> {
        let config_path = root.join(CONFIG_FILE);
        if let Some(dir) = config_path.parent()
            && !dir.exists()
        {
            fs::create_dir_all(dir).with_context(|| format!("建立設定目錄失敗: {}", dir.display()))?;
        }
        let serialized = toml::to_string_pretty(self).context("序列化設定失敗")?;
        fs::write(&config_path, serialized)
            .with_context(|| format!("寫入設定失敗: {}", config_path.display()))?;
        Ok(())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = lookup(API_URL_ENV) {
            self.api_base_url = url;
        }
        if let Some(path) = lookup(STORE_ENV) {
            self.store_path = PathBuf::from(path);
        }
        if let Some(level) = lookup(LOG_ENV) {
            self.log_level = level;
        }
        self
    }

    /// 將相對路徑轉為以 `root` 為基準的絕對路徑。
    fn resolve(mut self, root: &Path) -> Self {
        if self.store_path.is_relative() {
            self.store_path = root.join(&self.store_path);
        }
        if self.log_path.is_relative() {
            self.log_path = root.join(&self.log_path);
        }
        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.store_path, dir.path().join("data/store.json"));
        assert_eq!(config.tick_rate_ms, 100);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "api_base_url = \"https://chat.example.com/api/\"\nstore_path = \"/var/lib/relay.json\"\n",
        )
        .unwrap();

        let config = RelayConfig::load(dir.path()).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/relay.json"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let config = RelayConfig::default()
            .with_env_overrides(|key| match key {
                API_URL_ENV => Some("https://other.example.com/".into()),
                STORE_ENV => Some("  ".into()),
                LOG_ENV => Some("debug".into()),
                _ => None,
            })
            .resolve(Path::new("/srv"));
        assert_eq!(config.api_base_url, "https://other.example.com");
        assert_eq!(config.store_path, PathBuf::from("/srv/data/store.json"));
        assert_eq!(config.log_level, "debug");
    }
}
