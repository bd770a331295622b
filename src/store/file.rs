use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::fs;
use tokio::sync::Mutex;

use super::{DurableStore, StoreError, StoreKey, StoredRecord};

/// `DurableStore` 的檔案實作。
///
/// 整份資料以一個 JSON 物件存放；每次操作都會完整讀取並改寫檔案，
/// 寫入時先寫到暫存檔再改名，避免中途失敗留下半份內容。
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    /// 序列化同一個行程內的讀改寫流程。跨行程的衝突以最後寫入者為準。
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_record(&self) -> Result<StoredRecord, StoreError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(StoredRecord::default()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if raw.trim().is_empty() {
            return Ok(StoredRecord::default());
        }
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(record),
            Err(err) => {
                // 損毀的檔案視為空白，下一次寫入會覆蓋它。
                warn!(
                    "Ignoring unreadable store file {}: {}",
                    self.path.display(),
                    err
                );
                Ok(StoredRecord::default())
            }
        }
    }

    async fn write_record(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let serialized = serde_json::to_string_pretty(record)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serialized).await.map_err(io_err)?;
        fs::rename(&staging, &self.path).await.map_err(io_err)?;
        debug!("Store written to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, keys: &[StoreKey]) -> Result<StoredRecord, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_record().await?.project(keys))
    }

    async fn set(&self, record: StoredRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut current = self.read_record().await?;
        current.merge(record);
        self.write_record(&current).await
    }

    async fn remove(&self, keys: &[StoreKey]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut current = self.read_record().await?;
        current.remove(keys);
        self.write_record(&current).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
