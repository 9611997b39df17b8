use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::{Arc, RwLock},
};

use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;

/// 受管主機操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// 本機或主機上的 I/O 失敗
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// 路徑為空、含控制字元或跳出根目錄
    #[error("Path is invalid: {0}")]
    InvalidPath(String),
    /// 讀到的檔案不是 UTF-8
    #[error("File is not valid UTF-8: {0}")]
    NotUtf8(String),
    /// 共享狀態的鎖已中毒
    #[error("Lock poisoned")]
    LockPoisoned,
    /// 遠端操作回報失敗，`payload` 保留完整的診斷資料。
    #[error("{operation} failed: {message}")]
    Failed {
        operation: String,
        message: String,
        payload: Value,
    },
}

impl ExecutorError {
    /// 以操作名稱與診斷資料建立 [`ExecutorError::Failed`]。
    pub fn failed(operation: impl Into<String>, message: impl Into<String>, payload: Value) -> Self {
        Self::Failed {
            operation: operation.into(),
            message: message.into(),
            payload,
        }
    }
}

/// 本模組使用的結果類型，當中錯誤皆為 `ExecutorError`。
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// 對受管主機讀取與發佈檔案的介面。
///
/// 實作者負責實際的傳輸方式（本機檔案系統、SSH 等）；核心流程只透過此介面存取主機。
pub trait RemoteExecutor: Send + Sync + fmt::Debug {
    /// 讀取主機上的檔案，不存在時回傳 `None`。
    fn read_file(&self, path: &str) -> Result<Option<String>>;

    /// 將本機暫存檔發佈到主機上的 `remote_path`，並套用權限 `mode`。
    fn publish_file(&self, staged: &Path, remote_path: &str, mode: u32) -> Result<()>;

    /// 先寫入暫存檔再發佈，暫存檔在任何結束路徑上都會被刪除。
    fn publish_content(&self, content: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let mut staged = StagedFile::new()?;
        staged.write_all(content)?;
        self.publish_file(staged.path(), remote_path, mode)
    }
}

/// 本機上的暫存檔，離開作用域時自動刪除。
#[derive(Debug)]
pub struct StagedFile {
    file: NamedTempFile,
}

impl StagedFile {
    /// 在系統暫存目錄建立暫存檔。
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: NamedTempFile::new()?,
        })
    }

    /// 在指定目錄建立暫存檔。
    ///
    /// # 參數
    ///
    /// - `dir`: 已存在的本機目錄
    ///
    /// # 回傳
    ///
    /// 成功回傳暫存檔，目錄不存在或無法寫入時回傳 `ExecutorError::Io`
    pub fn new_in(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: NamedTempFile::new_in(dir)?,
        })
    }

    /// 暫存檔的本機路徑。
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// 寫入內容並立即 flush。
    pub fn write_all(&mut self, content: &[u8]) -> Result<()> {
        self.file.write_all(content)?;
        self.file.flush()?;
        Ok(())
    }
}

/// 主機路徑的正規化與驗證。
struct PathUtils;

impl PathUtils {
    /// 將路徑正規化為以 `/` 開頭的絕對路徑，並拒絕不合法字元與跳出根目錄的 `..`。
    fn normalize(path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(ExecutorError::InvalidPath("Empty path".to_string()));
        }
        if path.contains('\0') || path.contains('\n') || path.contains('\r') {
            return Err(ExecutorError::InvalidPath(format!(
                "Invalid characters in path: {}",
                path
            )));
        }
        if path.ends_with('/') {
            return Err(ExecutorError::InvalidPath(format!(
                "File path cannot end with '/': {}",
                path
            )));
        }
        let mut normalized = PathBuf::from("/");
        for component in Path::new(path).components() {
            match component {
                Component::RootDir => normalized = PathBuf::from("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if normalized.as_os_str() == "/" {
                        return Err(ExecutorError::InvalidPath(format!(
                            "Cannot use '..' to escape root directory: {}",
                            path
                        )));
                    }
                    normalized.pop();
                }
                Component::Normal(name) => normalized.push(name),
                Component::Prefix(_) => {
                    return Err(ExecutorError::InvalidPath(format!("Invalid path: {}", path)))
                }
            }
        }
        Ok(normalized)
    }
}

/// 以本機檔案系統作為受管主機，所有路徑都解析在 `root` 之下。
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    root: PathBuf,
}

impl LocalExecutor {
    /// 以 `root` 作為主機的根目錄。
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = PathUtils::normalize(path)?;
        let relative = normalized.strip_prefix("/").unwrap_or(&normalized);
        Ok(self.root.join(relative))
    }
}

impl RemoteExecutor for LocalExecutor {
    fn read_file(&self, path: &str) -> Result<Option<String>> {
        let target = self.resolve(path)?;
        match fs::read(&target) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| ExecutorError::NotUtf8(path.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn publish_file(&self, staged: &Path, remote_path: &str, mode: u32) -> Result<()> {
        let target = self.resolve(remote_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(staged, &target)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }
}

/// 記憶體中的檔案內容與權限。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemFile {
    /// 檔案內容
    pub content: String,
    /// 發佈時套用的權限
    pub mode: u32,
}

/// 基於記憶體的受管主機，複製出的實例共用同一份資料。
#[derive(Debug, Clone, Default)]
pub struct MemExecutor {
    files: Arc<RwLock<HashMap<PathBuf, MemFile>>>,
    failures: Arc<RwLock<HashMap<PathBuf, String>>>,
    staged: Arc<RwLock<Vec<PathBuf>>>,
}

impl MemExecutor {
    /// 建立空的主機。
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接放入一個檔案，模擬主機上既有的資料。
    pub fn insert(&self, path: &str, content: &str, mode: u32) -> Result<()> {
        let path = PathUtils::normalize(path)?;
        self.files
            .write()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .insert(
                path,
                MemFile {
                    content: content.to_string(),
                    mode,
                },
            );
        Ok(())
    }

    /// 讀出檔案內容與權限。
    pub fn get(&self, path: &str) -> Result<Option<MemFile>> {
        let path = PathUtils::normalize(path)?;
        Ok(self
            .files
            .read()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .get(&path)
            .cloned())
    }

    /// 令之後對 `path` 的發佈失敗並回傳 `message`。
    pub fn fail_publish(&self, path: &str, message: &str) -> Result<()> {
        let path = PathUtils::normalize(path)?;
        self.failures
            .write()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .insert(path, message.to_string());
        Ok(())
    }

    /// 曾被用來發佈的本機暫存檔路徑。
    pub fn staged_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .staged
            .read()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .clone())
    }
}

impl RemoteExecutor for MemExecutor {
    fn read_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self.get(path)?.map(|file| file.content))
    }

    fn publish_file(&self, staged: &Path, remote_path: &str, mode: u32) -> Result<()> {
        let path = PathUtils::normalize(remote_path)?;
        self.staged
            .write()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .push(staged.to_path_buf());
        if let Some(message) = self
            .failures
            .read()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .get(&path)
        {
            return Err(ExecutorError::failed(
                "copy",
                message.clone(),
                serde_json::json!({ "dest": remote_path, "failed": true, "msg": message }),
            ));
        }
        let content = fs::read_to_string(staged)?;
        self.files
            .write()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .insert(path, MemFile { content, mode });
        Ok(())
    }
}
