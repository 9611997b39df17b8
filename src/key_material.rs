use std::path::PathBuf;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto::{CryptoError, CryptoToolkit, CsrOptions, KeySpec, KeyType},
    executor::{ExecutorError, RemoteExecutor, StagedFile},
};

/// 私鑰權限，僅擁有者可讀寫。
pub const PRIVATE_KEY_MODE: u32 = 0o600;

/// 私鑰與 CSR 操作的錯誤。
#[derive(Debug, Error)]
pub enum KeyMaterialError {
    /// 讀取、暫存或發佈私鑰失敗
    #[error("Remote operation error: {0}")]
    Executor(#[from] ExecutorError),
    /// 產生私鑰或 CSR 失敗
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

type Result<T> = std::result::Result<T, KeyMaterialError>;

/// 私鑰操作的輸入。
#[derive(Debug, Clone, Deserialize)]
pub struct PrivateKeyRequest {
    /// 私鑰在主機上的路徑。
    pub path: String,
    /// RSA 金鑰長度，其他類型忽略。
    pub size: u32,
    /// `RSA`、`ECC` 或 `Ed25519`。
    #[serde(rename = "type")]
    pub key_type: String,
    /// ECC 曲線名稱，例如 `secp256r1`。
    pub curve: String,
}

impl PrivateKeyRequest {
    /// 轉為 [`KeySpec`]，金鑰類型未知時回傳 `KeyMaterialError::Crypto`。
    pub fn key_spec(&self) -> Result<KeySpec> {
        let key_type: KeyType = self.key_type.parse()?;
        Ok(KeySpec {
            key_type,
            size: self.size,
            curve: self.curve.clone(),
        })
    }
}

/// 私鑰操作的結果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrivateKeyOutcome {
    /// 私鑰的 PEM 內容。
    pub private_key_content: String,
    /// 私鑰為新產生時為 `true`。
    pub changed: bool,
}

/// CSR 操作的輸入。
#[derive(Debug, Clone, Deserialize)]
pub struct CsrRequest {
    /// 簽署 CSR 的私鑰 PEM 內容。
    pub private_key_content: String,
    /// CSR 的主體與 SAN 設定。
    #[serde(default)]
    pub options: CsrOptions,
}

/// CSR 操作的結果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsrOutcome {
    /// CSR 的 PEM 內容。
    pub content: String,
    /// CSR 只回傳不寫入主機，恆為 `false`。
    pub changed: bool,
}

/// 確保主機上存在私鑰，並由私鑰衍生 CSR。
pub struct KeyMaterialManager<'a> {
    executor: &'a dyn RemoteExecutor,
    crypto: &'a dyn CryptoToolkit,
    host: String,
    staging_dir: Option<PathBuf>,
}

impl<'a> KeyMaterialManager<'a> {
    /// 建立管理器。
    ///
    /// # 參數
    ///
    /// - `executor`: 存放私鑰的受管主機
    /// - `crypto`: 產生私鑰與 CSR 的工具
    /// - `host`: 記錄訊息時使用的主機標籤
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        crypto: &'a dyn CryptoToolkit,
        host: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            crypto,
            host: host.into(),
            staging_dir: None,
        }
    }

    /// 新私鑰發佈前暫存於 `dir`，未設定時使用系統暫存目錄。
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    fn stage(&self) -> Result<StagedFile> {
        Ok(match &self.staging_dir {
            Some(dir) => StagedFile::new_in(dir)?,
            None => StagedFile::new()?,
        })
    }

    /// 載入 `path` 上的私鑰；不存在時產生新私鑰並以 0600 權限發佈。
    ///
    /// # 參數
    ///
    /// - `path`: 私鑰在主機上的路徑
    /// - `spec`: 需要產生時使用的金鑰規格
    ///
    /// # 回傳
    ///
    /// 私鑰內容，以及是否為既有私鑰
    pub fn ensure_key(&self, path: &str, spec: &KeySpec) -> Result<(String, bool)> {
        if let Some(content) = self.executor.read_file(path)? {
            debug!("[{}] Loaded private key {}", self.host, path);
            return Ok((content, true));
        }

        let mut staged = self.stage()?;
        let content = self.crypto.generate_private_key(spec)?;
        staged.write_all(content.as_bytes())?;
        self.executor
            .publish_file(staged.path(), path, PRIVATE_KEY_MODE)?;
        info!(
            "[{}] Generated {} private key {}",
            self.host, spec.key_type, path
        );
        Ok((content, false))
    }

    /// 由私鑰重新產生 CSR，不快取也不與先前的 CSR 比較。
    pub fn generate_csr(&self, private_key_content: &str, options: &CsrOptions) -> Result<String> {
        Ok(self.crypto.generate_csr(private_key_content, options)?)
    }

    /// 獨立的私鑰操作：`changed` 表示是否產生了新私鑰。
    pub fn run_private_key(&self, request: &PrivateKeyRequest) -> Result<PrivateKeyOutcome> {
        let spec = request.key_spec()?;
        let (private_key_content, loaded) = self.ensure_key(&request.path, &spec)?;
        Ok(PrivateKeyOutcome {
            private_key_content,
            changed: !loaded,
        })
    }

    /// 獨立的 CSR 操作：只回傳內容，不寫入主機。
    pub fn run_csr(&self, request: &CsrRequest) -> Result<CsrOutcome> {
        let content = self.generate_csr(&request.private_key_content, &request.options)?;
        Ok(CsrOutcome {
            content,
            changed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        certificate::SubjectAltName,
        crypto::OpensslToolkit,
        executor::{MemExecutor, MemFile},
    };

    #[derive(Debug)]
    struct BrokenToolkit;

    impl CryptoToolkit for BrokenToolkit {
        fn generate_private_key(&self, spec: &KeySpec) -> std::result::Result<String, CryptoError> {
            Err(CryptoError::UnsupportedCurve(spec.curve.clone()))
        }

        fn generate_csr(
            &self,
            _private_key_pem: &str,
            _options: &CsrOptions,
        ) -> std::result::Result<String, CryptoError> {
            Err(CryptoError::NoSanEntries)
        }
    }

    #[test]
    fn test_ensure_key_generates_then_loads() {
        let executor = MemExecutor::new();
        let toolkit = OpensslToolkit;
        let manager = KeyMaterialManager::new(&executor, &toolkit, "web1");
        let spec = KeySpec::ecc("secp256r1");

        let (generated, loaded) = manager.ensure_key("/etc/ssl/private/site.key", &spec).unwrap();
        assert!(!loaded);
        assert_eq!(
            executor.get("/etc/ssl/private/site.key").unwrap(),
            Some(MemFile {
                content: generated.clone(),
                mode: PRIVATE_KEY_MODE
            })
        );

        let (again, loaded) = manager.ensure_key("/etc/ssl/private/site.key", &spec).unwrap();
        assert!(loaded);
        assert_eq!(again, generated);

        for staged in executor.staged_paths().unwrap() {
            assert!(!staged.exists());
        }
    }

    #[test]
    fn test_generation_failure_publishes_nothing() {
        let executor = MemExecutor::new();
        let manager = KeyMaterialManager::new(&executor, &BrokenToolkit, "web1");

        let result = manager.ensure_key("/etc/ssl/private/site.key", &KeySpec::ecc("p-999"));
        assert!(matches!(result, Err(KeyMaterialError::Crypto(_))));
        assert_eq!(executor.get("/etc/ssl/private/site.key").unwrap(), None);
        assert!(executor.staged_paths().unwrap().is_empty());
    }

    /// 產生私鑰時檢查暫存目錄中恰有一個暫存檔，然後失敗。
    #[derive(Debug)]
    struct StagingObserver {
        dir: PathBuf,
        staged_during_generation: AtomicUsize,
    }

    impl CryptoToolkit for StagingObserver {
        fn generate_private_key(&self, spec: &KeySpec) -> std::result::Result<String, CryptoError> {
            let count = std::fs::read_dir(&self.dir).unwrap().count();
            self.staged_during_generation.store(count, Ordering::SeqCst);
            Err(CryptoError::UnsupportedCurve(spec.curve.clone()))
        }

        fn generate_csr(
            &self,
            _private_key_pem: &str,
            _options: &CsrOptions,
        ) -> std::result::Result<String, CryptoError> {
            Err(CryptoError::NoSanEntries)
        }
    }

    #[test]
    fn test_generation_failure_removes_staging_file() {
        let staging = tempfile::tempdir().unwrap();
        let executor = MemExecutor::new();
        let observer = StagingObserver {
            dir: staging.path().to_path_buf(),
            staged_during_generation: AtomicUsize::new(0),
        };
        let manager =
            KeyMaterialManager::new(&executor, &observer, "web1").with_staging_dir(staging.path());

        let result = manager.ensure_key("/etc/ssl/private/site.key", &KeySpec::ecc("p-999"));

        assert!(matches!(result, Err(KeyMaterialError::Crypto(_))));
        assert_eq!(observer.staged_during_generation.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
        assert_eq!(executor.get("/etc/ssl/private/site.key").unwrap(), None);
    }

    #[test]
    fn test_staging_dir_is_used_for_publish() {
        let staging = tempfile::tempdir().unwrap();
        let executor = MemExecutor::new();
        let manager = KeyMaterialManager::new(&executor, &OpensslToolkit, "web1")
            .with_staging_dir(staging.path());

        manager
            .ensure_key("/etc/ssl/private/site.key", &KeySpec::ecc("secp256r1"))
            .unwrap();

        let staged = executor.staged_paths().unwrap();
        assert_eq!(staged.len(), 1);
        assert!(staged[0].starts_with(staging.path()));
        assert!(!staged[0].exists());
    }

    #[test]
    fn test_publish_failure_is_remote_error() {
        let executor = MemExecutor::new();
        executor
            .fail_publish("/etc/ssl/private/site.key", "disk full")
            .unwrap();
        let manager = KeyMaterialManager::new(&executor, &OpensslToolkit, "web1");

        let result = manager.ensure_key("/etc/ssl/private/site.key", &KeySpec::ecc("secp256r1"));
        assert!(matches!(
            result,
            Err(KeyMaterialError::Executor(ExecutorError::Failed { .. }))
        ));
        for staged in executor.staged_paths().unwrap() {
            assert!(!staged.exists());
        }
    }

    #[test]
    fn test_run_private_key_reports_changed() {
        let executor = MemExecutor::new();
        let manager = KeyMaterialManager::new(&executor, &OpensslToolkit, "web1");
        let request: PrivateKeyRequest = serde_json::from_value(serde_json::json!({
            "path": "/etc/ssl/private/mail.key",
            "size": 2048,
            "type": "RSA",
            "curve": "secp256r1",
        }))
        .unwrap();

        assert!(manager.run_private_key(&request).unwrap().changed);
        assert!(!manager.run_private_key(&request).unwrap().changed);
    }

    #[test]
    fn test_run_csr_is_stateless() {
        let executor = MemExecutor::new();
        let toolkit = OpensslToolkit;
        let manager = KeyMaterialManager::new(&executor, &toolkit, "web1");
        let (key, _) = manager
            .ensure_key("/etc/ssl/private/site.key", &KeySpec::ecc("secp256r1"))
            .unwrap();

        let request = CsrRequest {
            private_key_content: key,
            options: CsrOptions::for_domains(&["example.com"]),
        };
        let outcome = manager.run_csr(&request).unwrap();
        assert!(!outcome.changed);
        let csr = toolkit.csr_info(&outcome.content).unwrap();
        assert_eq!(csr.sans(), &[SubjectAltName::dns("example.com")]);
        assert!(executor.get("/etc/ssl/private/site.csr").unwrap().is_none());
    }
}
