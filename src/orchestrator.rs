//! 憑證續約流程。
//!
//! [`Orchestrator`] 依序載入現有憑證與 CSR、判斷是否續約，必要時向 ACME 申請 DNS-01 挑戰，
//! 透過 DNS Provider 發佈 TXT 記錄、等待傳播、完成驗證並寫入完整憑證鏈，最後清除挑戰記錄。
//!
//! 狀態依序為 `Init → Loaded → Decided → ChallengeRequested → RecordsPublished →
//! PropagationConfirmed → Verified → RecordsCleaned → Done`，任何步驟失敗則停在
//! `Failed(kind)`。驗證前失敗時已發佈的挑戰記錄會保留，不做補償清除。

use std::fmt;

use chrono::{TimeDelta, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    acme::{AcmeAccountConfig, AcmeConnector, AcmeError, HttpAcmeConnector},
    certificate::{Certificate, CertificateSigningRequest},
    crypto::{CryptoError, CryptoToolkit, CsrOptions, OpensslToolkit},
    decision::{decide, Decision, DecisionReason},
    executor::{ExecutorError, RemoteExecutor},
    key_material::{KeyMaterialError, KeyMaterialManager, PrivateKeyRequest},
    propagation::{
        wait_for_txt, DohResolver, PropagationError, PropagationPolicy, TxtResolver,
        DEFAULT_DOH_ENDPOINT,
    },
    provider::{ProviderError, ProviderRegistry, RecordState, RecordType},
};

/// 預設的續約窗口（天）。
pub const DEFAULT_RENEWAL_WINDOW_DAYS: i64 = 30;
/// 憑證鏈寫入目標路徑時的權限。
pub const CERTIFICATE_MODE: u32 = 0o644;

/// 失敗分類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 輸入不合法，例如缺少 CSR、Provider 名稱未知或選項錯誤。
    Configuration,
    /// 受管主機或 DNS Provider API 的操作失敗。
    RemoteOperation,
    /// TXT 記錄在期限內未傳播。
    PropagationTimeout,
    /// ACME 伺服器拒絕或挑戰驗證失敗。
    AcmeChallenge,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Configuration => "configuration error",
            Self::RemoteOperation => "remote operation error",
            Self::PropagationTimeout => "propagation timeout",
            Self::AcmeChallenge => "ACME challenge error",
        };
        f.write_str(text)
    }
}

/// 續約流程的錯誤，各協作者的錯誤原樣包裝。
#[derive(Debug, Error)]
pub enum RenewalError {
    /// 請求本身不合法
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// CSR 無法解析
    #[error("Invalid signing request: {0}")]
    InvalidCsr(String),
    #[error("DNS provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Remote operation error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Key material error: {0}")]
    KeyMaterial(#[from] KeyMaterialError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Propagation error: {0}")]
    Propagation(#[from] PropagationError),
    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),
}

impl RenewalError {
    /// 錯誤對應的失敗分類。Provider 錯誤依其是否屬於設定問題分流。
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) | Self::InvalidCsr(_) => FailureKind::Configuration,
            Self::Provider(e) if e.is_configuration() => FailureKind::Configuration,
            Self::Provider(_) | Self::Executor(_) | Self::KeyMaterial(_) | Self::Crypto(_) => {
                FailureKind::RemoteOperation
            }
            Self::Propagation(_) => FailureKind::PropagationTimeout,
            Self::Acme(_) => FailureKind::AcmeChallenge,
        }
    }
}

/// 本模組操作的結果類型。
pub type Result<T> = std::result::Result<T, RenewalError>;

/// 流程狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// 尚未開始
    Init,
    /// 已讀取現有憑證與 CSR
    Loaded,
    /// 已做出續約判斷
    Decided(Decision),
    /// 已向 ACME 取得 DNS-01 挑戰
    ChallengeRequested,
    /// 挑戰記錄已發佈
    RecordsPublished,
    /// 所有挑戰值皆已可見
    PropagationConfirmed,
    /// ACME 驗證通過且憑證鏈已寫入
    Verified,
    /// 挑戰記錄已清除
    RecordsCleaned,
    /// 流程結束
    Done,
    /// 流程失敗
    Failed(FailureKind),
}

/// 一次成功執行的結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalOutcome {
    /// 是否寫入了新的憑證鏈
    pub changed: bool,
    /// 結束時的狀態
    pub state: RenewalState,
    /// 續約判斷的理由
    pub reason: DecisionReason,
}

/// CSR 的來源，兩者擇一。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrSource {
    /// 受管主機上的 CSR 路徑
    Path(String),
    /// CSR 的 PEM 內容
    Content(String),
}

/// 續約操作的輸入。
#[derive(Clone, Deserialize)]
pub struct RenewalRequest {
    /// 憑證鏈寫入的路徑。
    pub path: String,
    /// 受管主機上的 CSR 路徑，與 `csr_content` 擇一。
    #[serde(default)]
    pub csr_path: Option<String>,
    /// CSR 的 PEM 內容，與 `csr_path` 擇一。
    #[serde(default)]
    pub csr_content: Option<String>,
    /// ACME 目錄 URL。
    pub acme_directory: String,
    /// 註冊帳號使用的聯絡信箱。
    pub acme_account_email: String,
    /// 帳號私鑰的 PEM 內容。
    pub acme_account_key: String,
    /// 只能有一個鍵：Provider 名稱對應其選項。
    pub dns_provider: Map<String, Value>,
}

impl fmt::Debug for RenewalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalRequest")
            .field("path", &self.path)
            .field("csr_path", &self.csr_path)
            .field("acme_directory", &self.acme_directory)
            .field("acme_account_email", &self.acme_account_email)
            .field("dns_provider", &self.dns_provider.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RenewalRequest {
    /// 取出 CSR 來源。
    ///
    /// # 回傳
    /// 兩者恰好給定一個時回傳對應的 [`CsrSource`]，否則回傳設定錯誤
    pub fn csr_source(&self) -> Result<CsrSource> {
        match (&self.csr_path, &self.csr_content) {
            (Some(path), None) => Ok(CsrSource::Path(path.clone())),
            (None, Some(content)) => Ok(CsrSource::Content(content.clone())),
            (Some(_), Some(_)) => Err(RenewalError::Configuration(
                "csr_path and csr_content are mutually exclusive".to_string(),
            )),
            (None, None) => Err(RenewalError::Configuration(
                "one of csr_path or csr_content is required".to_string(),
            )),
        }
    }

    /// 取出唯一的 DNS Provider 名稱與選項。
    pub fn provider(&self) -> Result<(&str, &Value)> {
        let mut entries = self.dns_provider.iter();
        match (entries.next(), entries.next()) {
            (Some((name, options)), None) => Ok((name.as_str(), options)),
            (None, _) => Err(RenewalError::Configuration(
                "dns_provider requires exactly one provider".to_string(),
            )),
            (Some(_), Some(_)) => Err(RenewalError::Configuration(format!(
                "Only one dns provider may be given, got {:?}",
                self.dns_provider.keys().collect::<Vec<_>>()
            ))),
        }
    }

    /// 在聯絡任何遠端之前檢查請求的結構。
    pub fn validate(&self) -> Result<()> {
        self.csr_source()?;
        self.provider()?;
        if self.path.trim().is_empty() {
            return Err(RenewalError::Configuration("path is required".to_string()));
        }
        Ok(())
    }

    /// 轉為 ACME 連線所需的帳號設定。
    pub fn account_config(&self) -> AcmeAccountConfig {
        AcmeAccountConfig {
            directory_url: self.acme_directory.clone(),
            email: self.acme_account_email.clone(),
            account_key_pem: self.acme_account_key.clone(),
        }
    }
}

/// 可調整的參數。
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 用於記錄的主機標籤。
    pub host: String,
    /// 憑證在此期間內到期即續約。
    pub renewal_window: TimeDelta,
    /// 等待 TXT 記錄傳播的輪詢策略。
    pub propagation: PropagationPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            renewal_window: TimeDelta::days(DEFAULT_RENEWAL_WINDOW_DAYS),
            propagation: PropagationPolicy::default(),
        }
    }
}

/// 用於構建 [`Orchestrator`] 實例的構造器，未指定的協作者使用預設實作。
pub struct OrchestratorBuilder {
    executor: Box<dyn RemoteExecutor>,
    crypto: Option<Box<dyn CryptoToolkit>>,
    acme: Option<Box<dyn AcmeConnector>>,
    resolver: Option<Box<dyn TxtResolver>>,
    providers: Option<ProviderRegistry>,
    doh_endpoint: String,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    /// 建立新的構造器。
    ///
    /// # 參數
    /// - `executor`: 存放憑證、CSR 與私鑰的受管主機
    pub fn new(executor: impl RemoteExecutor + 'static) -> Self {
        Self {
            executor: Box::new(executor),
            crypto: None,
            acme: None,
            resolver: None,
            providers: None,
            doh_endpoint: DEFAULT_DOH_ENDPOINT.to_string(),
            settings: OrchestratorSettings::default(),
        }
    }

    /// 設定日誌中的主機標籤，同時傳給 DNS Provider 與 ACME 客戶端。
    pub fn host(mut self, host: &str) -> Self {
        self.settings.host = host.to_string();
        self
    }

    /// 設定續約窗口，預設 30 天。
    pub fn renewal_window(mut self, window: TimeDelta) -> Self {
        self.settings.renewal_window = window;
        self
    }

    /// 設定傳播等待的輪詢間隔與期限。
    pub fn propagation(mut self, policy: PropagationPolicy) -> Self {
        self.settings.propagation = policy;
        self
    }

    /// 替換密碼學工具，預設為 [`OpensslToolkit`]。
    pub fn crypto(mut self, crypto: impl CryptoToolkit + 'static) -> Self {
        self.crypto = Some(Box::new(crypto));
        self
    }

    /// 替換 ACME 連線工廠，預設為 [`HttpAcmeConnector`]。
    pub fn acme(mut self, acme: impl AcmeConnector + 'static) -> Self {
        self.acme = Some(Box::new(acme));
        self
    }

    /// 替換 TXT 解析器，預設為 [`DohResolver`]。
    pub fn resolver(mut self, resolver: impl TxtResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// 使用預設 DoH 解析器時的查詢端點。
    pub fn doh_endpoint(mut self, endpoint: &str) -> Self {
        self.doh_endpoint = endpoint.to_string();
        self
    }

    /// 替換 DNS Provider 登記表，預設只有內建 Provider。
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    /// 建立 [`Orchestrator`]。
    ///
    /// # 回傳
    /// 預設 DoH 端點無法使用時回傳設定錯誤
    pub fn build(self) -> Result<Orchestrator> {
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Box::new(
                DohResolver::new(&self.doh_endpoint)
                    .map_err(|e| RenewalError::Configuration(e.to_string()))?,
            ),
        };
        Ok(Orchestrator {
            executor: self.executor,
            crypto: self.crypto.unwrap_or_else(|| Box::new(OpensslToolkit)),
            acme: self
                .acme
                .unwrap_or_else(|| Box::new(HttpAcmeConnector::default())),
            resolver,
            providers: self.providers.unwrap_or_default(),
            settings: self.settings,
            state: RenewalState::Init,
            history: vec![RenewalState::Init],
        })
    }
}

/// 憑證生命週期的協調者，一次處理一張憑證。
pub struct Orchestrator {
    executor: Box<dyn RemoteExecutor>,
    crypto: Box<dyn CryptoToolkit>,
    acme: Box<dyn AcmeConnector>,
    resolver: Box<dyn TxtResolver>,
    providers: ProviderRegistry,
    settings: OrchestratorSettings,
    state: RenewalState,
    history: Vec<RenewalState>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("state", &self.state)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// 以指定的受管主機建立構造器。
    pub fn builder(executor: impl RemoteExecutor + 'static) -> OrchestratorBuilder {
        OrchestratorBuilder::new(executor)
    }

    /// 目前的狀態。
    pub fn state(&self) -> RenewalState {
        self.state
    }

    /// 最近一次執行經過的狀態，依序排列。
    pub fn history(&self) -> &[RenewalState] {
        &self.history
    }

    /// 目前使用的參數。
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 使用同一組協作者的私鑰與 CSR 管理器。
    pub fn key_material(&self) -> KeyMaterialManager<'_> {
        KeyMaterialManager::new(
            self.executor.as_ref(),
            self.crypto.as_ref(),
            &self.settings.host,
        )
    }

    /// 確保私鑰存在並由其產生 CSR，結果可作為 `csr_content` 使用。
    pub fn prepare_csr(&self, key: &PrivateKeyRequest, options: &CsrOptions) -> Result<String> {
        let manager = self.key_material();
        let (private_key, _) = manager.ensure_key(&key.path, &key.key_spec()?)?;
        Ok(manager.generate_csr(&private_key, options)?)
    }

    fn transition(&mut self, state: RenewalState) {
        debug!(
            "[{}] {:?} -> {:?}",
            self.settings.host, self.state, state
        );
        self.state = state;
        self.history.push(state);
    }

    /// 執行一次完整流程。失敗時狀態停在 `Failed(kind)` 並回傳錯誤。
    ///
    /// # 參數
    /// - `request`: 要維護的憑證與其 ACME、DNS Provider 設定
    ///
    /// # 回傳
    /// 成功時回傳是否有變更、最終狀態與判斷理由
    pub fn run(&mut self, request: &RenewalRequest) -> Result<RenewalOutcome> {
        self.state = RenewalState::Init;
        self.history = vec![RenewalState::Init];

        let result = self.execute(request);
        if let Err(e) = &result {
            let kind = e.kind();
            warn!("[{}] {} failed ({}): {}", self.settings.host, request.path, kind, e);
            self.transition(RenewalState::Failed(kind));
        }
        result
    }

    fn load_certificate(&self, path: &str) -> Result<Option<Certificate>> {
        match self.executor.read_file(path)? {
            Some(pem) => Ok(Some(self.crypto.certificate_info(&pem)?)),
            None => Ok(None),
        }
    }

    fn load_csr(&self, source: &CsrSource) -> Result<CertificateSigningRequest> {
        let content = match source {
            CsrSource::Content(content) => content.clone(),
            CsrSource::Path(path) => self.executor.read_file(path)?.ok_or_else(|| {
                RenewalError::Configuration(format!("CSR not found at {}", path))
            })?,
        };
        self.crypto
            .csr_info(&content)
            .map_err(|e| RenewalError::InvalidCsr(e.to_string()))
    }

    fn execute(&mut self, request: &RenewalRequest) -> Result<RenewalOutcome> {
        request.validate()?;
        let csr_source = request.csr_source()?;
        let (provider_name, provider_options) = request.provider()?;
        self.providers.validate(provider_name)?;
        let host = self.settings.host.clone();

        let existing = self.load_certificate(&request.path)?;
        let csr = self.load_csr(&csr_source)?;
        self.transition(RenewalState::Loaded);

        let decision = decide(
            existing.as_ref(),
            &csr,
            self.settings.renewal_window,
            Utc::now(),
        );
        self.transition(RenewalState::Decided(decision));
        if !decision.renew {
            info!("[{}] ok: {} ({})", host, request.path, decision.reason);
            self.transition(RenewalState::Done);
            return Ok(RenewalOutcome {
                changed: false,
                state: self.state,
                reason: decision.reason,
            });
        }
        info!("[{}] Renewing {}: {}", host, request.path, decision.reason);

        let mut provider = self.providers.create(provider_name, &host, provider_options)?;
        let mut client = self.acme.connect(&request.account_config(), &host)?;
        let challenge = client.request_challenge(&csr)?;
        self.transition(RenewalState::ChallengeRequested);

        let records = challenge.record_specs()?;
        provider.apply(RecordState::Present, RecordType::Txt, &records)?;
        info!(
            "[{}] Published {} challenge record(s) via {}",
            host,
            records.len(),
            provider_name
        );
        self.transition(RenewalState::RecordsPublished);

        wait_for_txt(self.resolver.as_ref(), &records, &self.settings.propagation)?;
        self.transition(RenewalState::PropagationConfirmed);

        let chain = client.complete_challenge(&challenge, &csr)?;
        self.executor
            .publish_content(chain.as_bytes(), &request.path, CERTIFICATE_MODE)?;
        info!("[{}] changed: wrote certificate chain to {}", host, request.path);
        self.transition(RenewalState::Verified);

        provider.apply(RecordState::Absent, RecordType::Txt, &records)?;
        self.transition(RenewalState::RecordsCleaned);

        self.transition(RenewalState::Done);
        Ok(RenewalOutcome {
            changed: true,
            state: self.state,
            reason: decision.reason,
        })
    }
}
