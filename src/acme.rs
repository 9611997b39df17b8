//! 模塊提供 ACME 協作者介面，以及基於 RFC 8555 的同步 HTTP 實作。
//!
//! [`AcmeConnector`] 只在確定需要續約時才建立連線與帳號，[`AcmeClient`] 則負責
//! 申請 DNS-01 挑戰與在記錄發佈後完成挑戰、取得完整憑證鏈。

use std::{fmt, thread, time::Duration};

use log::{debug, info};
use reqwest::{
    blocking::{Client, Response},
    header::{ACCEPT, CONTENT_TYPE, LOCATION},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    certificate::{CertificateError, CertificateSigningRequest, SubjectAltName},
    challenge::{dns_txt_value, key_authorization, DnsChallenge},
    directory::{Directory, DirectoryError},
    jws::{base64_url, AccountKey, JwsError, KeyId},
    nonce::{Nonce, NonceError},
};

const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_POLL_ATTEMPTS: usize = 60;

/// 錯誤類型，用於描述與 ACME 伺服器互動時可能發生的各類錯誤。
#[derive(Debug, Error)]
pub enum AcmeError {
    /// HTTP 請求失敗
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    /// 回應標頭不是可見 ASCII
    #[error("Request header error: {0}")]
    Header(#[from] reqwest::header::ToStrError),
    /// 回應或 payload 的 JSON 處理失敗
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// 帳號金鑰無法使用或簽章失敗
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    /// 取得 nonce 失敗
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    /// 取得目錄失敗
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    /// CSR 轉為 DER 失敗
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    /// 伺服器回傳錯誤狀態與 problem document。
    #[error("ACME server error: {status}, {problem}")]
    Server { status: StatusCode, problem: Problem },
    /// 伺服器要求外部帳號綁定，目前不支援。
    #[error("External account binding required by {0}")]
    ExternalAccountRequired(String),
    /// 建立帳號或訂單的回應缺少 `Location` 標頭。
    #[error("Location header not found in response from {0}")]
    MissingLocation(String),
    /// CSR 中有 DNS-01 無法驗證的 SAN（例如 IP）。
    #[error("Unsupported identifier: {0}")]
    UnsupportedIdentifier(String),
    /// 授權中沒有 dns-01 挑戰。
    #[error("No dns-01 challenge offered for {0}")]
    NoDnsChallenge(String),
    /// 訂單或授權處於無法繼續的狀態。
    #[error("{resource} is {status}")]
    InvalidStatus { resource: String, status: Status },
    /// 伺服器驗證挑戰失敗。
    #[error("Challenge for {domain} failed: {detail}")]
    ChallengeFailed { domain: String, detail: String },
    /// 輪詢次數用盡仍未達到目標狀態。
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    /// 訂單已生效但沒有憑證 URL。
    #[error("Order is valid but has no certificate URL")]
    MissingCertificate,
}

/// 本模組使用的結果類型，當中錯誤皆為 `AcmeError`。
pub type Result<T> = std::result::Result<T, AcmeError>;

/// RFC 7807 problem document。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Problem {
    /// 錯誤類型 URN，例如 `urn:ietf:params:acme:error:badNonce`。
    #[serde(rename = "type", default)]
    pub problem_type: String,
    /// 人類可讀的說明。
    #[serde(default)]
    pub detail: String,
}

impl Problem {
    fn is_bad_nonce(&self) -> bool {
        self.problem_type == BAD_NONCE
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.problem_type, self.detail)
    }
}

/// 訂單、授權與挑戰共用的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Deserialize)]
struct Order {
    status: Status,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    error: Option<Problem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Identifier {
    #[serde(rename = "type")]
    id_type: String,
    value: String,
}

impl Identifier {
    fn dns(name: &str) -> Self {
        Self {
            id_type: "dns".to_string(),
            value: name.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Authorization {
    status: Status,
    identifier: Identifier,
    #[serde(default)]
    challenges: Vec<ChallengeResource>,
    #[serde(default)]
    wildcard: bool,
}

impl Authorization {
    fn domain(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }

    fn dns_challenge(&self) -> Result<&ChallengeResource> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == "dns-01")
            .ok_or_else(|| AcmeError::NoDnsChallenge(self.domain()))
    }

    fn failure_detail(&self) -> String {
        self.challenges
            .iter()
            .find_map(|c| c.error.as_ref())
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("authorization is {}", self.status))
    }
}

#[derive(Debug, Deserialize)]
struct ChallengeResource {
    #[serde(rename = "type")]
    challenge_type: String,
    url: String,
    status: Status,
    #[serde(default)]
    token: String,
    #[serde(default)]
    error: Option<Problem>,
}

#[derive(Debug, Serialize)]
struct NewAccountPayload {
    contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed")]
    terms_of_service_agreed: bool,
}

impl NewAccountPayload {
    fn new(email: &str) -> Self {
        let contact = if email.starts_with("mailto:") {
            email.to_string()
        } else {
            format!("mailto:{}", email)
        };
        Self {
            contact: vec![contact],
            terms_of_service_agreed: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct NewOrderPayload {
    identifiers: Vec<Identifier>,
}

#[derive(Debug, Serialize)]
struct FinalizeOrderPayload {
    csr: String,
}

/// CSR 中的 SAN 轉為訂單識別；ACME DNS-01 只接受 DNS 名稱。
fn order_identifiers(csr: &CertificateSigningRequest) -> Result<Vec<Identifier>> {
    csr.sans()
        .iter()
        .map(|san| match san {
            SubjectAltName::Dns(name) => Ok(Identifier::dns(name)),
            SubjectAltName::Ip(_) => Err(AcmeError::UnsupportedIdentifier(san.to_string())),
        })
        .collect()
}

fn location(response: &Response, url: &str) -> Result<String> {
    Ok(response
        .headers()
        .get(LOCATION)
        .ok_or_else(|| AcmeError::MissingLocation(url.to_string()))?
        .to_str()?
        .to_string())
}

/// ACME 帳號設定。
#[derive(Clone)]
pub struct AcmeAccountConfig {
    /// ACME 目錄的 URL。
    pub directory_url: String,
    /// 帳號聯絡信箱，未帶 `mailto:` 時會自動補上。
    pub email: String,
    /// 帳號私鑰的 PEM 內容（RSA 或 P-256）。
    pub account_key_pem: String,
}

impl fmt::Debug for AcmeAccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeAccountConfig")
            .field("directory_url", &self.directory_url)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// 已連線並完成帳號註冊的 ACME 客戶端。
pub trait AcmeClient: fmt::Debug {
    /// 為 CSR 的 SAN 建立訂單，回傳需發佈的 DNS-01 挑戰。
    ///
    /// # 參數
    ///
    /// - `csr`: 期望簽發的 CSR，其 DNS 名稱即為訂單識別
    ///
    /// # 回傳
    ///
    /// 每個網域對應的 TXT 值；已通過驗證的網域不會出現在其中
    fn request_challenge(&mut self, csr: &CertificateSigningRequest) -> Result<DnsChallenge>;

    /// 通知伺服器驗證挑戰並完成訂單，回傳 PEM 格式的完整憑證鏈。
    ///
    /// # 參數
    ///
    /// - `challenge`: `request_challenge` 回傳的挑戰，其中記錄了訂單 URL
    /// - `csr`: 用於 finalize 的 CSR
    ///
    /// # 回傳
    ///
    /// 成功回傳憑證鏈，伺服器拒絕時回傳 `AcmeError`
    fn complete_challenge(
        &mut self,
        challenge: &DnsChallenge,
        csr: &CertificateSigningRequest,
    ) -> Result<String>;
}

/// 建立 [`AcmeClient`] 的工廠。
pub trait AcmeConnector: fmt::Debug {
    /// 取得目錄並註冊（或取回）帳號。
    ///
    /// # 參數
    ///
    /// - `account`: 目錄 URL、聯絡信箱與帳號私鑰
    /// - `host`: 記錄訊息時使用的主機標籤
    ///
    /// # 回傳
    ///
    /// 已完成註冊的 `AcmeClient`
    fn connect(&self, account: &AcmeAccountConfig, host: &str) -> Result<Box<dyn AcmeClient>>;
}

/// 以 HTTP 連線 ACME 伺服器的 [`AcmeConnector`]。
#[derive(Debug, Clone, Copy)]
pub struct HttpAcmeConnector {
    poll_interval: Duration,
    poll_attempts: usize,
}

impl Default for HttpAcmeConnector {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }
}

impl HttpAcmeConnector {
    /// 設定輪詢授權與訂單狀態的間隔與次數。
    ///
    /// # 參數
    ///
    /// - `interval`: 兩次查詢之間的等待時間
    /// - `attempts`: 最多查詢次數，至少為 1
    pub fn poll(mut self, interval: Duration, attempts: usize) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts.max(1);
        self
    }
}

impl AcmeConnector for HttpAcmeConnector {
    fn connect(&self, account: &AcmeAccountConfig, host: &str) -> Result<Box<dyn AcmeClient>> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let directory = Directory::fetch(&client, &account.directory_url)?;
        if directory.requires_external_account() {
            return Err(AcmeError::ExternalAccountRequired(
                account.directory_url.clone(),
            ));
        }
        let key = AccountKey::from_pem(&account.account_key_pem)?;

        let mut acme = HttpAcmeClient {
            client,
            host: host.to_string(),
            nonce: Nonce::new(&directory.new_nonce),
            directory,
            key,
            account_url: String::new(),
            poll_interval: self.poll_interval,
            poll_attempts: self.poll_attempts,
        };
        acme.register(&account.email)?;
        Ok(Box::new(acme))
    }
}

/// 透過 HTTP 與 ACME 伺服器互動的 [`AcmeClient`]，由 [`HttpAcmeConnector`] 建立。
#[derive(Debug)]
pub struct HttpAcmeClient {
    client: Client,
    host: String,
    directory: Directory,
    key: AccountKey,
    nonce: Nonce,
    account_url: String,
    poll_interval: Duration,
    poll_attempts: usize,
}

impl HttpAcmeClient {
    /// 建立或取回帳號。伺服器對既有帳號同樣回傳 `Location`。
    fn register(&mut self, email: &str) -> Result<()> {
        if let Some(terms) = self.directory.terms_of_service() {
            debug!("[{}] Agreeing to terms of service {}", self.host, terms);
        }
        let payload = serde_json::to_value(NewAccountPayload::new(email))?;
        let url = self.directory.new_account.clone();
        let response = self.post(&url, Some(&payload))?;
        self.account_url = location(&response, &url)?;
        info!("[{}] Using ACME account {}", self.host, self.account_url);
        Ok(())
    }

    /// 送出簽名請求。遇到 `badNonce` 時以新的 nonce 重試一次。
    fn signed_request(
        &mut self,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response> {
        let mut retried = false;
        loop {
            let nonce = self.nonce.take(&self.client)?;
            let key_id = if self.account_url.is_empty() {
                KeyId::Jwk
            } else {
                KeyId::Kid(&self.account_url)
            };
            let body = self.key.sign(url, &nonce, key_id, payload)?.to_json()?;

            debug!("ACME request: POST {}", url);
            let mut request = self
                .client
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .body(body);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let response = request.send()?;
            self.nonce.store(response.headers());

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let problem: Problem = serde_json::from_str(&response.text()?).unwrap_or_default();
            if problem.is_bad_nonce() && !retried {
                debug!("Retrying {} after badNonce", url);
                self.nonce.discard();
                retried = true;
                continue;
            }
            return Err(AcmeError::Server { status, problem });
        }
    }

    fn post(&mut self, url: &str, payload: Option<&Value>) -> Result<Response> {
        self.signed_request(url, payload, None)
    }

    fn post_as_get<T: DeserializeOwned>(&mut self, url: &str) -> Result<T> {
        Ok(self.post(url, None)?.json()?)
    }

    fn wait_authorization(&mut self, url: &str, domain: &str) -> Result<()> {
        for attempt in 1..=self.poll_attempts {
            let authz: Authorization = self.post_as_get(url)?;
            match authz.status {
                Status::Valid => return Ok(()),
                Status::Pending | Status::Processing => {}
                _ => {
                    return Err(AcmeError::ChallengeFailed {
                        domain: domain.to_string(),
                        detail: authz.failure_detail(),
                    })
                }
            }
            debug!("Authorization for {} still {} ({})", domain, authz.status, attempt);
            thread::sleep(self.poll_interval);
        }
        Err(AcmeError::Timeout(format!("authorization for {}", domain)))
    }

    fn wait_order(&mut self, url: &str, targets: &[Status]) -> Result<Order> {
        for attempt in 1..=self.poll_attempts {
            let order: Order = self.post_as_get(url)?;
            if targets.contains(&order.status) {
                return Ok(order);
            }
            if order.status == Status::Invalid {
                return Err(AcmeError::ChallengeFailed {
                    domain: url.to_string(),
                    detail: order
                        .error
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "order is invalid".to_string()),
                });
            }
            debug!("Order {} still {} ({})", url, order.status, attempt);
            thread::sleep(self.poll_interval);
        }
        Err(AcmeError::Timeout(format!("order {}", url)))
    }
}

impl AcmeClient for HttpAcmeClient {
    fn request_challenge(&mut self, csr: &CertificateSigningRequest) -> Result<DnsChallenge> {
        let payload = serde_json::to_value(NewOrderPayload {
            identifiers: order_identifiers(csr)?,
        })?;
        let new_order = self.directory.new_order.clone();
        let response = self.post(&new_order, Some(&payload))?;
        let order_url = location(&response, &new_order)?;
        let order: Order = response.json()?;
        if order.status == Status::Invalid {
            return Err(AcmeError::InvalidStatus {
                resource: format!("order {}", order_url),
                status: order.status,
            });
        }

        let thumbprint = self.key.thumbprint()?;
        let mut dns_challenge = DnsChallenge::new(&order_url);
        for authz_url in &order.authorizations {
            let authz: Authorization = self.post_as_get(authz_url)?;
            match authz.status {
                Status::Valid => {
                    debug!("Authorization for {} is already valid", authz.domain());
                    continue;
                }
                Status::Pending => {}
                status => {
                    return Err(AcmeError::InvalidStatus {
                        resource: format!("authorization for {}", authz.domain()),
                        status,
                    })
                }
            }
            let challenge = authz.dns_challenge()?;
            dns_challenge.add(
                &authz.domain(),
                dns_txt_value(&key_authorization(&challenge.token, &thumbprint)),
            );
        }
        Ok(dns_challenge)
    }

    fn complete_challenge(
        &mut self,
        challenge: &DnsChallenge,
        csr: &CertificateSigningRequest,
    ) -> Result<String> {
        let order_url = challenge.order_url();
        let order: Order = self.post_as_get(order_url)?;

        for authz_url in &order.authorizations {
            let authz: Authorization = self.post_as_get(authz_url)?;
            if authz.status == Status::Valid {
                continue;
            }
            let resource = authz.dns_challenge()?;
            if resource.status == Status::Pending {
                let url = resource.url.clone();
                self.post(&url, Some(&json!({})))?;
            }
            self.wait_authorization(authz_url, &authz.domain())?;
        }

        let mut order = self.wait_order(order_url, &[Status::Ready, Status::Valid])?;
        if order.status == Status::Ready {
            let payload = serde_json::to_value(FinalizeOrderPayload {
                csr: base64_url(csr.to_der()?),
            })?;
            let finalize = order.finalize.clone();
            self.post(&finalize, Some(&payload))?;
            order = self.wait_order(order_url, &[Status::Valid])?;
        }

        let certificate_url = order.certificate.ok_or(AcmeError::MissingCertificate)?;
        let chain = self
            .signed_request(&certificate_url, None, Some(PEM_CHAIN))?
            .text()?;
        info!(
            "[{}] Downloaded certificate chain for order {}",
            self.host, order_url
        );
        Ok(chain)
    }
}
