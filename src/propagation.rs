use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use log::debug;
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::provider::TxtRecordSpec;

/// 預設的 DNS-over-HTTPS JSON 端點。
pub const DEFAULT_DOH_ENDPOINT: &str = "https://cloudflare-dns.com/dns-query";
/// 預設的輪詢間隔。
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// 預設的傳播等待期限。
pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(120);

const TXT_RECORD_TYPE: u16 = 16;
const RCODE_NOERROR: u32 = 0;
const RCODE_NXDOMAIN: u32 = 3;

/// 查詢或等待 TXT 記錄時的錯誤。
#[derive(Debug, Error)]
pub enum PropagationError {
    /// DoH 請求失敗
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    /// 解析器回傳 NOERROR 與 NXDOMAIN 以外的狀態碼
    #[error("Resolver returned status {status} for {name}")]
    Resolver { name: String, status: u32 },
    /// 期限內仍有值不可見，`pending` 列出尚未看到的名稱
    #[error("Timed out after {waited:?} waiting for {pending:?} (last resolver error: {last_error:?})")]
    Timeout {
        waited: Duration,
        pending: Vec<String>,
        last_error: Option<String>,
    },
}

/// 本模組使用的結果類型，當中錯誤皆為 `PropagationError`。
pub type Result<T> = std::result::Result<T, PropagationError>;

/// 查詢 TXT 記錄的解析器。
pub trait TxtResolver: fmt::Debug {
    /// 回傳 `name` 目前可見的 TXT 值；不存在時回傳空清單。
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// 透過 DNS-over-HTTPS JSON API 查詢的解析器。
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: Client,
    endpoint: String,
}

impl DohResolver {
    /// 建立解析器。
    ///
    /// # 參數
    ///
    /// - `endpoint`: 支援 `application/dns-json` 的查詢端點
    ///
    /// # 回傳
    ///
    /// HTTP 客戶端建立失敗時回傳 `PropagationError::Request`
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
            endpoint: endpoint.into(),
        })
    }

    fn parse_answers(name: &str, response: DohResponse) -> Result<Vec<String>> {
        match response.status {
            RCODE_NOERROR => Ok(response
                .answer
                .into_iter()
                .filter(|answer| answer.record_type == TXT_RECORD_TYPE)
                .map(|answer| decode_txt_data(&answer.data))
                .collect()),
            RCODE_NXDOMAIN => Ok(Vec::new()),
            status => Err(PropagationError::Resolver {
                name: name.to_string(),
                status,
            }),
        }
    }
}

impl TxtResolver for DohResolver {
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        let response: DohResponse = self
            .client
            .get(&self.endpoint)
            .query(&[("name", name), ("type", "TXT")])
            .header("Accept", "application/dns-json")
            .send()?
            .error_for_status()?
            .json()?;
        Self::parse_answers(name, response)
    }
}

/// 將 `"abc" "def"` 形式的 TXT 資料合併成單一字串；未加引號的資料原樣回傳。
fn decode_txt_data(data: &str) -> String {
    let trimmed = data.trim();
    if !trimmed.starts_with('"') {
        return trimmed.to_string();
    }

    let mut value = String::new();
    let mut in_quotes = false;
    let mut chars = trimmed.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    value.push(escaped);
                }
            }
            _ if in_quotes => value.push(c),
            _ => {}
        }
    }
    value
}

/// 輪詢間隔與期限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationPolicy {
    /// 兩次查詢之間的間隔
    pub interval: Duration,
    /// 超過此期限即回報逾時
    pub timeout: Duration,
}

impl Default for PropagationPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_PROPAGATION_TIMEOUT,
        }
    }
}

/// 反覆查詢每筆記錄，直到所有值都可見或超過期限。
///
/// 查詢失敗視為尚未可見，最後一次的錯誤會附在逾時錯誤中。
pub fn wait_for_txt(
    resolver: &dyn TxtResolver,
    records: &[TxtRecordSpec],
    policy: &PropagationPolicy,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut last_error = None;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut pending = Vec::new();
        for record in records {
            let name = record.lookup_name();
            let visible = match resolver.lookup_txt(&name) {
                Ok(values) => values,
                Err(e) => {
                    debug!("TXT lookup for {} failed: {}", name, e);
                    last_error = Some(e.to_string());
                    Vec::new()
                }
            };
            pending.extend(
                record
                    .values
                    .iter()
                    .filter(|value| !visible.contains(value))
                    .map(|value| format!("{} {}", name, value)),
            );
        }

        if pending.is_empty() {
            debug!("TXT records visible after {} attempt(s)", attempt);
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PropagationError::Timeout {
                waited: now - started,
                pending,
                last_error,
            });
        }
        debug!(
            "Attempt {}: {} TXT value(s) not yet visible",
            attempt,
            pending.len()
        );
        thread::sleep(policy.interval.min(deadline - now));
    }
}
