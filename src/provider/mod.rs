//! DNS Provider 抽象。
//!
//! 每個 Provider 以 [`DnsProvider::apply`] 將一組 TXT 記錄設為存在或移除。Provider 實例只存活於
//! 單次流程中，內部的記錄快取不會在流程之間共用。可用的 Provider 由 [`ProviderRegistry`]
//! 以名稱對應工廠函式登記。

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod digital_ocean;

/// DNS Provider 的錯誤。[`ProviderError::is_configuration`] 區分設定錯誤與遠端錯誤。
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 設定的 Provider 名稱未登記。
    #[error("Got invalid dns provider {name}, choose one of {available:?}")]
    UnknownProvider { name: String, available: Vec<String> },
    /// 記錄類型不是 TXT。
    #[error("{0} is not a valid DNS record type")]
    UnsupportedRecordType(String),
    /// Provider 選項無法解析。
    #[error("Invalid provider options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
    /// 記錄規格的 `values` 為空。
    #[error("Record {0} has no values")]
    EmptyValues(String),
    /// 與 Provider API 的連線失敗。
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    /// Provider API 回傳錯誤狀態。
    #[error("Provider API error: {status}, {message}")]
    Api {
        status: reqwest::StatusCode,
        message: String,
    },
}

impl ProviderError {
    /// 是否為設定錯誤（不應重試），其餘皆為遠端操作失敗。
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownProvider { .. }
                | Self::UnsupportedRecordType(_)
                | Self::InvalidOptions(_)
                | Self::EmptyValues(_)
        )
    }
}

/// 本模組使用的結果類型，當中錯誤皆為 `ProviderError`。
pub type Result<T> = std::result::Result<T, ProviderError>;

/// 記錄的目標狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// 記錄必須存在。
    Present,
    /// 先前建立的記錄必須移除。
    Absent,
}

/// 支援的記錄類型，目前只有 TXT。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// TXT 記錄
    Txt,
}

impl RecordType {
    /// DNS 上的類型名稱，例如 `TXT`。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Txt => "TXT",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TXT" => Ok(Self::Txt),
            other => Err(ProviderError::UnsupportedRecordType(other.to_string())),
        }
    }
}

/// `Subset`：`values` 必須額外存在於該名稱下，不影響同名的其他值。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    #[default]
    Subset,
}

/// 一筆 TXT 記錄規格，`name` 為以點結尾的完整網域名稱。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtRecordSpec {
    /// 記錄名稱，例如 `_acme-challenge.example.com.`。
    pub name: String,
    /// 必須存在的值，不可為空。
    pub values: Vec<String>,
    /// 發佈模式，預設為 `subset`。
    #[serde(default)]
    pub mode: RecordMode,
}

impl TxtRecordSpec {
    /// 建立 subset 模式的記錄規格。
    ///
    /// # 參數
    ///
    /// - `name`: 以點結尾的完整網域名稱
    /// - `values`: 必須存在於該名稱下的值
    ///
    /// # 回傳
    ///
    /// 成功回傳記錄規格；`values` 為空時回傳 `ProviderError::EmptyValues`
    pub fn subset(name: impl Into<String>, values: Vec<String>) -> Result<Self> {
        let spec = Self {
            name: name.into(),
            values,
            mode: RecordMode::Subset,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// 確認 `values` 不為空。
    pub fn validate(&self) -> Result<()> {
        if self.values.is_empty() {
            return Err(ProviderError::EmptyValues(self.name.clone()));
        }
        Ok(())
    }

    /// 去掉結尾的點並轉為小寫，作為快取與查詢用的名稱。
    pub fn lookup_name(&self) -> String {
        self.name.trim_end_matches('.').to_ascii_lowercase()
    }
}

/// 獨立的記錄操作輸入：`type` 必須為 `TXT`，其餘欄位（憑證、domain、ttl 等）原樣交給 Provider。
#[derive(Debug, Clone, Deserialize)]
pub struct RecordRequest {
    /// 記錄類型名稱，只接受 `TXT`。
    #[serde(rename = "type")]
    pub record_type: String,
    /// 目標狀態。
    pub state: RecordState,
    /// 要處理的記錄。
    pub records: Vec<TxtRecordSpec>,
    /// 其餘欄位，作為 Provider 選項。
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// DNS Provider 的能力介面。
pub trait DnsProvider: fmt::Debug {
    /// 將一組記錄設為存在或移除。
    ///
    /// # 參數
    ///
    /// - `state`: 目標狀態
    /// - `record_type`: 記錄類型
    /// - `records`: 記錄規格，依序處理
    ///
    /// # 回傳
    ///
    /// 全部成功時回傳 `Ok(())`；第一個失敗即中止並回傳錯誤
    fn apply(
        &mut self,
        state: RecordState,
        record_type: RecordType,
        records: &[TxtRecordSpec],
    ) -> Result<()>;
}

/// 由主機標籤與 Provider 選項建立 Provider 實例的工廠函式。
pub type ProviderFactory =
    Box<dyn Fn(&str, &Value) -> Result<Box<dyn DnsProvider>> + Send + Sync>;

/// Provider 名稱到工廠函式的靜態登記表。
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(digital_ocean::PROVIDER_NAME, digital_ocean::factory);
        registry
    }
}

impl ProviderRegistry {
    /// 建立沒有任何 Provider 的登記表。
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// 登記（或覆蓋）一個 Provider。
    ///
    /// # 參數
    ///
    /// - `name`: `dns_provider` 設定中使用的鍵
    /// - `factory`: 以主機標籤與選項建立 Provider 的函式
    ///
    /// # 回傳
    ///
    /// 回傳自身的可變參考，方便鏈式調用
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&str, &Value) -> Result<Box<dyn DnsProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    /// 已登記的名稱，依字母排序。
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// 名稱是否已登記。
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// 確認名稱已登記，否則回傳列出可用名稱的設定錯誤。
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(ProviderError::UnknownProvider {
                name: name.to_string(),
                available: self.names(),
            })
        }
    }

    /// 建立一個新的 Provider 實例。
    ///
    /// # 參數
    ///
    /// - `name`: 已登記的 Provider 名稱
    /// - `host`: 記錄訊息時使用的主機標籤
    /// - `options`: Provider 專屬的選項，原樣交給工廠函式
    ///
    /// # 回傳
    ///
    /// 成功回傳 Provider 實例；名稱未登記或選項錯誤時回傳設定錯誤
    pub fn create(&self, name: &str, host: &str, options: &Value) -> Result<Box<dyn DnsProvider>> {
        self.validate(name)?;
        match self.factories.get(name) {
            Some(factory) => factory(host, options),
            None => Err(ProviderError::UnknownProvider {
                name: name.to_string(),
                available: self.names(),
            }),
        }
    }

    /// 以新的 Provider 實例執行一次記錄操作。
    pub fn apply(&self, name: &str, host: &str, request: &RecordRequest) -> Result<()> {
        let record_type: RecordType = request.record_type.parse()?;
        for record in &request.records {
            record.validate()?;
        }
        let mut provider = self.create(name, host, &Value::Object(request.options.clone()))?;
        provider.apply(request.state, record_type, &request.records)
    }
}
