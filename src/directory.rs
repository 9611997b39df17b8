use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 表示取得目錄時可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// 目錄內容不是預期的 JSON 結構。
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// 請求失敗或伺服器回傳非成功狀態。
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

/// 本模組使用的結果類型，當中錯誤皆為 `DirectoryError`。
type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// ACME 伺服器目錄，列出帳號、nonce 與訂單相關的 API 路徑。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Directory {
    /// 建立帳號的 URL。
    #[serde(rename = "newAccount")]
    pub new_account: String,
    /// 取得新 nonce 的 URL。
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    /// 建立訂單的 URL。
    #[serde(rename = "newOrder")]
    pub new_order: String,
    /// 伺服器的附加資訊，可省略。
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

/// 目錄中的 `meta` 物件。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectoryMeta {
    /// 服務條款的 URL；註冊時即表示同意。
    #[serde(rename = "termsOfService", default)]
    pub terms_of_service: Option<String>,
    /// 伺服器是否要求外部帳號綁定 (EAB)。
    #[serde(rename = "externalAccountRequired", default)]
    pub external_account_required: bool,
}

impl Directory {
    /// 以 GET 請求取得目錄。
    ///
    /// # 參數
    ///
    /// - `client`: 用於發送請求的 HTTP 客戶端
    /// - `url`: ACME 目錄的 URL
    ///
    /// # 回傳
    ///
    /// 成功回傳解析後的 `Directory`，否則回傳 `DirectoryError`
    pub fn fetch(client: &Client, url: &str) -> DirectoryResult<Self> {
        let response = client.get(url).send()?.error_for_status()?;
        Ok(serde_json::from_str(&response.text()?)?)
    }

    /// 伺服器是否要求外部帳號綁定。
    pub fn requires_external_account(&self) -> bool {
        self.meta
            .as_ref()
            .is_some_and(|meta| meta.external_account_required)
    }

    /// 服務條款的 URL（若有）。
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.as_deref())
    }
}
