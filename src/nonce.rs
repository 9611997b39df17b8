use reqwest::{blocking::Client, header::HeaderMap};
use thiserror::Error;

/// 回應中攜帶下一個 nonce 的標頭。
pub const REPLAY_NONCE: &str = "Replay-Nonce";

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 對 newNonce 的 HEAD 請求失敗
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    /// 回應沒有 `Replay-Nonce` 標頭
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
    /// 標頭值不是可見 ASCII
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
}

type Result<T> = std::result::Result<T, NonceError>;

/// 管理 `Replay-Nonce`：優先使用上一個回應附帶的值，沒有時才向 newNonce 發出 HEAD 請求。
#[derive(Debug)]
pub struct Nonce {
    url: String,
    cached: Option<String>,
}

impl Nonce {
    /// 以目錄中的 newNonce URL 建立。
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cached: None,
        }
    }

    /// 取出一個 nonce，每個值只會使用一次。
    pub fn take(&mut self, client: &Client) -> Result<String> {
        if let Some(nonce) = self.cached.take() {
            return Ok(nonce);
        }
        let response = client.head(&self.url).send()?;
        match response.headers().get(REPLAY_NONCE) {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(NonceError::NoNonceHeader),
        }
    }

    /// 記下回應中的新 nonce，供下一個請求使用。
    pub fn store(&mut self, headers: &HeaderMap) {
        if let Some(nonce) = headers.get(REPLAY_NONCE).and_then(|v| v.to_str().ok()) {
            self.cached = Some(nonce.to_string());
        }
    }

    /// 丟棄快取的 nonce，下一次改向伺服器取得。
    pub fn discard(&mut self) {
        self.cached = None;
    }
}
