use openssl::sha::sha256;

use crate::{
    jws::base64_url,
    provider::{ProviderError, TxtRecordSpec},
};

/// key authorization：`token.thumbprint`。
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// DNS-01 的 TXT 記錄值：key authorization 的 SHA-256，再以 URL-safe Base64 編碼。
pub fn dns_txt_value(key_authorization: &str) -> String {
    base64_url(sha256(key_authorization.as_bytes()))
}

/// 網域對應的挑戰記錄名稱。萬用字元網域與其基底網域共用同一個名稱。
pub fn record_name(domain: &str) -> String {
    format!("_acme-challenge.{}.", base_domain(domain))
}

fn base_domain(domain: &str) -> String {
    domain
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// 一次訂單的 DNS-01 挑戰：網域到 TXT 值的有序對應，以及訂單的識別。
///
/// 建立後不再變更；網域與值的順序即為發佈與清除的順序。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsChallenge {
    order_url: String,
    entries: Vec<(String, Vec<String>)>,
}

impl DnsChallenge {
    /// 建立空的挑戰。
    ///
    /// # 參數
    ///
    /// - `order_url`: 訂單 URL，完成挑戰時用來找回訂單
    pub fn new(order_url: impl Into<String>) -> Self {
        Self {
            order_url: order_url.into(),
            entries: Vec::new(),
        }
    }

    /// 加入一個挑戰值。萬用字元網域併入基底網域，重複的值會被忽略。
    pub fn add(&mut self, domain: &str, value: impl Into<String>) {
        let domain = base_domain(domain);
        let value = value.into();
        match self.entries.iter_mut().find(|(d, _)| *d == domain) {
            Some((_, values)) => {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            None => self.entries.push((domain, vec![value])),
        }
    }

    /// 以 builder 形式加入多個值。
    pub fn with(mut self, domain: &str, values: &[&str]) -> Self {
        for value in values {
            self.add(domain, *value);
        }
        self
    }

    /// 訂單 URL。
    pub fn order_url(&self) -> &str {
        &self.order_url
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 依加入順序列出網域與其 TXT 值。
    pub fn domains(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(domain, values)| (domain.as_str(), values.as_slice()))
    }

    /// 每個網域一筆 subset 模式的 TXT 記錄規格。
    pub fn record_specs(&self) -> Result<Vec<TxtRecordSpec>, ProviderError> {
        self.domains()
            .map(|(domain, values)| TxtRecordSpec::subset(record_name(domain), values.to_vec()))
            .collect()
    }
}
