use std::{
    collections::BTreeSet,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use chrono::{DateTime, TimeDelta, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    x509::{GeneralNameRef, X509},
};
use thiserror::Error;
use x509_parser::{pem::parse_x509_pem, prelude::*};

/// 憑證與 CSR 解析可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    /// OpenSSL 無法解析憑證內容。
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    /// CSR 的 PEM 或 DER 結構不正確。
    #[error("Failed to parse signing request: {0}")]
    CsrParseError(String),
    /// 憑證的有效期限超出可表示的範圍。
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
    /// SAN 字串不是 `DNS:` 或 `IP:` 形式。
    #[error("Invalid subject alternative name: {0}")]
    InvalidSan(String),
}

/// 本模組使用的結果類型，當中錯誤皆為 `CertificateError`。
type Result<T> = std::result::Result<T, CertificateError>;

/// 主體替代名稱 (SAN)，比較時 DNS 名稱不分大小寫且忽略結尾的點。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubjectAltName {
    /// 正規化後的 DNS 名稱（小寫、不含結尾點）。
    Dns(String),
    /// IP 位址。
    Ip(IpAddr),
}

impl SubjectAltName {
    /// 建立 DNS 名稱，並轉為小寫、去除結尾的點。
    ///
    /// # 參數
    ///
    /// - `name`: 原始 DNS 名稱，例如 `Example.com.`
    ///
    /// # 回傳
    ///
    /// 正規化後的 `SubjectAltName::Dns`
    pub fn dns(name: &str) -> Self {
        Self::Dns(name.trim_end_matches('.').to_ascii_lowercase())
    }

    fn from_ip_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            4 => <[u8; 4]>::try_from(bytes)
                .ok()
                .map(|octets| Self::Ip(IpAddr::V4(Ipv4Addr::from(octets)))),
            16 => <[u8; 16]>::try_from(bytes)
                .ok()
                .map(|octets| Self::Ip(IpAddr::V6(Ipv6Addr::from(octets)))),
            _ => None,
        }
    }

    fn from_openssl(name: &GeneralNameRef) -> Option<Self> {
        if let Some(dns) = name.dnsname() {
            return Some(Self::dns(dns));
        }
        name.ipaddress().and_then(Self::from_ip_bytes)
    }

    /// 若為 DNS 名稱則回傳其值。
    pub fn as_dns(&self) -> Option<&str> {
        match self {
            Self::Dns(name) => Some(name),
            Self::Ip(_) => None,
        }
    }
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns(name) => write!(f, "DNS:{}", name),
            Self::Ip(ip) => write!(f, "IP:{}", ip),
        }
    }
}

impl FromStr for SubjectAltName {
    type Err = CertificateError;

    /// 解析 `DNS:example.com` 或 `IP:192.0.2.1` 形式的字串。
    fn from_str(s: &str) -> Result<Self> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| CertificateError::InvalidSan(s.to_string()))?;
        match kind.trim().to_ascii_uppercase().as_str() {
            "DNS" if !value.trim().is_empty() => Ok(Self::dns(value.trim())),
            "IP" => value
                .trim()
                .parse()
                .map(Self::Ip)
                .map_err(|_| CertificateError::InvalidSan(s.to_string())),
            _ => Err(CertificateError::InvalidSan(s.to_string())),
        }
    }
}

/// 將 OpenSSL 的 ASN.1 時間轉為 UTC 時間戳。
fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0).ok_or(CertificateError::InvalidTimestamp)
}

/// 已載入的 X.509 憑證，僅保留續約判斷所需的屬性。載入後不可變。
#[derive(Debug, Clone)]
pub struct Certificate {
    pem: String,
    sans: BTreeSet<SubjectAltName>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl Certificate {
    /// 解析 PEM 內容。若為完整憑證鏈，只取第一張（葉憑證）。
    pub fn from_pem(pem: &str) -> Result<Self> {
        let cert = X509::from_pem(pem.as_bytes())?;
        let sans = cert
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(SubjectAltName::from_openssl)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            pem: pem.to_string(),
            sans,
            not_before: asn1_to_datetime(cert.not_before())?,
            not_after: asn1_to_datetime(cert.not_after())?,
        })
    }

    /// 原始的 PEM 內容。
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// 憑證涵蓋的 SAN 集合。
    pub fn sans(&self) -> &BTreeSet<SubjectAltName> {
        &self.sans
    }

    /// 憑證的到期時間。
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// 憑證在 `at` 時是否有效。
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    /// 憑證在 `now + window` 時是否仍然有效，即不在續約窗口內到期。
    ///
    /// # 參數
    ///
    /// - `now`: 判斷的基準時間
    /// - `window`: 續約窗口長度
    ///
    /// # 回傳
    ///
    /// 在窗口結束時仍有效則回傳 `true`；窗口超出可表示的時間範圍時視為無效。
    pub fn is_valid_within(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        now.checked_add_signed(window)
            .is_some_and(|at| self.is_valid_at(at))
    }
}

/// 證書簽名請求，保留 PEM 內容與依出現順序排列的 SAN 清單。
#[derive(Debug, Clone)]
pub struct CertificateSigningRequest {
    pem: String,
    sans: Vec<SubjectAltName>,
}

impl CertificateSigningRequest {
    /// 解析 PEM 格式的 CSR，並依出現順序取出 requested extensions 中的 SAN。
    ///
    /// # 參數
    ///
    /// - `pem`: CSR 的 PEM 內容
    ///
    /// # 回傳
    ///
    /// 成功回傳 `CertificateSigningRequest`，格式錯誤時回傳 `CertificateError::CsrParseError`。
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (_, block) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| CertificateError::CsrParseError(e.to_string()))?;
        let (_, request) = X509CertificationRequest::from_der(&block.contents)
            .map_err(|e| CertificateError::CsrParseError(e.to_string()))?;

        let mut sans: Vec<SubjectAltName> = Vec::new();
        if let Some(extensions) = request.requested_extensions() {
            for extension in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = extension {
                    for name in &san.general_names {
                        let parsed = match name {
                            GeneralName::DNSName(dns) => Some(SubjectAltName::dns(dns)),
                            GeneralName::IPAddress(bytes) => SubjectAltName::from_ip_bytes(bytes),
                            _ => None,
                        };
                        if let Some(parsed) = parsed {
                            if !sans.contains(&parsed) {
                                sans.push(parsed);
                            }
                        }
                    }
                }
            }
        }

        Ok(Self {
            pem: pem.to_string(),
            sans,
        })
    }

    /// 原始的 PEM 內容。
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// 以 DER 格式回傳請求內容，供 ACME finalize 使用。
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let (_, block) = parse_x509_pem(self.pem.as_bytes())
            .map_err(|e| CertificateError::CsrParseError(e.to_string()))?;
        Ok(block.contents)
    }

    /// 依出現順序排列、已去除重複的 SAN。
    pub fn sans(&self) -> &[SubjectAltName] {
        &self.sans
    }

    /// SAN 的集合形式，用於與憑證比較。
    pub fn san_set(&self) -> BTreeSet<SubjectAltName> {
        self.sans.iter().cloned().collect()
    }

    /// 依序回傳 SAN 中的 DNS 名稱。
    pub fn dns_names(&self) -> Vec<&str> {
        self.sans.iter().filter_map(SubjectAltName::as_dns).collect()
    }
}
