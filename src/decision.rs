//! 憑證續約判斷：給定現有憑證與期望的 CSR，決定是否需要重新簽發。
//!
//! 此模組不進行任何 I/O，可在沒有遠端協作者的情況下單獨測試。

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

use crate::certificate::{Certificate, CertificateSigningRequest};

/// 決定重新簽發（或略過）的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// 目標路徑上沒有憑證（首次簽發）。
    NoExistingCertificate,
    /// 憑證在續約窗口結束前到期。
    ExpiringWithinWindow,
    /// CSR 的 SAN 集合與憑證不同。
    SanMismatch,
    /// 憑證仍有效且 SAN 一致，略過。
    UpToDate,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoExistingCertificate => "no existing certificate",
            Self::ExpiringWithinWindow => "expiring within window",
            Self::SanMismatch => "SAN mismatch",
            Self::UpToDate => "certificate is up to date",
        };
        f.write_str(text)
    }
}

/// 續約判斷的結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// 是否需要重新簽發。
    pub renew: bool,
    /// 做出此決定的原因。
    pub reason: DecisionReason,
}

impl Decision {
    fn renew(reason: DecisionReason) -> Self {
        Self {
            renew: true,
            reason,
        }
    }

    fn skip() -> Self {
        Self {
            renew: false,
            reason: DecisionReason::UpToDate,
        }
    }
}

/// 依序套用規則：無憑證、窗口內到期、SAN 不一致時續約，否則略過。
///
/// SAN 以集合比較，與順序無關。
///
/// # 參數
///
/// - `existing`: 目標路徑上已載入的憑證，不存在時為 `None`
/// - `csr`: 期望的 CSR
/// - `window`: 續約窗口，例如 30 天
/// - `now`: 判斷的基準時間
///
/// # 回傳
///
/// 回傳 `Decision`，其中 `renew` 表示是否需要重新簽發
pub fn decide(
    existing: Option<&Certificate>,
    csr: &CertificateSigningRequest,
    window: TimeDelta,
    now: DateTime<Utc>,
) -> Decision {
    let Some(certificate) = existing else {
        return Decision::renew(DecisionReason::NoExistingCertificate);
    };
    if !certificate.is_valid_within(now, window) {
        return Decision::renew(DecisionReason::ExpiringWithinWindow);
    }
    if &csr.san_set() != certificate.sans() {
        return Decision::renew(DecisionReason::SanMismatch);
    }
    Decision::skip()
}
