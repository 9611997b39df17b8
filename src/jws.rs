//! ACME 請求所需的 JSON Web Signature (JWS) 與 JSON Web Key (JWK)。
//!
//! 帳號金鑰支援 RSA（RS256）與 P-256 ECDSA（ES256）。

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{
    bn::{BigNum, BigNumContext},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, Private},
    sha::sha256,
    sign::Signer,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// JWS 與金鑰操作的錯誤類型。
#[derive(Debug, Error)]
pub enum JwsError {
    /// 金鑰解析或簽章失敗
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    /// protected header 或 payload 序列化失敗
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// 金鑰不是 RSA 或 P-256
    #[error("Unsupported account key: {0}")]
    UnsupportedKey(String),
}

type Result<T> = std::result::Result<T, JwsError>;

/// 以 URL-safe、無補齊的 Base64 編碼。
pub fn base64_url(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Flattened JSON 序列化的 JWS。
#[derive(Debug, Serialize, Deserialize)]
pub struct Jws {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

impl Jws {
    /// 序列化為請求 body。
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Rs256,
    Es256,
}

impl Algorithm {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Es256 => "ES256",
        }
    }
}

/// protected header 中識別簽名者的方式。
#[derive(Debug, Clone, Copy)]
pub enum KeyId<'a> {
    /// 帳號尚未建立時，附上完整 JWK。
    Jwk,
    /// 帳號已建立，以帳號 URL 作為 `kid`。
    Kid(&'a str),
}

/// ACME 帳號金鑰。
pub struct AccountKey {
    key: PKey<Private>,
    alg: Algorithm,
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("alg", &self.alg.as_str())
            .finish_non_exhaustive()
    }
}

impl AccountKey {
    /// 由 PEM 私鑰建立帳號金鑰。
    ///
    /// # 參數
    ///
    /// - `pem`: PKCS#8 或傳統格式的 RSA、P-256 私鑰
    ///
    /// # 回傳
    ///
    /// 成功回傳 `AccountKey`，其他金鑰類型回傳 `JwsError::UnsupportedKey`
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = PKey::private_key_from_pem(pem.as_bytes())?;
        let alg = match key.id() {
            Id::RSA => Algorithm::Rs256,
            Id::EC => {
                let curve = key.ec_key()?.group().curve_name();
                if curve != Some(Nid::X9_62_PRIME256V1) {
                    return Err(JwsError::UnsupportedKey(format!("EC curve {:?}", curve)));
                }
                Algorithm::Es256
            }
            other => return Err(JwsError::UnsupportedKey(format!("{:?}", other))),
        };
        Ok(Self { key, alg })
    }

    /// 公鑰的 JWK，成員依字典序排列，可直接用於計算 thumbprint。
    pub fn jwk(&self) -> Result<Value> {
        match self.alg {
            Algorithm::Rs256 => {
                let rsa = self.key.rsa()?;
                Ok(json!({
                    "e": base64_url(rsa.e().to_vec()),
                    "kty": "RSA",
                    "n": base64_url(rsa.n().to_vec()),
                }))
            }
            Algorithm::Es256 => {
                let ec = self.key.ec_key()?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates(ec.group(), &mut x, &mut y, &mut ctx)?;
                Ok(json!({
                    "crv": "P-256",
                    "kty": "EC",
                    "x": base64_url(x.to_vec_padded(32)?),
                    "y": base64_url(y.to_vec_padded(32)?),
                }))
            }
        }
    }

    /// RFC 7638 thumbprint。
    pub fn thumbprint(&self) -> Result<String> {
        let canonical = serde_json::to_string(&self.jwk()?)?;
        Ok(base64_url(sha256(canonical.as_bytes())))
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.alg {
            Algorithm::Rs256 => {
                let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
                signer.update(data)?;
                Ok(signer.sign_to_vec()?)
            }
            Algorithm::Es256 => {
                let ec = self.key.ec_key()?;
                let signature = EcdsaSig::sign(&sha256(data), &ec)?;
                let mut raw = signature.r().to_vec_padded(32)?;
                raw.extend(signature.s().to_vec_padded(32)?);
                Ok(raw)
            }
        }
    }

    /// 簽署一個 ACME 請求。`payload` 為 `None` 時產生 POST-as-GET 的空 payload。
    pub fn sign(
        &self,
        url: &str,
        nonce: &str,
        key_id: KeyId<'_>,
        payload: Option<&Value>,
    ) -> Result<Jws> {
        let mut protected = json!({
            "alg": self.alg.as_str(),
            "nonce": nonce,
            "url": url,
        });
        match key_id {
            KeyId::Jwk => protected["jwk"] = self.jwk()?,
            KeyId::Kid(kid) => protected["kid"] = Value::String(kid.to_string()),
        }

        let header = base64_url(serde_json::to_vec(&protected)?);
        let payload = match payload {
            Some(value) => base64_url(serde_json::to_vec(value)?),
            None => String::new(),
        };
        let signing_input = format!("{}.{}", header, payload);
        let signature = base64_url(self.sign_bytes(signing_input.as_bytes())?);

        Ok(Jws {
            header,
            payload,
            signature,
        })
    }
}
