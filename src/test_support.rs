//! 測試用的記憶體協作者與憑證材料。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Once, OnceLock, RwLock},
};

use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::PKey,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509},
};
use reqwest::StatusCode;

use crate::{
    acme::{self, AcmeAccountConfig, AcmeClient, AcmeConnector, AcmeError, Problem},
    certificate::CertificateSigningRequest,
    challenge::DnsChallenge,
    crypto::{CryptoToolkit, CsrOptions, KeySpec, OpensslToolkit},
    propagation::{self, TxtResolver},
    provider::{
        self,
        digital_ocean::{self, DigitalOceanOptions, DigitalOceanProvider, RecordBackend, RecordEntry},
        DnsProvider, ProviderError, ProviderRegistry, RecordType,
    },
};

/// 整個測試程序共用的 RSA 2048 私鑰。
pub fn rsa_key_pem() -> String {
    static KEY: OnceLock<String> = OnceLock::new();
    KEY.get_or_init(|| OpensslToolkit.generate_private_key(&KeySpec::rsa(2048)).unwrap())
        .clone()
}

pub fn signing_request(private_key_pem: &str, domains: &[&str]) -> String {
    OpensslToolkit
        .generate_csr(private_key_pem, &CsrOptions::for_domains(domains))
        .unwrap()
}

/// 自簽憑證，從一天前開始生效，`days` 天後到期。
pub fn self_signed_certificate(domains: &[&str], days: i64) -> String {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, domains[0]).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let now = Utc::now().timestamp();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(now - 86_400).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + days * 86_400).unwrap())
        .unwrap();

    let mut san = SubjectAlternativeName::new();
    for domain in domains {
        san.dns(domain);
    }
    let san = san.build(&builder.x509v3_context(None, None)).unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
}

#[derive(Debug, Default)]
struct ZoneState {
    next_id: i64,
    records: Vec<RecordEntry>,
    calls: Vec<String>,
    upsert_failure: Option<String>,
}

/// 記憶體中的 DNS zone，同時作為記錄後端與 TXT 解析器。
#[derive(Debug, Clone, Default)]
pub struct MemZone {
    state: Arc<RwLock<ZoneState>>,
}

impl MemZone {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(state: &mut ZoneState, name: &str, value: &str) -> RecordEntry {
        state.next_id += 1;
        let entry = RecordEntry {
            id: state.next_id,
            name: name.trim_end_matches('.').to_lowercase(),
            value: value.to_string(),
        };
        state.records.push(entry.clone());
        entry
    }

    /// 放入既有記錄，不記入呼叫紀錄。
    pub fn seed(&self, name: &str, value: &str) -> i64 {
        Self::insert(&mut self.state.write().unwrap(), name, value).id
    }

    pub fn values(&self, name: &str) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .records
            .iter()
            .filter(|entry| entry.name == name)
            .map(|entry| entry.value.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.read().unwrap().calls.clone()
    }

    pub fn fail_upserts(&self, message: &str) {
        self.state.write().unwrap().upsert_failure = Some(message.to_string());
    }
}

impl RecordBackend for MemZone {
    fn list_records(&self, domain: &str, _: RecordType) -> provider::Result<Vec<RecordEntry>> {
        let mut state = self.state.write().unwrap();
        state.calls.push(format!("list {}", domain));
        Ok(state.records.clone())
    }

    fn upsert_record(
        &self,
        _: &str,
        _: RecordType,
        name: &str,
        value: &str,
        _: u32,
    ) -> provider::Result<RecordEntry> {
        let mut state = self.state.write().unwrap();
        if let Some(message) = &state.upsert_failure {
            return Err(ProviderError::Api {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: message.clone(),
            });
        }
        state.calls.push(format!("upsert {} {}", name, value));
        let existing = state
            .records
            .iter()
            .find(|entry| entry.name == name && entry.value == value)
            .cloned();
        Ok(match existing {
            Some(entry) => entry,
            None => Self::insert(&mut state, name, value),
        })
    }

    fn delete_record(&self, _: &str, id: i64) -> provider::Result<()> {
        let mut state = self.state.write().unwrap();
        state.calls.push(format!("delete {}", id));
        state.records.retain(|entry| entry.id != id);
        Ok(())
    }
}

impl TxtResolver for MemZone {
    fn lookup_txt(&self, name: &str) -> propagation::Result<Vec<String>> {
        Ok(self.values(name))
    }
}

/// 回傳預先設定內容的解析器；未設定的名稱視為不存在。
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, values: &[&str]) {
        self.answers.write().unwrap().insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
    }
}

impl TxtResolver for StaticResolver {
    fn lookup_txt(&self, name: &str) -> propagation::Result<Vec<String>> {
        Ok(self
            .answers
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug)]
struct AcmeScript {
    challenge: DnsChallenge,
    chain: String,
    request_failure: Option<String>,
    complete_failure: Option<String>,
    connects: usize,
    requested: Vec<Vec<String>>,
    completed: usize,
}

/// 依腳本回應的 ACME 伺服器，同時作為連線工廠與客戶端。
#[derive(Debug, Clone)]
pub struct ScriptedAcme {
    script: Arc<RwLock<AcmeScript>>,
}

impl ScriptedAcme {
    pub fn new(challenge: DnsChallenge, chain: String) -> Self {
        Self {
            script: Arc::new(RwLock::new(AcmeScript {
                challenge,
                chain,
                request_failure: None,
                complete_failure: None,
                connects: 0,
                requested: Vec::new(),
                completed: 0,
            })),
        }
    }

    pub fn fail_request(&self, detail: &str) {
        self.script.write().unwrap().request_failure = Some(detail.to_string());
    }

    pub fn fail_complete(&self, detail: &str) {
        self.script.write().unwrap().complete_failure = Some(detail.to_string());
    }

    pub fn chain(&self) -> String {
        self.script.read().unwrap().chain.clone()
    }

    pub fn connects(&self) -> usize {
        self.script.read().unwrap().connects
    }

    /// 每次申請挑戰時 CSR 的 DNS 名稱。
    pub fn requested(&self) -> Vec<Vec<String>> {
        self.script.read().unwrap().requested.clone()
    }

    pub fn completed(&self) -> usize {
        self.script.read().unwrap().completed
    }

    fn unauthorized(detail: &str) -> AcmeError {
        AcmeError::Server {
            status: StatusCode::FORBIDDEN,
            problem: Problem {
                problem_type: "urn:ietf:params:acme:error:unauthorized".to_string(),
                detail: detail.to_string(),
            },
        }
    }
}

impl AcmeConnector for ScriptedAcme {
    fn connect(&self, _: &AcmeAccountConfig, _: &str) -> acme::Result<Box<dyn AcmeClient>> {
        self.script.write().unwrap().connects += 1;
        Ok(Box::new(self.clone()))
    }
}

impl AcmeClient for ScriptedAcme {
    fn request_challenge(&mut self, csr: &CertificateSigningRequest) -> acme::Result<DnsChallenge> {
        let mut script = self.script.write().unwrap();
        if let Some(detail) = &script.request_failure {
            return Err(Self::unauthorized(detail));
        }
        script
            .requested
            .push(csr.dns_names().into_iter().map(String::from).collect());
        Ok(script.challenge.clone())
    }

    fn complete_challenge(
        &mut self,
        _: &DnsChallenge,
        _: &CertificateSigningRequest,
    ) -> acme::Result<String> {
        let mut script = self.script.write().unwrap();
        if let Some(detail) = &script.complete_failure {
            return Err(Self::unauthorized(detail));
        }
        script.completed += 1;
        Ok(script.chain.clone())
    }
}

/// `digital_ocean` 改用 `zone` 作為後端的登記表，選項仍照常解析。
pub fn mem_registry(zone: &MemZone) -> ProviderRegistry {
    let mut registry = ProviderRegistry::default();
    let zone = zone.clone();
    registry.register(digital_ocean::PROVIDER_NAME, move |host, options| {
        let options: DigitalOceanOptions = serde_json::from_value(options.clone())?;
        Ok(Box::new(
            DigitalOceanProvider::with_backend(options, Box::new(zone.clone())).with_host(host),
        ) as Box<dyn DnsProvider>)
    });
    registry
}

static CAPTURED: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

/// 把日誌收進記憶體的 logger。測試並行執行，斷言時應以唯一的主機名稱過濾。
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        CAPTURED
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// 安裝收集用的 logger，可重複呼叫。
pub fn capture_logs() {
    static LOGGER: CaptureLogger = CaptureLogger;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
}

/// 是否曾以 `level` 記錄包含 `needle` 的訊息。
pub fn logged(level: Level, needle: &str) -> bool {
    CAPTURED
        .lock()
        .unwrap()
        .iter()
        .any(|(l, message)| *l == level && message.contains(needle))
}
