//! DigitalOcean DNS Provider。
//!
//! [`DigitalOceanProvider`] 在單次流程內維護 [`DomainRecordCache`]，透過 [`RecordBackend`]
//! 建立與刪除 TXT 記錄。刪除一律依記錄 ID 進行，因此同名但不相關的記錄不會被移除。

use std::{collections::HashMap, fmt, time::Duration};

use log::{debug, info, warn};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DnsProvider, ProviderError, RecordState, RecordType, Result, TxtRecordSpec};

/// 在 [`super::ProviderRegistry`] 中登記的名稱。
pub const PROVIDER_NAME: &str = "digital_ocean";

const DO_API_BASE: &str = "https://api.digitalocean.com/v2";
const PER_PAGE: u32 = 200;
const DEFAULT_TTL: u32 = 60;

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

/// `dns_provider.digital_ocean` 的選項。
#[derive(Clone, Deserialize)]
pub struct DigitalOceanOptions {
    /// API token。
    pub oauth_token: String,
    /// 記錄所在的 zone，例如 `example.com`。
    pub domain: String,
    /// 新記錄的 TTL（秒），預設 60。
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

impl fmt::Debug for DigitalOceanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOceanOptions")
            .field("oauth_token", &"***")
            .field("domain", &self.domain)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// 後端記錄。`name` 為不含結尾點的小寫 FQDN。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    /// 後端指派的記錄 ID，刪除時使用。
    pub id: i64,
    /// 記錄名稱。
    pub name: String,
    /// 記錄內容。
    pub value: String,
}

/// Zone API 的最小操作集合。
pub trait RecordBackend: fmt::Debug {
    /// 列出 `domain` 下所有指定類型的記錄。
    fn list_records(&self, domain: &str, record_type: RecordType) -> Result<Vec<RecordEntry>>;

    /// 建立記錄；相同名稱與內容的記錄已存在時直接回傳該記錄。
    ///
    /// # 參數
    ///
    /// - `domain`: 記錄所在的 zone
    /// - `record_type`: 記錄類型
    /// - `name`: 不含結尾點的 FQDN
    /// - `value`: 記錄內容
    /// - `ttl`: 新記錄的 TTL（秒）
    ///
    /// # 回傳
    ///
    /// 新建立或既有的記錄，其中包含後端指派的 ID
    fn upsert_record(
        &self,
        domain: &str,
        record_type: RecordType,
        name: &str,
        value: &str,
        ttl: u32,
    ) -> Result<RecordEntry>;

    /// 依 ID 刪除記錄。
    fn delete_record(&self, domain: &str, id: i64) -> Result<()>;
}

/// 單次流程內的記錄快取：domain -> FQDN -> 記錄。
///
/// 某個 domain 一旦載入即視為權威資料，流程結束前不會重新查詢。
#[derive(Debug, Default)]
pub struct DomainRecordCache {
    domains: HashMap<String, HashMap<String, Vec<RecordEntry>>>,
}

impl DomainRecordCache {
    /// `domain` 是否已經載入。
    pub fn is_populated(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    /// 以後端列出的記錄載入 `domain`，空清單同樣視為已載入。
    pub fn populate(&mut self, domain: &str, entries: Vec<RecordEntry>) {
        let mut by_name: HashMap<String, Vec<RecordEntry>> = HashMap::new();
        for entry in entries {
            by_name.entry(entry.name.clone()).or_default().push(entry);
        }
        self.domains.insert(domain.to_string(), by_name);
    }

    /// `name`（不含結尾點的 FQDN）下的快取記錄。
    pub fn lookup(&self, domain: &str, name: &str) -> &[RecordEntry] {
        self.domains
            .get(domain)
            .and_then(|names| names.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 記下新建立的記錄；相同 ID 不會重複加入。domain 尚未載入時不做任何事。
    pub fn remember(&mut self, domain: &str, entry: RecordEntry) {
        if let Some(names) = self.domains.get_mut(domain) {
            let entries = names.entry(entry.name.clone()).or_default();
            if !entries.iter().any(|e| e.id == entry.id) {
                entries.push(entry);
            }
        }
    }

    /// 移除已刪除的記錄。
    pub fn forget(&mut self, domain: &str, name: &str, id: i64) {
        if let Some(entries) = self
            .domains
            .get_mut(domain)
            .and_then(|names| names.get_mut(name))
        {
            entries.retain(|e| e.id != id);
        }
    }
}

/// 以 DigitalOcean 為後端的 [`DnsProvider`]。
#[derive(Debug)]
pub struct DigitalOceanProvider {
    backend: Box<dyn RecordBackend>,
    options: DigitalOceanOptions,
    cache: DomainRecordCache,
    host: String,
}

impl DigitalOceanProvider {
    /// 以選項中的 token 建立連線至 DigitalOcean API 的 Provider。
    ///
    /// # 參數
    ///
    /// - `options`: token、zone 與 TTL
    ///
    /// # 回傳
    ///
    /// 成功回傳 Provider，HTTP 客戶端建立失敗時回傳 `ProviderError::Request`
    pub fn new(options: DigitalOceanOptions) -> Result<Self> {
        let client = DigitalOceanClient::new(&options.oauth_token)?;
        Ok(Self::with_backend(options, Box::new(client)))
    }

    /// 使用指定的記錄後端建立 Provider。
    pub fn with_backend(options: DigitalOceanOptions, backend: Box<dyn RecordBackend>) -> Self {
        Self {
            backend,
            options,
            cache: DomainRecordCache::default(),
            host: "localhost".to_string(),
        }
    }

    /// 設定記錄訊息時使用的主機標籤。
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// 本次流程的記錄快取。
    pub fn cache(&self) -> &DomainRecordCache {
        &self.cache
    }

    fn ensure_cached(&mut self, record_type: RecordType) -> Result<()> {
        let domain = &self.options.domain;
        if self.cache.is_populated(domain) {
            return Ok(());
        }
        let entries = self.backend.list_records(domain, record_type)?;
        if entries.is_empty() {
            warn!(
                "[{}] No {} records found for domain {}",
                self.host, record_type, domain
            );
        }
        debug!("Cached {} {} records for {}", entries.len(), record_type, domain);
        self.cache.populate(domain, entries);
        Ok(())
    }

    fn present(&mut self, record_type: RecordType, records: &[TxtRecordSpec]) -> Result<()> {
        self.ensure_cached(record_type)?;
        let domain = self.options.domain.clone();
        for record in records {
            let name = record.lookup_name();
            for value in &record.values {
                let entry = self.backend.upsert_record(
                    &domain,
                    record_type,
                    &name,
                    value,
                    self.options.ttl,
                )?;
                info!(
                    "[{}] changed: created {} record {} ({}): {}",
                    self.host, record_type, name, entry.id, value
                );
                self.cache.remember(&domain, entry);
            }
        }
        Ok(())
    }

    fn absent(&mut self, record_type: RecordType, records: &[TxtRecordSpec]) -> Result<()> {
        self.ensure_cached(record_type)?;
        let domain = self.options.domain.clone();
        for record in records {
            let name = record.lookup_name();
            let matched: Vec<RecordEntry> = self
                .cache
                .lookup(&domain, &name)
                .iter()
                .filter(|entry| record.values.contains(&entry.value))
                .cloned()
                .collect();
            for entry in matched {
                self.backend.delete_record(&domain, entry.id)?;
                self.cache.forget(&domain, &name, entry.id);
                info!(
                    "[{}] changed: deleted {} record {} ({}): {}",
                    self.host, record_type, name, entry.id, entry.value
                );
            }
        }
        Ok(())
    }
}

impl DnsProvider for DigitalOceanProvider {
    fn apply(
        &mut self,
        state: RecordState,
        record_type: RecordType,
        records: &[TxtRecordSpec],
    ) -> Result<()> {
        for record in records {
            record.validate()?;
        }
        match state {
            RecordState::Present => self.present(record_type, records),
            RecordState::Absent => self.absent(record_type, records),
        }
    }
}

/// [`super::ProviderRegistry`] 使用的工廠函式。
///
/// # 參數
///
/// - `host`: 記錄訊息時使用的主機標籤
/// - `options`: `dns_provider.digital_ocean` 的內容
///
/// # 回傳
///
/// 成功回傳 Provider；選項缺欄位或型別錯誤時回傳 `ProviderError::InvalidOptions`
pub fn factory(host: &str, options: &Value) -> Result<Box<dyn DnsProvider>> {
    let options: DigitalOceanOptions = serde_json::from_value(options.clone())?;
    Ok(Box::new(DigitalOceanProvider::new(options)?.with_host(host)))
}

/// 將 FQDN 轉為 zone 內的相對名稱，zone 本身為 `@`。
fn relative_name(fqdn: &str, zone: &str) -> String {
    let fqdn = fqdn.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');
    if fqdn.eq_ignore_ascii_case(zone) {
        return "@".to_string();
    }
    let suffix = format!(".{}", zone.to_ascii_lowercase());
    let lower = fqdn.to_ascii_lowercase();
    match lower.strip_suffix(&suffix) {
        Some(prefix) => prefix.to_string(),
        None => lower,
    }
}

/// 將 zone 內的相對名稱轉回 FQDN（不含結尾點）。
fn absolute_name(name: &str, zone: &str) -> String {
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    if name == "@" || name == zone {
        zone
    } else if name.ends_with(&format!(".{}", zone)) {
        name
    } else {
        format!("{}.{}", name, zone)
    }
}

#[derive(Debug, Deserialize)]
struct DomainRecordsResponse {
    domain_records: Vec<DoDomainRecord>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Debug, Default, Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DomainRecordResponse {
    domain_record: DoDomainRecord,
}

#[derive(Debug, Clone, Deserialize)]
struct DoDomainRecord {
    id: i64,
    name: String,
    data: String,
}

impl DoDomainRecord {
    fn into_entry(self, zone: &str) -> RecordEntry {
        RecordEntry {
            id: self.id,
            name: absolute_name(&self.name, zone),
            value: self.data,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    data: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct DoErrorResponse {
    id: String,
    message: String,
}

/// DigitalOcean v2 Domain Records API 的同步客戶端。
pub struct DigitalOceanClient {
    client: Client,
    token: String,
    base_url: String,
}

impl fmt::Debug for DigitalOceanClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOceanClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DigitalOceanClient {
    /// 連線至正式 API 的客戶端。
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(token, DO_API_BASE)
    }

    /// 連線至指定 API 位址的客戶端。
    ///
    /// # 參數
    ///
    /// - `token`: API token，以 Bearer 方式送出
    /// - `base_url`: API 根路徑，例如 `https://api.digitalocean.com/v2`
    ///
    /// # 回傳
    ///
    /// 成功回傳客戶端，HTTP 客戶端建立失敗時回傳 `ProviderError::Request`
    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        let message = match serde_json::from_str::<DoErrorResponse>(&body) {
            Ok(error) => format!("{} ({})", error.message, error.id),
            Err(_) => body,
        };
        Err(ProviderError::Api { status, message })
    }

    /// 取得所有分頁的記錄，`name` 為 FQDN 時只取該名稱。
    fn fetch_records(
        &self,
        domain: &str,
        record_type: RecordType,
        name: Option<&str>,
    ) -> Result<Vec<RecordEntry>> {
        let url = format!("{}/domains/{}/records", self.base_url, domain);
        let per_page = PER_PAGE.to_string();
        let mut query = vec![("type", record_type.as_str()), ("per_page", per_page.as_str())];
        if let Some(name) = name {
            query.push(("name", name));
        }

        debug!("DigitalOcean API request: GET {}", url);
        let mut request = self.authorized(self.client.get(&url).query(&query));
        let mut entries = Vec::new();
        loop {
            let page: DomainRecordsResponse = Self::check(request.send()?)?.json()?;
            entries.extend(page.domain_records.into_iter().map(|r| r.into_entry(domain)));
            match page.links.pages.and_then(|pages| pages.next) {
                Some(next) => {
                    debug!("DigitalOcean API request: GET {}", next);
                    request = self.authorized(self.client.get(&next));
                }
                None => break,
            }
        }
        Ok(entries)
    }
}

impl RecordBackend for DigitalOceanClient {
    fn list_records(&self, domain: &str, record_type: RecordType) -> Result<Vec<RecordEntry>> {
        self.fetch_records(domain, record_type, None)
    }

    fn upsert_record(
        &self,
        domain: &str,
        record_type: RecordType,
        name: &str,
        value: &str,
        ttl: u32,
    ) -> Result<RecordEntry> {
        let fqdn = absolute_name(name, domain);
        let existing = self.fetch_records(domain, record_type, Some(&fqdn))?;
        if let Some(entry) = existing.into_iter().find(|e| e.name == fqdn && e.value == value) {
            debug!("Record {} already holds {}", fqdn, value);
            return Ok(entry);
        }

        let url = format!("{}/domains/{}/records", self.base_url, domain);
        let relative = relative_name(&fqdn, domain);
        let body = CreateRecordRequest {
            record_type: record_type.as_str(),
            name: &relative,
            data: value,
            ttl,
        };
        debug!("DigitalOcean API request: POST {}", url);
        let response = self.authorized(self.client.post(&url).json(&body)).send()?;
        let created: DomainRecordResponse = Self::check(response)?.json()?;
        Ok(created.domain_record.into_entry(domain))
    }

    fn delete_record(&self, domain: &str, id: i64) -> Result<()> {
        let url = format!("{}/domains/{}/records/{}", self.base_url, domain, id);
        debug!("DigitalOcean API request: DELETE {}", url);
        Self::check(self.authorized(self.client.delete(&url)).send()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, MemZone};

    fn options() -> DigitalOceanOptions {
        serde_json::from_value(serde_json::json!({
            "oauth_token": "secret-token",
            "domain": "example.com",
        }))
        .unwrap()
    }

    fn provider(zone: &MemZone) -> DigitalOceanProvider {
        DigitalOceanProvider::with_backend(options(), Box::new(zone.clone()))
    }

    fn challenge(values: &[&str]) -> Vec<TxtRecordSpec> {
        vec![TxtRecordSpec::subset(
            "_acme-challenge.example.com.",
            values.iter().map(|v| v.to_string()).collect(),
        )
        .unwrap()]
    }

    #[test]
    fn test_options_defaults_and_redaction() {
        let options = options();
        assert_eq!(options.ttl, 60);
        let printed = format!("{:?}", options);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("example.com"));
    }

    #[test]
    fn test_name_conversion() {
        assert_eq!(relative_name("example.com.", "example.com"), "@");
        assert_eq!(
            relative_name("_acme-challenge.Example.com.", "example.com"),
            "_acme-challenge"
        );
        assert_eq!(relative_name("other.org", "example.com"), "other.org");

        assert_eq!(absolute_name("@", "example.com"), "example.com");
        assert_eq!(
            absolute_name("_acme-challenge", "example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            absolute_name("_acme-challenge.example.com.", "example.com"),
            "_acme-challenge.example.com"
        );
    }

    #[test]
    fn test_records_page_parsing() {
        let page: DomainRecordsResponse = serde_json::from_str(
            r#"{
                "domain_records": [
                    {"id": 11, "type": "TXT", "name": "_acme-challenge", "data": "tok1", "ttl": 60},
                    {"id": 12, "type": "TXT", "name": "@", "data": "v=spf1 -all", "ttl": 3600}
                ],
                "links": {"pages": {"next": "https://api.digitalocean.com/v2/domains/example.com/records?page=2"}},
                "meta": {"total": 3}
            }"#,
        )
        .unwrap();
        let next = page.links.pages.as_ref().and_then(|p| p.next.clone());
        assert!(next.unwrap().ends_with("page=2"));

        let entries: Vec<RecordEntry> = page
            .domain_records
            .into_iter()
            .map(|r| r.into_entry("example.com"))
            .collect();
        assert_eq!(entries[0].name, "_acme-challenge.example.com");
        assert_eq!(entries[1].name, "example.com");

        let last: DomainRecordsResponse =
            serde_json::from_str(r#"{"domain_records": [], "links": {}}"#).unwrap();
        assert!(last.links.pages.is_none());
    }

    #[test]
    fn test_absent_on_unseen_domain_is_noop() {
        test_support::capture_logs();
        let zone = MemZone::new();
        let mut provider = provider(&zone).with_host("empty-zone-host");

        provider
            .apply(RecordState::Absent, RecordType::Txt, &challenge(&["tok1"]))
            .unwrap();

        assert!(provider.cache().is_populated("example.com"));
        assert_eq!(zone.calls(), vec!["list example.com"]);
        assert!(test_support::logged(
            log::Level::Warn,
            "[empty-zone-host] No TXT records found for domain example.com"
        ));
    }

    /// 列出記錄時總是回傳建立時的快照，模擬尚未反映新寫入的 API。
    #[derive(Debug)]
    struct LaggingBackend {
        zone: MemZone,
        snapshot: Vec<RecordEntry>,
    }

    impl LaggingBackend {
        fn new(zone: &MemZone) -> Self {
            let snapshot = zone.list_records("example.com", RecordType::Txt).unwrap();
            Self {
                zone: zone.clone(),
                snapshot,
            }
        }
    }

    impl RecordBackend for LaggingBackend {
        fn list_records(&self, _: &str, _: RecordType) -> Result<Vec<RecordEntry>> {
            Ok(self.snapshot.clone())
        }

        fn upsert_record(
            &self,
            domain: &str,
            record_type: RecordType,
            name: &str,
            value: &str,
            ttl: u32,
        ) -> Result<RecordEntry> {
            self.zone
                .upsert_record(domain, record_type, name, value, ttl)
        }

        fn delete_record(&self, domain: &str, id: i64) -> Result<()> {
            self.zone.delete_record(domain, id)
        }
    }

    #[test]
    fn test_absent_deletes_created_records_when_listing_lags() {
        let zone = MemZone::new();
        let unrelated = zone.seed("_acme-challenge.example.com", "other-validation");
        let mut provider =
            DigitalOceanProvider::with_backend(options(), Box::new(LaggingBackend::new(&zone)));
        let records = challenge(&["tok1", "tok2"]);

        provider
            .apply(RecordState::Present, RecordType::Txt, &records)
            .unwrap();
        provider
            .apply(RecordState::Absent, RecordType::Txt, &records)
            .unwrap();

        assert_eq!(
            zone.values("_acme-challenge.example.com"),
            vec!["other-validation"]
        );
        assert_eq!(
            provider
                .cache()
                .lookup("example.com", "_acme-challenge.example.com")
                .iter()
                .map(|e| e.id)
                .collect::<Vec<_>>(),
            vec![unrelated]
        );
    }

    #[test]
    fn test_present_populates_cache_before_writing() {
        let zone = MemZone::new();
        let mut provider = provider(&zone);

        provider
            .apply(RecordState::Present, RecordType::Txt, &challenge(&["tok1"]))
            .unwrap();

        assert_eq!(
            zone.calls(),
            vec![
                "list example.com".to_string(),
                "upsert _acme-challenge.example.com tok1".to_string(),
            ]
        );
        assert_eq!(
            provider
                .cache()
                .lookup("example.com", "_acme-challenge.example.com")
                .len(),
            1
        );
    }

    #[test]
    fn test_present_then_absent_round_trip() {
        let zone = MemZone::new();
        let unrelated = zone.seed("_acme-challenge.example.com", "other-validation");
        let mut provider = provider(&zone);
        let records = challenge(&["tok1", "tok2"]);

        provider
            .apply(RecordState::Present, RecordType::Txt, &records)
            .unwrap();
        assert_eq!(
            zone.values("_acme-challenge.example.com"),
            vec!["other-validation", "tok1", "tok2"]
        );

        provider
            .apply(RecordState::Absent, RecordType::Txt, &records)
            .unwrap();
        assert_eq!(
            zone.values("_acme-challenge.example.com"),
            vec!["other-validation"]
        );
        assert_eq!(
            provider
                .cache()
                .lookup("example.com", "_acme-challenge.example.com")
                .iter()
                .map(|e| e.id)
                .collect::<Vec<_>>(),
            vec![unrelated]
        );
    }

    #[test]
    fn test_present_is_idempotent_with_force_update() {
        let zone = MemZone::new();
        let mut provider = provider(&zone);
        let records = challenge(&["tok1"]);

        provider
            .apply(RecordState::Present, RecordType::Txt, &records)
            .unwrap();
        provider
            .apply(RecordState::Present, RecordType::Txt, &records)
            .unwrap();
        assert_eq!(zone.values("_acme-challenge.example.com"), vec!["tok1"]);
    }

    #[test]
    fn test_cache_is_authoritative_after_population() {
        let zone = MemZone::new();
        let mut provider = provider(&zone);
        provider
            .apply(RecordState::Absent, RecordType::Txt, &challenge(&["tok1"]))
            .unwrap();

        provider
            .apply(RecordState::Present, RecordType::Txt, &challenge(&["tok1"]))
            .unwrap();
        provider
            .apply(RecordState::Absent, RecordType::Txt, &challenge(&["tok1"]))
            .unwrap();

        assert!(zone.values("_acme-challenge.example.com").is_empty());
        let lists = zone.calls().iter().filter(|c| c.starts_with("list")).count();
        assert_eq!(lists, 1);
    }

    #[test]
    fn test_backend_failure_is_remote_error() {
        let zone = MemZone::new();
        zone.fail_upserts("rate limited");
        let mut provider = provider(&zone);

        let err = provider
            .apply(RecordState::Present, RecordType::Txt, &challenge(&["tok1"]))
            .unwrap_err();
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_empty_values_rejected_before_backend() {
        let zone = MemZone::new();
        let mut provider = provider(&zone);
        let records = vec![TxtRecordSpec {
            name: "_acme-challenge.example.com.".into(),
            values: vec![],
            mode: Default::default(),
        }];

        let err = provider
            .apply(RecordState::Present, RecordType::Txt, &records)
            .unwrap_err();
        assert!(matches!(err, ProviderError::EmptyValues(_)));
        assert!(zone.calls().is_empty());
    }
}
