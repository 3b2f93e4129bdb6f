// 🌐 External Registry Client - corporate-number resolution + basic info
//
// Two independent, rate-limited services sit behind one trait:
// - corporate-number search: company name (+ optional prefecture) → ordered
//   candidate list, CSV response body
// - registry info: corporate number → basic fields, JSON response body
//
// Both carry their own token and are paced with a fixed inter-call delay -
// the external rate limit is undocumented, so the delay is not adaptive.
// Calls are single-attempt: a failure here is mapped by the caller to
// "no enrichment available", never retried within a run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::time::{Duration, Instant};

// ============================================================================
// CONFIG
// ============================================================================

/// Connection settings for both services, built once (from the environment,
/// in the CLI) and injected - never re-derived from ambient state per call.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub corporate_api_token: String,
    pub info_api_token: String,
    pub corporate_api_base: String,
    pub info_api_base: String,
    /// Fixed delay between any two outgoing calls
    pub call_interval: Duration,
    pub timeout: Duration,
}

impl RegistryConfig {
    pub fn new(corporate_api_token: String, info_api_token: String) -> Self {
        RegistryConfig {
            corporate_api_token,
            info_api_token,
            corporate_api_base: "https://api.houjin-bangou.nta.go.jp/4".to_string(),
            info_api_base: "https://info.gbiz.go.jp/hojin/v1/hojin".to_string(),
            call_interval: Duration::from_millis(1200),
            timeout: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// One corporate-number candidate with its registered address text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateCandidate {
    pub corporate_number: String,
    pub name: String,
    pub address: String,
}

/// Basic registry fields for a resolved corporate number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub corporate_number: String,
    pub name: String,
    pub address: Option<String>,
    pub capital: Option<i64>,
    pub employee_count: Option<i64>,
    pub established: Option<String>,
    pub status: Option<String>,
}

// ============================================================================
// TRAIT
// ============================================================================

pub trait RegistryClient {
    /// Name → ordered corporate-number candidates, optionally region-filtered.
    fn find_candidates(
        &self,
        name: &str,
        prefecture: Option<&str>,
    ) -> Result<Vec<CorporateCandidate>>;

    /// Corporate number → basic registry info. Ok(None) when unknown.
    fn basic_info(&self, corporate_number: &str) -> Result<Option<RegistryInfo>>;
}

// ============================================================================
// HTTP ADAPTER
// ============================================================================

pub struct HttpRegistryClient {
    http: reqwest::blocking::Client,
    config: RegistryConfig,
    last_call: RefCell<Option<Instant>>,
}

impl HttpRegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(HttpRegistryClient {
            http,
            config,
            last_call: RefCell::new(None),
        })
    }

    /// Enforce the fixed inter-call delay against the previous call.
    fn pace(&self) {
        let mut last = self.last_call.borrow_mut();
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.config.call_interval {
                std::thread::sleep(self.config.call_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

impl RegistryClient for HttpRegistryClient {
    fn find_candidates(
        &self,
        name: &str,
        prefecture: Option<&str>,
    ) -> Result<Vec<CorporateCandidate>> {
        self.pace();

        let url = format!("{}/name", self.config.corporate_api_base);
        let mut query: Vec<(&str, String)> = vec![
            ("id", self.config.corporate_api_token.clone()),
            ("name", name.to_string()),
            ("type", "12".to_string()), // CSV, Unicode
            ("mode", "2".to_string()),  // partial name match
            ("history", "0".to_string()),
        ];
        if let Some(code) = prefecture.and_then(jis_prefecture_code) {
            query.push(("address", code.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .with_context(|| format!("Corporate-number search failed for: {name}"))?;

        anyhow::ensure!(
            response.status().is_success(),
            "Corporate-number search returned {} for: {name}",
            response.status()
        );

        let body = response
            .text()
            .context("Corporate-number search body unreadable")?;
        Ok(parse_candidate_csv(&body))
    }

    fn basic_info(&self, corporate_number: &str) -> Result<Option<RegistryInfo>> {
        self.pace();

        let url = format!("{}/{}", self.config.info_api_base, corporate_number);
        let response = self
            .http
            .get(&url)
            .header("X-hojinInfo-api-token", &self.config.info_api_token)
            .header("Accept", "application/json")
            .send()
            .with_context(|| format!("Registry info fetch failed for: {corporate_number}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        anyhow::ensure!(
            response.status().is_success(),
            "Registry info returned {} for: {corporate_number}",
            response.status()
        );

        let body: serde_json::Value = response
            .json()
            .context("Registry info body is not valid JSON")?;
        Ok(parse_basic_info(&body))
    }
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

/// Parse the corporate-number search CSV body.
///
/// Layout per record: sequence, corporateNumber, process, correct,
/// updateDate, changeDate, name, nameImageId, kind, prefectureName,
/// cityName, streetNumber, ... A leading metadata line and any record
/// without a 13-digit number in column 1 are skipped rather than rejected.
pub fn parse_candidate_csv(body: &str) -> Vec<CorporateCandidate> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut candidates = Vec::new();
    for record in reader.records().flatten() {
        let number = record.get(1).unwrap_or("").trim();
        if number.len() != 13 || !number.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let name = record.get(6).unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }

        let address = [record.get(9), record.get(10), record.get(11)]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("");

        candidates.push(CorporateCandidate {
            corporate_number: number.to_string(),
            name: name.to_string(),
            address,
        });
    }
    candidates
}

/// Pull the first entry out of a registry-info JSON payload.
pub fn parse_basic_info(body: &serde_json::Value) -> Option<RegistryInfo> {
    let entry = body.get("hojin-infos")?.as_array()?.first()?;

    let corporate_number = entry
        .get("corporate_number")
        .and_then(|v| v.as_str())?
        .to_string();
    let name = entry.get("name").and_then(|v| v.as_str())?.to_string();

    Some(RegistryInfo {
        corporate_number,
        name,
        address: entry
            .get("location")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        capital: entry.get("capital_stock").and_then(|v| v.as_i64()),
        employee_count: entry.get("employee_number").and_then(|v| v.as_i64()),
        established: entry
            .get("date_of_establishment")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        status: entry
            .get("status")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

/// Prefecture name → two-digit JIS code, the region-filter format the
/// corporate-number service expects.
pub fn jis_prefecture_code(prefecture: &str) -> Option<&'static str> {
    let code = match prefecture {
        "北海道" => "01",
        "青森県" => "02",
        "岩手県" => "03",
        "宮城県" => "04",
        "秋田県" => "05",
        "山形県" => "06",
        "福島県" => "07",
        "茨城県" => "08",
        "栃木県" => "09",
        "群馬県" => "10",
        "埼玉県" => "11",
        "千葉県" => "12",
        "東京都" => "13",
        "神奈川県" => "14",
        "新潟県" => "15",
        "富山県" => "16",
        "石川県" => "17",
        "福井県" => "18",
        "山梨県" => "19",
        "長野県" => "20",
        "岐阜県" => "21",
        "静岡県" => "22",
        "愛知県" => "23",
        "三重県" => "24",
        "滋賀県" => "25",
        "京都府" => "26",
        "大阪府" => "27",
        "兵庫県" => "28",
        "奈良県" => "29",
        "和歌山県" => "30",
        "鳥取県" => "31",
        "島根県" => "32",
        "岡山県" => "33",
        "広島県" => "34",
        "山口県" => "35",
        "徳島県" => "36",
        "香川県" => "37",
        "愛媛県" => "38",
        "高知県" => "39",
        "福岡県" => "40",
        "佐賀県" => "41",
        "長崎県" => "42",
        "熊本県" => "43",
        "大分県" => "44",
        "宮崎県" => "45",
        "鹿児島県" => "46",
        "沖縄県" => "47",
        _ => return None,
    };
    Some(code)
}

// ============================================================================
// TESTS
// ============================================================================
