// 📋 Record Normalizer - heterogeneous extract row → company draft
//
// Every prefecture publishes the same registry with its own column headings.
// Each canonical field therefore resolves through an ordered list of
// column-name synonyms, taking the first non-empty match - one small pure
// helper, no duck typing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::path::Path;

use crate::entities::{CoverageLevel, PerformanceSeries};

/// One raw extract row: header → cell value.
pub type RowMap = HashMap<String, String>;

// ============================================================================
// SYNONYM VOCABULARY
// ============================================================================

// Ordered: the most specific published heading first.
const NAME_COLUMNS: &[&str] = &[
    "登録事業者名",
    "事業者名",
    "商号又は名称",
    "会社名",
    "名称",
];
const REGISTRATION_COLUMNS: &[&str] = &["登録番号", "事業者登録番号", "登録No.", "登録No"];
const CORPORATE_NUMBER_COLUMNS: &[&str] = &["法人番号"];
const POSTAL_COLUMNS: &[&str] = &["郵便番号", "〒"];
const PREFECTURE_COLUMNS: &[&str] = &["都道府県", "都道府県名"];
const CITY_COLUMNS: &[&str] = &["市区町村", "市区町村名"];
const STREET_COLUMNS: &[&str] = &["所在地", "住所", "住所（市区町村以降）"];
const PHONE_COLUMNS: &[&str] = &["電話番号", "TEL", "電話", "連絡先電話番号"];
const WEBSITE_COLUMNS: &[&str] = &["ホームページ", "ホームページアドレス", "URL", "ウェブサイト", "HP"];
const TAG_COLUMNS: &[&str] = &["事業区分", "対応工事種別", "取扱工事", "業種"];
const REGION_COLUMNS: &[&str] = &["対応可能地域", "対応地域", "営業地域", "対象地域"];

/// Fixed window of year-keyed performance columns in the published extracts.
pub const PERFORMANCE_YEARS: RangeInclusive<i32> = 2019..=2023;

fn performance_columns(year: i32) -> [String; 3] {
    [
        format!("{year}年度実績(%)"),
        format!("{year}年度実績"),
        format!("{year}年度"),
    ]
}

// ============================================================================
// DRAFT
// ============================================================================

/// A target-region token parsed out of the delimited field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub region: String,
    pub coverage: CoverageLevel,
    /// Raw token, kept only when coverage is Partial
    pub remark: Option<String>,
}

/// Normalized row, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyDraft {
    /// Merge key: exact string equality after trimming. Suffix/spacing/width
    /// variants of a legal name intentionally stay distinct records.
    pub canonical_name: String,
    pub registration_number: Option<String>,
    pub corporate_number: Option<String>,
    pub postal_code: Option<String>,
    pub prefecture: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub tags: Vec<String>,
    /// Region → entry, keyed so re-normalizing never duplicates a region.
    pub regions: BTreeMap<String, RegionEntry>,
    /// Year → value for this extract's performance window
    pub performance: PerformanceSeries,
    pub source_region: String,
}

impl CompanyDraft {
    /// True when the row carried a usable structured address
    pub fn has_structured_address(&self) -> bool {
        self.prefecture.is_some() && (self.city.is_some() || self.street.is_some())
    }
}

// ============================================================================
// NORMALIZER
// ============================================================================

pub struct RecordNormalizer;

impl RecordNormalizer {
    pub fn new() -> Self {
        RecordNormalizer
    }

    /// Normalize one raw row.
    ///
    /// Returns None when no name-candidate column holds a usable value -
    /// the caller counts the skip; the row never reaches the repository.
    pub fn normalize(&self, row: &RowMap, source_region: &str) -> Option<CompanyDraft> {
        let canonical_name = lookup(row, NAME_COLUMNS)?.to_string();

        let mut regions = BTreeMap::new();
        if let Some(raw) = lookup(row, REGION_COLUMNS) {
            for token in split_delimited(raw) {
                let entry = parse_region_token(&token);
                // First token wins; re-running on the same row adds nothing
                regions.entry(entry.region.clone()).or_insert(entry);
            }
        }
        // The source region is always covered, even when the field omits it
        regions
            .entry(source_region.to_string())
            .or_insert_with(|| RegionEntry {
                region: source_region.to_string(),
                coverage: CoverageLevel::Full,
                remark: None,
            });

        let mut performance = PerformanceSeries::new();
        for year in PERFORMANCE_YEARS {
            let columns = performance_columns(year);
            let candidates: Vec<&str> = columns.iter().map(String::as_str).collect();
            if let Some(raw) = lookup(row, &candidates) {
                if let Some(value) = parse_performance_value(raw) {
                    performance.insert(year, value);
                }
            }
        }

        let tags = lookup(row, TAG_COLUMNS)
            .map(split_delimited)
            .unwrap_or_default();

        Some(CompanyDraft {
            canonical_name,
            registration_number: lookup(row, REGISTRATION_COLUMNS).map(str::to_string),
            corporate_number: lookup(row, CORPORATE_NUMBER_COLUMNS).map(str::to_string),
            postal_code: lookup(row, POSTAL_COLUMNS).map(str::to_string),
            prefecture: lookup(row, PREFECTURE_COLUMNS).map(str::to_string),
            city: lookup(row, CITY_COLUMNS).map(str::to_string),
            street: lookup(row, STREET_COLUMNS).map(str::to_string),
            phone: lookup(row, PHONE_COLUMNS).map(str::to_string),
            website: lookup(row, WEBSITE_COLUMNS).map(str::to_string),
            tags,
            regions,
            performance,
            source_region: source_region.to_string(),
        })
    }
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FIELD HELPERS
// ============================================================================

/// Resolve a canonical field through its ordered synonym list:
/// first candidate column with a non-absent value wins.
fn lookup<'a>(row: &'a RowMap, candidates: &[&str]) -> Option<&'a str> {
    for candidate in candidates {
        if let Some(value) = row.get(*candidate) {
            let trimmed = value.trim();
            if !is_absent_marker(trimmed) {
                return Some(trimmed);
            }
        }
    }
    None
}

/// Markers the extracts use for "no data". Never coerced to zero.
fn is_absent_marker(value: &str) -> bool {
    matches!(
        value,
        "" | "-" | "－" | "―" | "ー" | "null" | "NULL" | "N/A"
    )
}

/// Parse a percentage-like performance value.
///
/// "12.5%", "12.5％" and "12.5" all parse to 12.5. Full-width digits are
/// accepted. Absent markers return None - absent is absent, not zero.
pub fn parse_performance_value(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if is_absent_marker(trimmed) {
        return None;
    }

    let stripped = trimmed
        .trim_end_matches('%')
        .trim_end_matches('％')
        .trim();

    let ascii: String = stripped
        .chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            '．' => '.',
            _ => c,
        })
        .collect();

    ascii.parse::<f64>().ok()
}

/// Split a delimiter-separated field on half-width and full-width semicolons.
fn split_delimited(raw: &str) -> Vec<String> {
    raw.split([';', '；'])
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// 「東京都（一部）」→ region 東京都, Partial, raw token kept as the remark.
fn parse_region_token(token: &str) -> RegionEntry {
    if token.contains("一部") {
        let region = token
            .replace("（一部）", "")
            .replace("(一部)", "")
            .trim()
            .to_string();
        RegionEntry {
            region,
            coverage: CoverageLevel::Partial,
            remark: Some(token.to_string()),
        }
    } else {
        RegionEntry {
            region: token.to_string(),
            coverage: CoverageLevel::Full,
            remark: None,
        }
    }
}

// ============================================================================
// REGION FILE READING
// ============================================================================

/// Read one region extract into string-keyed row maps.
///
/// BOM-tolerant; rows with unexpected column counts are tolerated (flexible
/// mode) rather than rejected. A malformed file surfaces as one error for
/// the caller's file-level accounting.
pub fn read_region_rows(path: &Path) -> Result<Vec<RowMap>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read region file: {}", path.display()))?;
    let text = raw.strip_prefix('\u{feff}').unwrap_or(&raw);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to parse CSV header in {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        let record = result.with_context(|| {
            format!(
                "Failed to parse CSV line {} in {}",
                line_num + 2,
                path.display()
            )
        })?;

        let mut row = RowMap::with_capacity(headers.len());
        for (idx, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            if let Some(value) = record.get(idx) {
                row.insert(header.clone(), value.to_string());
            }
        }
        rows.push(row);
    }

    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================
