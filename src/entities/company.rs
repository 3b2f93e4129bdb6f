// 🏢 Company Entity - Canonical directory record
//
// "Canonical name is the MERGE KEY, company UUID is IDENTITY"
//
// Problem solved:
// - The same builder appears in many prefecture extracts → one record
// - Performance figures arrive region by region, year by year → unioned, never duplicated
// - Service areas accumulate additively → (company, region) pairs are unique

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// ENRICHMENT STATUS
// ============================================================================

/// State of corporate-number resolution for one record.
///
/// Unresolved → Resolved when the external lookup succeeds.
/// Unresolved → Fallback when the lookup fails, returns nothing, or is
/// skipped by configuration. Both are terminal for the current run; a later
/// run may promote Fallback to Resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrichmentStatus {
    Unresolved,
    /// Externally verified corporate number
    Resolved,
    /// Synthetic identifier assigned locally
    Fallback,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Unresolved => "unresolved",
            EnrichmentStatus::Resolved => "resolved",
            EnrichmentStatus::Fallback => "fallback",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "resolved" => EnrichmentStatus::Resolved,
            "fallback" => EnrichmentStatus::Fallback,
            _ => EnrichmentStatus::Unresolved,
        }
    }
}

// ============================================================================
// COMPANY RECORD
// ============================================================================

/// Performance series: fiscal year → reported value (percent).
pub type PerformanceSeries = BTreeMap<i32, f64>;

/// Canonical company record owned by the pipeline during a run.
///
/// Identity: UUID (never changes).
/// Merge key: canonical_name, exact string equality after trimming. Legal-name
/// variants (corporate-suffix notation, spacing, full/half-width) create
/// separate records on purpose; collapsing them is a product decision, not
/// something this pipeline guesses at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyRecord {
    /// Stable identity (UUID) - NEVER changes
    pub id: String,

    /// Canonical trade/registered name - the merge key
    pub canonical_name: String,

    /// Legal corporate identifier (13-digit corporate number, or synthetic)
    pub corporate_number: Option<String>,

    /// How the corporate number was obtained
    pub enrichment: EnrichmentStatus,

    // ------------------------------------------------------------------
    // Location (all optional - phone-based inference may fill some of it)
    // ------------------------------------------------------------------
    pub postal_code: Option<String>,
    pub prefecture: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    pub phone: Option<String>,
    pub website: Option<String>,

    /// Region → fiscal year → reported performance value.
    /// Unioned per region when later extracts reference the same name.
    pub performance: BTreeMap<String, PerformanceSeries>,

    /// Business classification tags
    pub tags: BTreeSet<String>,

    /// Data provenance: which region extract first produced this record
    pub source: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Extensible metadata (registry profile lands here without schema changes)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompanyRecord {
    /// Create a new record for a canonical name first seen in `source`.
    pub fn new(canonical_name: String, source: String) -> Self {
        let now = Utc::now();

        CompanyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            canonical_name,
            corporate_number: None,
            enrichment: EnrichmentStatus::Unresolved,
            postal_code: None,
            prefecture: None,
            city: None,
            street: None,
            latitude: None,
            longitude: None,
            phone: None,
            website: None,
            performance: BTreeMap::new(),
            tags: BTreeSet::new(),
            source,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Union a year-keyed series into one region's slot.
    ///
    /// Existing year entries win; re-running the same extract never changes
    /// the stored map. Returns true if any new entry landed.
    pub fn merge_performance(&mut self, region: &str, series: &PerformanceSeries) -> bool {
        if series.is_empty() {
            return false;
        }

        let slot = self.performance.entry(region.to_string()).or_default();
        let mut changed = false;
        for (year, value) in series {
            // Year already present - keep the first-seen value
            if !slot.contains_key(year) {
                slot.insert(*year, *value);
                changed = true;
            }
        }
        changed
    }

    /// Fill contact/location fields that are still empty. Never overwrites.
    pub fn fill_missing(&mut self, other: &CompanyRecord) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if dst.is_none() {
                *dst = src.clone();
            }
        }
        take(&mut self.postal_code, &other.postal_code);
        take(&mut self.prefecture, &other.prefecture);
        take(&mut self.city, &other.city);
        take(&mut self.street, &other.street);
        take(&mut self.latitude, &other.latitude);
        take(&mut self.longitude, &other.longitude);
        take(&mut self.phone, &other.phone);
        take(&mut self.website, &other.website);
        for tag in &other.tags {
            self.tags.insert(tag.clone());
        }
    }

    /// True once a structured address is present (no phone inference needed).
    pub fn has_structured_address(&self) -> bool {
        self.prefecture.is_some() && (self.city.is_some() || self.street.is_some())
    }

    /// Assign an externally verified corporate number.
    pub fn resolve_corporate_number(&mut self, number: String) {
        self.corporate_number = Some(number);
        self.enrichment = EnrichmentStatus::Resolved;
    }

    /// Assign a synthetic identifier when resolution failed or was skipped.
    pub fn assign_fallback(&mut self, registration_number: Option<&str>) {
        self.corporate_number = Some(fallback_identifier(registration_number));
        self.enrichment = EnrichmentStatus::Fallback;
    }

    /// Bump the updated timestamp after a merge
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

// ============================================================================
// SERVICE AREA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverageLevel {
    Full,
    Partial,
}

impl CoverageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageLevel::Full => "full",
            CoverageLevel::Partial => "partial",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "partial" => CoverageLevel::Partial,
            _ => CoverageLevel::Full,
        }
    }
}

/// One "company operates in region" row. Unique per (company, region);
/// re-adding an existing pair is a no-op at the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceArea {
    pub company_id: String,
    pub region: String,
    pub coverage: CoverageLevel,
    pub remark: Option<String>,
}

impl ServiceArea {
    pub fn full(company_id: &str, region: &str) -> Self {
        ServiceArea {
            company_id: company_id.to_string(),
            region: region.to_string(),
            coverage: CoverageLevel::Full,
            remark: None,
        }
    }

    pub fn partial(company_id: &str, region: &str, remark: &str) -> Self {
        ServiceArea {
            company_id: company_id.to_string(),
            region: region.to_string(),
            coverage: CoverageLevel::Partial,
            remark: Some(remark.to_string()),
        }
    }
}

// ============================================================================
// FALLBACK IDENTIFIER
// ============================================================================

/// Synthetic corporate identifier for the Fallback path.
///
/// Derived from the program registration number when one exists so that
/// repeated runs over the same extract converge on the same identifier.
/// Without one, a process-unique UUID-based stand-in is issued.
pub fn fallback_identifier(registration_number: Option<&str>) -> String {
    match registration_number.map(str::trim) {
        Some(reg) if !reg.is_empty() => {
            let mut hasher = Sha256::new();
            hasher.update(reg.as_bytes());
            let digest = format!("{:x}", hasher.finalize());
            format!("F{}", &digest[..12])
        }
        _ => format!("F-{}", uuid::Uuid::new_v4()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
