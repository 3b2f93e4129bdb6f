// 💾 Company Repository - persistence collaborator
//
// The pipeline owns CompanyRecord values during a run; storage is behind
// this trait. Idempotent re-processing hangs on two guarantees here:
// upsert-by-canonical-name and additive service areas (UNIQUE pair,
// INSERT OR IGNORE).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::entities::{CompanyRecord, CoverageLevel, EnrichmentStatus, ServiceArea};

// ============================================================================
// TRAIT
// ============================================================================

pub trait CompanyRepository {
    /// Find the record whose canonical name matches exactly.
    fn find_by_name(&mut self, canonical_name: &str) -> Result<Option<CompanyRecord>>;

    /// Persist a record seen for the first time.
    fn create(&mut self, record: &CompanyRecord) -> Result<()>;

    /// Persist the merged state of an existing record.
    fn merge_update(&mut self, record: &CompanyRecord) -> Result<()>;

    /// Add a (company, region) service area if absent.
    /// Returns true when the pair was new; re-adding is a no-op.
    fn add_service_area(&mut self, area: &ServiceArea) -> Result<bool>;
}

// ============================================================================
// SQLITE ADAPTER
// ============================================================================

pub struct SqliteCompanyRepository {
    conn: Connection,
}

impl SqliteCompanyRepository {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let repo = SqliteCompanyRepository { conn };
        repo.setup_schema()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let repo = SqliteCompanyRepository { conn };
        repo.setup_schema()?;
        Ok(repo)
    }

    fn setup_schema(&self) -> Result<()> {
        // WAL mode for crash recovery
        self.conn.pragma_update(None, "journal_mode", "WAL")?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS companies (
                id TEXT PRIMARY KEY,
                canonical_name TEXT UNIQUE NOT NULL,
                corporate_number TEXT,
                enrichment TEXT NOT NULL,
                postal_code TEXT,
                prefecture TEXT,
                city TEXT,
                street TEXT,
                latitude REAL,
                longitude REAL,
                phone TEXT,
                website TEXT,
                performance TEXT NOT NULL,
                tags TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS service_areas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id TEXT NOT NULL,
                region TEXT NOT NULL,
                coverage TEXT NOT NULL,
                remark TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(company_id, region)
            )",
            [],
        )?;

        Ok(())
    }

    /// All service areas for one company (test and reporting helper).
    pub fn service_areas_for(&self, company_id: &str) -> Result<Vec<ServiceArea>> {
        let mut stmt = self.conn.prepare(
            "SELECT company_id, region, coverage, remark
             FROM service_areas WHERE company_id = ?1 ORDER BY region",
        )?;
        let rows = stmt.query_map(params![company_id], |row| {
            Ok(ServiceArea {
                company_id: row.get(0)?,
                region: row.get(1)?,
                coverage: CoverageLevel::from_str(&row.get::<_, String>(2)?),
                remark: row.get(3)?,
            })
        })?;

        let mut areas = Vec::new();
        for area in rows {
            areas.push(area?);
        }
        Ok(areas)
    }

    pub fn company_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl CompanyRepository for SqliteCompanyRepository {
    fn find_by_name(&mut self, canonical_name: &str) -> Result<Option<CompanyRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, canonical_name, corporate_number, enrichment,
                        postal_code, prefecture, city, street, latitude, longitude,
                        phone, website, performance, tags, source,
                        created_at, updated_at, metadata
                 FROM companies WHERE canonical_name = ?1",
                params![canonical_name],
                RawCompanyRow::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to query company: {canonical_name}"))?;

        raw.map(RawCompanyRow::into_record).transpose()
    }

    fn create(&mut self, record: &CompanyRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO companies (
                    id, canonical_name, corporate_number, enrichment,
                    postal_code, prefecture, city, street, latitude, longitude,
                    phone, website, performance, tags, source,
                    created_at, updated_at, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    record.id,
                    record.canonical_name,
                    record.corporate_number,
                    record.enrichment.as_str(),
                    record.postal_code,
                    record.prefecture,
                    record.city,
                    record.street,
                    record.latitude,
                    record.longitude,
                    record.phone,
                    record.website,
                    serde_json::to_string(&record.performance)?,
                    serde_json::to_string(&record.tags)?,
                    record.source,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    serde_json::to_string(&record.metadata)?,
                ],
            )
            .with_context(|| format!("Failed to insert company: {}", record.canonical_name))?;
        Ok(())
    }

    fn merge_update(&mut self, record: &CompanyRecord) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE companies SET
                    corporate_number = ?2, enrichment = ?3,
                    postal_code = ?4, prefecture = ?5, city = ?6, street = ?7,
                    latitude = ?8, longitude = ?9, phone = ?10, website = ?11,
                    performance = ?12, tags = ?13, updated_at = ?14, metadata = ?15
                 WHERE id = ?1",
                params![
                    record.id,
                    record.corporate_number,
                    record.enrichment.as_str(),
                    record.postal_code,
                    record.prefecture,
                    record.city,
                    record.street,
                    record.latitude,
                    record.longitude,
                    record.phone,
                    record.website,
                    serde_json::to_string(&record.performance)?,
                    serde_json::to_string(&record.tags)?,
                    record.updated_at.to_rfc3339(),
                    serde_json::to_string(&record.metadata)?,
                ],
            )
            .with_context(|| format!("Failed to update company: {}", record.canonical_name))?;

        anyhow::ensure!(updated == 1, "No company row for id {}", record.id);
        Ok(())
    }

    fn add_service_area(&mut self, area: &ServiceArea) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO service_areas (company_id, region, coverage, remark)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    area.company_id,
                    area.region,
                    area.coverage.as_str(),
                    area.remark,
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to insert service area: {} / {}",
                    area.company_id, area.region
                )
            })?;
        Ok(inserted > 0)
    }
}

/// Plain-typed row image, converted to CompanyRecord outside the
/// rusqlite closure so JSON errors go through anyhow.
struct RawCompanyRow {
    id: String,
    canonical_name: String,
    corporate_number: Option<String>,
    enrichment: String,
    postal_code: Option<String>,
    prefecture: Option<String>,
    city: Option<String>,
    street: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    phone: Option<String>,
    website: Option<String>,
    performance: String,
    tags: String,
    source: String,
    created_at: String,
    updated_at: String,
    metadata: Option<String>,
}

impl RawCompanyRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawCompanyRow {
            id: row.get(0)?,
            canonical_name: row.get(1)?,
            corporate_number: row.get(2)?,
            enrichment: row.get(3)?,
            postal_code: row.get(4)?,
            prefecture: row.get(5)?,
            city: row.get(6)?,
            street: row.get(7)?,
            latitude: row.get(8)?,
            longitude: row.get(9)?,
            phone: row.get(10)?,
            website: row.get(11)?,
            performance: row.get(12)?,
            tags: row.get(13)?,
            source: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            metadata: row.get(17)?,
        })
    }

    fn into_record(self) -> Result<CompanyRecord> {
        Ok(CompanyRecord {
            id: self.id,
            canonical_name: self.canonical_name,
            corporate_number: self.corporate_number,
            enrichment: EnrichmentStatus::from_str(&self.enrichment),
            postal_code: self.postal_code,
            prefecture: self.prefecture,
            city: self.city,
            street: self.street,
            latitude: self.latitude,
            longitude: self.longitude,
            phone: self.phone,
            website: self.website,
            performance: serde_json::from_str(&self.performance)
                .context("Corrupt performance column")?,
            tags: serde_json::from_str(&self.tags).context("Corrupt tags column")?,
            source: self.source,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            metadata: match self.metadata {
                Some(raw) => serde_json::from_str(&raw).context("Corrupt metadata column")?,
                None => HashMap::new(),
            },
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad timestamp: {raw}"))?
        .with_timezone(&Utc))
}

// ============================================================================
// IN-MEMORY ADAPTER
// ============================================================================

/// HashMap-backed adapter for tests and statistics-only experiments.
#[derive(Default)]
pub struct MemoryCompanyRepository {
    companies: HashMap<String, CompanyRecord>,
    service_areas: Vec<ServiceArea>,
}

impl MemoryCompanyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn companies(&self) -> impl Iterator<Item = &CompanyRecord> {
        self.companies.values()
    }

    pub fn service_areas(&self) -> &[ServiceArea] {
        &self.service_areas
    }

    pub fn company_count(&self) -> usize {
        self.companies.len()
    }
}

impl CompanyRepository for MemoryCompanyRepository {
    fn find_by_name(&mut self, canonical_name: &str) -> Result<Option<CompanyRecord>> {
        Ok(self.companies.get(canonical_name).cloned())
    }

    fn create(&mut self, record: &CompanyRecord) -> Result<()> {
        anyhow::ensure!(
            !self.companies.contains_key(&record.canonical_name),
            "Duplicate canonical name: {}",
            record.canonical_name
        );
        self.companies
            .insert(record.canonical_name.clone(), record.clone());
        Ok(())
    }

    fn merge_update(&mut self, record: &CompanyRecord) -> Result<()> {
        anyhow::ensure!(
            self.companies.contains_key(&record.canonical_name),
            "No company to update: {}",
            record.canonical_name
        );
        self.companies
            .insert(record.canonical_name.clone(), record.clone());
        Ok(())
    }

    fn add_service_area(&mut self, area: &ServiceArea) -> Result<bool> {
        let exists = self
            .service_areas
            .iter()
            .any(|a| a.company_id == area.company_id && a.region == area.region);
        if exists {
            return Ok(false);
        }
        self.service_areas.push(area.clone());
        Ok(true)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PerformanceSeries;

    fn sample_record(name: &str) -> CompanyRecord {
        let mut record = CompanyRecord::new(name.to_string(), "23_aichi.csv".to_string());
        record.prefecture = Some("愛知県".to_string());
        record.phone = Some("0586-23-4567".to_string());
        let mut series = PerformanceSeries::new();
        series.insert(2020, 12.5);
        record.merge_performance("愛知県", &series);
        record
    }

    #[test]
    fn test_sqlite_create_and_find() {
        let mut repo = SqliteCompanyRepository::open_in_memory().unwrap();
        let record = sample_record("株式会社一宮工務店");

        repo.create(&record).unwrap();

        let found = repo.find_by_name("株式会社一宮工務店").unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.prefecture.as_deref(), Some("愛知県"));
        assert_eq!(found.performance["愛知県"][&2020], 12.5);

        assert!(repo.find_by_name("存在しない会社").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directory.db");

        {
            let mut repo = SqliteCompanyRepository::open(&path).unwrap();
            repo.create(&sample_record("株式会社テスト")).unwrap();
        }

        let mut reopened = SqliteCompanyRepository::open(&path).unwrap();
        assert_eq!(reopened.company_count().unwrap(), 1);
        assert!(reopened.find_by_name("株式会社テスト").unwrap().is_some());
    }

    #[test]
    fn test_sqlite_merge_update() {
        let mut repo = SqliteCompanyRepository::open_in_memory().unwrap();
        let mut record = sample_record("株式会社テスト");
        repo.create(&record).unwrap();

        let mut series = PerformanceSeries::new();
        series.insert(2021, 8.0);
        record.merge_performance("岐阜県", &series);
        record.resolve_corporate_number("1234567890123".to_string());
        repo.merge_update(&record).unwrap();

        let found = repo.find_by_name("株式会社テスト").unwrap().unwrap();
        assert_eq!(found.enrichment, EnrichmentStatus::Resolved);
        assert_eq!(found.performance.len(), 2);
        assert_eq!(repo.company_count().unwrap(), 1);
    }

    #[test]
    fn test_sqlite_merge_update_requires_existing_row() {
        let mut repo = SqliteCompanyRepository::open_in_memory().unwrap();
        let record = sample_record("株式会社テスト");
        assert!(repo.merge_update(&record).is_err());
    }

    #[test]
    fn test_sqlite_service_area_is_additive() {
        let mut repo = SqliteCompanyRepository::open_in_memory().unwrap();
        let record = sample_record("株式会社テスト");
        repo.create(&record).unwrap();

        let area = ServiceArea::full(&record.id, "愛知県");
        assert!(repo.add_service_area(&area).unwrap());
        // Re-adding the same (company, region) pair is a no-op
        assert!(!repo.add_service_area(&area).unwrap());

        let partial = ServiceArea::partial(&record.id, "岐阜県", "岐阜県（一部）");
        assert!(repo.add_service_area(&partial).unwrap());

        let areas = repo.service_areas_for(&record.id).unwrap();
        assert_eq!(areas.len(), 2);
        let gifu = areas.iter().find(|a| a.region == "岐阜県").unwrap();
        assert_eq!(gifu.coverage, CoverageLevel::Partial);
        assert_eq!(gifu.remark.as_deref(), Some("岐阜県（一部）"));
    }

    #[test]
    fn test_memory_repository_mirrors_contract() {
        let mut repo = MemoryCompanyRepository::new();
        let record = sample_record("株式会社テスト");

        repo.create(&record).unwrap();
        assert!(repo.create(&record).is_err()); // duplicate name

        let area = ServiceArea::full(&record.id, "愛知県");
        assert!(repo.add_service_area(&area).unwrap());
        assert!(!repo.add_service_area(&area).unwrap());

        let found = repo.find_by_name("株式会社テスト").unwrap().unwrap();
        assert_eq!(found.id, record.id);
    }
}
