// 🔄 Enrichment Orchestrator - end-to-end batch driver
//
// One region file at a time, in a fixed order, rows in fixed-size batches.
// Merge path for known canonical names, create path (+ best-effort
// enrichment) for new ones. Every per-row failure is classified, counted
// and survived - there is no all-or-nothing transaction anywhere.

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::area_code::{AreaCodeTable, Unresolvable};
use crate::entities::{CompanyRecord, EnrichmentStatus, ServiceArea};
use crate::normalizer::{read_region_rows, CompanyDraft, RecordNormalizer, RowMap};
use crate::registry::RegistryClient;
use crate::repository::CompanyRepository;

// ============================================================================
// FAILURE TAXONOMY
// ============================================================================

/// Classified failures. None of them halt the run.
#[derive(Debug, Error)]
pub enum PipelineFailure {
    /// Registry call failed or returned nothing - the record falls back
    /// to a synthetic identifier and the run continues.
    #[error("external lookup unavailable: {0}")]
    ExternalLookup(String),

    /// Phone present, no table match, not mobile/toll-free. The record
    /// persists without coordinates.
    #[error("unresolved area code: {0}")]
    UnresolvedAreaCode(String),

    /// Write failed for one record; that record is abandoned.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A whole region file failed to parse; the region is abandoned.
    #[error("region file error: {0}")]
    FileLevel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FailureKind {
    ExternalLookup,
    UnresolvedAreaCode,
    Persistence,
    FileLevel,
}

impl PipelineFailure {
    fn kind(&self) -> FailureKind {
        match self {
            PipelineFailure::ExternalLookup(_) => FailureKind::ExternalLookup,
            PipelineFailure::UnresolvedAreaCode(_) => FailureKind::UnresolvedAreaCode,
            PipelineFailure::Persistence(_) => FailureKind::Persistence,
            PipelineFailure::FileLevel(_) => FailureKind::FileLevel,
        }
    }
}

// ============================================================================
// RUN STATISTICS
// ============================================================================

#[derive(Debug, Default, Clone, Serialize)]
pub struct RegionStats {
    pub rows: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub lookup_failures: u64,
    pub unresolved_area_codes: u64,
    pub service_areas_added: u64,
}

/// Monotonic counters for one run, threaded explicitly through the
/// orchestrator - never ambient globals.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    pub files_total: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub rows_total: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub resolved: u64,
    pub fallback_assigned: u64,
    pub lookup_failures: u64,
    pub unresolved_area_codes: u64,
    pub service_areas_added: u64,
    pub per_region: BTreeMap<String, RegionStats>,
}

impl RunStats {
    fn region(&mut self, name: &str) -> &mut RegionStats {
        self.per_region.entry(name.to_string()).or_default()
    }

    /// Human-readable summary enumerating every counter, so an operator
    /// can target reprocessing.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Files: {} total / {} processed / {} failed",
            self.files_total, self.files_processed, self.files_failed
        );
        let _ = writeln!(
            out,
            "Rows: {} (new {} / updated {} / skipped {} / errors {})",
            self.rows_total, self.created, self.updated, self.skipped, self.errors
        );
        let _ = writeln!(
            out,
            "Enrichment: {} resolved / {} fallback / {} lookup failures",
            self.resolved, self.fallback_assigned, self.lookup_failures
        );
        let _ = writeln!(
            out,
            "Area codes unresolved: {} | Service areas added: {}",
            self.unresolved_area_codes, self.service_areas_added
        );
        for (region, stats) in &self.per_region {
            let _ = writeln!(
                out,
                "  {}: rows {} (new {} / updated {} / skipped {} / errors {})",
                region, stats.rows, stats.created, stats.updated, stats.skipped, stats.errors
            );
        }
        out
    }
}

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Rows per progress batch
    pub batch_size: usize,
    /// false = fast mode: skip corporate-number enrichment entirely
    pub enrich: bool,
    /// Statistics-only: lookups run, writes are suppressed
    pub dry_run: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            batch_size: 100,
            enrich: true,
            dry_run: false,
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct EnrichmentOrchestrator<'a> {
    repo: &'a mut dyn CompanyRepository,
    registry: Option<&'a dyn RegistryClient>,
    area_codes: AreaCodeTable,
    normalizer: RecordNormalizer,
    options: PipelineOptions,
    /// Canonical name → company id, populated lazily from the repository
    name_cache: HashMap<String, String>,
    /// Failure kinds already logged in full; later occurrences stay terse
    logged_kinds: HashSet<FailureKind>,
    stats: RunStats,
}

impl<'a> EnrichmentOrchestrator<'a> {
    pub fn new(
        repo: &'a mut dyn CompanyRepository,
        registry: Option<&'a dyn RegistryClient>,
        options: PipelineOptions,
    ) -> Self {
        EnrichmentOrchestrator {
            repo,
            registry,
            area_codes: AreaCodeTable::new(),
            normalizer: RecordNormalizer::new(),
            options,
            name_cache: HashMap::new(),
            logged_kinds: HashSet::new(),
            stats: RunStats::default(),
        }
    }

    /// Process every region file to completion, strictly in the given order.
    pub fn run(mut self, region_files: &[PathBuf]) -> RunStats {
        self.stats.files_total = region_files.len() as u64;

        for path in region_files {
            let region = region_from_path(path);
            info!("Processing region {region}: {}", path.display());

            match self.process_file(path, &region) {
                Ok(()) => self.stats.files_processed += 1,
                Err(failure) => {
                    self.stats.files_failed += 1;
                    self.note(&failure);
                }
            }
        }

        self.stats
    }

    fn process_file(&mut self, path: &Path, region: &str) -> Result<(), PipelineFailure> {
        let rows = read_region_rows(path)
            .map_err(|e| PipelineFailure::FileLevel(format!("{}: {e:#}", path.display())))?;

        let total = rows.len();
        let mut done = 0usize;
        for batch in rows.chunks(self.options.batch_size.max(1)) {
            for row in batch {
                self.process_row(row, region);
            }
            done += batch.len();
            info!("{region}: {done}/{total} rows");
        }

        Ok(())
    }

    fn process_row(&mut self, row: &RowMap, region: &str) {
        self.stats.rows_total += 1;
        self.stats.region(region).rows += 1;

        let draft = match self.normalizer.normalize(row, region) {
            Some(draft) => draft,
            None => {
                // Not an error: counted, never persisted
                self.stats.skipped += 1;
                self.stats.region(region).skipped += 1;
                return;
            }
        };

        let outcome = if self.known_company(&draft.canonical_name) {
            self.merge_existing(&draft, region)
        } else {
            self.create_new(&draft, region)
        };

        if let Err(failure) = outcome {
            self.stats.errors += 1;
            self.stats.region(region).errors += 1;
            self.note(&failure);
        }
    }

    /// Cache-first existence check; the cache fills lazily from the
    /// repository as names are first seen.
    fn known_company(&mut self, name: &str) -> bool {
        if self.name_cache.contains_key(name) {
            return true;
        }
        match self.repo.find_by_name(name) {
            Ok(Some(record)) => {
                self.name_cache.insert(name.to_string(), record.id);
                true
            }
            Ok(None) => false,
            Err(e) => {
                // Treat an unreadable repository like a missing record; the
                // write path will surface the real failure.
                debug!("lookup failed for {name}: {e:#}");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Merge path
    // ------------------------------------------------------------------

    fn merge_existing(&mut self, draft: &CompanyDraft, region: &str) -> Result<(), PipelineFailure> {
        let mut company = match self
            .repo
            .find_by_name(&draft.canonical_name)
            .map_err(|e| PipelineFailure::Persistence(format!("{}: {e:#}", draft.canonical_name)))?
        {
            Some(company) => company,
            None => {
                // Cached from a dry-run create: nothing stored to merge into
                self.stats.updated += 1;
                self.stats.region(region).updated += 1;
                return Ok(());
            }
        };

        company.merge_performance(region, &draft.performance);
        apply_draft_contacts(&mut company, draft);
        company.touch();

        if !self.options.dry_run {
            self.repo.merge_update(&company).map_err(|e| {
                PipelineFailure::Persistence(format!("{}: {e:#}", company.canonical_name))
            })?;
            self.add_service_areas(&company.id, draft, region);
        }

        self.stats.updated += 1;
        self.stats.region(region).updated += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Create path
    // ------------------------------------------------------------------

    fn create_new(&mut self, draft: &CompanyDraft, region: &str) -> Result<(), PipelineFailure> {
        let mut company = CompanyRecord::new(
            draft.canonical_name.clone(),
            draft.source_region.clone(),
        );
        apply_draft_contacts(&mut company, draft);
        company.merge_performance(region, &draft.performance);

        if !draft.has_structured_address() {
            self.geocode_from_phone(&mut company, region);
        }

        self.resolve_identifier(&mut company, draft, region);

        if !self.options.dry_run {
            self.repo.create(&company).map_err(|e| {
                PipelineFailure::Persistence(format!("{}: {e:#}", company.canonical_name))
            })?;
            self.add_service_areas(&company.id, draft, region);
        }

        self.name_cache
            .insert(company.canonical_name.clone(), company.id.clone());
        self.stats.created += 1;
        self.stats.region(region).created += 1;
        match company.enrichment {
            EnrichmentStatus::Resolved => self.stats.resolved += 1,
            EnrichmentStatus::Fallback => self.stats.fallback_assigned += 1,
            EnrichmentStatus::Unresolved => {}
        }
        Ok(())
    }

    /// Phone-based geocoding, only for records without a structured address.
    fn geocode_from_phone(&mut self, company: &mut CompanyRecord, region: &str) {
        let phone = match &company.phone {
            Some(phone) => phone.clone(),
            None => return,
        };

        match self.area_codes.resolve(&phone) {
            Ok(location) => {
                if company.prefecture.is_none() {
                    company.prefecture = Some(location.prefecture);
                }
                if company.city.is_none() {
                    company.city = Some(location.city);
                }
                company.latitude = Some(location.latitude);
                company.longitude = Some(location.longitude);
            }
            Err(Unresolvable::NoTableEntry) => {
                self.stats.unresolved_area_codes += 1;
                self.stats.region(region).unresolved_area_codes += 1;
                self.note(&PipelineFailure::UnresolvedAreaCode(format!(
                    "{} ({phone})",
                    company.canonical_name
                )));
            }
            Err(reason) => {
                // Mobile and toll-free numbers carry no location by design
                debug!(
                    "no geocoding for {} ({phone}): {}",
                    company.canonical_name,
                    reason.as_str()
                );
            }
        }
    }

    /// Corporate-number resolution: best effort, single attempt, no retry.
    fn resolve_identifier(&mut self, company: &mut CompanyRecord, draft: &CompanyDraft, region: &str) {
        // An identifier published in the extract itself is authoritative;
        // only the profile fetch remains to be done for it.
        if let Some(number) = &draft.corporate_number {
            let number = number.clone();
            company.resolve_corporate_number(number.clone());
            if self.options.enrich {
                self.fetch_profile(company, &number, region);
            }
            return;
        }

        let registry = match (self.options.enrich, self.registry) {
            (true, Some(registry)) => registry,
            _ => {
                company.assign_fallback(draft.registration_number.as_deref());
                return;
            }
        };

        match registry.find_candidates(&company.canonical_name, company.prefecture.as_deref()) {
            Ok(candidates) if !candidates.is_empty() => {
                let number = candidates[0].corporate_number.clone();
                company.resolve_corporate_number(number.clone());
                self.fetch_profile(company, &number, region);
            }
            Ok(_) => {
                // Empty result set: same non-fatal outcome as a failed call
                self.count_lookup_failure(region);
                self.note(&PipelineFailure::ExternalLookup(format!(
                    "no candidates for {}",
                    company.canonical_name
                )));
                company.assign_fallback(draft.registration_number.as_deref());
            }
            Err(e) => {
                self.count_lookup_failure(region);
                self.note(&PipelineFailure::ExternalLookup(format!(
                    "{}: {e:#}",
                    company.canonical_name
                )));
                company.assign_fallback(draft.registration_number.as_deref());
            }
        }
    }

    /// Second-service profile fetch. The number stays resolved even when
    /// this fails - the profile is a bonus, not a requirement.
    fn fetch_profile(&mut self, company: &mut CompanyRecord, number: &str, region: &str) {
        let registry = match self.registry {
            Some(registry) => registry,
            None => return,
        };

        match registry.basic_info(number) {
            Ok(Some(info)) => {
                if let Ok(profile) = serde_json::to_value(&info) {
                    company.set_metadata("registry_profile", profile);
                }
            }
            Ok(None) => {
                debug!("no registry profile for {number}");
            }
            Err(e) => {
                self.count_lookup_failure(region);
                self.note(&PipelineFailure::ExternalLookup(format!(
                    "profile {number}: {e:#}"
                )));
            }
        }
    }

    fn count_lookup_failure(&mut self, region: &str) {
        self.stats.lookup_failures += 1;
        self.stats.region(region).lookup_failures += 1;
    }

    fn add_service_areas(&mut self, company_id: &str, draft: &CompanyDraft, region: &str) {
        for entry in draft.regions.values() {
            let area = ServiceArea {
                company_id: company_id.to_string(),
                region: entry.region.clone(),
                coverage: entry.coverage,
                remark: entry.remark.clone(),
            };
            match self.repo.add_service_area(&area) {
                Ok(true) => {
                    self.stats.service_areas_added += 1;
                    self.stats.region(region).service_areas_added += 1;
                }
                Ok(false) => {} // pair already present - additive no-op
                Err(e) => {
                    self.stats.errors += 1;
                    self.stats.region(region).errors += 1;
                    self.note(&PipelineFailure::Persistence(format!(
                        "service area {} / {}: {e:#}",
                        company_id, entry.region
                    )));
                }
            }
        }
    }

    /// First occurrence of each failure kind gets full context; later
    /// occurrences stay terse to keep the log readable.
    fn note(&mut self, failure: &PipelineFailure) {
        if self.logged_kinds.insert(failure.kind()) {
            warn!("{failure}");
        } else {
            debug!("{failure}");
        }
    }
}

/// Copy draft contact fields into still-empty record slots and union tags.
/// Never overwrites a value that is already present.
fn apply_draft_contacts(company: &mut CompanyRecord, draft: &CompanyDraft) {
    fn fill(dst: &mut Option<String>, src: &Option<String>) {
        if dst.is_none() {
            *dst = src.clone();
        }
    }
    fill(&mut company.postal_code, &draft.postal_code);
    fill(&mut company.prefecture, &draft.prefecture);
    fill(&mut company.city, &draft.city);
    fill(&mut company.street, &draft.street);
    fill(&mut company.phone, &draft.phone);
    fill(&mut company.website, &draft.website);
    for tag in &draft.tags {
        company.tags.insert(tag.clone());
    }
}

// ============================================================================
// FILE DISCOVERY
// ============================================================================

/// Region name from a file like `23_愛知県.csv` → 愛知県.
/// Files without the numeric prefix fall back to the whole stem.
pub fn region_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown");
    match stem.split_once('_') {
        Some((_, region)) if !region.is_empty() => region.to_string(),
        _ => stem.to_string(),
    }
}

/// All `*.csv` files in a directory, sorted by file name. The numeric
/// prefecture prefix makes lexicographic order the fixed processing order.
pub fn discover_region_files(dir: &Path) -> Result<Vec<PathBuf>> {
    use anyhow::Context;

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read data directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::CoverageLevel;
    use crate::registry::{CorporateCandidate, RegistryInfo};
    use crate::repository::MemoryCompanyRepository;
    use std::cell::RefCell;
    use std::io::Write;
    use std::path::PathBuf;

    // ------------------------------------------------------------------
    // Stub registry
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct StubRegistry {
        candidates: Vec<CorporateCandidate>,
        fail: bool,
        calls: RefCell<u64>,
    }

    impl StubRegistry {
        fn resolving(number: &str) -> Self {
            StubRegistry {
                candidates: vec![CorporateCandidate {
                    corporate_number: number.to_string(),
                    name: "株式会社テスト".to_string(),
                    address: "愛知県一宮市本町1-1".to_string(),
                }],
                ..Default::default()
            }
        }

        fn failing() -> Self {
            StubRegistry {
                fail: true,
                ..Default::default()
            }
        }
    }

    impl RegistryClient for StubRegistry {
        fn find_candidates(
            &self,
            _name: &str,
            _prefecture: Option<&str>,
        ) -> Result<Vec<CorporateCandidate>> {
            *self.calls.borrow_mut() += 1;
            if self.fail {
                anyhow::bail!("service unavailable");
            }
            Ok(self.candidates.clone())
        }

        fn basic_info(&self, corporate_number: &str) -> Result<Option<RegistryInfo>> {
            *self.calls.borrow_mut() += 1;
            if self.fail {
                anyhow::bail!("service unavailable");
            }
            Ok(Some(RegistryInfo {
                corporate_number: corporate_number.to_string(),
                name: "株式会社テスト".to_string(),
                address: Some("愛知県一宮市本町1-1".to_string()),
                capital: Some(10_000_000),
                employee_count: Some(25),
                established: Some("2005-04-01".to_string()),
                status: None,
            }))
        }
    }

    // ------------------------------------------------------------------
    // Fixture files
    // ------------------------------------------------------------------

    fn write_region_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{content}").unwrap();
        path
    }

    const AICHI_CSV: &str = "\
事業者名,電話番号,対応可能地域,2020年度実績,2021年度実績\n\
株式会社一宮工務店,0586-23-4567,愛知県;岐阜県（一部）,12.5％,－\n\
名古屋リフォーム株式会社,052-231-4567,,8.0,9.5\n\
,03-1111-2222,東京都,1.0,2.0\n";

    const GIFU_CSV: &str = "\
事業者名,電話番号,対応可能地域,2022年度実績\n\
株式会社一宮工務店,0586-23-4567,岐阜県,14.0\n";

    fn run_pipeline(
        repo: &mut MemoryCompanyRepository,
        registry: Option<&dyn RegistryClient>,
        options: PipelineOptions,
        files: &[PathBuf],
    ) -> RunStats {
        EnrichmentOrchestrator::new(repo, registry, options).run(files)
    }

    #[test]
    fn test_create_path_with_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let registry = StubRegistry::resolving("7000012050002");
        let stats = run_pipeline(
            &mut repo,
            Some(&registry),
            PipelineOptions::default(),
            &[file],
        );

        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.skipped, 1); // nameless row never persisted
        assert_eq!(stats.resolved, 2);
        assert_eq!(repo.company_count(), 2);

        let ichinomiya = repo
            .find_by_name("株式会社一宮工務店")
            .unwrap()
            .unwrap();
        assert_eq!(ichinomiya.enrichment, EnrichmentStatus::Resolved);
        assert_eq!(
            ichinomiya.corporate_number.as_deref(),
            Some("7000012050002")
        );
        // Phone-based geocoding: 0586 is 一宮市, 愛知県
        assert_eq!(ichinomiya.prefecture.as_deref(), Some("愛知県"));
        assert_eq!(ichinomiya.city.as_deref(), Some("一宮市"));
        assert!(ichinomiya.latitude.is_some());
        // Performance: ％ parsed, dash omitted
        assert_eq!(ichinomiya.performance["愛知県"][&2020], 12.5);
        assert!(!ichinomiya.performance["愛知県"].contains_key(&2021));
        // Registry profile stored from the second service
        assert!(ichinomiya.metadata.contains_key("registry_profile"));
    }

    #[test]
    fn test_service_areas_with_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let registry = StubRegistry::resolving("7000012050002");
        let stats = run_pipeline(
            &mut repo,
            Some(&registry),
            PipelineOptions::default(),
            &[file],
        );

        // 一宮工務店: 愛知県 + 岐阜県（一部）; 名古屋リフォーム: 愛知県 only
        assert_eq!(stats.service_areas_added, 3);

        let ichinomiya = repo.find_by_name("株式会社一宮工務店").unwrap().unwrap();
        let areas: Vec<_> = repo
            .service_areas()
            .iter()
            .filter(|a| a.company_id == ichinomiya.id)
            .collect();
        assert_eq!(areas.len(), 2);
        let gifu = areas.iter().find(|a| a.region == "岐阜県").unwrap();
        assert_eq!(gifu.coverage, CoverageLevel::Partial);
        assert_eq!(gifu.remark.as_deref(), Some("岐阜県（一部）"));
    }

    #[test]
    fn test_lookup_failure_falls_back_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let registry = StubRegistry::failing();
        let stats = run_pipeline(
            &mut repo,
            Some(&registry),
            PipelineOptions::default(),
            &[file],
        );

        assert_eq!(stats.created, 2);
        assert_eq!(stats.resolved, 0);
        assert_eq!(stats.fallback_assigned, 2);
        assert_eq!(stats.lookup_failures, 2);
        assert_eq!(stats.errors, 0); // lookup failures are not row errors

        let company = repo.find_by_name("株式会社一宮工務店").unwrap().unwrap();
        assert_eq!(company.enrichment, EnrichmentStatus::Fallback);
        assert!(company.corporate_number.as_deref().unwrap().starts_with('F'));
    }

    #[test]
    fn test_fast_mode_skips_registry_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let registry = StubRegistry::resolving("7000012050002");
        let options = PipelineOptions {
            enrich: false,
            ..Default::default()
        };
        let stats = run_pipeline(&mut repo, Some(&registry), options, &[file]);

        assert_eq!(*registry.calls.borrow(), 0);
        assert_eq!(stats.fallback_assigned, 2);
        assert_eq!(stats.resolved, 0);
    }

    #[test]
    fn test_second_file_merges_instead_of_creating() {
        let dir = tempfile::tempdir().unwrap();
        let aichi = write_region_file(dir.path(), "21_愛知県.csv", AICHI_CSV);
        let gifu = write_region_file(dir.path(), "22_岐阜県.csv", GIFU_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let stats = run_pipeline(
            &mut repo,
            None,
            PipelineOptions::default(),
            &[aichi, gifu],
        );

        // The Gifu file references an already-known canonical name:
        // always an update, never a second create.
        assert_eq!(stats.created, 2);
        assert_eq!(stats.updated, 1);
        assert_eq!(repo.company_count(), 2);

        let company = repo.find_by_name("株式会社一宮工務店").unwrap().unwrap();
        assert_eq!(company.performance["愛知県"][&2020], 12.5);
        assert_eq!(company.performance["岐阜県"][&2022], 14.0);

        // 岐阜県 pair already existed from the first file's target regions;
        // no duplicate row, no new addition for it.
        let areas: Vec<_> = repo
            .service_areas()
            .iter()
            .filter(|a| a.company_id == company.id)
            .collect();
        assert_eq!(areas.len(), 2);
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let first = run_pipeline(
            &mut repo,
            None,
            PipelineOptions::default(),
            &[file.clone()],
        );
        assert_eq!(first.created, 2);

        let second = run_pipeline(&mut repo, None, PipelineOptions::default(), &[file]);
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(second.service_areas_added, 0);

        assert_eq!(repo.company_count(), 2);
        assert_eq!(repo.service_areas().len(), 3);
        let company = repo.find_by_name("株式会社一宮工務店").unwrap().unwrap();
        assert_eq!(company.performance["愛知県"].len(), 1); // no duplicated years
    }

    #[test]
    fn test_file_level_error_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);
        let missing = dir.path().join("24_三重県.csv");

        let mut repo = MemoryCompanyRepository::new();
        let stats = run_pipeline(
            &mut repo,
            None,
            PipelineOptions::default(),
            &[missing, good],
        );

        assert_eq!(stats.files_total, 2);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.created, 2); // the good region still ran
    }

    /// Repository that refuses writes - drives the persistence-error path.
    struct BrokenRepository(MemoryCompanyRepository);

    impl CompanyRepository for BrokenRepository {
        fn find_by_name(&mut self, name: &str) -> Result<Option<CompanyRecord>> {
            self.0.find_by_name(name)
        }
        fn create(&mut self, _record: &CompanyRecord) -> Result<()> {
            anyhow::bail!("disk full")
        }
        fn merge_update(&mut self, record: &CompanyRecord) -> Result<()> {
            self.0.merge_update(record)
        }
        fn add_service_area(&mut self, area: &ServiceArea) -> Result<bool> {
            self.0.add_service_area(area)
        }
    }

    #[test]
    fn test_persistence_error_abandons_record_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);

        let mut repo = BrokenRepository(MemoryCompanyRepository::new());
        let stats = EnrichmentOrchestrator::new(&mut repo, None, PipelineOptions::default())
            .run(&[file]);

        // Both creates fail, the run still reaches the end of the file
        assert_eq!(stats.rows_total, 3);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.created, 0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.files_processed, 1);
        assert_eq!(repo.0.company_count(), 0);
    }

    #[test]
    fn test_dry_run_counts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let options = PipelineOptions {
            dry_run: true,
            ..Default::default()
        };
        let stats = run_pipeline(&mut repo, None, options, &[file]);

        assert_eq!(stats.created, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(repo.company_count(), 0);
        assert!(repo.service_areas().is_empty());
    }

    #[test]
    fn test_per_region_breakdown() {
        let dir = tempfile::tempdir().unwrap();
        let aichi = write_region_file(dir.path(), "21_愛知県.csv", AICHI_CSV);
        let gifu = write_region_file(dir.path(), "22_岐阜県.csv", GIFU_CSV);

        let mut repo = MemoryCompanyRepository::new();
        let stats = run_pipeline(
            &mut repo,
            None,
            PipelineOptions::default(),
            &[aichi, gifu],
        );

        assert_eq!(stats.per_region["愛知県"].rows, 3);
        assert_eq!(stats.per_region["愛知県"].created, 2);
        assert_eq!(stats.per_region["愛知県"].skipped, 1);
        assert_eq!(stats.per_region["岐阜県"].rows, 1);
        assert_eq!(stats.per_region["岐阜県"].updated, 1);

        let summary = stats.summary();
        assert!(summary.contains("愛知県"));
        assert!(summary.contains("岐阜県"));
    }

    #[test]
    fn test_region_from_path() {
        assert_eq!(region_from_path(Path::new("23_愛知県.csv")), "愛知県");
        assert_eq!(region_from_path(Path::new("/data/01_北海道.csv")), "北海道");
        assert_eq!(region_from_path(Path::new("tokyo.csv")), "tokyo");
    }

    #[test]
    fn test_discover_region_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_region_file(dir.path(), "23_愛知県.csv", AICHI_CSV);
        write_region_file(dir.path(), "01_北海道.csv", "事業者名\n");
        write_region_file(dir.path(), "notes.txt", "ignored");

        let files = discover_region_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("01_北海道.csv"));
        assert!(files[1].ends_with("23_愛知県.csv"));
    }
}
