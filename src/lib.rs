// Certified-Company Directory - Core Library
// Exposes all modules for use in the CLI and tests

pub mod area_code;
pub mod entities;
pub mod normalizer;
pub mod orchestrator;
pub mod registry;
pub mod repository;

// Re-export commonly used types
pub use area_code::{AreaCodeTable, AreaLocation, Unresolvable};
pub use entities::{
    fallback_identifier, CompanyRecord, CoverageLevel, EnrichmentStatus, PerformanceSeries,
    ServiceArea,
};
pub use normalizer::{
    parse_performance_value, read_region_rows, CompanyDraft, RecordNormalizer, RowMap,
};
pub use orchestrator::{
    discover_region_files, region_from_path, EnrichmentOrchestrator, PipelineFailure,
    PipelineOptions, RegionStats, RunStats,
};
pub use registry::{
    CorporateCandidate, HttpRegistryClient, RegistryClient, RegistryConfig, RegistryInfo,
};
pub use repository::{CompanyRepository, MemoryCompanyRepository, SqliteCompanyRepository};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
