// Entity Models
//
// The directory has a single entity kind: the certified company.
// - Stable identity (UUID) that NEVER changes
// - Canonical name as the merge key across region extracts
// - Additive service areas, unioned performance series

pub mod company;

pub use company::{
    fallback_identifier, CompanyRecord, CoverageLevel, EnrichmentStatus, PerformanceSeries,
    ServiceArea,
};
