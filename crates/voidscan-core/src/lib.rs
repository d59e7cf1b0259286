//! Core domain model for voidscan: ecosystem snapshots, candidate gaps and
//! the persisted opportunity record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "voidscan-core";

/// Read-only per-category view assembled fresh at the start of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySnapshot {
    pub name: String,
    pub slug: String,
    pub strategic: bool,
    pub strategic_multiplier: f64,
    pub projects: Vec<ProjectSnapshot>,
    pub total_projects: usize,
    pub active_projects: usize,
    pub total_value_locked: f64,
    pub avg_activity_score: f64,
    /// Projects with a commit inside the trailing 30 days.
    pub recently_active: usize,
    /// Projects with nonzero live trading volume.
    pub trading_projects: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub name: String,
    pub description: String,
    pub value_locked: f64,
    pub stars: i64,
    pub forks: i64,
    pub last_commit: Option<DateTime<Utc>>,
    pub active: bool,
    /// Joined from live market data by fuzzy name match; zero when unmatched.
    pub volume_24h: f64,
    pub liquidity_usd: f64,
}

/// Live token listing from the market-data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketToken {
    pub symbol: String,
    pub name: String,
    pub volume_24h: f64,
    pub liquidity_usd: f64,
}

/// Ecosystem-wide statistics derived alongside the snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChainStats {
    pub total_categories: usize,
    pub total_projects: usize,
    pub total_value_locked: f64,
    pub avg_value_locked_per_category: f64,
    pub avg_active_projects_per_category: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitionLevel {
    Low,
    Medium,
    High,
}

/// Model-proposed unmet need. Lives only inside a single run; never persisted
/// directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateGap {
    pub category_slug: String,
    pub title: String,
    pub description: String,
    pub reasoning: String,
    pub difficulty: Difficulty,
    pub competition_level: CompetitionLevel,
    pub suggested_features: Vec<String>,
    pub evidence_projects: Vec<String>,
    /// Model self-confidence, 1-10.
    pub void_confidence: u8,
}

/// Candidate annotated by the skeptic pass. Matched back by exact title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedGap {
    pub candidate: CandidateGap,
    pub skeptic_score: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Filling,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Filling => "filling",
        }
    }
}

/// Persisted opportunity row. `stable_id` is the idempotency key: identical
/// candidates across runs always land on the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub stable_id: String,
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    pub gap_score: i32,
    pub demand_score: i32,
    pub competition_level: CompetitionLevel,
    pub reasoning: String,
    pub suggested_features: Vec<String>,
    pub difficulty: Difficulty,
    pub evidence_projects: Vec<String>,
    pub void_confidence: u8,
    pub status: RecordStatus,
    pub updated_at: DateTime<Utc>,
}

/// User-visible outcome of a detection run. A populated `error` implies zero
/// records were touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub created: usize,
    pub updated: usize,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn failed(run_id: Uuid, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            created: 0,
            updated: 0,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_gap_uses_wire_field_names() {
        let json = serde_json::json!({
            "categorySlug": "defi-lending",
            "title": "Undercollateralized lending desk",
            "description": "d",
            "reasoning": "r",
            "difficulty": "advanced",
            "competitionLevel": "low",
            "suggestedFeatures": ["credit scoring"],
            "evidenceProjects": ["LendCo"],
            "voidConfidence": 7
        });
        let gap: CandidateGap = serde_json::from_value(json).unwrap();
        assert_eq!(gap.category_slug, "defi-lending");
        assert_eq!(gap.difficulty, Difficulty::Advanced);
        assert_eq!(gap.competition_level, CompetitionLevel::Low);
        assert_eq!(gap.void_confidence, 7);
    }

    #[test]
    fn record_status_round_trips_as_lowercase() {
        assert_eq!(RecordStatus::Active.as_str(), "active");
        let s: RecordStatus = serde_json::from_str("\"filling\"").unwrap();
        assert_eq!(s, RecordStatus::Filling);
    }

    #[test]
    fn failed_summary_reports_zero_touched_records() {
        let summary = RunSummary::failed(Uuid::new_v4(), Utc::now(), "synthesis aborted");
        assert_eq!(summary.created, 0);
        assert_eq!(summary.updated, 0);
        assert!(summary.error.is_some());
    }
}
