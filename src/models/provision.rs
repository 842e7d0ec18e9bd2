use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "provision_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    Pending,
    Provisioned,
    Failed,
}

impl ProvisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStatus::Pending => "pending",
            ProvisionStatus::Provisioned => "provisioned",
            ProvisionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects which tenant migration set applies on top of the common scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "academic_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AcademicLevel {
    Preschool,
    Primary,
    Secondary,
    HigherSecondary,
}

impl AcademicLevel {
    /// Directory holding the level-specific scripts.
    pub fn dir_name(&self) -> &'static str {
        match self {
            AcademicLevel::Preschool => "preschool",
            AcademicLevel::Primary => "primary",
            AcademicLevel::Secondary => "secondary",
            AcademicLevel::HigherSecondary => "higher_secondary",
        }
    }
}

impl fmt::Display for AcademicLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One row of `tenancy.provisions`: the lifecycle of one tenant schema.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProvisionRecord {
    pub id: Uuid,
    pub schema_name: String,
    pub status: ProvisionStatus,
    pub academic_level: AcademicLevel,
    pub assigned_owner_id: Option<Uuid>,
    pub assigned_by: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub accessible: bool,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisionRecord {
    pub fn is_assigned(&self) -> bool {
        self.assigned_owner_id.is_some()
    }

    pub fn is_provisioned(&self) -> bool {
        self.status == ProvisionStatus::Provisioned
    }
}

/// Values for a freshly inserted PENDING record.
#[derive(Debug, Clone)]
pub struct NewProvision {
    pub schema_name: String,
    pub academic_level: AcademicLevel,
    pub requested_by: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionFilter {
    pub status: Option<ProvisionStatus>,
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvisionStats {
    pub total: i64,
    pub provisioned: i64,
    pub pending: i64,
    pub failed: i64,
    /// Percentage of records that reached PROVISIONED.
    pub success_rate: f64,
}

impl ProvisionStats {
    pub fn from_counts(provisioned: i64, pending: i64, failed: i64) -> Self {
        let total = provisioned + pending + failed;
        let success_rate = if total == 0 {
            0.0
        } else {
            (provisioned as f64 / total as f64) * 100.0
        };
        Self {
            total,
            provisioned,
            pending,
            failed,
            success_rate,
        }
    }
}

// ─── Admin API payloads ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateProvisionRequest {
    pub schema_prefix: String,
    pub academic_level: AcademicLevel,
    pub assigned_by: String,
}

#[derive(Debug, Serialize)]
pub struct CreateProvisionResponse {
    pub provision_id: Uuid,
    pub schema_name: String,
    pub status: ProvisionStatus,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignProvisionRequest {
    pub owner_id: Uuid,
    pub assigned_by: String,
}

/// Outcome of a bulk sweep; item failures are counted, not fatal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    pub target: String,
    pub error: String,
}

impl SweepReport {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, target: impl Into<String>, error: impl fmt::Display) {
        self.attempted += 1;
        self.failed += 1;
        self.failures.push(SweepFailure {
            target: target.into(),
            error: error.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub schema_name: String,
    pub schema_exists: bool,
    pub record_exists: bool,
    pub consistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    None,
    RecreatedSchema,
    DroppedOrphanSchema,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_success_rate() {
        let stats = ProvisionStats::from_counts(3, 0, 1);
        assert_eq!(stats.total, 4);
        assert!((stats.success_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(ProvisionStats::from_counts(0, 0, 0).success_rate, 0.0);
    }

    #[test]
    fn academic_level_wire_format() {
        let level: AcademicLevel = serde_json::from_str("\"higher_secondary\"").unwrap();
        assert_eq!(level, AcademicLevel::HigherSecondary);
        assert_eq!(level.dir_name(), "higher_secondary");
    }

    #[test]
    fn sweep_report_counts() {
        let mut report = SweepReport::default();
        report.record_success();
        report.record_failure("school_x", "boom");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].target, "school_x");
    }
}
