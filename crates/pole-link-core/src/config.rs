use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Tunables for one project. A run takes its own copy at start and never re-reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub version: u32,
    pub auto_link_confidence_threshold: f64,
    pub gps_proximity_meters: f64,
    pub location_mismatch_meters: f64,
    pub agent_name_similarity_threshold: f64,
    pub address_similarity_threshold: f64,
    pub max_records_per_run: usize,
    pub enable_auto_linking: bool,
    pub notify_on_conflicts: bool,
    pub conflict_escalation_threshold: f64,
    pub split_assignment_margin: f64,
    pub transient_retry_limit: u32,
    pub run_timeout_ms: Option<u64>,
    pub reconciliation_interval_hours: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            version: 1,
            auto_link_confidence_threshold: 0.9,
            gps_proximity_meters: 100.0,
            location_mismatch_meters: 200.0,
            agent_name_similarity_threshold: 0.8,
            address_similarity_threshold: 0.8,
            max_records_per_run: 1000,
            enable_auto_linking: true,
            notify_on_conflicts: true,
            conflict_escalation_threshold: 0.3,
            split_assignment_margin: 0.05,
            transient_retry_limit: 2,
            run_timeout_ms: None,
            reconciliation_interval_hours: 24,
        }
    }
}

fn require_unit_interval(value: f64, field: &str) -> Result<(), EngineError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Validation(format!("{field} MUST be in [0.0, 1.0]")));
    }
    Ok(())
}

impl ReconciliationConfig {
    /// # Errors
    /// Returns [`EngineError::Validation`] when a threshold leaves [0, 1], a radius is not
    /// positive, the thresholds are inverted, or the run would process nothing.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.version == 0 {
            return Err(EngineError::Validation("version MUST be >= 1".to_string()));
        }
        for (value, field) in [
            (self.auto_link_confidence_threshold, "auto_link_confidence_threshold"),
            (self.agent_name_similarity_threshold, "agent_name_similarity_threshold"),
            (self.address_similarity_threshold, "address_similarity_threshold"),
            (self.conflict_escalation_threshold, "conflict_escalation_threshold"),
            (self.split_assignment_margin, "split_assignment_margin"),
        ] {
            require_unit_interval(value, field)?;
        }

        if !self.gps_proximity_meters.is_finite() || self.gps_proximity_meters <= 0.0 {
            return Err(EngineError::Validation(
                "gps_proximity_meters MUST be a positive number".to_string(),
            ));
        }
        if !self.location_mismatch_meters.is_finite()
            || self.location_mismatch_meters < self.gps_proximity_meters
        {
            return Err(EngineError::Validation(
                "location_mismatch_meters MUST be >= gps_proximity_meters".to_string(),
            ));
        }
        if self.conflict_escalation_threshold > self.auto_link_confidence_threshold {
            return Err(EngineError::Validation(
                "conflict_escalation_threshold MUST NOT exceed auto_link_confidence_threshold"
                    .to_string(),
            ));
        }
        if self.max_records_per_run == 0 {
            return Err(EngineError::Validation("max_records_per_run MUST be >= 1".to_string()));
        }
        if self.reconciliation_interval_hours == 0 {
            return Err(EngineError::Validation(
                "reconciliation_interval_hours MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
