//! The experiment aggregate and its state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::results::ExperimentResults;

/// Experiment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Pending,
    Initializing,
    Running,
    Paused,
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl ExperimentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an edge of the transition graph.
    ///
    /// Cancellation is reachable from every non-terminal state; everything
    /// else follows the explicit edges.
    pub fn can_transition_to(self, next: Self) -> bool {
        if next == Self::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Initializing)
                | (Self::Initializing, Self::Running)
                | (Self::Initializing, Self::Failed)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Analyzing)
                | (Self::Paused, Self::Running)
                | (Self::Analyzing, Self::Completed)
                | (Self::Analyzing, Self::Running)
        )
    }
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExperimentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "analyzing" => Ok(Self::Analyzing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown experiment state '{s}'")),
        }
    }
}

/// Percentage of traffic each variant receives. Must sum to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub baseline_pct: u8,
    pub candidate_pct: u8,
}

impl Default for TrafficSplit {
    fn default() -> Self {
        Self {
            baseline_pct: 50,
            candidate_pct: 50,
        }
    }
}

/// Thresholds the verdict synthesizer applies to per-metric test results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// A significant metric counts as an improvement above this (+%).
    pub min_improvement_pct: f64,
    /// A significant metric counts as a regression below minus this (%).
    pub max_regression_pct: f64,
    /// Significance level for per-metric tests.
    pub alpha: f64,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            min_improvement_pct: 5.0,
            max_regression_pct: 5.0,
            alpha: 0.05,
        }
    }
}

/// Synthetic load applied to target hosts while the experiment runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProfile {
    pub profile: String,
    pub duration_seconds: u64,
    pub process_count: u32,
}

/// Experiment configuration, persisted as the `config` JSONB column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Collection window length in seconds.
    pub duration_secs: u64,
    /// Interval between collect tasks in seconds.
    #[serde(default = "default_collect_interval")]
    pub collect_interval_secs: u64,
    #[serde(default)]
    pub traffic_split: TrafficSplit,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_profile: Option<LoadProfile>,
    /// Metric names compared between the variants.
    pub metrics: Vec<String>,
    #[serde(default)]
    pub template_variables: HashMap<String, String>,
}

fn default_collect_interval() -> u64 {
    10
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Client-supplied experiment definition.
#[derive(Debug, Clone, Deserialize)]
pub struct NewExperiment {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub baseline_pipeline: String,
    pub candidate_pipeline: String,
    pub target_hosts: Vec<String>,
    pub config: ExperimentConfig,
}

impl NewExperiment {
    /// Field-level validation of the creation payload.
    pub fn validate(&self, max_duration_secs: u64) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "must not be empty"));
        }
        if self.baseline_pipeline.trim().is_empty() {
            errors.push(ValidationError::new("baseline_pipeline", "must not be empty"));
        }
        if self.baseline_pipeline == self.candidate_pipeline {
            errors.push(ValidationError::new(
                "candidate_pipeline",
                "must differ from baseline_pipeline",
            ));
        }
        if self.target_hosts.is_empty() {
            errors.push(ValidationError::new("target_hosts", "must not be empty"));
        }
        let split = &self.config.traffic_split;
        if u32::from(split.baseline_pct) + u32::from(split.candidate_pct) != 100 {
            errors.push(ValidationError::new(
                "config.traffic_split",
                "baseline and candidate percentages must sum to 100",
            ));
        }
        if self.config.duration_secs == 0 {
            errors.push(ValidationError::new("config.duration_secs", "must be positive"));
        }
        if self.config.duration_secs > max_duration_secs {
            errors.push(ValidationError::new(
                "config.duration_secs",
                format!("exceeds the maximum of {max_duration_secs} seconds"),
            ));
        }
        if self.config.metrics.is_empty() {
            errors.push(ValidationError::new("config.metrics", "must not be empty"));
        }
        let alpha = self.config.success_criteria.alpha;
        if !(0.0..1.0).contains(&alpha) || alpha == 0.0 {
            errors.push(ValidationError::new(
                "config.success_criteria.alpha",
                "must be in (0, 1)",
            ));
        }
        errors
    }
}

/// An experiment row.
#[derive(Debug, Clone, Serialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub baseline_pipeline: String,
    pub candidate_pipeline: String,
    pub target_hosts: Vec<String>,
    pub config: ExperimentConfig,
    pub state: ExperimentState,
    pub state_message: Option<String>,
    pub results: Option<ExperimentResults>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub promoted_at: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Materialize a validated creation payload as a `Pending` row.
    pub fn from_new(spec: NewExperiment) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            description: spec.description,
            baseline_pipeline: spec.baseline_pipeline,
            candidate_pipeline: spec.candidate_pipeline,
            target_hosts: spec.target_hosts,
            config: spec.config,
            state: ExperimentState::Pending,
            state_message: None,
            results: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            promoted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> NewExperiment {
        NewExperiment {
            name: "topk-rollout".to_string(),
            description: String::new(),
            baseline_pipeline: "process-baseline-v1".to_string(),
            candidate_pipeline: "process-topk-v1".to_string(),
            target_hosts: vec!["h1".to_string(), "h2".to_string()],
            config: ExperimentConfig {
                duration_secs: 60,
                collect_interval_secs: 10,
                traffic_split: TrafficSplit::default(),
                success_criteria: SuccessCriteria::default(),
                load_profile: None,
                metrics: vec!["cardinality".to_string()],
                template_variables: HashMap::new(),
            },
        }
    }

    #[test]
    fn transition_graph_edges() {
        use ExperimentState::*;
        assert!(Pending.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Failed));
        assert!(Running.can_transition_to(Paused));
        assert!(Running.can_transition_to(Analyzing));
        assert!(Paused.can_transition_to(Running));
        assert!(Analyzing.can_transition_to(Completed));
        assert!(Analyzing.can_transition_to(Running));

        // Cancellation from any non-terminal state.
        for state in [Pending, Initializing, Running, Paused, Analyzing] {
            assert!(state.can_transition_to(Cancelled), "{state} -> cancelled");
        }
    }

    #[test]
    fn no_transitions_out_of_terminal_states() {
        use ExperimentState::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [
                Pending,
                Initializing,
                Running,
                Paused,
                Analyzing,
                Completed,
                Failed,
                Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not reach {next}"
                );
            }
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        use ExperimentState::*;
        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Analyzing));
        assert!(!Running.can_transition_to(Failed));
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert!(valid_spec().validate(604_800).is_empty());
    }

    #[test]
    fn validation_reports_each_bad_field() {
        let mut spec = valid_spec();
        spec.candidate_pipeline = spec.baseline_pipeline.clone();
        spec.target_hosts.clear();
        spec.config.traffic_split = TrafficSplit {
            baseline_pct: 70,
            candidate_pct: 40,
        };

        let errors = spec.validate(604_800);
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"candidate_pipeline"), "{fields:?}");
        assert!(fields.contains(&"target_hosts"), "{fields:?}");
        assert!(fields.contains(&"config.traffic_split"), "{fields:?}");
    }

    #[test]
    fn duration_bounded_by_engine_maximum() {
        let mut spec = valid_spec();
        spec.config.duration_secs = 900_000;
        let errors = spec.validate(604_800);
        assert!(errors.iter().any(|e| e.field == "config.duration_secs"));
    }

    #[test]
    fn state_string_round_trip() {
        for state in [
            ExperimentState::Pending,
            ExperimentState::Initializing,
            ExperimentState::Running,
            ExperimentState::Paused,
            ExperimentState::Analyzing,
            ExperimentState::Completed,
            ExperimentState::Failed,
            ExperimentState::Cancelled,
        ] {
            let parsed: ExperimentState = state.to_string().parse().expect("should parse");
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn config_defaults_apply_on_deserialize() {
        let json = serde_json::json!({
            "duration_secs": 120,
            "metrics": ["latency_p95"],
        });
        let config: ExperimentConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.collect_interval_secs, 10);
        assert_eq!(config.traffic_split.baseline_pct, 50);
        assert_eq!(config.success_criteria.alpha, 0.05);
    }
}
