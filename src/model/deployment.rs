//! Pipeline deployment records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ResourceLimits, Variant};

/// Deployment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Degraded,
    Terminating,
    /// Soft-deleted; the row keeps its identity but no longer counts toward
    /// the (name, namespace) uniqueness constraint.
    Deleting,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Terminating => "terminating",
            Self::Deleting => "deleting",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "degraded" => Ok(Self::Degraded),
            "terminating" => Ok(Self::Terminating),
            "deleting" => Ok(Self::Deleting),
            _ => Err(format!("unknown deployment status '{s}'")),
        }
    }
}

/// A deployed pipeline configuration on a set of hosts.
///
/// Created either by the experiment engine (two per experiment, tagged with
/// the variant) or directly through the deployment API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDeployment {
    pub id: Uuid,
    pub deployment_name: String,
    pub namespace: String,
    pub pipeline: String,
    pub experiment_id: Option<Uuid>,
    pub variant: Option<Variant>,
    pub node_selector: HashMap<String, String>,
    pub parameters: serde_json::Value,
    pub resource_limits: Option<ResourceLimits>,
    pub status: DeploymentStatus,
    pub phase: String,
    pub instances: i32,
    pub metrics_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PipelineDeployment {
    /// A fresh `Pending` deployment row.
    pub fn new(deployment_name: impl Into<String>, namespace: impl Into<String>, pipeline: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            deployment_name: deployment_name.into(),
            namespace: namespace.into(),
            pipeline: pipeline.into(),
            experiment_id: None,
            variant: None,
            node_selector: HashMap::new(),
            parameters: serde_json::Value::Object(Default::default()),
            resource_limits: None,
            status: DeploymentStatus::Pending,
            phase: String::new(),
            instances: 0,
            metrics_snapshot: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn for_experiment(mut self, experiment_id: Uuid, variant: Variant) -> Self {
        self.experiment_id = Some(experiment_id);
        self.variant = Some(variant);
        self
    }
}
