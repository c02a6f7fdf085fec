//! Workflow orchestration for the provisioning phases.

mod orchestrate;

use crate::error::{StevedoreError, StevedoreResult};

pub use orchestrate::Orchestrator;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by a provisioning run.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// One provisionable service of the object-storage stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    ClusterCommon,
    Proxy,
    ObjectServer,
    AuthServer,
    BgScheduler,
    BgWorker,
}

impl Service {
    /// System-fixed phase order. Cluster-common configures before any
    /// service; the scheduler runs before the worker so topic provisioning
    /// happens in dependency order.
    pub const ORDERED: [Service; 6] = [
        Service::ClusterCommon,
        Service::Proxy,
        Service::ObjectServer,
        Service::AuthServer,
        Service::BgScheduler,
        Service::BgWorker,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Service::ClusterCommon => "cluster-common",
            Service::Proxy => "proxy",
            Service::ObjectServer => "object-server",
            Service::AuthServer => "auth-server",
            Service::BgScheduler => "bg-scheduler",
            Service::BgWorker => "bg-worker",
        }
    }

    pub fn parse(raw: &str) -> StevedoreResult<Service> {
        Service::ORDERED
            .iter()
            .copied()
            .find(|service| service.name() == raw.trim())
            .ok_or_else(|| {
                StevedoreError::InvalidConfig(format!("unknown service '{}'", raw.trim()))
            })
    }
}

/// Order the requested services by the system-fixed dependency order.
///
/// Cluster-common is always included first regardless of the caller's list;
/// the caller's ordering and duplicates are ignored.
pub fn ordered_services(requested: &[Service]) -> Vec<Service> {
    Service::ORDERED
        .iter()
        .copied()
        .filter(|service| *service == Service::ClusterCommon || requested.contains(service))
        .collect()
}
