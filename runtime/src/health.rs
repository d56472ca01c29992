//! Health reporting for dispatchers and their performers.

/// Health check status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Fully operational
    Healthy,

    /// Operational, but something needs attention (e.g. a stopped performer)
    Degraded,

    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// The worse of two statuses.
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one component (a performer, a subscription, the dispatcher).
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Component name
    pub component: String,

    /// Status
    pub status: HealthStatus,

    /// Details
    pub message: Option<String>,

    /// Counters and other key/value details
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    fn with_status(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// Healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    /// Degraded component.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// Unhealthy component.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a detail.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }

    /// Look up a detail.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Aggregated health; the overall status is the worst individual one.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,

    /// Individual checks
    pub checks: Vec<HealthCheck>,

    /// When the report was taken
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Aggregate checks into a report.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Whether everything is healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// The check for a component.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_takes_the_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("orders#0"),
            HealthCheck::degraded("orders#1", "stopped"),
            HealthCheck::unhealthy("payments#0", "quarantined").with_metadata("unacceptable", 3),
        ]);

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(
            report.check("payments#0").and_then(|c| c.metadata("unacceptable")),
            Some("3")
        );
    }

    #[test]
    fn empty_report_is_healthy() {
        assert!(HealthReport::new(Vec::new()).is_healthy());
    }
}
