use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conductor_core::{Agent, AgentHealth, AgentStatus, RegistryConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::registry::AgentRegistry;

/// Minimum recent success rate for the success-rate check to pass.
pub const SUCCESS_RATE_THRESHOLD: f64 = 0.8;

const HEALTHY_SCORE: f64 = 0.8;
const DEGRADED_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthAssessment {
    pub health: AgentHealth,
    pub score: f64,
    /// Success rate over the recent window, `None` before the first execution.
    pub success_rate: Option<f64>,
    pub checks: Vec<HealthCheck>,
}

impl HealthAssessment {
    pub fn failed_checks(&self) -> Vec<&'static str> {
        self.checks.iter().filter(|c| !c.passed).map(|c| c.name).collect()
    }
}

/// Scores agents against three checks:
/// - recent activity within the activity window
/// - success rate over the last `success_rate_window` executions
/// - operational status is not `error`
///
/// The score is the lower of the passing-check ratio and the recent success
/// rate, so a poor success rate drags the verdict down on its own.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    activity_window: ChronoDuration,
    success_rate_window: usize,
}

impl HealthChecker {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            activity_window: ChronoDuration::seconds(config.activity_window_secs as i64),
            success_rate_window: config.success_rate_window,
        }
    }

    pub fn classify(score: f64) -> AgentHealth {
        if score >= HEALTHY_SCORE {
            AgentHealth::Healthy
        } else if score >= DEGRADED_SCORE {
            AgentHealth::Degraded
        } else {
            AgentHealth::Unhealthy
        }
    }

    pub fn assess(&self, agent: &Agent, now: DateTime<Utc>) -> HealthAssessment {
        let idle = now.signed_duration_since(agent.last_activity);
        let active = idle <= self.activity_window;
        let success_rate = agent.recent_success_rate(self.success_rate_window);
        let rate_ok = success_rate.map_or(true, |r| r >= SUCCESS_RATE_THRESHOLD);
        let status_ok = agent.status != AgentStatus::Error;

        let checks = vec![
            HealthCheck {
                name: "recent_activity",
                passed: active,
                detail: format!("last activity {}s ago", idle.num_seconds()),
            },
            HealthCheck {
                name: "success_rate",
                passed: rate_ok,
                detail: match success_rate {
                    Some(r) => format!("{:.0}% over the last {} executions", r * 100.0, self.success_rate_window),
                    None => "no executions yet".to_string(),
                },
            },
            HealthCheck {
                name: "status",
                passed: status_ok,
                detail: agent.status.to_string(),
            },
        ];

        let passed = checks.iter().filter(|c| c.passed).count() as f64;
        let score = (passed / checks.len() as f64).min(success_rate.unwrap_or(1.0));
        HealthAssessment {
            health: Self::classify(score),
            score,
            success_rate,
            checks,
        }
    }
}

/// Background loop re-running the registry health check on a fixed interval.
pub struct HealthMonitor {
    registry: AgentRegistry,
    interval: Duration,
}

impl HealthMonitor {
    /// A zero interval is raised to 1ms; `tokio::time::interval` rejects zero.
    pub fn new(registry: AgentRegistry, interval: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Health monitor started");

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.registry.perform_health_check().await;
                    let unhealthy = report.count(AgentHealth::Unhealthy);
                    if unhealthy > 0 {
                        warn!(unhealthy, checked = report.agents.len(), "Unhealthy agents detected");
                    } else {
                        debug!(checked = report.agents.len(), "Health check passed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{AgentInfo, ExecutionRecord};

    fn agent_with(successes: usize, failures: usize) -> Agent {
        let mut agent = Agent::new("worker", AgentInfo::new("audit", "audit"));
        for i in 0..(successes + failures) {
            agent.push_execution(
                ExecutionRecord {
                    operation: "scan".to_string(),
                    duration_ms: 5,
                    success: i < successes,
                    timestamp: Utc::now(),
                    summary: None,
                },
                100,
            );
        }
        agent
    }

    fn checker() -> HealthChecker {
        HealthChecker::new(&RegistryConfig::default())
    }

    #[test]
    fn test_boundary_eight_of_ten_is_healthy() {
        let assessment = checker().assess(&agent_with(8, 2), Utc::now());
        assert_eq!(assessment.health, AgentHealth::Healthy);
        assert!(assessment.failed_checks().is_empty());
    }

    #[test]
    fn test_four_of_ten_is_unhealthy() {
        let assessment = checker().assess(&agent_with(4, 6), Utc::now());
        assert_eq!(assessment.health, AgentHealth::Unhealthy);
        assert_eq!(assessment.failed_checks(), vec!["success_rate"]);
    }

    #[test]
    fn test_fresh_agent_is_healthy() {
        let assessment = checker().assess(&agent_with(0, 0), Utc::now());
        assert_eq!(assessment.health, AgentHealth::Healthy);
        assert_eq!(assessment.score, 1.0);
        assert!(assessment.success_rate.is_none());
    }

    #[test]
    fn test_error_status_and_inactivity_degrade() {
        let mut agent = agent_with(10, 0);
        agent.status = AgentStatus::Error;
        // One failing check out of three
        assert_eq!(checker().assess(&agent, Utc::now()).health, AgentHealth::Degraded);

        // Two failing checks out of three
        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(checker().assess(&agent, later).health, AgentHealth::Unhealthy);
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(HealthChecker::classify(0.8), AgentHealth::Healthy);
        assert_eq!(HealthChecker::classify(0.79), AgentHealth::Degraded);
        assert_eq!(HealthChecker::classify(0.5), AgentHealth::Degraded);
        assert_eq!(HealthChecker::classify(0.49), AgentHealth::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_with_zero_interval_runs_and_stops() {
        let registry = AgentRegistry::default();
        registry
            .register_agent("worker", AgentInfo::new("audit", "audit"))
            .await;
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), Duration::ZERO));
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(monitor.run_loop(rx));

        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.send(()).unwrap();
        task.await.unwrap();
        let agent = registry.get_agent("worker").await.unwrap();
        assert!(agent.last_health_check.is_some());
    }
}
