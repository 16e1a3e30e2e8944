//! Demo team: stub research, analysis and writing agents

use agent_hive_agent::{AgentRuntime, Collaborator, CompositeTask, Coordinator, Subtask};
use agent_hive_core::bus::MessageBus;
use agent_hive_core::config::Config;
use agent_hive_core::protocol::capability;
use agent_hive_core::DomainError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Roles the demo can be told to fail
pub const ROLES: [&str; 3] = [capability::RESEARCH, capability::ANALYSIS, capability::WRITING];

fn topic_of(payload: &Value) -> &str {
    payload["parameters"]["topic"]
        .as_str()
        .unwrap_or("an unnamed topic")
}

struct Researcher;

#[async_trait]
impl Collaborator for Researcher {
    async fn handle(&self, payload: &Value) -> Result<Value, DomainError> {
        let topic = topic_of(payload);
        Ok(json!({
            "topic": topic,
            "findings": [
                format!("{} is gaining adoption", topic),
                format!("open questions remain around {}", topic),
            ],
            "sources": 2,
        }))
    }
}

struct Analyst;

#[async_trait]
impl Collaborator for Analyst {
    async fn handle(&self, payload: &Value) -> Result<Value, DomainError> {
        Ok(json!({
            "topic": topic_of(payload),
            "trend": "increasing",
            "confidence": 0.8,
        }))
    }
}

struct Writer;

#[async_trait]
impl Collaborator for Writer {
    async fn handle(&self, payload: &Value) -> Result<Value, DomainError> {
        let dependencies = &payload["parameters"]["dependencies"];
        let findings = dependencies["research"]["findings"]
            .as_array()
            .ok_or_else(|| DomainError::new("research findings missing"))?;
        let trend = dependencies["analyze"]["trend"]
            .as_str()
            .unwrap_or("unclear");

        let mut report = format!("Report on {} (trend: {})", topic_of(payload), trend);
        for finding in findings.iter().filter_map(Value::as_str) {
            report.push_str("\n- ");
            report.push_str(finding);
        }
        Ok(json!(report))
    }
}

/// Always fails, standing in for a broken collaborator
struct Broken(&'static str);

#[async_trait]
impl Collaborator for Broken {
    async fn handle(&self, _payload: &Value) -> Result<Value, DomainError> {
        Err(DomainError::new(format!("{} collaborator is unavailable", self.0)))
    }
}

fn build_agent(
    bus: &MessageBus,
    config: &Config,
    role: &'static str,
    fail: Option<&str>,
) -> agent_hive_core::Result<AgentRuntime> {
    let builder = AgentRuntime::builder(format!("{}-agent", role))
        .capability(role)
        .config(config.runtime.clone());
    let builder = if fail == Some(role) {
        builder.on_task(Broken(role))
    } else {
        match role {
            capability::RESEARCH => builder.on_task(Researcher),
            capability::ANALYSIS => builder.on_task(Analyst),
            _ => builder.on_task(Writer),
        }
    };
    builder.build(bus)
}

/// A coordinator with one running agent per role
pub struct DemoTeam {
    pub bus: MessageBus,
    pub coordinator: Coordinator,
    agents: Vec<AgentRuntime>,
}

impl DemoTeam {
    pub fn start(config: &Config, fail: Option<&str>) -> agent_hive_core::Result<Self> {
        let bus = MessageBus::new(config.bus.clone());
        let coordinator = Coordinator::start(bus.clone(), config.coordinator.clone())?;

        let mut agents = Vec::with_capacity(ROLES.len());
        for role in ROLES {
            let agent = build_agent(&bus, config, role, fail)?;
            agent.start()?;
            agents.push(agent);
        }
        info!("Demo team started ({} agents)", agents.len());

        Ok(Self {
            bus,
            coordinator,
            agents,
        })
    }

    pub async fn stop(self) {
        for agent in &self.agents {
            agent.stop().await;
        }
        self.coordinator.shutdown().await;
    }
}

/// research and analyze in parallel, then write from both
pub fn report_pipeline(topic: &str, timeout: Duration) -> CompositeTask {
    CompositeTask::new("report", format!("Write a report on {}", topic))
        .with_subtask(
            Subtask::new("research", "Collect findings", capability::RESEARCH)
                .with_parameter("topic", topic)
                .with_timeout(timeout),
        )
        .with_subtask(
            Subtask::new("analyze", "Assess the trend", capability::ANALYSIS)
                .with_parameter("topic", topic)
                .with_timeout(timeout),
        )
        .with_subtask(
            Subtask::new("write", "Draft the report", capability::WRITING)
                .with_parameter("topic", topic)
                .after("research")
                .after("analyze")
                .with_timeout(timeout),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hive_agent::TaskOutcome;

    #[tokio::test]
    async fn test_pipeline_completes() {
        let team = DemoTeam::start(&Config::default(), None).unwrap();
        let outcome = team
            .coordinator
            .decompose_and_dispatch(report_pipeline("tide pools", Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(outcome.is_complete());
        let report = outcome.get("write").and_then(TaskOutcome::payload).unwrap();
        let report = report.as_str().unwrap();
        assert!(report.starts_with("Report on tide pools (trend: increasing)"));
        assert!(report.contains("- tide pools is gaining adoption"));
        team.stop().await;
    }

    #[tokio::test]
    async fn test_broken_research_fails_write() {
        let team = DemoTeam::start(&Config::default(), Some(capability::RESEARCH)).unwrap();
        let outcome = team
            .coordinator
            .decompose_and_dispatch(report_pipeline("tide pools", Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(outcome.get("analyze").is_some_and(TaskOutcome::is_completed));
        assert_eq!(outcome.unfinished(), vec!["research", "write"]);
        team.stop().await;
    }
}
