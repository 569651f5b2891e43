use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conductor_agent::{
    engine_fn, handler_fn, CoordinationContext, EngineOrchestrator, EventRoute,
};
use conductor_core::{AgentInfo, Config, Error, Paths, SendOptions};
use serde_json::{json, Value};
use tracing::warn;

use super::load_config;

pub const AUDIT_AGENT: &str = "site-auditor";
pub const NOTIFY_AGENT: &str = "notifier";
pub const PLANNER_AGENT: &str = "planner";

/// Build a context with two orchestrators, three agents and two routed events.
pub async fn build_context(config: Config, failures: bool) -> anyhow::Result<CoordinationContext> {
    let context = CoordinationContext::builder(config)
        .dispatch_event(
            "site.created",
            EventRoute::new("audit", "initial_audit", AUDIT_AGENT, "initial_audit"),
        )
        .dispatch_event(
            "report.ready",
            EventRoute::new("notification", "send_report", NOTIFY_AGENT, "send_report"),
        )
        .build()?;

    let registry = context.registry();
    registry
        .register_agent(
            AUDIT_AGENT,
            AgentInfo::new("audit", "audit")
                .with_capabilities(&["crawl", "score", "report"])
                .with_tags(&["seo"])
                .with_description("Crawls a site and scores its SEO health"),
        )
        .await;
    registry
        .register_agent(
            NOTIFY_AGENT,
            AgentInfo::new("notification", "coordinator")
                .with_capabilities(&["email"])
                .with_description("Sends reports to site owners"),
        )
        .await;
    registry
        .register_agent(
            PLANNER_AGENT,
            AgentInfo::new("coordinator", "coordinator")
                .with_capabilities(&["plan"])
                .with_description("Coordinates work between agents"),
        )
        .await;

    let runs = Arc::new(AtomicU64::new(0));
    let audit_engine = engine_fn(move |params: Value| {
        let run = runs.fetch_add(1, Ordering::SeqCst);
        async move {
            if failures && run % 2 == 1 {
                return Err(Error::Other("crawler was rate limited".to_string()));
            }
            let site = params["site"].as_str().unwrap_or("unknown").to_string();
            Ok(json!({ "site": site, "score": 70 + (site.len() as u64 % 30) }))
        }
    });
    let notify_engine = engine_fn(|params: Value| async move {
        Ok(json!({ "sent_to": params["site"], "channel": "email" }))
    });

    let audit = Arc::new(
        EngineOrchestrator::new("audit")
            .map_agent(AUDIT_AGENT, "seo_audit")
            .with_engine("seo_audit", audit_engine),
    );
    let coordinator = Arc::new(
        EngineOrchestrator::new("coordinator")
            .map_agent(NOTIFY_AGENT, "notify")
            .with_engine("notify", notify_engine),
    );
    audit.set_ready(true);
    coordinator.set_ready(true);
    context.dispatcher().register_orchestrator(audit).await;
    context.dispatcher().register_orchestrator(coordinator).await;

    // Every agent answers coordination requests with its own name.
    for agent in [AUDIT_AGENT, NOTIFY_AGENT] {
        let name = agent.to_string();
        context
            .bus()
            .register_handler(
                agent,
                handler_fn(move |msg| {
                    let name = name.clone();
                    async move { Ok(Some(json!({ "agent": name, "ack": msg.message_type }))) }
                }),
            )
            .await;
    }
    if let Some(topic) = &context.config().dispatcher.notify_topic {
        context.bus().subscribe(PLANNER_AGENT, topic, None, None).await;
    }

    Ok(context)
}

pub async fn run(config_path: Option<&Path>, failures: bool, dump: Option<&str>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if config.dispatcher.notify_topic.is_none() {
        config.dispatcher.notify_topic = Some("operations".to_string());
    }
    let context = build_context(config, failures).await?;
    context.start().await;

    println!();
    println!("🎼 conductor demo");
    println!("=================");
    println!();

    for site in ["example.org", "shop.example.com", "blog.example.net"] {
        match context
            .activation()
            .trigger_event("site.created", json!({ "site": site }))
            .await
        {
            Ok(outcome) => println!("  ✓ site.created {:<20} {}", site, outcome.status),
            Err(e) => println!("  ✗ site.created {:<20} {}", site, e),
        }
    }
    let outcome = context
        .activation()
        .trigger_event("report.ready", json!({ "site": "example.org" }))
        .await?;
    println!("  ✓ report.ready {:<20} {}", "example.org", outcome.status);
    let outcome = context
        .activation()
        .trigger_event("site.deleted", json!({ "site": "old.example" }))
        .await?;
    println!("  · site.deleted {:<20} {}", "old.example", outcome.status);

    let participants = vec![AUDIT_AGENT.to_string(), NOTIFY_AGENT.to_string()];
    let coordination = context
        .bus()
        .request_coordination(PLANNER_AGENT, &participants, "weekly_plan", json!({ "week": 42 }))
        .await?;
    println!(
        "  ✓ coordination {} answered by {} agents",
        coordination.coordination_id,
        coordination.responses.len()
    );

    let receipt = context
        .bus()
        .send_message(PLANNER_AGENT, AUDIT_AGENT, "ping", json!({}), SendOptions::request())
        .await?;
    if let Some(response) = receipt.response {
        println!("  ✓ ping answered with {}", response.payload);
    }

    let report = context.registry().perform_health_check().await;
    println!();
    println!("🩺 Health");
    for (name, assessment) in &report.agents {
        println!("  {:<14} {:<10} score {:.2}", name, assessment.health, assessment.score);
    }

    let state = context.export_state().await;
    println!();
    println!("📊 Statistics");
    println!("  dispatcher: {}", state["dispatcher"]["statistics"]);
    println!("  activation: {}", state["activation"]["statistics"]);
    println!("  bus:        {}", state["bus"]["statistics"]["messages_by_kind"]);

    if let Some(label) = dump {
        let path = Paths::new().snapshot_file(label);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&state)?)?;
        println!();
        println!("  Snapshot written to {}", path.display());
    }

    context.stop().await;
    if context.dispatcher().is_active() {
        warn!("Dispatcher still busy at shutdown");
    }
    Ok(())
}
