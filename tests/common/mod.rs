//! Shared fixtures: a service loader backed by an in-memory command bus.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use service_host::commbus::{
    Broadcast, CommandBus, CommandEnvelope, CommandRouter, CommandSpec,
};
use service_host::host::ServiceHost;
use service_host::types::{Config, Error, ErrorReport, ServiceId, ServicesDir, SupervisorConfig};
use service_host::worker::{ServiceLoader, WorkerProvider, WorkerStartup};
use service_host::workers::{Launchers, TaskLauncher};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Worker bus exposing:
/// - `serviceStart` / `serviceCheck` (the check fails for service `faulty`,
///   the start takes [`SLOW_START`] for service `slow`)
/// - `echo`: returns its data
/// - `hang`: never answers
/// - `panic`: panics inside the handler
/// - `crash`: reports `data.code` as a fatal error and ends the unit
/// - `relay`: escalates `data.command` with `data.data` to the host
///
/// Service `unloadable` fails to load; service `flaky` loads and then dies at
/// once with an ignored root cause.
pub struct TestLoader;

pub const SLOW_START: Duration = Duration::from_millis(500);

#[async_trait]
impl ServiceLoader for TestLoader {
    async fn load(
        &self,
        startup: &WorkerStartup,
        provider: &WorkerProvider,
    ) -> Result<Arc<dyn CommandRouter>, ErrorReport> {
        if startup.service.as_str() == "unloadable" {
            return Err(ErrorReport::new("CTR_CONF_EXTENDS_PROBLEM", "cannot load"));
        }
        let bus = build_bus(provider.clone())
            .await
            .map_err(|err| err.to_report())?;
        if startup.service.as_str() == "flaky" {
            let provider = provider.clone();
            tokio::spawn(async move {
                provider.crash(ErrorReport::new("CTR_CONF_EXTENDS_PROBLEM", "gone at once"));
            });
        }
        Ok(bus)
    }
}

async fn service_start(env: CommandEnvelope) -> service_host::Result<Value> {
    if env.data["service"] == json!("slow") {
        tokio::time::sleep(SLOW_START).await;
    }
    Ok(json!({}))
}

async fn service_check(env: CommandEnvelope) -> service_host::Result<Value> {
    if env.data["service"] == json!("faulty") {
        return Err(Error::validation("bad service configuration"));
    }
    Ok(json!({}))
}

async fn echo(env: CommandEnvelope) -> service_host::Result<Value> {
    Ok(env.data)
}

async fn hang(_env: CommandEnvelope) -> service_host::Result<Value> {
    std::future::pending().await
}

async fn explode(_env: CommandEnvelope) -> service_host::Result<Value> {
    panic!("handler blew up")
}

async fn build_bus(provider: WorkerProvider) -> service_host::Result<Arc<dyn CommandRouter>> {
    let bus = CommandBus::new();
    bus.register(CommandSpec::new("serviceStart", "start", 0), service_start)
        .await?;
    bus.register(CommandSpec::new("serviceCheck", "check", 0), service_check)
        .await?;
    bus.register(CommandSpec::new("echo", "echo", 0), echo).await?;
    bus.register(CommandSpec::new("hang", "never answers", 0), hang)
        .await?;
    bus.register(CommandSpec::new("panic", "panics", 0), explode)
        .await?;

    let crashing = provider.clone();
    bus.register(
        CommandSpec::new("crash", "fatal error", 0),
        move |env: CommandEnvelope| {
            let provider = crashing.clone();
            async move {
                let code = env.data["code"].as_str().unwrap_or("UNKNOWN").to_string();
                provider.crash(ErrorReport::new(code, "boom"));
                Ok::<_, Error>(json!({}))
            }
        },
    )
    .await?;

    bus.register(
        CommandSpec::new("relay", "escalate to the host", 0),
        move |env: CommandEnvelope| {
            let provider = provider.clone();
            async move {
                let command = env.data["command"].as_str().unwrap_or_default().to_string();
                provider.request(command, env.data["data"].clone()).await
            }
        },
    )
    .await?;

    Ok(Arc::new(bus))
}

pub fn launchers() -> Launchers {
    Launchers::new(Arc::new(TaskLauncher::new(Arc::new(TestLoader))))
}

/// Write `<id>.json` definitions, with `<id>.meta.json` when meta is given.
pub fn services_dir(services: &[(&str, Option<&str>)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (id, meta) in services {
        fs::write(dir.path().join(format!("{id}.json")), "{}").unwrap();
        if let Some(meta) = meta {
            fs::write(dir.path().join(format!("{id}.meta.json")), meta).unwrap();
        }
    }
    dir
}

pub fn config(dir: &Path) -> Config {
    Config {
        supervisor: SupervisorConfig {
            services_dirs: vec![ServicesDir {
                dir: dir.to_path_buf(),
                generate: false,
            }],
            ..SupervisorConfig::default()
        },
        ..Config::default()
    }
}

pub async fn host(dir: &Path) -> ServiceHost {
    let host = ServiceHost::new(&config(dir), launchers()).await.unwrap();
    host.services().update_list().unwrap();
    host
}

pub fn id(raw: &str) -> ServiceId {
    ServiceId::try_from(raw).unwrap()
}

/// Receive updates until one matches.
pub async fn wait_for(
    updates: &mut mpsc::UnboundedReceiver<Broadcast>,
    matches: impl Fn(&Value) -> bool,
) -> Value {
    loop {
        let update = updates.recv().await.unwrap();
        if matches(&update.data) {
            return update.data;
        }
    }
}

/// Ask a running service's worker to crash with `code`.
pub async fn crash(host: &ServiceHost, service: &str, code: &str) {
    let envelope = CommandEnvelope::internal(
        "test",
        "crash",
        json!({"service": service, "code": code}),
    );
    // The worker may end before it answers.
    let _ = host.services().submaster(envelope).await;
}
