//! Service supervisor commands on the host command bus.
//!
//! Query commands run at level 3, lifecycle commands require level 1. Every
//! command except `serviceList`/`serviceUpdateList` takes `{ "service": id }`.
//! Commands the host does not know are forwarded into the worker of the
//! service named by `data.service`.

use serde_json::{json, Value};
use std::future::Future;

use super::ServiceManager;
use crate::commbus::{CommandBus, CommandEnvelope, CommandSpec};
use crate::types::{Error, Result, ServiceId};

const QUERY_LEVEL: u8 = 3;
const CONTROL_LEVEL: u8 = 1;

/// Register every service supervisor command on `bus`.
pub async fn register_commands(bus: &CommandBus, manager: &ServiceManager) -> Result<()> {
    register(bus, manager, "service", "Return a service config", QUERY_LEVEL, service).await?;
    register(bus, manager, "serviceMeta", "Return service metadata", QUERY_LEVEL, service_meta).await?;
    register(bus, manager, "serviceList", "Return all services", QUERY_LEVEL, service_list).await?;
    register(
        bus,
        manager,
        "serviceUpdateList",
        "Rescan services dirs and return all services",
        QUERY_LEVEL,
        service_update_list,
    )
    .await?;
    register(bus, manager, "serviceStart", "Start service", CONTROL_LEVEL, service_start).await?;
    register(bus, manager, "serviceStop", "Stop service", CONTROL_LEVEL, service_stop).await?;
    register(bus, manager, "serviceCheck", "Check service", CONTROL_LEVEL, service_check).await?;
    register(bus, manager, "serviceErrors", "Return service errors", CONTROL_LEVEL, service_errors)
        .await?;
    register(
        bus,
        manager,
        "serviceErrorsClear",
        "Clear service errors",
        CONTROL_LEVEL,
        service_errors_clear,
    )
    .await?;

    let manager = manager.clone();
    bus.set_fallback(move |envelope: CommandEnvelope| {
        let manager = manager.clone();
        async move { manager.submaster(envelope).await }
    })
    .await;
    Ok(())
}

async fn register<F, Fut>(
    bus: &CommandBus,
    manager: &ServiceManager,
    command: &str,
    description: &str,
    level: u8,
    handler: F,
) -> Result<()>
where
    F: Fn(ServiceManager, CommandEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let manager = manager.clone();
    bus.register(
        CommandSpec::new(command, description, level),
        move |envelope: CommandEnvelope| handler(manager.clone(), envelope),
    )
    .await
}

fn service_param(data: &Value) -> Result<ServiceId> {
    let raw = data
        .get("service")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation("service is required"))?;
    ServiceId::try_from(raw).map_err(Error::validation)
}

async fn service(manager: ServiceManager, envelope: CommandEnvelope) -> Result<Value> {
    let id = service_param(&envelope.data)?;
    Ok(serde_json::to_value(manager.service(&id)?)?)
}

async fn service_meta(manager: ServiceManager, envelope: CommandEnvelope) -> Result<Value> {
    let id = service_param(&envelope.data)?;
    Ok(serde_json::to_value(manager.meta(&id)?)?)
}

async fn service_list(manager: ServiceManager, _envelope: CommandEnvelope) -> Result<Value> {
    Ok(manager.list())
}

async fn service_update_list(manager: ServiceManager, _envelope: CommandEnvelope) -> Result<Value> {
    manager.update_list()
}

async fn service_start(manager: ServiceManager, envelope: CommandEnvelope) -> Result<Value> {
    let id = service_param(&envelope.data)?;
    Ok(serde_json::to_value(manager.start(&id).await?)?)
}

async fn service_stop(manager: ServiceManager, envelope: CommandEnvelope) -> Result<Value> {
    let id = service_param(&envelope.data)?;
    Ok(serde_json::to_value(manager.stop(&id).await?)?)
}

async fn service_check(manager: ServiceManager, envelope: CommandEnvelope) -> Result<Value> {
    let id = service_param(&envelope.data)?;
    manager.check(&id).await
}

async fn service_errors(manager: ServiceManager, envelope: CommandEnvelope) -> Result<Value> {
    let id = service_param(&envelope.data)?;
    Ok(serde_json::to_value(manager.errors(&id)?)?)
}

async fn service_errors_clear(manager: ServiceManager, envelope: CommandEnvelope) -> Result<Value> {
    let id = service_param(&envelope.data)?;
    manager.clear_errors(&id)?;
    Ok(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_param() {
        assert_eq!(
            service_param(&json!({"service": "meter"})).unwrap().as_str(),
            "meter"
        );
        assert_eq!(service_param(&json!({})).unwrap_err().code(), "VALIDATION");
        assert_eq!(
            service_param(&json!({"service": ""})).unwrap_err().code(),
            "VALIDATION"
        );
        assert_eq!(
            service_param(&json!({"service": 7})).unwrap_err().code(),
            "VALIDATION"
        );
    }
}
