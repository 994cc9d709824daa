//! The Worker Binary (§4.11): one [`orc_scheduler::TenantProcessor`] per
//! active tenant, the [`orc_scheduler::MaintenanceLeader`] bundle on whichever
//! process wins the advisory-lock election, all driven from a single
//! Postgres pool and shut down cooperatively on `SIGINT`/`SIGTERM`.

mod config;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use config::Config;
use orc_loop::{LoopConfig, LoopRunner, ReqwestHealthProbe};
use orc_providers::{AnthropicHandler, OpenAiHandler, OpenCuaHandler, Provider, ProviderHandler, ProviderSettings};
use orc_scheduler::{MaintenanceConfig, MaintenanceLeader, SchedulerConfig, Service, SessionProvisioner, TenantProcessor};
use orc_session::{FakeContainerManager, MonitorConfig, Provisioner, SessionMonitor};
use orc_store::{AdvisoryLocks, JobStore, LogStore, PgMaintenanceLock, PgStore, SettingsKey, SettingsStore, Tenant, TenantStore};
use orc_tools::{ComputerTool, ComputerToolVersion, ExtractionTool, ToolRegistry, UiNotAsExpectedTool};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    tracing::info!(worker_id = %config.worker_id, "orchestrator worker starting");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;

    // `TenantStore::list_active` doesn't depend on `tenant_schema` (see
    // DESIGN.md), so one tenant-agnostic handle is enough to discover
    // tenants; the maintenance election lives on its own connection below.
    let bootstrap = PgStore::new(pool.clone(), "bootstrap");

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    // Out of scope per SPEC_FULL §1/§4.6: no real Docker/OCI client ships
    // here. Shared across every tenant's provisioner and the one global
    // session monitor, exactly as a real container runtime would be.
    let containers = Arc::new(FakeContainerManager::new());

    // Held on a dedicated connection for the life of the process, per
    // §4.8 — a pool-backed handle would let sqlx recycle the underlying
    // connection and silently drop the session-level lock out from under
    // us while `is_leader` still reads true.
    let maintenance_lock = PgMaintenanceLock::connect(&config.database_url)
        .await
        .context("failed to open the dedicated maintenance-lock connection")?;
    let is_leader = maintenance_lock
        .try_become_maintenance_leader()
        .await
        .context("maintenance leader election failed")?;

    let mut handles: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    if is_leader {
        tracing::info!("won the maintenance election; starting background tasks");
        let monitor: Arc<dyn orc_scheduler::Reconciler> = Arc::new(SessionMonitor::new(
            bootstrap.clone(),
            containers.clone(),
            MonitorConfig {
                initializing_interval_seconds: config.session_monitor_initializing_interval_seconds,
                ready_interval_seconds: config.session_monitor_ready_interval_seconds,
                idle_timeout_minutes: config.session_idle_timeout_minutes,
            },
        ));
        let leader = Box::new(MaintenanceLeader::new(
            Arc::new(bootstrap.clone()) as Arc<dyn JobStore>,
            Arc::new(bootstrap.clone()) as Arc<dyn LogStore>,
            monitor,
            MaintenanceConfig {
                stale_lease_sweep_interval: std::time::Duration::from_secs(config.stale_lease_sweep_interval_seconds),
                log_retention_days: config.log_retention_days,
                session_monitor_tick_interval: std::time::Duration::from_secs(config.session_monitor_initializing_interval_seconds),
            },
        ));
        let leader_shutdown = shutdown.clone();
        handles.insert(Uuid::nil(), tokio::spawn(async move { run_service(leader, leader_shutdown).await }));
    }

    let mut known_tenants: HashMap<Uuid, JoinHandle<()>> = HashMap::new();
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match bootstrap.list_active().await {
            Ok(tenants) => spawn_new_tenants(&pool, &config, &containers, tenants, &mut known_tenants, &shutdown).await,
            Err(e) => tracing::error!(error = %e, "failed to list active tenants"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.tenant_rescan_interval_seconds)) => {}
        }
    }

    for (_, handle) in handles.into_iter().chain(known_tenants.into_iter()) {
        let _ = handle.await;
    }

    tracing::info!("orchestrator worker stopped");
    Ok(())
}

async fn run_service(service: Box<dyn Service>, shutdown: CancellationToken) {
    let name = service.name();
    if let Err(e) = service.run(shutdown).await {
        tracing::error!(service = name, error = %e, "service exited with an error");
    }
}

async fn spawn_new_tenants(
    pool: &sqlx::PgPool,
    config: &Config,
    containers: &Arc<FakeContainerManager>,
    tenants: Vec<Tenant>,
    known: &mut HashMap<Uuid, JoinHandle<()>>,
    shutdown: &CancellationToken,
) {
    for tenant in tenants {
        if known.contains_key(&tenant.id) {
            continue;
        }
        tracing::info!(tenant_id = %tenant.id, tenant = %tenant.schema, "starting tenant processor");

        let store = PgStore::new(pool.clone(), tenant.schema.clone());
        let registry = build_tool_registry(config);
        let provider_settings = resolve_provider_settings(&store, tenant.id, &config.default_model).await;
        let handler = build_handler(&provider_settings);
        let loop_runner = Arc::new(LoopRunner::new(
            Arc::new(store.clone()) as Arc<dyn JobStore>,
            Arc::new(store.clone()) as Arc<dyn orc_store::MessageStore>,
            Arc::new(store.clone()) as Arc<dyn LogStore>,
            Arc::new(store.clone()) as Arc<dyn orc_store::SessionStore>,
            Arc::new(store.clone()) as Arc<dyn orc_store::ApiDefinitionStore>,
            handler,
            Arc::new(registry),
            Arc::new(ReqwestHealthProbe::new()),
            LoopConfig {
                only_n_most_recent_images: only_n_most_recent_images_for(provider_settings.resolved_provider(), config.only_n_most_recent_images),
                min_removal_threshold: config.min_removal_threshold,
                default_token_limit: config.default_token_limit,
                ..LoopConfig::default()
            },
            config.default_model.clone(),
        ));

        let provisioner: Arc<dyn SessionProvisioner> =
            Arc::new(Provisioner::new(store.clone(), store.clone(), containers.clone(), config.sandbox_image.clone()));

        let processor = Box::new(TenantProcessor::new(
            tenant.clone(),
            Arc::new(store) as Arc<dyn JobStore>,
            provisioner,
            loop_runner,
            SchedulerConfig {
                worker_id: config.worker_id.clone(),
                lease_seconds: config.lease_seconds,
                poll_interval: std::time::Duration::from_millis(config.scheduler_poll_interval_ms),
                lease_renew_interval: std::time::Duration::from_secs(config.lease_renew_interval_seconds),
                ..SchedulerConfig::default()
            },
        ));

        let tenant_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move { run_service(processor, tenant_shutdown).await });
        known.insert(tenant.id, handle);
    }
}

fn build_tool_registry(config: &Config) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ComputerTool::new(ComputerToolVersion::V20250124, config.default_screen_width, config.default_screen_height)));
    registry.register(Box::new(ExtractionTool));
    registry.register(Box::new(UiNotAsExpectedTool));
    registry
}

/// Resolves §4.10's `ProviderSettings` view for one tenant. Handler
/// selection happens once per tenant at startup; a live credential rotation
/// takes effect on the next worker restart.
async fn resolve_provider_settings(settings: &impl SettingsStore, tenant_id: Uuid, default_model: &str) -> ProviderSettings {
    async fn lookup(settings: &impl SettingsStore, tenant_id: Uuid, key: SettingsKey) -> Option<String> {
        match settings.get(tenant_id, key).await {
            Ok(Some(v)) => Some(v),
            Ok(None) => key.default_value().map(|v| v.to_string()),
            Err(e) => {
                tracing::warn!(tenant_id = %tenant_id, key = key.as_str(), error = %e, "failed to resolve tenant setting, using default");
                key.default_value().map(|v| v.to_string())
            }
        }
    }

    let provider = lookup(settings, tenant_id, SettingsKey::ApiProvider).await.map(|raw| Provider::parse(&raw));

    let api_key = match provider {
        Some(Provider::Anthropic) | None => match lookup(settings, tenant_id, SettingsKey::AnthropicApiKey).await {
            Some(key) => Some(key),
            None => lookup(settings, tenant_id, SettingsKey::ApiKey).await,
        },
        _ => lookup(settings, tenant_id, SettingsKey::ApiKey).await,
    };

    ProviderSettings {
        provider,
        api_key,
        model: Some(default_model.to_string()),
        aws_access_key_id: lookup(settings, tenant_id, SettingsKey::AwsAccessKeyId).await,
        aws_secret_access_key: lookup(settings, tenant_id, SettingsKey::AwsSecretAccessKey).await,
        aws_region: lookup(settings, tenant_id, SettingsKey::AwsRegion).await,
        vertex_project: lookup(settings, tenant_id, SettingsKey::VertexProject).await,
        vertex_region: lookup(settings, tenant_id, SettingsKey::VertexRegion).await,
        proxy_api_key: lookup(settings, tenant_id, SettingsKey::LegacyUseProxyApiKey).await,
    }
}

/// OpenCUA's self-hosted backend is VRAM-constrained, so it keeps far
/// fewer screenshots in context than the tenant's configured default
/// regardless of what that default is.
fn only_n_most_recent_images_for(provider: Provider, default: usize) -> usize {
    match provider {
        Provider::OpenCua => 1,
        _ => default,
    }
}

/// Bedrock/Vertex/LegacyUseProxy reuse `AnthropicHandler`'s wire format;
/// `OpenCua`'s self-hosted endpoint rides in the generic `API_KEY` setting
/// since it has no dedicated `SettingsKey` of its own.
fn build_handler(settings: &ProviderSettings) -> Arc<dyn ProviderHandler> {
    match settings.resolved_provider() {
        Provider::OpenAi => Arc::new(OpenAiHandler::new(settings.api_key.clone().unwrap_or_default())),
        Provider::OpenCua => Arc::new(OpenCuaHandler::new(settings.api_key.clone().unwrap_or_default())),
        Provider::Bedrock => Arc::new(AnthropicHandler::new(settings.aws_access_key_id.clone().unwrap_or_default())),
        Provider::Vertex => Arc::new(AnthropicHandler::new(settings.vertex_project.clone().unwrap_or_default())),
        Provider::LegacyUseProxy => Arc::new(AnthropicHandler::new(settings.proxy_api_key.clone().unwrap_or_default())),
        Provider::Anthropic => Arc::new(AnthropicHandler::new(settings.api_key.clone().unwrap_or_default())),
    }
}

/// Cooperative shutdown (§4.11): stop claiming new jobs on `SIGINT`/`SIGTERM`
/// and let in-flight jobs run to their next cancellation checkpoint.
fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("received shutdown signal");
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("received shutdown signal, draining in-flight work");
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_store::memory::MemoryStore;

    #[tokio::test]
    async fn unconfigured_tenant_falls_back_to_anthropic_with_no_key() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();

        let settings = resolve_provider_settings(&store, tenant_id, "claude-sonnet-4-20250514").await;

        assert_eq!(settings.resolved_provider(), Provider::Anthropic);
        assert!(settings.api_key.is_none());
        assert_eq!(settings.resolved_model(), "claude-sonnet-4-20250514");
    }

    #[tokio::test]
    async fn anthropic_api_key_override_wins_over_the_generic_key() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        store.set(tenant_id, SettingsKey::ApiKey, "generic-key".to_string()).await.unwrap();
        store.set(tenant_id, SettingsKey::AnthropicApiKey, "anthropic-key".to_string()).await.unwrap();

        let settings = resolve_provider_settings(&store, tenant_id, "m").await;

        assert_eq!(settings.api_key.as_deref(), Some("anthropic-key"));
    }

    #[tokio::test]
    async fn explicit_openai_provider_resolves_with_the_generic_key() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        store.set(tenant_id, SettingsKey::ApiProvider, "openai".to_string()).await.unwrap();
        store.set(tenant_id, SettingsKey::ApiKey, "sk-openai".to_string()).await.unwrap();

        let settings = resolve_provider_settings(&store, tenant_id, "m").await;
        assert_eq!(settings.resolved_provider(), Provider::OpenAi);

        let handler = build_handler(&settings);
        assert_eq!(handler.provider(), Provider::OpenAi);
    }

    #[test]
    fn every_provider_variant_builds_a_handler() {
        for provider in [Provider::Anthropic, Provider::Bedrock, Provider::Vertex, Provider::LegacyUseProxy, Provider::OpenAi, Provider::OpenCua] {
            let settings = ProviderSettings { provider: Some(provider), ..Default::default() };
            let handler = build_handler(&settings);
            let expected = match provider {
                Provider::Bedrock | Provider::Vertex | Provider::LegacyUseProxy => Provider::Anthropic,
                other => other,
            };
            assert_eq!(handler.provider(), expected);
        }
    }
}
