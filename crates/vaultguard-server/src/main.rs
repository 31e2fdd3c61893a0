use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vaultguard_client::{HttpPolicyEngine, PolicyClient};
use vaultguard_core::audit::{AuditQuery, ExportFormat};
use vaultguard_core::{CheckRequest, PlanType};
use vaultguard_storage::postgres::{self, PgPool, migrations};
use vaultguard_storage::{
    AuditStore, InMemoryPlanOverrideStore, PlanOverrideStore, PostgresAuditStore,
    PostgresPlanOverrideStore,
};

use vaultguard_server::audit::AuditPipeline;
use vaultguard_server::cache::PermissionCache;
use vaultguard_server::cli::{Cli, Command, OutputFormat, health_report};
use vaultguard_server::config::{AppConfig, LogFormat};
use vaultguard_server::plan_limits::PlanLimitService;
use vaultguard_server::service::AuthorizationService;

type BoxError = Box<dyn std::error::Error>;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Some(Command::Check {
            user,
            relation,
            object,
        }) => {
            let request = CheckRequest::new(user, relation, object);
            match connect_database(&config).await? {
                Some(pool) => {
                    let store = Arc::new(PostgresAuditStore::new(pool));
                    let audit = AuditPipeline::with_store(config.audit_level(), store);
                    run_check(&config, &shutdown, &request, audit).await
                }
                None => {
                    let audit = AuditPipeline::new(config.audit_level());
                    run_check(&config, &shutdown, &request, audit).await
                }
            }
        }
        Some(Command::Health) => run_health(&config, &shutdown).await,
        Some(Command::Limits { tenant, plan }) => {
            let plan: PlanType = plan.parse()?;
            match connect_database(&config).await? {
                Some(pool) => {
                    let store = Arc::new(PostgresPlanOverrideStore::new(pool));
                    run_limits(&config, store, &tenant, plan).await
                }
                None => {
                    let store = Arc::new(InMemoryPlanOverrideStore::new());
                    run_limits(&config, store, &tenant, plan).await
                }
            }
        }
        Some(Command::AuditLogs {
            user,
            action,
            format,
        }) => {
            let query = AuditQuery {
                user_id: user,
                action,
                ..Default::default()
            };
            run_audit_logs(&config, &query, format).await
        }
        Some(Command::Migrate) => run_migrate(&config).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

async fn connect_database(config: &AppConfig) -> Result<Option<PgPool>, BoxError> {
    let Some(url) = config.database.url.as_deref() else {
        return Ok(None);
    };
    let pool = postgres::connect(url, config.database.max_connections).await?;
    Ok(Some(pool))
}

fn build_client(config: &AppConfig) -> Result<PolicyClient<HttpPolicyEngine>, BoxError> {
    let engine = HttpPolicyEngine::new(config.to_engine_options())?;
    Ok(PolicyClient::new(Arc::new(engine), config.to_client_options()))
}

async fn run_check<S: AuditStore>(
    config: &AppConfig,
    ctx: &CancellationToken,
    request: &CheckRequest,
    audit: AuditPipeline<S>,
) -> Result<(), BoxError> {
    let client = build_client(config)?;
    let cache = config
        .to_cache_config()
        .map(|cfg| Arc::new(PermissionCache::with_config(&cfg)));
    let audit = Arc::new(audit.enabled(config.audit.enabled));
    let service = AuthorizationService::new(client, cache, audit);

    let background = ctx.child_token();
    let tasks = service.spawn_background(
        config.cache_cleanup_interval(),
        config.health_check_interval(),
        &background,
    );

    let outcome = service.check(ctx, request).await;
    background.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "background task failed");
        }
    }

    let allowed = outcome?;
    println!("{}", if allowed { "allowed" } else { "denied" });
    Ok(())
}

async fn run_health(config: &AppConfig, ctx: &CancellationToken) -> Result<(), BoxError> {
    let client = build_client(config)?;
    let check_ctx = ctx.child_token();

    let Ok(status) =
        tokio::time::timeout(config.health_check_timeout(), client.health_check(&check_ctx)).await
    else {
        check_ctx.cancel();
        return Err(format!("unhealthy: no answer within {:?}", config.health_check_timeout()).into());
    };

    println!("{}", health_report(status)?);
    Ok(())
}

async fn run_limits<O: PlanOverrideStore>(
    config: &AppConfig,
    overrides: Arc<O>,
    tenant: &str,
    plan: PlanType,
) -> Result<(), BoxError> {
    let service = PlanLimitService::new(overrides);
    let sweep = service.spawn_cleanup(config.cache_cleanup_interval());

    let limits = service.get_plan_limits(tenant, plan).await;
    service.close();
    if let Err(err) = sweep.await {
        tracing::warn!(error = %err, "plan cache cleanup task failed");
    }

    println!("{}", serde_json::to_string_pretty(&limits?)?);
    Ok(())
}

async fn run_audit_logs(
    config: &AppConfig,
    query: &AuditQuery,
    format: OutputFormat,
) -> Result<(), BoxError> {
    let Some(pool) = connect_database(config).await? else {
        return Err("audit-logs requires database.url to be configured".into());
    };
    let store = Arc::new(PostgresAuditStore::new(pool));
    let pipeline = AuditPipeline::with_store(config.audit_level(), store);

    let format = match format {
        OutputFormat::Json => ExportFormat::Json,
        OutputFormat::Csv => ExportFormat::Csv,
    };
    print!("{}", pipeline.export_logs(query, format).await?);
    Ok(())
}

async fn run_migrate(config: &AppConfig) -> Result<(), BoxError> {
    let Some(pool) = connect_database(config).await? else {
        return Err("migrate requires database.url to be configured".into());
    };
    tracing::info!("running database migrations");
    migrations::run_migrations(&pool).await?;
    tracing::info!("migrations completed successfully");
    Ok(())
}
