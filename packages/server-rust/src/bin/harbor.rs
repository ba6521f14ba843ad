//! `harbor`: run a host serving a small notes API, or manage its migrations.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use harbor_core::{Migration, Model};
use harbor_server::storage::{ConnectionPool, MemoryStore, PoolConfig, TransactionManager};
use harbor_server::telemetry::{init_tracing, install_prometheus};
use harbor_server::{
    HandlerContext, HandlerError, HostConfig, HostRequest, HostResponse, MetricsSink, RouteGroup,
    ServiceHost,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Harbor request host", long_about = None)]
struct Cli {
    /// Write logs as JSON lines
    #[arg(long, env = "HARBOR_JSON_LOGS", global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the notes API until interrupted
    Serve(ServeArgs),
    /// Inspect or apply schema migrations without serving
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply every pending migration
    Apply(StoreArgs),
    /// Print the current version and pending migrations
    Status(StoreArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// Snapshot file for durable storage; in-memory only when omitted
    #[arg(long, env = "HARBOR_DATA")]
    data: Option<PathBuf>,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "HARBOR_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "HARBOR_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "HARBOR_MAX_CONCURRENCY", default_value_t = 64)]
    max_concurrency: usize,

    #[arg(long, env = "HARBOR_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    #[arg(long, env = "HARBOR_POOL_SIZE", default_value_t = 8)]
    pool_size: usize,

    #[arg(long, env = "HARBOR_ACQUIRE_TIMEOUT_MS", default_value_t = 5_000)]
    acquire_timeout_ms: u64,

    #[arg(long, env = "HARBOR_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// Serve the route listing at /docs/routes
    #[arg(long, env = "HARBOR_EXPOSE_DOCS", default_value_t = false)]
    expose_docs: bool,

    /// Allowed CORS origin (repeat or comma-separate)
    #[arg(long = "cors-origin", env = "HARBOR_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Prometheus scrape address
    #[arg(long, env = "HARBOR_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(flatten)]
    store: StoreArgs,
}

impl ServeArgs {
    fn host_config(&self) -> HostConfig {
        HostConfig {
            host: self.host.clone(),
            port: self.port,
            max_concurrency: self.max_concurrency,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            expose_docs: self.expose_docs,
            cors_origins: self.cors_origins.clone(),
            pool_size: self.pool_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..HostConfig::default()
        }
    }
}

impl StoreArgs {
    fn open(&self) -> anyhow::Result<MemoryStore> {
        match &self.data {
            Some(path) => MemoryStore::open(path)
                .with_context(|| format!("opening snapshot {}", path.display())),
            None => Ok(MemoryStore::new()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Migrate { action } => migrate(action).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    if let Some(addr) = args.metrics_addr {
        install_prometheus(addr)?;
        info!("Prometheus metrics on http://{addr}/metrics");
    }

    let store = args.store.open()?;
    let mut host = ServiceHost::new(args.host_config())?
        .with_storage(Arc::new(store))
        .with_telemetry(Arc::new(MetricsSink))
        .with_migrations(notes::migrations());
    host.mount(notes::routes())?;

    let mut handle = host.start().await?;
    info!("serving on http://{}", handle.local_addr());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            info!("interrupt received");
        }
        () = handle.wait() => warn!("dispatch loop exited on its own"),
    }

    let report = host.shutdown().await?;
    info!(
        drained = report.drained,
        abandoned_requests = report.abandoned_requests,
        abandoned_handlers = report.abandoned_handlers,
        "shutdown complete"
    );
    Ok(())
}

async fn migrate(action: MigrateAction) -> anyhow::Result<()> {
    let (store_args, apply) = match &action {
        MigrateAction::Apply(args) => (args, true),
        MigrateAction::Status(args) => (args, false),
    };
    let store = store_args.open()?;
    let pool = ConnectionPool::new(Arc::new(store), PoolConfig::default());
    let transactions = TransactionManager::new(pool.clone());
    let declared = notes::migrations();

    let output = if apply {
        let report = transactions.apply_migrations(&declared).await?;
        serde_json::to_string_pretty(&report)?
    } else {
        let status = transactions.migration_status(&declared).await?;
        serde_json::to_string_pretty(&serde_json::json!({
            "current_version": status.current_version,
            "pending_count": status.pending_count(),
            "pending": status.pending,
        }))?
    };
    println!("{output}");

    pool.close(Duration::from_secs(1)).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Notes API
// ---------------------------------------------------------------------------

mod notes {
    use super::{
        Deserialize, HandlerContext, HandlerError, HostRequest, HostResponse, Migration, Model,
        RouteGroup, Serialize, StatusCode,
    };

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Note {
        pub id: String,
        pub body: String,
    }

    impl Model for Note {
        const TABLE: &'static str = "notes";

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    #[derive(Deserialize)]
    struct NoteBody {
        body: String,
    }

    pub fn migrations() -> Vec<Migration> {
        vec![
            Migration::new(1, "create notes").create_table(Note::TABLE),
            Migration::new(2, "welcome note").put(
                Note::TABLE,
                "welcome",
                serde_json::json!({ "id": "welcome", "body": "hello from harbor" }),
            ),
        ]
    }

    pub fn routes() -> RouteGroup {
        RouteGroup::new("/notes")
            .get("/", list)
            .post("/", create)
            .get("/{id}", fetch)
            .put("/{id}", update)
            .delete("/{id}", remove)
    }

    fn id(ctx: &HandlerContext) -> Result<String, HandlerError> {
        ctx.param("id")
            .map(str::to_string)
            .ok_or_else(|| HandlerError::BadRequest("missing note id".into()))
    }

    async fn list(_req: HostRequest, ctx: HandlerContext) -> Result<HostResponse, HandlerError> {
        let mut tx = ctx.begin().await?;
        let notes = tx.all::<Note>().await?;
        tx.commit().await?;
        HostResponse::json(StatusCode::OK, &notes)
    }

    async fn create(req: HostRequest, ctx: HandlerContext) -> Result<HostResponse, HandlerError> {
        let note: Note = req.json()?;
        let mut tx = ctx.begin().await?;
        tx.create(&note).await?;
        tx.commit().await?;
        HostResponse::json(StatusCode::CREATED, &note)
    }

    async fn fetch(_req: HostRequest, ctx: HandlerContext) -> Result<HostResponse, HandlerError> {
        let id = id(&ctx)?;
        let mut tx = ctx.begin().await?;
        let note = tx.find::<Note>(&id).await?;
        tx.commit().await?;
        match note {
            Some(note) => HostResponse::json(StatusCode::OK, &note),
            None => Err(HandlerError::NotFound(format!("note {id}"))),
        }
    }

    async fn update(req: HostRequest, ctx: HandlerContext) -> Result<HostResponse, HandlerError> {
        let id = id(&ctx)?;
        let NoteBody { body } = req.json()?;
        let note = Note { id, body };
        let mut tx = ctx.begin().await?;
        tx.save(&note).await?;
        tx.commit().await?;
        HostResponse::json(StatusCode::OK, &note)
    }

    async fn remove(_req: HostRequest, ctx: HandlerContext) -> Result<HostResponse, HandlerError> {
        let id = id(&ctx)?;
        let mut tx = ctx.begin().await?;
        let existed = tx.remove::<Note>(&id).await?;
        tx.commit().await?;
        if existed {
            Ok(HostResponse::no_content())
        } else {
            Err(HandlerError::NotFound(format!("note {id}")))
        }
    }
}
