pub use super::error::Error;
use super::{
    cache::ResolverCache,
    config::AppConfig,
    did::DidResolver,
    endpoints,
    handle::{DnsTxtLookup, HandleResolver, HttpsWellKnownLookup},
    identity::IdentityResolver,
    inspect::Inspector,
    plc::PlcClient,
    syntax::{AtUri, Identifier, Nsid, classify},
    xrpc::PdsClient,
};
use anyhow::Context as _;
use axum::Router;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity, log::LevelFilter};
use figment::{Figment, providers::Format as _};
use http_cache_reqwest::{CacheMode, HttpCacheOptions, MokaManager};
use serde::Serialize;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// The application user agent. Concatenates the package name and version. e.g. `atprobe/0.0.0`.
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// The application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
/// The reqwest client type with middleware.
pub type Client = reqwest_middleware::ClientWithMiddleware;

#[derive(Parser, Debug, Clone)]
/// Command line arguments.
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "default.toml")]
    pub config: PathBuf,
    /// The verbosity level.
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
    /// What to do. Serves the HTTP API when omitted.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Resolve a handle or DID to its identity.
    Resolve { identifier: String },
    /// Fetch a record by AT URI and verify its proof.
    Record {
        uri: String,
        /// Skip proof verification.
        #[arg(long)]
        no_verify: bool,
    },
    /// Verify the proof of a record by AT URI.
    Verify { uri: String },
    /// Show the PLC operation history of an identity.
    History { identifier: String },
    /// List the collections of a repository.
    Collections { identifier: String },
    /// List the records of a collection.
    List {
        identifier: String,
        collection: String,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long)]
        limit: Option<u16>,
    },
    /// Serve the HTTP API.
    Serve,
}

/// The application state, shared across all routes.
pub struct AppState<T = DnsTxtLookup, W = HttpsWellKnownLookup> {
    /// The application configuration.
    pub(crate) config: Arc<AppConfig>,
    /// The resolution pipeline.
    pub inspector: Arc<Inspector<T, W>>,
}

impl<T, W> Clone for AppState<T, W> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            inspector: Arc::clone(&self.inspector),
        }
    }
}

/// Build the resolution pipeline from configuration.
///
/// `blob_client` may cache responses. Everything else goes through `client`, leaving
/// [`ResolverCache`] as the only cache of identities.
pub fn build_inspector(
    config: &AppConfig,
    client: reqwest::Client,
    blob_client: Client,
) -> Inspector {
    let cache = ResolverCache::new(&config.cache);
    let timeouts = &config.timeouts;

    let handles = HandleResolver::new(
        DnsTxtLookup::from_system_conf(),
        HttpsWellKnownLookup::new(client.clone()),
        cache.clone(),
        timeouts.handle(),
        timeouts.https(),
    );
    let dids = DidResolver::new(
        client.clone(),
        config.plc_directory.clone(),
        timeouts.did(),
        cache,
    );

    Inspector::new(
        IdentityResolver::new(handles, dids),
        PdsClient::new(client.clone(), blob_client, timeouts.request()),
        PlcClient::new(client, config.plc_directory.clone(), timeouts.request()),
    )
}

#[expect(clippy::print_stdout, reason = "command output goes to stdout")]
fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

/// Run a single command and print its result.
async fn run_command(inspector: &Inspector, command: Command) -> anyhow::Result<()> {
    let identifier = |s: &str| -> anyhow::Result<Identifier> {
        classify(s).with_context(|| format!("invalid identifier {s:?}"))
    };
    let uri = |s: &str| -> anyhow::Result<AtUri> {
        s.parse().with_context(|| format!("invalid AT URI {s:?}"))
    };

    match command {
        Command::Resolve { identifier: id } => {
            let identity = inspector.identity(&identifier(&id)?).await?;
            print_json(&identity)
        }
        Command::Record { uri: u, no_verify } => {
            let report = inspector.record(&uri(&u)?, !no_verify).await?;
            print_json(&report)
        }
        Command::Verify { uri: u } => {
            let record = inspector.verify(&uri(&u)?).await?;
            info!(commit = %record.commit, "record verified");
            print_json(&crate::verify::Verification::from(Ok::<_, Error>(record)))
        }
        Command::History { identifier: id } => {
            print_json(&inspector.history(&identifier(&id)?).await?)
        }
        Command::Collections { identifier: id } => {
            print_json(&inspector.collections(&identifier(&id)?).await?)
        }
        Command::List {
            identifier: id,
            collection,
            cursor,
            limit,
        } => {
            let collection = Nsid::new(collection).context("invalid collection")?;
            let page = inspector
                .list_records(&identifier(&id)?, &collection, cursor.as_deref(), limit)
                .await?;
            print_json(&page)
        }
        Command::Serve => anyhow::bail!("serve is not a one-shot command"),
    }
}

async fn serve(config: AppConfig, inspector: Inspector) -> anyhow::Result<()> {
    let addr = config
        .listen_address
        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

    let app = Router::new()
        .merge(endpoints::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            config: Arc::new(config),
            inspector: Arc::new(inspector),
        });

    info!("listening on {addr}");
    info!("connect to: http://127.0.0.1:{}", addr.port());

    let listener = TcpListener::bind(&addr)
        .await
        .context("failed to bind address")?;

    axum::serve(listener, app.into_make_service())
        .await
        .context("failed to serve app")
}

/// The main application entry point.
pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up trace logging to console and account for the user-provided verbosity flag.
    if args.verbosity.log_level_filter() != LevelFilter::Off {
        let lvl = match args.verbosity.log_level_filter() {
            LevelFilter::Error => tracing::Level::ERROR,
            LevelFilter::Warn => tracing::Level::WARN,
            LevelFilter::Info | LevelFilter::Off => tracing::Level::INFO,
            LevelFilter::Debug => tracing::Level::DEBUG,
            LevelFilter::Trace => tracing::Level::TRACE,
        };
        // Command output goes to stdout, so logs go to stderr.
        tracing_subscriber::fmt()
            .with_max_level(lvl)
            .with_writer(std::io::stderr)
            .init();
    }

    if !args.config.exists() {
        // Not fatal: every setting has a default or can come from the environment.
        warn!(
            "configuration file {} does not exist",
            args.config.display()
        );
    }

    // Read and parse the user-provided configuration.
    let config: AppConfig = Figment::new()
        .admerge(figment::providers::Toml::file(&args.config))
        .admerge(figment::providers::Env::prefixed("ATPROBE_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // Initialize metrics reporting.
    super::metrics::setup(config.metrics.as_ref()).context("failed to set up metrics exporter")?;

    // Only blobs go through the HTTP cache.
    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.as_deref().unwrap_or(APP_USER_AGENT))
        .build()
        .context("failed to build requester client")?;
    let blob_client = reqwest_middleware::ClientBuilder::new(client.clone())
        .with(http_cache_reqwest::Cache(http_cache_reqwest::HttpCache {
            mode: CacheMode::Default,
            manager: MokaManager::default(),
            options: HttpCacheOptions::default(),
        }))
        .build();

    let inspector = build_inspector(&config, client, blob_client);

    match args.command {
        None | Some(Command::Serve) => serve(config, inspector).await,
        Some(command) => run_command(&inspector, command).await,
    }
}
