//! `ferry`: coordinating server, transfer clients and administration.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ferry_client::{ClientSession, DownloadClient, Transfer, UploadClient};
use ferry_core::TokenClaims;
use ferry_core::config::{AppConfig, ClientConfig};
use ferry_metadata::{MetadataStore, NewStorageProvider, StorageProviderRepo};
use ferry_server::{ProviderStorageFactory, ServerHandle};
use ferry_signer::{KeyPair, PublicKey, TokenSigner, TokenVerifier};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Multipart, resumable, verified file transfers through object storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct DatabaseArgs {
    /// Ledger database type
    #[arg(long, value_parser = ["sqlite", "postgres"])]
    database_type: Option<String>,

    /// Ledger connection string (a file path for sqlite)
    #[arg(long)]
    connection_string: Option<String>,
}

#[derive(Args, Clone, Debug)]
struct SessionArgs {
    /// Coordinating server URL
    #[arg(long, env = "FERRY_ENDPOINT")]
    endpoint: String,

    /// Session token from `ferry create-token`
    #[arg(long, env = "FERRY_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TokenType {
    Upload,
    Download,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the ledger schema
    Synchronize {
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Register an S3-compatible storage provider
    AddStorageProvider {
        /// Provider id referenced by upload tokens
        #[arg(long)]
        id: String,
        /// Storage endpoint host
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        region: String,
        #[arg(long)]
        access_key_id: String,
        #[arg(long, env = "FERRY_SECRET_ACCESS_KEY", hide_env_values = true)]
        secret_access_key: String,
        /// Location constraint used when creating buckets
        #[arg(long)]
        bucket_location_constraint: Option<String>,
        /// Download URL template with {bucket} and {key} placeholders
        #[arg(long)]
        download_url_template: Option<String>,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Sign a session token, generating the key pair if needed
    CreateToken {
        /// Secret key file; the public key is written to <file>.pub
        #[arg(long)]
        private_key_file: PathBuf,
        /// Key name used when generating a new key pair
        #[arg(long, default_value = "ferry")]
        key_name: String,
        #[arg(long = "type", value_enum)]
        token_type: TokenType,
        /// Upload scope name
        #[arg(long)]
        name: Option<String>,
        /// Storage provider for uploads
        #[arg(long)]
        storage_provider_id: Option<String>,
    },
    /// Run the coordinating server
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Public key used to verify session tokens
        #[arg(long)]
        public_key_file: Option<PathBuf>,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Upload a file or directory tree
    UploadClient {
        #[command(flatten)]
        session: SessionArgs,
        /// File or directory to upload
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        num_threads: Option<usize>,
        #[arg(long)]
        min_part_size: Option<u64>,
        #[arg(long)]
        max_part_count: Option<u64>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Receive broadcast parts into a local directory until interrupted
    DownloadClient {
        #[command(flatten)]
        session: SessionArgs,
        /// Destination root; files land in <path>/<name>/<file path>
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        num_threads: Option<usize>,
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Cli { command } = Cli::parse();

    match command {
        Commands::Synchronize { database, config } => handle_synchronize(&database, &config).await,
        Commands::AddStorageProvider {
            id,
            endpoint,
            region,
            access_key_id,
            secret_access_key,
            bucket_location_constraint,
            download_url_template,
            database,
            config,
        } => {
            let provider = NewStorageProvider {
                id,
                endpoint,
                region,
                access_key_id,
                secret_access_key,
                bucket_location_constraint,
                download_url_template,
            };
            handle_add_storage_provider(provider, &database, &config).await
        }
        Commands::CreateToken {
            private_key_file,
            key_name,
            token_type,
            name,
            storage_provider_id,
        } => {
            let token = create_token(
                &private_key_file,
                &key_name,
                token_type,
                name,
                storage_provider_id,
            )?;
            println!("{token}");
            Ok(())
        }
        Commands::Serve {
            port,
            public_key_file,
            database,
            config,
        } => handle_serve(port, public_key_file, &database, &config).await,
        Commands::UploadClient {
            session,
            path,
            num_threads,
            min_part_size,
            max_part_count,
            config,
        } => {
            let mut app = load_config(&config)?;
            apply_client_overrides(&mut app.client, num_threads, min_part_size, max_part_count);
            config::validate(&app)?;
            handle_upload(&session, path, app.client).await
        }
        Commands::DownloadClient {
            session,
            path,
            num_threads,
            config,
        } => {
            let mut app = load_config(&config)?;
            apply_client_overrides(&mut app.client, num_threads, None, None);
            config::validate(&app)?;
            handle_download(&session, path, app.client).await
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<AppConfig> {
    config::load(args.config.as_deref())
}

async fn open_ledger(
    database: &DatabaseArgs,
    args: &ConfigArgs,
) -> Result<(AppConfig, Arc<dyn MetadataStore>)> {
    let mut app = load_config(args)?;
    config::apply_database(
        &mut app,
        database.database_type.as_deref(),
        database.connection_string.as_deref(),
    )?;
    config::validate(&app)?;
    let metadata = ferry_metadata::from_config(&app.metadata)
        .await
        .context("failed to open ledger")?;
    Ok((app, metadata))
}

async fn handle_synchronize(database: &DatabaseArgs, args: &ConfigArgs) -> Result<()> {
    let (_, metadata) = open_ledger(database, args).await?;
    metadata.migrate().await.context("migration failed")?;
    tracing::info!("ledger schema is up to date");
    Ok(())
}

async fn handle_add_storage_provider(
    provider: NewStorageProvider,
    database: &DatabaseArgs,
    args: &ConfigArgs,
) -> Result<()> {
    anyhow::ensure!(!provider.id.is_empty(), "--id must not be empty");
    let (_, metadata) = open_ledger(database, args).await?;
    metadata
        .add_storage_provider(&provider)
        .await
        .with_context(|| format!("failed to add storage provider {}", provider.id))?;
    tracing::info!(id = %provider.id, endpoint = %provider.endpoint, "storage provider added");
    Ok(())
}

fn create_token(
    private_key_file: &std::path::Path,
    key_name: &str,
    token_type: TokenType,
    name: Option<String>,
    storage_provider_id: Option<String>,
) -> Result<String> {
    let claims = match token_type {
        TokenType::Upload => {
            let name = name.context("--name is required for upload tokens")?;
            let storage_provider_id = storage_provider_id
                .context("--storage-provider-id is required for upload tokens")?;
            TokenClaims::upload(name, storage_provider_id)
        }
        TokenType::Download => TokenClaims::download(),
    };
    let keypair = KeyPair::load_or_generate(private_key_file, key_name).with_context(|| {
        format!(
            "failed to load signing key from {}",
            private_key_file.display()
        )
    })?;
    TokenSigner::new(keypair)
        .sign(&claims)
        .context("failed to sign token")
}

async fn handle_serve(
    port: Option<u16>,
    public_key_file: Option<PathBuf>,
    database: &DatabaseArgs,
    args: &ConfigArgs,
) -> Result<()> {
    let (mut app, metadata) = open_ledger(database, args).await?;
    if let Some(port) = port {
        app.server.port = port;
    }
    if let Some(path) = public_key_file {
        app.server.public_key_file = Some(path);
    }

    let key_path = app
        .server
        .public_key_file
        .clone()
        .context("--public-key-file is required")?;
    let (key_name, public_key) = PublicKey::load(&key_path)
        .with_context(|| format!("failed to read public key {}", key_path.display()))?;
    tracing::info!(key = %key_name, "loaded token verification key");

    metadata
        .health_check()
        .await
        .context("ledger health check failed (run `ferry synchronize` first)")?;

    let storage = Arc::new(ProviderStorageFactory::new(app.server.storage.clone()));
    let handle = ServerHandle::start(
        app.server,
        metadata,
        TokenVerifier::new(public_key),
        storage,
    )
    .await
    .context("failed to start server")?;

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
    });
    handle.wait().await;
    tracing::info!("server stopped");
    Ok(())
}

fn apply_client_overrides(
    client: &mut ClientConfig,
    num_threads: Option<usize>,
    min_part_size: Option<u64>,
    max_part_count: Option<u64>,
) {
    if let Some(n) = num_threads {
        client.num_threads = n;
    }
    if let Some(size) = min_part_size {
        client.min_part_size = size;
    }
    if let Some(count) = max_part_count {
        client.max_part_count = count;
    }
}

fn http_client(config: &ClientConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.request_timeout())
        .build()
        .context("failed to build HTTP client")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, finishing in-flight transfers");
            token.cancel();
        }
    });
    cancel
}

async fn handle_upload(session: &SessionArgs, path: PathBuf, config: ClientConfig) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (client_session, _incoming) =
        ClientSession::connect(&session.endpoint, &session.token, None, &cancel)
            .await
            .context("failed to open upload session")?;
    let transfer = Transfer::new(http_client(&config)?, config.max_retries);
    let uploader = UploadClient::new(config, client_session.clone(), transfer)?;

    let result = tokio::select! {
        result = uploader.upload_path(&path) => result.context("upload failed"),
        _ = cancel.cancelled() => Err(anyhow::anyhow!("upload interrupted")),
    };
    client_session.close().await;

    let summary = result?;
    println!(
        "{} files: {} parts uploaded, {} already stored, {} failed ({} bytes)",
        summary.files, summary.uploaded, summary.skipped, summary.failed, summary.bytes
    );
    anyhow::ensure!(summary.failed == 0, "{} parts failed to upload", summary.failed);
    Ok(())
}

async fn handle_download(session: &SessionArgs, path: PathBuf, config: ClientConfig) -> Result<()> {
    tokio::fs::create_dir_all(&path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;

    let cancel = cancel_on_ctrl_c();
    let (client_session, incoming) =
        ClientSession::connect(&session.endpoint, &session.token, None, &cancel)
            .await
            .context("failed to open download session")?;
    let transfer = Transfer::new(http_client(&config)?, config.max_retries);
    let downloader = DownloadClient::new(config, path, client_session, incoming, transfer)?;

    let summary = downloader.run(cancel).await.context("download client failed")?;
    println!(
        "{} parts downloaded, {} files verified, {} failed ({} bytes)",
        summary.downloaded, summary.verified, summary.failed, summary.bytes
    );
    Ok(())
}
