pub mod cli;
pub mod config;
mod info;

use {
    crate::{
        cli::{Cli, Command},
        config::Config,
        info::{print_cache_stats, print_listing, print_metadata, print_mirror_results},
    },
    anyhow::{Context as _, Result, ensure},
    cloakfs_protocol::{
        Backend, LogicalPath, settings::CacheSettings, util::stream_file,
    },
    cloakfs_sdk::{ConnectOptions, Connection, LocalBackend, RemoveOptions, close_all},
    futures::TryStreamExt,
    std::{
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
    tokio::io::{AsyncWrite, AsyncWriteExt},
    tracing::{debug, info, warn},
    tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt},
};

/// Logs to stderr, and additionally to `log_file` if it's set.
pub fn setup_logger(log_file: Option<&Path>, log_filter: &str) -> Result<()> {
    let file_layer = log_file
        .map(|path| -> Result<_> {
            let file = fs_err::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok(tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)))
        })
        .transpose()?;
    let term_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(file_layer)
        .with(term_layer)
        .with(EnvFilter::try_new(log_filter)?)
        .init();
    Ok(())
}

pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let options = ConnectOptions {
        identity: config.identity(),
        read_only: config.read_only,
        cache: config.cache.clone(),
        encryption: config.resolve_encryption()?,
    };
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(&config.storage_root));
    let connection = Connection::open(backend, options).await?;
    let result = handle_command(cli.command, &connection, &config).await;
    connection.destroy().await;
    close_all().await;
    result
}

async fn handle_command(command: Command, connection: &Connection, config: &Config) -> Result<()> {
    match command {
        Command::Ls { path, recursive } => {
            let entries = connection.list(&path, recursive).await?;
            print_listing(&path, &entries, recursive);
        }
        Command::Stat { path } => {
            print_metadata(&connection.metadata(&path).await?);
        }
        Command::Get { path, local_path } => {
            let written = if let Some(local_path) = local_path {
                let mut file = fs_err::tokio::File::create(&local_path).await?;
                let written = download(connection, &path, &mut file).await?;
                file.sync_all().await?;
                info!("downloaded {path} to {} ({written} bytes)", local_path.display());
                written
            } else {
                download(connection, &path, &mut tokio::io::stdout()).await?
            };
            debug!(%path, written, "download finished");
        }
        Command::Put { local_path, path } => {
            upload(connection, config, &local_path, &path).await?;
        }
        Command::Rm {
            path,
            recursive,
            quiet,
        } => {
            let removed = connection
                .remove(&path, RemoveOptions { recursive, quiet })
                .await?;
            for entry in &removed {
                debug!("removed {entry}");
            }
            info!("removed {} entries", removed.len());
        }
        Command::Import { local_dir, path } => {
            import(connection, local_dir, &path).await?;
        }
        Command::Flush => {
            connection.flush().await;
            info!("cache flushed");
        }
        Command::Stats => {
            print_cache_stats(connection.cache_stats());
        }
    }
    Ok(())
}

async fn download(
    connection: &Connection,
    path: &LogicalPath,
    output: &mut (impl AsyncWrite + Unpin),
) -> Result<u64> {
    let mut stream = connection.read(path).await?;
    let mut written = 0_u64;
    while let Some(chunk) = stream.try_next().await? {
        output.write_all(&chunk).await?;
        written = written.saturating_add(u64::try_from(chunk.len())?);
    }
    output.flush().await?;
    Ok(written)
}

async fn upload(
    connection: &Connection,
    config: &Config,
    local_path: &Path,
    path: &LogicalPath,
) -> Result<()> {
    let metadata = fs_err::metadata(local_path)?;
    ensure!(metadata.is_file(), "{} is not a file", local_path.display());
    if metadata.len() > config.warn_about_files_larger_than.as_u64() {
        warn!(
            "uploading large file {} ({} bytes)",
            local_path.display(),
            metadata.len()
        );
    }
    let file = fs_err::File::open(local_path)?;
    let written = connection
        .write(path, stream_file(file))
        .await
        .with_context(|| format!("failed to upload {}", local_path.display()))?;
    info!("uploaded {} to {path} ({written} bytes)", local_path.display());
    Ok(())
}

async fn import(connection: &Connection, local_dir: PathBuf, path: &LogicalPath) -> Result<()> {
    let metadata = fs_err::metadata(&local_dir)?;
    ensure!(metadata.is_dir(), "{} is not a directory", local_dir.display());
    let source = Connection::open(
        Arc::new(LocalBackend::new(&local_dir)),
        ConnectOptions {
            identity: local_dir.display().to_string(),
            read_only: true,
            cache: CacheSettings::disabled(),
            encryption: None,
        },
    )
    .await?;
    let results = connection.mirror(&source, path, &LogicalPath::root()).await;
    source.destroy().await;
    let results = results?;
    print_mirror_results(&results);
    ensure!(results.errors == 0, "failed to import {} files", results.errors);
    Ok(())
}
