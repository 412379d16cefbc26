use std::{path::PathBuf, process, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shardbox::{
    allocation::{AllocationContext, DownloadOptions, UploadOptions},
    api,
    blobber::{HttpBlobber, StagedChange},
    chain::HttpChain,
    config::Config,
    context::CoreContext,
    crypto::Wallet,
    download::ByteRange,
    error::Error,
    fs::{DiskFs, FileSystem, HandleWriter, OpenMode},
    logging,
    marker::now_unix,
    stopper,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(author, version, about = "Shardbox")]
struct Cli {
    #[clap(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates a new wallet file.
    WalletInit {
        #[clap(long)]
        force: bool,
    },
    Upload {
        #[clap(long)]
        local: PathBuf,
        #[clap(long)]
        remote: String,
        /// Replace an existing object.
        #[clap(long)]
        update: bool,
        #[clap(long)]
        encrypt: bool,
        #[clap(long, default_value = "application/octet-stream")]
        mime_type: String,
        #[clap(long)]
        thumbnail: Option<PathBuf>,
    },
    Download {
        #[clap(long)]
        remote: String,
        #[clap(long)]
        local: PathBuf,
        #[clap(long, default_value = "0")]
        start: u64,
        /// Last byte, inclusive.
        #[clap(long)]
        end: Option<u64>,
    },
    Delete {
        #[clap(long)]
        remote: String,
    },
    Share {
        #[clap(long)]
        remote: String,
        /// Client the ticket is bound to.
        #[clap(long)]
        referee: Option<String>,
        /// Seconds the ticket stays valid; zero never expires.
        #[clap(long, default_value = "0")]
        expires_in: i64,
    },
    DownloadShared {
        #[clap(long)]
        ticket: String,
        #[clap(long)]
        local: PathBuf,
        /// Object inside a shared directory.
        #[clap(long)]
        path: Option<String>,
    },
    Repair {
        #[clap(long, default_value = "/")]
        remote: String,
    },
    Stats {
        #[clap(long)]
        remote: String,
    },
    Rename {
        #[clap(long)]
        remote: String,
        #[clap(long)]
        new_name: String,
    },
    Copy {
        #[clap(long)]
        remote: String,
        #[clap(long)]
        dest: String,
    },
    Move {
        #[clap(long)]
        remote: String,
        #[clap(long)]
        dest: String,
    },
    List {
        #[clap(long, default_value = "/")]
        remote: String,
    },
    CreateDir {
        #[clap(long)]
        remote: String,
    },
    /// Applies a JSON array of operations as one commit.
    Multi {
        #[clap(long)]
        ops: PathBuf,
    },
    /// Runs the HTTP range streaming front-end.
    Serve,
}

type HttpContext = AllocationContext<HttpBlobber, HttpChain>;

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_wallet(config: &Config) -> Result<Wallet, Error> {
    let bytes = std::fs::read(&config.wallet_path).map_err(|e| {
        Error::not_initialized(format!(
            "cannot read wallet {}: {}",
            config.wallet_path.display(),
            e
        ))
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::not_initialized(format!("malformed wallet: {}", e)))
}

async fn open_context(config: &Config) -> Result<HttpContext, Error> {
    let credentials = load_wallet(config)?.credentials()?;
    let allocation_id = config
        .allocation_id
        .clone()
        .ok_or_else(|| Error::invalid_parameter("--allocation-id is required"))?;
    let fs: Arc<dyn FileSystem> = Arc::new(DiskFs::new(&config.progress_dir)?);
    let mut core = CoreContext::new(Some(credentials), fs, config.sdk_config())?;
    if let Some(key) = config.encryption_key()? {
        core = core.with_encryption_key(key);
    }
    let chain = HttpChain::new(
        config.miner_urls.clone(),
        config.sharder_urls.clone(),
        &config.storage_sc_address,
        core.config.rpc_timeout,
    )?;
    AllocationContext::open(&allocation_id, chain, core, &config.storage_sc_address).await
}

async fn run(cli: Cli, cancel_token: CancellationToken) -> Result<()> {
    let config = cli.config;
    if let Command::WalletInit { force } = cli.command {
        if config.wallet_path.exists() && !force {
            return Err(Error::invalid_parameter(format!(
                "{} exists, pass --force to replace it",
                config.wallet_path.display()
            ))
            .into());
        }
        let wallet = Wallet::generate();
        std::fs::write(&config.wallet_path, serde_json::to_vec_pretty(&wallet)?)
            .with_context(|| format!("writing {}", config.wallet_path.display()))?;
        info!("Wallet {} written", wallet.client_id);
        return print(&serde_json::json!({ "client_id": wallet.client_id }));
    }

    let context = open_context(&config).await?;
    let cancel = cancel_token.clone();
    match cli.command {
        Command::WalletInit { .. } => Ok(()),
        Command::Upload {
            local,
            remote,
            update,
            encrypt,
            mime_type,
            thumbnail,
        } => {
            let thumbnail = thumbnail.map(std::fs::read).transpose()?;
            let options = UploadOptions::builder()
                .update(update)
                .encrypt(encrypt)
                .mime_type(mime_type)
                .maybe_thumbnail(thumbnail)
                .build();
            print(&context.upload_file(&local, &remote, options, cancel).await?)
        }
        Command::Download {
            remote,
            local,
            start,
            end,
        } => {
            let options = DownloadOptions::builder()
                .range(ByteRange::new(start, end))
                .build();
            let report = context.download_to_file(&remote, &local, options, cancel).await?;
            print(&serde_json::json!({
                "content_range": report.content_range(),
                "bytes_written": report.bytes_written,
            }))
        }
        Command::Delete { remote } => print(&context.delete(&remote, cancel).await?),
        Command::Share {
            remote,
            referee,
            expires_in,
        } => {
            let expiration = if expires_in > 0 { now_unix() + expires_in } else { 0 };
            let ticket = context
                .share(&remote, referee.as_deref(), expiration, None)
                .await?;
            println!("{}", ticket);
            Ok(())
        }
        Command::DownloadShared { ticket, local, path } => {
            let handle = context.core().fs.open(&local, OpenMode::Create)?;
            let mut sink = HandleWriter::new(handle);
            let report = context
                .download_shared(&ticket, path, &mut sink, DownloadOptions::default(), cancel)
                .await?;
            print(&serde_json::json!({
                "content_range": report.content_range(),
                "bytes_written": report.bytes_written,
            }))
        }
        Command::Repair { remote } => print(&context.repair(&remote, cancel).await?),
        Command::Stats { remote } => print(&context.file_stats(&remote).await?),
        Command::Rename { remote, new_name } => {
            print(&context.rename(&remote, &new_name, cancel).await?)
        }
        Command::Copy { remote, dest } => print(&context.copy(&remote, &dest, cancel).await?),
        Command::Move { remote, dest } => {
            print(&context.move_object(&remote, &dest, cancel).await?)
        }
        Command::List { remote } => print(&context.list(&remote).await?),
        Command::CreateDir { remote } => print(&context.create_dir(&remote, cancel).await?),
        Command::Multi { ops } => {
            let ops: Vec<StagedChange> = serde_json::from_slice(&std::fs::read(&ops)?)?;
            print(&context.do_multi_operation(ops, cancel).await?)
        }
        Command::Serve => {
            let env = api::Env {
                context: Arc::new(context),
                cancel_token: cancel_token.clone(),
            };
            api::run(env, config.api_port).await?.await?;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::setup(cli.config.log_format);
    let cancel_token = CancellationToken::new();
    let stopper_handle = stopper::run(cancel_token.clone());
    let code = match run(cli, cancel_token.clone()).await {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<Error>() {
            Some(error) => {
                eprintln!("{}: {}", error.kind(), error.message());
                error.exit_code()
            }
            None => {
                eprintln!("internal: {:#}", e);
                1
            }
        },
    };
    cancel_token.cancel();
    let _ = stopper_handle.await;
    process::exit(code);
}
