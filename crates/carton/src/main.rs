use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use carton::cli::{print_containers, print_policy, print_url};
use carton::config::storage_from_store_address;
use carton_core::handles::BlobStorageExt;
use carton_core::path::BlobPath;
use carton_core::store::{
    AccessPolicy, BlobStorage, CreateContainerOptions, UrlOptions, WriteBlobOptions,
};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
struct Opts {
    #[clap(subcommand)]
    subcmd: CartonSubcommand,
}

#[derive(Subcommand)]
enum CartonSubcommand {
    /// List the containers in the store.
    Containers {
        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    CreateContainer {
        name: String,

        #[clap(long, default_value = "private")]
        access_policy: AccessPolicy,

        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    DeleteContainer {
        name: String,

        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    /// Show a container's access policy, optionally changing it first.
    Policy {
        name: String,

        #[clap(long)]
        set: Option<AccessPolicy>,

        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    /// Write a blob from a file, or from stdin when no file is given.
    Put {
        /// Blob address as container/name.
        path: String,

        #[clap(long)]
        file: Option<PathBuf>,

        #[clap(long)]
        content_type: Option<String>,

        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    /// Print a blob's content.
    Get {
        path: String,

        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    /// Delete a blob.
    Rm {
        path: String,

        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    /// Print a blob's URL.
    Url {
        path: String,

        /// Include a signed access token in the URL.
        #[clap(long)]
        access_token: bool,

        #[clap(long, env = "CARTON_STORE")]
        store: String,
    },

    Version,
}

async fn storage_for(store: &str, token: CancellationToken) -> Result<Arc<dyn BlobStorage>> {
    let storage = storage_from_store_address(store, token)?;
    storage.init().await.context("Failed to initialize store")?;
    Ok(Arc::new(storage))
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C signal handler");
            tracing::warn!("Interrupt received, aborting in-flight requests.");
            token.cancel();
        });
    }

    match &opts.subcmd {
        CartonSubcommand::Containers { store } => {
            let storage = storage_for(store, token).await?;
            let containers = storage.containers().await?;
            print_containers(&containers);
        }
        CartonSubcommand::CreateContainer {
            name,
            access_policy,
            store,
        } => {
            let storage = storage_for(store, token).await?;
            let created = storage
                .create_container(
                    name,
                    CreateContainerOptions {
                        access_policy: *access_policy,
                    },
                )
                .await?;
            if created {
                tracing::info!(container = %name, "Container created.");
            } else {
                tracing::info!(container = %name, "Container already exists.");
            }
        }
        CartonSubcommand::DeleteContainer { name, store } => {
            let storage = storage_for(store, token).await?;
            if storage.delete_container(name).await? {
                tracing::info!(container = %name, "Container deleted.");
            } else {
                tracing::warn!(container = %name, "Container did not exist.");
            }
        }
        CartonSubcommand::Policy { name, set, store } => {
            let storage = storage_for(store, token).await?;
            if let Some(policy) = set {
                storage.set_container_access_policy(name, *policy).await?;
            }
            let policy = storage.container_access_policy(name).await?;
            print_policy(name, policy);
        }
        CartonSubcommand::Put {
            path,
            file,
            content_type,
            store,
        } => {
            let storage = storage_for(store, token).await?;
            let path = BlobPath::parse(path)?;
            if let Some(file) = file {
                let content_type = content_type.clone().or_else(|| {
                    mime_guess::from_path(file)
                        .first_raw()
                        .map(str::to_string)
                });
                storage
                    .set_blob_contents_file(&path, file, WriteBlobOptions { content_type })
                    .await?;
            } else {
                let mut stdin = tokio::io::stdin();
                let mut contents = String::new();
                stdin.read_to_string(&mut contents).await?;
                storage
                    .set_blob_contents_string(
                        &path,
                        &contents,
                        WriteBlobOptions {
                            content_type: content_type.clone(),
                        },
                    )
                    .await?;
            }
            tracing::info!(blob = %path, "Blob written.");
        }
        CartonSubcommand::Get { path, store } => {
            let storage = storage_for(store, token).await?;
            let path = BlobPath::parse(path)?;
            let contents = storage.blob_contents_string(&path).await?;
            print!("{}", contents);
        }
        CartonSubcommand::Rm { path, store } => {
            let storage = storage_for(store, token).await?;
            let path = BlobPath::parse(path)?;
            if storage.delete_blob(&path).await? {
                tracing::info!(blob = %path, "Blob deleted.");
            } else {
                tracing::warn!(blob = %path, "Blob did not exist.");
            }
        }
        CartonSubcommand::Url {
            path,
            access_token,
            store,
        } => {
            let storage = storage_for(store, token).await?;
            let path = BlobPath::parse(path)?;
            let url = storage.blob_url(
                &path,
                &UrlOptions {
                    include_access_token: *access_token,
                },
            )?;
            print_url(&url);
        }
        CartonSubcommand::Version => {
            println!("{}", VERSION);
        }
    }

    Ok(())
}
