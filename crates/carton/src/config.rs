use std::env;

use anyhow::Result;
use carton_core::store::s3::{S3Config, S3Storage};
use tokio_util::sync::CancellationToken;
use url::Url;

const S3_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const S3_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const S3_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const S3_REGION: &str = "AWS_REGION";
const S3_ENDPOINT: &str = "AWS_ENDPOINT_URL_S3";

const DEFAULT_S3_REGION: &str = "us-east-1";

pub fn parse_s3_config_from_env(bucket: String, prefix: Option<String>) -> Result<S3Config> {
    Ok(S3Config {
        key: env::var(S3_ACCESS_KEY_ID)
            .map_err(|_| anyhow::anyhow!("{} env var not supplied", S3_ACCESS_KEY_ID))?,
        region: env::var(S3_REGION).unwrap_or_else(|_| DEFAULT_S3_REGION.to_string()),
        endpoint: env::var(S3_ENDPOINT).unwrap_or_else(|_| {
            format!(
                "https://s3.dualstack.{}.amazonaws.com",
                env::var(S3_REGION).unwrap_or_else(|_| DEFAULT_S3_REGION.to_string())
            )
        }),
        secret: env::var(S3_SECRET_ACCESS_KEY)
            .map_err(|_| anyhow::anyhow!("{} env var not supplied", S3_SECRET_ACCESS_KEY))?,
        token: env::var(S3_SESSION_TOKEN).ok(),
        bucket,
        bucket_prefix: prefix,
    })
}

/// Split an `s3://bucket[/prefix]` store address into bucket and prefix.
pub fn parse_store_address(store: &str) -> Result<(String, Option<String>)> {
    let url = Url::parse(store)?;
    if url.scheme() != "s3" {
        anyhow::bail!("unsupported store address {store:?}; expected s3://bucket[/prefix]");
    }
    let bucket = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("store address {store:?} has no bucket"))?
        .to_owned();
    let prefix = url.path().trim_start_matches('/').trim_end_matches('/');
    let prefix = (!prefix.is_empty()).then(|| prefix.to_owned());
    Ok((bucket, prefix))
}

pub fn storage_from_store_address(store: &str, token: CancellationToken) -> Result<S3Storage> {
    let (bucket, prefix) = parse_store_address(store)?;
    let config = parse_s3_config_from_env(bucket, prefix)?;
    Ok(S3Storage::new(config).with_cancellation_token(token))
}
