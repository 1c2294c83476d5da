use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Initialise the tracing subscriber.
pub fn init() -> Result<()> {
    Registry::default()
        .with(build_env_filter()?)
        .with(tracing_subscriber::fmt::layer().with_target(true).compact())
        .try_init()
        .map_err(|err| anyhow!("initialising tracing subscriber failed: {err}"))?;
    Ok(())
}

fn build_env_filter() -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("akash_rpc_proxy=info,hyper=warn,reqwest=warn"))
        .map_err(|err| anyhow!("building tracing filter failed: {err}"))
}
