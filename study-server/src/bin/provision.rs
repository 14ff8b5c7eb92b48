//! `provision <alias>...`: create each tenant database and its schema.

use anyhow::{bail, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let aliases: Vec<String> = std::env::args().skip(1).collect();
    if aliases.is_empty() {
        bail!("usage: provision <alias>...");
    }

    let config = study_server::config::load().snapshot();
    let parts = study_server::collaborators(&config).await?;

    let mut failed = 0usize;
    for alias in &aliases {
        match parts.registry.create_tenant_database(alias).await {
            Ok(()) => info!(%alias, "tenant database ready"),
            Err(err) => {
                failed += 1;
                error!(%alias, %err, "provisioning failed");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} tenant databases failed to provision", aliases.len());
    }
    Ok(())
}
