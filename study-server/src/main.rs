use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = study_server::config::load().snapshot();
    let app = study_server::build(&config).await?;

    let host = config.get_string("http.host").unwrap_or_else(|| "127.0.0.1".to_string());
    let port = config.get_string("http.port").unwrap_or_else(|| "3036".to_string());
    let addr = format!("{host}:{port}");

    app.listen(addr).await?;

    Ok(())
}
