mod app;
mod config;
mod engine;
mod error;
mod hash;
mod http;
mod index;
mod lock;
mod lru;
mod nar_url;
mod narinfo;
mod netrc;
mod signing;
mod storage;
mod upstream;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing::subscriber::set_global_default;
        use tracing_subscriber::filter::EnvFilter;
        use tracing_subscriber::prelude::*;

        tracing_log::LogTracer::init().expect("failed to set logger");

        let env_filter = EnvFilter::try_from_env("CACHE_PROXY_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"))
            .add_directive("sqlx::query=warn".parse().unwrap());

        let formatting_layer =
            tracing_bunyan_formatter::BunyanFormattingLayer::new(PKG_NAME.into(), std::io::stdout);

        let subscriber = tracing_subscriber::Registry::default()
            .with(formatting_layer)
            .with(tracing_bunyan_formatter::JsonStorageLayer)
            .with(env_filter);

        set_global_default(subscriber).expect("failed to set subscriber");
    }

    tracing::info!("cache-proxy starting");

    let app = app::App::new().await?;
    app.run().await
}
