mod admin;
mod api;

use anyhow::Context as _;

use crate::app;

#[derive(Debug)]
pub struct Server {
    router: axum::Router<app::State>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

impl Server {
    #[tracing::instrument(name = "server_init", skip_all)]
    pub fn new(shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> Self {
        use tower_http::catch_panic::CatchPanicLayer;
        use tower_http::trace::TraceLayer;

        let router = api::router()
            .nest("/admin", admin::router())
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::new());

        Self {
            router,
            shutdown_rx,
        }
    }

    pub async fn run(self, state: app::State) -> anyhow::Result<()> {
        let server = axum::Server::bind(&"0.0.0.0:8080".parse().unwrap())
            .serve(self.router.with_state(state).into_make_service())
            .with_graceful_shutdown(async {
                self.shutdown_rx.await.ok();
            });

        tracing::info!("starting http server on 0.0.0.0:8080");

        server.await.context("http server error")?;

        Ok(())
    }
}
