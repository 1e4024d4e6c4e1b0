use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use anyhow::Context;
use stamp_core::Settings;
use stamp_server::{build_state, handlers};
use tracing_subscriber::EnvFilter;

const GC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env().context("loading configuration")?;
    let host = settings.server.host.clone();
    let port = settings.server.port;

    let state = build_state(settings).await.context("building app state")?;

    // Expired turns are swept once at startup and then daily.
    let gc_store = Arc::clone(&state.conversations);
    let expire_days = state.settings.conversation.expire_days;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        loop {
            ticker.tick().await;
            match gc_store.gc(expire_days).await {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(deleted, "conversation gc removed expired turns");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "conversation gc failed"),
            }
        }
    });

    let data = web::Data::new(state);

    tracing::info!(host, port, "starting knowledge chat server");
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(data.clone())
            .service(
                web::scope("/api")
                    .route(
                        "/knowledge_chat",
                        web::post().to(handlers::knowledge_chat),
                    )
                    .route(
                        "/knowledge_chat_conversation",
                        web::post().to(handlers::knowledge_chat_conversation),
                    )
                    .route(
                        "/health",
                        web::get().to(|| async { HttpResponse::Ok().body("ok") }),
                    ),
            )
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    Ok(())
}
