use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Registry;

use sonoaudio::{ChannelPool, MasterGain, SessionController};
use sonoconfig::get_config;
use sonoserver::{create_router, AppState};
use sonotheme::FolderThemeSupplier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing en place avant tout le reste : le chargement de la
    // configuration émet déjà des logs
    let subscriber = Registry::default().with(
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true),
    );
    tracing::subscriber::set_global_default(subscriber)?;

    let config = get_config();
    let params = config.engine_params();
    let base_url = config.get_base_url();
    let port = config.get_http_port();

    info!("🎧 Sonorium starting");
    info!(
        sample_rate = params.sample_rate,
        bitrate = params.bitrate,
        max_channels = params.max_channels,
        base_url = %base_url,
        "engine configuration"
    );

    // Bibliothèque de thèmes
    let supplier = Arc::new(FolderThemeSupplier::new(
        config.get_themes_root(),
        params.sample_rate,
        config.theme_tuning(),
    ));
    match supplier.reload() {
        Ok(count) => info!(themes = count, "theme library ready"),
        Err(e) => tracing::warn!("theme library scan failed, starting empty: {e}"),
    }

    // Vérification du backend d'encodage : sans lui, inutile de démarrer
    sonoaudio::Mp3Encoder::new(params.sample_rate, params.bitrate)
        .map_err(|e| anyhow::anyhow!("fatal: encoder backend failed to initialize: {e}"))?;

    // Moteur : gain maître, pool de canaux, contrôleur de sessions
    let master_gain = MasterGain::new(params.master_gain);
    let pool = ChannelPool::new(params, master_gain.clone());
    let sessions = SessionController::new(
        pool.clone(),
        supplier.clone(),
        base_url,
        config.data().sessions.max_sessions,
        config.data().sessions.default_volume,
    );

    let shutdown = CancellationToken::new();
    pool.spawn_reaper(shutdown.clone());

    // Bus d'enceintes : les transports (DLNA, AirPlay, Chromecast...)
    // s'abonnent ici. Sans transport branché, on trace les événements.
    let mut events = sessions.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                session = %event.session_id,
                action = ?event.action,
                url = event.stream_url.as_deref().unwrap_or("-"),
                targets = event.speaker_targets.len(),
                "speaker transport event"
            );
        }
    });

    // Surface HTTP
    let reload_supplier = supplier.clone();
    let router = create_router(AppState {
        sessions,
        master_gain,
        reload_themes: Arc::new(move || reload_supplier.reload()),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "✅ Sonorium listening");

    axum::serve(listener, router)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = signal::ctrl_c().await;
                info!("shutdown requested");
                shutdown.cancel();
            }
        })
        .await?;

    info!("Sonorium stopped");
    Ok(())
}
