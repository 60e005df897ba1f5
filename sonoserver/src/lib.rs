//! # sonoserver - Surface HTTP de Sonorium
//!
//! Deux façades sur le moteur :
//!
//! - `GET /channel_stream/{channel_id}` : le flux MP3 d'un canal, chunked et
//!   sans fin ; chaque connexion reçoit son propre encodeur ;
//! - `/api/...` : le plan de contrôle REST (canaux, thèmes, sessions, gain
//!   maître), documenté via OpenAPI.
//!
//! La couche HTTP possède le cycle de vie des connexions ; le moteur ne voit
//! qu'un auditeur attaché puis détaché.

mod api;
mod stream;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use utoipa::OpenApi;

use sonoaudio::{MasterGain, SessionController};

/// État partagé des handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionController>,
    pub master_gain: MasterGain,
    pub reload_themes: Arc<dyn Fn() -> Result<usize, sonoaudio::EngineError> + Send + Sync>,
}

/// Documentation OpenAPI du plan de contrôle
#[derive(OpenApi)]
#[openapi(
    paths(
        api::list_channels,
        api::load_channel_theme,
        api::stop_channel,
        api::list_themes,
        api::reload_themes,
        api::list_sessions,
        api::create_session,
        api::get_session,
        api::update_session,
        api::delete_session,
        api::play_session,
        api::stop_session,
        api::set_session_volume,
        api::stop_all_sessions,
        api::set_master_gain,
    ),
    components(schemas(
        api::ChannelResponse,
        api::SessionResponse,
        api::LoadThemeRequest,
        api::CreateSessionRequest,
        api::UpdateSessionRequest,
        api::VolumeRequest,
        api::MasterGainRequest,
        api::ReloadResponse,
        api::StopAllResponse,
    )),
    tags((name = "sonorium", description = "Contrôle du serveur d'ambiances"))
)]
pub struct ApiDoc;

/// Construit le router complet
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/channel_stream/{channel_id}", get(stream::channel_stream))
        .route("/api/channels", get(api::list_channels))
        .route(
            "/api/channels/{channel_id}/theme",
            post(api::load_channel_theme),
        )
        .route("/api/channels/{channel_id}/stop", post(api::stop_channel))
        .route("/api/themes", get(api::list_themes))
        .route("/api/themes/reload", post(api::reload_themes))
        .route(
            "/api/sessions",
            get(api::list_sessions).post(api::create_session),
        )
        .route(
            "/api/sessions/{session_id}",
            get(api::get_session)
                .put(api::update_session)
                .delete(api::delete_session),
        )
        .route("/api/sessions/{session_id}/play", post(api::play_session))
        .route("/api/sessions/{session_id}/stop", post(api::stop_session))
        .route(
            "/api/sessions/{session_id}/volume",
            post(api::set_session_volume),
        )
        .route("/api/sessions/stop-all", post(api::stop_all_sessions))
        .route("/api/master_gain", post(api::set_master_gain))
        .route(
            "/api/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        )
        .with_state(state)
}
