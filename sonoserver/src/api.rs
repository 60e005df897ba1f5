//! Handlers REST du plan de contrôle
//!
//! Les erreurs typées du moteur sont mappées sur les statuts HTTP : référence
//! inconnue → 404, pool épuisé → 503, requête invalide → 400, le reste → 500.
//! Le corps d'erreur est toujours `{"error": "..."}`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use sonoaudio::{ChannelSnapshot, EngineError, Session, SessionUpdate};

use crate::AppState;

// ============ Gestion des erreurs ============

pub struct ApiError(EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::UnknownTheme(_)
            | EngineError::UnknownPreset(_)
            | EngineError::UnknownSession(_)
            | EngineError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            EngineError::NoChannelAvailable => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::TooManySessions(_)
            | EngineError::NoThemeSelected(_)
            | EngineError::NoPlayableTracks(_) => StatusCode::BAD_REQUEST,
            EngineError::Supplier(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

// ============ Modèles ============

/// État observable d'un canal
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ChannelResponse {
    pub channel_id: u32,
    /// idle | loading | playing | transitioning
    pub state: String,
    pub current_theme_ref: Option<String>,
    pub version: u64,
    pub listener_count: usize,
    pub frame_position: u64,
    pub stream_path: String,
}

impl From<ChannelSnapshot> for ChannelResponse {
    fn from(s: ChannelSnapshot) -> Self {
        Self {
            stream_path: format!("/channel_stream/{}", s.channel_id),
            channel_id: s.channel_id,
            state: serde_json::to_value(s.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            current_theme_ref: s.current_theme_ref,
            version: s.version,
            listener_count: s.listener_count,
            frame_position: s.frame_position,
        }
    }
}

/// Une session de lecture
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SessionResponse {
    pub id: String,
    pub name: String,
    pub theme_ref: Option<String>,
    pub preset_ref: Option<String>,
    pub speakers: Vec<String>,
    pub volume: u8,
    pub playing: bool,
    pub channel_id: Option<u32>,
    pub stream_url: Option<String>,
}

impl SessionResponse {
    fn from_session(session: Session, state: &AppState) -> Self {
        let stream_url = session
            .channel_id
            .map(|id| state.sessions.stream_url(id));
        Self {
            id: session.id,
            name: session.name,
            theme_ref: session.theme_ref,
            preset_ref: session.preset_ref,
            speakers: session.speakers,
            volume: session.volume,
            playing: session.playing,
            channel_id: session.channel_id,
            stream_url,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct LoadThemeRequest {
    pub theme_ref: String,
    pub preset_ref: Option<String>,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
#[serde(default)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub theme_ref: Option<String>,
    pub speakers: Vec<String>,
    pub volume: Option<u8>,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
#[serde(default)]
pub struct UpdateSessionRequest {
    pub name: Option<String>,
    pub theme_ref: Option<String>,
    /// Présent et nul = retirer le preset
    #[serde(deserialize_with = "deserialize_double_option")]
    pub preset_ref: Option<Option<String>>,
    pub speakers: Option<Vec<String>>,
    pub volume: Option<u8>,
}

fn deserialize_double_option<'de, D>(
    deserializer: D,
) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::<String>::deserialize(deserializer)?))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct VolumeRequest {
    /// Volume 0..=100
    pub volume: u8,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct MasterGainRequest {
    pub gain: f32,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ReloadResponse {
    pub themes: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StopAllResponse {
    pub stopped: usize,
}

// ============ Canaux ============

/// GET /api/channels - Instantané de tous les canaux
#[utoipa::path(
    get,
    path = "/api/channels",
    tag = "sonorium",
    responses((status = 200, description = "Liste des canaux", body = [ChannelResponse]))
)]
pub async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelResponse>> {
    Json(
        state
            .sessions
            .snapshot()
            .into_iter()
            .map(ChannelResponse::from)
            .collect(),
    )
}

/// POST /api/channels/{channel_id}/theme - Charger ou changer de thème
#[utoipa::path(
    post,
    path = "/api/channels/{channel_id}/theme",
    tag = "sonorium",
    params(("channel_id" = u32, Path, description = "Identité du canal")),
    request_body = LoadThemeRequest,
    responses(
        (status = 200, description = "État du canal après chargement", body = ChannelResponse),
        (status = 404, description = "Canal, thème ou preset inconnu")
    )
)]
pub async fn load_channel_theme(
    State(state): State<AppState>,
    Path(channel_id): Path<u32>,
    Json(request): Json<LoadThemeRequest>,
) -> Result<Json<ChannelResponse>, ApiError> {
    let snapshot = state
        .sessions
        .load_channel_theme(channel_id, &request.theme_ref, request.preset_ref.as_deref())
        .await?;
    Ok(Json(snapshot.into()))
}

/// POST /api/channels/{channel_id}/stop - Arrêter un canal
#[utoipa::path(
    post,
    path = "/api/channels/{channel_id}/stop",
    tag = "sonorium",
    params(("channel_id" = u32, Path, description = "Identité du canal")),
    responses((status = 200, description = "État du canal", body = ChannelResponse))
)]
pub async fn stop_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<u32>,
) -> Result<Json<ChannelResponse>, ApiError> {
    Ok(Json(state.sessions.stop_channel(channel_id)?.into()))
}

// ============ Thèmes ============

/// GET /api/themes - Références de thèmes connues
#[utoipa::path(
    get,
    path = "/api/themes",
    tag = "sonorium",
    responses((status = 200, description = "Liste des thèmes", body = [String]))
)]
pub async fn list_themes(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.sessions.themes().await)
}

/// POST /api/themes/reload - Rescanner la bibliothèque de thèmes
#[utoipa::path(
    post,
    path = "/api/themes/reload",
    tag = "sonorium",
    responses((status = 200, description = "Nombre de thèmes découverts", body = ReloadResponse))
)]
pub async fn reload_themes(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let themes = (state.reload_themes)()?;
    Ok(Json(ReloadResponse { themes }))
}

// ============ Sessions ============

/// GET /api/sessions - Sessions triées par création
#[utoipa::path(
    get,
    path = "/api/sessions",
    tag = "sonorium",
    responses((status = 200, description = "Liste des sessions", body = [SessionResponse]))
)]
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionResponse>> {
    Json(
        state
            .sessions
            .list()
            .into_iter()
            .map(|s| SessionResponse::from_session(s, &state))
            .collect(),
    )
}

/// POST /api/sessions - Créer une session
#[utoipa::path(
    post,
    path = "/api/sessions",
    tag = "sonorium",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session créée", body = SessionResponse),
        (status = 400, description = "Limite de sessions atteinte")
    )
)]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session = state.sessions.create(
        request.name,
        request.theme_ref,
        request.speakers,
        request.volume,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::from_session(session, &state)),
    ))
}

/// GET /api/sessions/{session_id}
#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}",
    tag = "sonorium",
    params(("session_id" = String, Path, description = "Identifiant de session")),
    responses(
        (status = 200, description = "La session", body = SessionResponse),
        (status = 404, description = "Session inconnue")
    )
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.sessions.get(&session_id)?;
    Ok(Json(SessionResponse::from_session(session, &state)))
}

/// PUT /api/sessions/{session_id} - Mise à jour partielle ; changer le thème
/// d'une session en lecture déclenche une transition crossfadée
#[utoipa::path(
    put,
    path = "/api/sessions/{session_id}",
    tag = "sonorium",
    params(("session_id" = String, Path, description = "Identifiant de session")),
    request_body = UpdateSessionRequest,
    responses(
        (status = 200, description = "Session mise à jour", body = SessionResponse),
        (status = 404, description = "Session inconnue")
    )
)]
pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let update = SessionUpdate {
        name: request.name,
        theme_ref: request.theme_ref,
        preset_ref: request.preset_ref,
        speakers: request.speakers,
        volume: request.volume,
    };
    let session = state.sessions.update(&session_id, update).await?;
    Ok(Json(SessionResponse::from_session(session, &state)))
}

/// DELETE /api/sessions/{session_id}
#[utoipa::path(
    delete,
    path = "/api/sessions/{session_id}",
    tag = "sonorium",
    params(("session_id" = String, Path, description = "Identifiant de session")),
    responses(
        (status = 204, description = "Session supprimée"),
        (status = 404, description = "Session inconnue")
    )
)]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/sessions/{session_id}/play
#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/play",
    tag = "sonorium",
    params(("session_id" = String, Path, description = "Identifiant de session")),
    responses(
        (status = 200, description = "Lecture lancée", body = SessionResponse),
        (status = 400, description = "Pas de thème sélectionné"),
        (status = 503, description = "Aucun canal disponible")
    )
)]
pub async fn play_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.sessions.play(&session_id).await?;
    Ok(Json(SessionResponse::from_session(session, &state)))
}

/// POST /api/sessions/{session_id}/stop
#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/stop",
    tag = "sonorium",
    params(("session_id" = String, Path, description = "Identifiant de session")),
    responses((status = 200, description = "Lecture arrêtée", body = SessionResponse))
)]
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.sessions.stop(&session_id).await?;
    Ok(Json(SessionResponse::from_session(session, &state)))
}

/// POST /api/sessions/{session_id}/volume
#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/volume",
    tag = "sonorium",
    params(("session_id" = String, Path, description = "Identifiant de session")),
    request_body = VolumeRequest,
    responses((status = 200, description = "Volume enregistré", body = SessionResponse))
)]
pub async fn set_session_volume(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<VolumeRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.sessions.set_volume(&session_id, request.volume)?;
    Ok(Json(SessionResponse::from_session(session, &state)))
}

/// POST /api/sessions/stop-all
#[utoipa::path(
    post,
    path = "/api/sessions/stop-all",
    tag = "sonorium",
    responses((status = 200, description = "Sessions arrêtées", body = StopAllResponse))
)]
pub async fn stop_all_sessions(State(state): State<AppState>) -> Json<StopAllResponse> {
    let stopped = state.sessions.stop_all().await;
    Json(StopAllResponse { stopped })
}

// ============ Gain maître ============

/// POST /api/master_gain - Gain maître appliqué par tous les mixers
#[utoipa::path(
    post,
    path = "/api/master_gain",
    tag = "sonorium",
    request_body = MasterGainRequest,
    responses((status = 200, description = "Gain appliqué"))
)]
pub async fn set_master_gain(
    State(state): State<AppState>,
    Json(request): Json<MasterGainRequest>,
) -> Json<serde_json::Value> {
    state.master_gain.set(request.gain);
    tracing::info!(gain = request.gain, "master gain updated");
    Json(serde_json::json!({ "gain": state.master_gain.get() }))
}
