//! Le flux audio d'un canal, servi en HTTP chunked sans fin
//!
//! Chaque connexion attache un nouvel encodeur auditeur au canal et draine
//! son buffer de sortie borné. La déconnexion du client (ou la mort de
//! l'auditeur par backpressure) droppe le flux, ce qui ferme l'auditeur ;
//! le canal le détache au bloc suivant.

use axum::{
    body::Body,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::stream;

use crate::api::ApiError;
use crate::AppState;

/// GET /channel_stream/{channel_id} → `audio/mpeg`, longueur indéfinie
pub async fn channel_stream(
    State(state): State<AppState>,
    Path(channel_id): Path<u32>,
) -> Result<Response, ApiError> {
    let channel = state.sessions.pool().channel(channel_id)?;
    let listener = channel.attach_listener();

    tracing::info!(channel = channel_id, "stream client connected");

    let mut headers = HeaderMap::new();
    headers.insert("content-type", "audio/mpeg".parse().expect("valid header"));
    headers.insert("cache-control", "no-cache".parse().expect("valid header"));

    // Le flux se termine quand l'auditeur est fermé : canal arrêté, client
    // parti ou auditeur déclaré mort
    let body_stream = stream::unfold(listener, move |mut listener| async move {
        match listener.recv().await {
            Some(bytes) => Some((Ok::<_, std::io::Error>(bytes), listener)),
            None => {
                tracing::info!(channel = channel_id, "stream client closed");
                None
            }
        }
    });

    Ok((headers, Body::from_stream(body_stream)).into_response())
}
