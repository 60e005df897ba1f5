//! Sessions : l'intention de haut niveau liée aux primitives du moteur
//!
//! Une session lie `{thème, preset, enceintes, volume}` à un canal. Le moteur
//! ne parle jamais aux enceintes : au play/stop il émet un événement
//! fire-and-forget sur un bus broadcast, que les transports externes (DLNA,
//! AirPlay, Chromecast, sortie locale...) consomment à leur guise. Aucun
//! succès ou échec de livraison n'est suivi ici.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::channel::ChannelSnapshot;
use crate::decode::AudioSource;
use crate::error::EngineError;
use crate::mixer::{ThemeSpec, TrackSpec};
use crate::pool::ChannelPool;
use crate::settings::{ThemeTuning, TrackOverlay};

/// Une session de lecture
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub theme_ref: Option<String>,
    pub preset_ref: Option<String>,
    /// Cibles d'enceintes, opaques pour le moteur
    pub speakers: Vec<String>,
    /// Volume 0..=100, appliqué par les transports externes
    pub volume: u8,
    pub playing: bool,
    pub channel_id: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerAction {
    Play,
    Stop,
}

/// Événement émis vers les transports d'enceintes
#[derive(Debug, Clone, Serialize)]
pub struct SpeakerEvent {
    pub session_id: String,
    pub action: SpeakerAction,
    pub stream_url: Option<String>,
    pub speaker_targets: Vec<String>,
}

/// Contrat du fournisseur de thèmes
///
/// Le moteur ne surveille pas le système de fichiers : les rechargements de
/// thèmes sont explicites, côté fournisseur.
#[async_trait]
pub trait ThemeSupplier: Send + Sync {
    /// Références de thèmes connues
    async fn list_themes(&self) -> Vec<String>;

    /// Liste ordonnée des pistes d'un thème, avec leur instantané de réglages
    async fn list_files(&self, theme_ref: &str) -> Result<Vec<TrackSpec>, EngineError>;

    /// Surcouche partielle d'un preset, par label de piste
    async fn preset_overlay(
        &self,
        theme_ref: &str,
        preset_ref: &str,
    ) -> Result<HashMap<String, TrackOverlay>, EngineError>;

    /// Accordage du thème (seuils, intervalles, fenêtres)
    async fn theme_tuning(&self, theme_ref: &str) -> Result<ThemeTuning, EngineError>;
}

/// Champs modifiables d'une session ; seuls les champs présents changent
#[derive(Debug, Default, Clone)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub theme_ref: Option<String>,
    pub preset_ref: Option<Option<String>>,
    pub speakers: Option<Vec<String>>,
    pub volume: Option<u8>,
}

/// Contrôleur de sessions : CRUD, lecture, arrêt, liaison aux canaux
pub struct SessionController {
    sessions: Mutex<HashMap<String, Session>>,
    pool: Arc<ChannelPool>,
    supplier: Arc<dyn ThemeSupplier>,
    events: broadcast::Sender<SpeakerEvent>,
    stream_base_url: String,
    max_sessions: usize,
    default_volume: u8,
}

impl SessionController {
    pub fn new(
        pool: Arc<ChannelPool>,
        supplier: Arc<dyn ThemeSupplier>,
        stream_base_url: impl Into<String>,
        max_sessions: usize,
        default_volume: u8,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            pool,
            supplier,
            events,
            stream_base_url: stream_base_url.into(),
            max_sessions,
            default_volume,
        })
    }

    /// S'abonne au bus d'événements d'enceintes
    pub fn subscribe_events(&self) -> broadcast::Receiver<SpeakerEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// URL du flux d'un canal
    pub fn stream_url(&self, channel_id: u32) -> String {
        format!("{}/channel_stream/{}", self.stream_base_url, channel_id)
    }

    fn emit(&self, event: SpeakerEvent) {
        // Fire-and-forget : sans abonné, l'événement est simplement perdu
        let _ = self.events.send(event);
    }

    fn auto_name(speakers: &[String]) -> String {
        match speakers {
            [] => "New Session".to_string(),
            [one] => one.clone(),
            many => format!("{} speakers", many.len()),
        }
    }

    // ── CRUD ────────────────────────────────────────────────────────────────

    pub fn create(
        &self,
        name: Option<String>,
        theme_ref: Option<String>,
        speakers: Vec<String>,
        volume: Option<u8>,
    ) -> Result<Session, EngineError> {
        let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
        if sessions.len() >= self.max_sessions {
            return Err(EngineError::TooManySessions(self.max_sessions));
        }

        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let session = Session {
            id: id.clone(),
            name: name.unwrap_or_else(|| Self::auto_name(&speakers)),
            theme_ref,
            preset_ref: None,
            speakers,
            volume: volume.unwrap_or(self.default_volume).min(100),
            playing: false,
            channel_id: None,
            created_at: Utc::now(),
        };
        tracing::info!(session = %id, name = %session.name, "session created");
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Session, EngineError> {
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    /// Sessions triées par date de création
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .expect("sessions mutex poisoned")
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Met à jour une session ; un changement de thème ou de preset sur une
    /// session en lecture déclenche une transition crossfadée sur son canal
    pub async fn update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<Session, EngineError> {
        let (needs_reload, session) = {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;

            let theme_changed = update
                .theme_ref
                .as_ref()
                .map(|t| Some(t) != session.theme_ref.as_ref())
                .unwrap_or(false);
            let preset_changed = update
                .preset_ref
                .as_ref()
                .map(|p| *p != session.preset_ref)
                .unwrap_or(false);

            if let Some(name) = update.name {
                session.name = name;
            }
            if let Some(theme) = update.theme_ref {
                session.theme_ref = Some(theme);
            }
            if let Some(preset) = update.preset_ref {
                session.preset_ref = preset;
            }
            if let Some(speakers) = update.speakers {
                session.speakers = speakers;
            }
            if let Some(volume) = update.volume {
                session.volume = volume.min(100);
            }

            (
                session.playing && (theme_changed || preset_changed),
                session.clone(),
            )
        };

        if needs_reload {
            // Rechargement sur le même canal → transition crossfadée
            self.play(session_id).await?;
            return self.get(session_id);
        }
        Ok(session)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), EngineError> {
        self.stop(session_id).await.ok();
        let removed = self
            .sessions
            .lock()
            .expect("sessions mutex poisoned")
            .remove(session_id);
        match removed {
            Some(session) => {
                tracing::info!(session = %session_id, name = %session.name, "session deleted");
                Ok(())
            }
            None => Err(EngineError::UnknownSession(session_id.to_string())),
        }
    }

    // ── Résolution de thème ────────────────────────────────────────────────

    /// Construit la spécification mixable d'un thème, preset appliqué en
    /// surcouche valeur par valeur
    pub async fn resolve_theme(
        &self,
        theme_ref: &str,
        preset_ref: Option<&str>,
    ) -> Result<ThemeSpec, EngineError> {
        let mut tracks: Vec<TrackSpec> = self.supplier.list_files(theme_ref).await?;
        let tuning = self.supplier.theme_tuning(theme_ref).await?;

        if let Some(preset) = preset_ref {
            let overlay = self.supplier.preset_overlay(theme_ref, preset).await?;
            for track in &mut tracks {
                if let Some(o) = overlay.get(track.source.label()) {
                    o.apply(&mut track.settings);
                }
            }
        }

        Ok(ThemeSpec {
            theme_ref: theme_ref.to_string(),
            tuning,
            tracks,
        })
    }

    pub async fn themes(&self) -> Vec<String> {
        self.supplier.list_themes().await
    }

    // ── Lecture ────────────────────────────────────────────────────────────

    /// Lance (ou relance) la lecture d'une session : résolution du thème,
    /// attribution d'un canal, chargement, notification des transports
    pub async fn play(&self, session_id: &str) -> Result<Session, EngineError> {
        let session = self.get(session_id)?;
        let theme_ref = session
            .theme_ref
            .clone()
            .ok_or_else(|| EngineError::NoThemeSelected(session_id.to_string()))?;

        let spec = self
            .resolve_theme(&theme_ref, session.preset_ref.as_deref())
            .await?;
        let channel = self.pool.assign_or_reuse(session_id)?;
        channel.load_theme(spec).await?;

        let updated = {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
            session.playing = true;
            session.channel_id = Some(channel.id());
            session.clone()
        };

        let stream_url = self.stream_url(channel.id());
        tracing::info!(session = %session_id, channel = channel.id(), url = %stream_url, "session playing");
        self.emit(SpeakerEvent {
            session_id: session_id.to_string(),
            action: SpeakerAction::Play,
            stream_url: Some(stream_url),
            speaker_targets: updated.speakers.clone(),
        });
        Ok(updated)
    }

    /// Arrête une session : déliaison du canal (qui sera récupéré par le
    /// reaper une fois ses auditeurs partis), notification des transports
    pub async fn stop(&self, session_id: &str) -> Result<Session, EngineError> {
        let updated = {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
            session.playing = false;
            session.channel_id = None;
            session.clone()
        };
        self.pool.release(session_id);

        tracing::info!(session = %session_id, "session stopped");
        self.emit(SpeakerEvent {
            session_id: session_id.to_string(),
            action: SpeakerAction::Stop,
            stream_url: None,
            speaker_targets: updated.speakers.clone(),
        });
        Ok(updated)
    }

    pub async fn stop_all(&self) -> usize {
        let playing: Vec<String> = self
            .list()
            .into_iter()
            .filter(|s| s.playing)
            .map(|s| s.id)
            .collect();
        let mut count = 0;
        for id in playing {
            if self.stop(&id).await.is_ok() {
                count += 1;
            }
        }
        count
    }

    pub fn set_volume(&self, session_id: &str, volume: u8) -> Result<Session, EngineError> {
        let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        session.volume = volume.min(100);
        Ok(session.clone())
    }

    // ── Contrôle direct des canaux ─────────────────────────────────────────

    /// Charge un thème directement sur un canal, sans passer par une session
    pub async fn load_channel_theme(
        &self,
        channel_id: u32,
        theme_ref: &str,
        preset_ref: Option<&str>,
    ) -> Result<ChannelSnapshot, EngineError> {
        let spec = self.resolve_theme(theme_ref, preset_ref).await?;
        self.pool.channel(channel_id)?.load_theme(spec).await
    }

    pub fn stop_channel(&self, channel_id: u32) -> Result<ChannelSnapshot, EngineError> {
        Ok(self.pool.channel(channel_id)?.stop())
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.pool.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::BufferSource;
    use crate::mixer::MasterGain;
    use crate::settings::{EngineParams, PlaybackMode, TrackSettings};

    struct StaticSupplier;

    #[async_trait]
    impl ThemeSupplier for StaticSupplier {
        async fn list_themes(&self) -> Vec<String> {
            vec!["forest".into()]
        }

        async fn list_files(&self, theme_ref: &str) -> Result<Vec<TrackSpec>, EngineError> {
            if theme_ref != "forest" {
                return Err(EngineError::UnknownTheme(theme_ref.to_string()));
            }
            Ok(vec![TrackSpec {
                source: Arc::new(BufferSource::new(
                    "wind",
                    vec![0.2; 4096],
                    vec![0.2; 4096],
                    48000,
                )),
                settings: TrackSettings {
                    playback_mode: PlaybackMode::Continuous,
                    seamless_loop: true,
                    ..Default::default()
                },
            }])
        }

        async fn preset_overlay(
            &self,
            _theme_ref: &str,
            preset_ref: &str,
        ) -> Result<HashMap<String, TrackOverlay>, EngineError> {
            if preset_ref != "night" {
                return Err(EngineError::UnknownPreset(preset_ref.to_string()));
            }
            let mut map = HashMap::new();
            map.insert(
                "wind".to_string(),
                TrackOverlay {
                    volume: Some(0.1),
                    ..Default::default()
                },
            );
            Ok(map)
        }

        async fn theme_tuning(&self, _theme_ref: &str) -> Result<ThemeTuning, EngineError> {
            Ok(ThemeTuning::default())
        }
    }

    fn controller() -> Arc<SessionController> {
        let params = EngineParams {
            max_channels: 2,
            rng_seed: Some(1),
            ..Default::default()
        };
        let pool = ChannelPool::new(params, MasterGain::new(1.0));
        SessionController::new(pool, Arc::new(StaticSupplier), "http://host:8096", 20, 50)
    }

    #[tokio::test]
    async fn test_play_emits_event_and_binds_channel() {
        let controller = controller();
        let mut events = controller.subscribe_events();

        let session = controller
            .create(None, Some("forest".into()), vec!["kitchen".into()], None)
            .unwrap();
        assert_eq!(session.name, "kitchen");

        let played = controller.play(&session.id).await.unwrap();
        assert!(played.playing);
        assert_eq!(played.channel_id, Some(1));

        let event = events.recv().await.unwrap();
        assert_eq!(event.action, SpeakerAction::Play);
        assert_eq!(
            event.stream_url.as_deref(),
            Some("http://host:8096/channel_stream/1")
        );
        assert_eq!(event.speaker_targets, vec!["kitchen".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_theme_rejected_before_state_change() {
        let controller = controller();
        let session = controller
            .create(None, Some("volcano".into()), vec![], None)
            .unwrap();
        let err = controller.play(&session.id).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownTheme(_)));
        assert!(!controller.get(&session.id).unwrap().playing);
        // Le canal attribué reste idle : aucun thème chargé
        assert_eq!(
            controller.snapshot()[0].state,
            crate::channel::ChannelStateKind::Idle
        );
    }

    #[tokio::test]
    async fn test_stop_releases_binding() {
        let controller = controller();
        let session = controller
            .create(None, Some("forest".into()), vec![], None)
            .unwrap();
        controller.play(&session.id).await.unwrap();
        assert_eq!(controller.pool().binding_of(&session.id), Some(1));

        controller.stop(&session.id).await.unwrap();
        assert_eq!(controller.pool().binding_of(&session.id), None);
        assert!(!controller.get(&session.id).unwrap().playing);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let params = EngineParams::default();
        let pool = ChannelPool::new(params, MasterGain::new(1.0));
        let controller =
            SessionController::new(pool, Arc::new(StaticSupplier), "http://h", 2, 50);
        controller.create(None, None, vec![], None).unwrap();
        controller.create(None, None, vec![], None).unwrap();
        assert!(matches!(
            controller.create(None, None, vec![], None),
            Err(EngineError::TooManySessions(2))
        ));
    }

    #[tokio::test]
    async fn test_preset_overlay_applied() {
        let controller = controller();
        let spec = controller
            .resolve_theme("forest", Some("night"))
            .await
            .unwrap();
        assert!((spec.tracks[0].settings.volume - 0.1).abs() < f32::EPSILON);

        let err = controller
            .resolve_theme("forest", Some("dawn"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPreset(_)));
    }
}
