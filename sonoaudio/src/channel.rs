//! Canal : producteur persistant d'un flux PCM, indifférent aux changements
//! de thème
//!
//! Un canal détient le [`ThemeMixer`] courant, éventuellement un mixer
//! sortant pendant une transition, un compteur de version et le registre des
//! auditeurs. Toute mutation passe par le verrou du canal ; `pull` prend ce
//! même verrou à la granularité d'un bloc, donc un échange de thème est
//! observé par tous les auditeurs à la même frontière de frame.
//!
//! La transition de thème est un crossfade équi-puissance sur
//! `crossfade_window_s`. Un `load_theme` qui arrive pendant une transition
//! l'effondre : le mixer sortant est jeté immédiatement, l'entrant précédent
//! devient le sortant d'une nouvelle transition complète vers le nouveau
//! thème.

use std::f32::consts::FRAC_PI_2;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chunk::AudioChunk;
pub use crate::chunk::PULL_CHUNK_FRAMES;
use crate::error::EngineError;
use crate::listener::{spawn_listener, ListenerSink, ListenerStream};
use crate::mixer::{MasterGain, ThemeMixer, ThemeSpec};
use crate::settings::EngineParams;

/// État observable d'un canal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStateKind {
    Idle,
    Loading,
    Playing,
    Transitioning,
}

/// Instantané d'un canal pour le plan de contrôle
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel_id: u32,
    pub state: ChannelStateKind,
    pub current_theme_ref: Option<String>,
    pub version: u64,
    pub listener_count: usize,
    pub frame_position: u64,
}

/// Transition de thème en cours : le mixer sortant et la position dans la
/// fenêtre
struct Transition {
    outgoing: ThemeMixer,
    pos: u64,
    len: u64,
}

struct ChannelInner {
    state: ChannelStateKind,
    current: Option<ThemeMixer>,
    /// Invariant : `Some` ssi `state == Transitioning`
    transition: Option<Transition>,
    version: u64,
    listeners: Vec<ListenerSink>,
    /// Depuis quand le registre d'auditeurs est vide (pour le reaper)
    empty_since: Option<Instant>,
    producer: Option<CancellationToken>,
    next_listener_id: u64,
    order: u64,
}

/// Un canal de sortie persistant, identité `1..=max_channels`
pub struct Channel {
    id: u32,
    params: EngineParams,
    master_gain: MasterGain,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub fn new(id: u32, params: EngineParams, master_gain: MasterGain) -> Arc<Self> {
        Arc::new(Self {
            id,
            params,
            master_gain,
            inner: Mutex::new(ChannelInner {
                state: ChannelStateKind::Idle,
                current: None,
                transition: None,
                version: 0,
                listeners: Vec::new(),
                empty_since: None,
                producer: None,
                next_listener_id: 0,
                order: 0,
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ChannelStateKind {
        self.inner.lock().expect("channel mutex poisoned").state
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().expect("channel mutex poisoned").version
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .expect("channel mutex poisoned")
            .listeners
            .len()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let inner = self.inner.lock().expect("channel mutex poisoned");
        ChannelSnapshot {
            channel_id: self.id,
            state: inner.state,
            current_theme_ref: inner.current.as_ref().map(|m| m.theme_ref().to_string()),
            version: inner.version,
            listener_count: inner.listeners.len(),
            frame_position: inner.current.as_ref().map(|m| m.frames()).unwrap_or(0),
        }
    }

    /// Nombre de pistes réduites au silence dans le thème courant
    pub fn silenced_tracks(&self) -> usize {
        self.inner
            .lock()
            .expect("channel mutex poisoned")
            .current
            .as_ref()
            .map(|m| m.silenced_tracks())
            .unwrap_or(0)
    }

    /// Charge un thème sur le canal
    ///
    /// Canal idle : le mixer entrant est installé et la production démarre.
    /// Canal en lecture : transition crossfadée vers le nouveau thème.
    /// Transition en cours : effondrée (voir le module).
    /// Si le mixer entrant ne peut pas s'initialiser, l'état du canal est
    /// inchangé.
    pub async fn load_theme(self: &Arc<Self>, spec: ThemeSpec) -> Result<ChannelSnapshot, EngineError> {
        let theme_ref = spec.theme_ref.clone();
        {
            let mut inner = self.inner.lock().expect("channel mutex poisoned");
            if inner.state == ChannelStateKind::Idle {
                inner.state = ChannelStateKind::Loading;
            }
        }

        let incoming = match ThemeMixer::build(spec, &self.params, self.master_gain.clone()).await {
            Ok(mixer) => mixer,
            Err(e) => {
                let mut inner = self.inner.lock().expect("channel mutex poisoned");
                if inner.state == ChannelStateKind::Loading {
                    inner.state = ChannelStateKind::Idle;
                }
                return Err(e);
            }
        };

        let transition_len =
            (self.params.crossfade_window_s * self.params.sample_rate as f64) as u64;

        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        inner.version += 1;
        match inner.state {
            ChannelStateKind::Idle | ChannelStateKind::Loading => {
                inner.current = Some(incoming);
                inner.state = ChannelStateKind::Playing;
                if inner.listeners.is_empty() && inner.empty_since.is_none() {
                    inner.empty_since = Some(Instant::now());
                }
                tracing::info!(channel = self.id, theme = %theme_ref, "theme loaded");
            }
            ChannelStateKind::Playing => {
                let outgoing = inner.current.take().expect("playing channel has a mixer");
                inner.transition = Some(Transition {
                    outgoing,
                    pos: 0,
                    len: transition_len.max(1),
                });
                inner.current = Some(incoming);
                inner.state = ChannelStateKind::Transitioning;
                tracing::info!(channel = self.id, theme = %theme_ref, "theme transition started");
            }
            ChannelStateKind::Transitioning => {
                // Effondrement : le sortant est jeté, l'entrant précédent
                // devient le sortant de la nouvelle transition
                let collapsed = inner.transition.take().expect("transitioning channel has a transition");
                drop(collapsed.outgoing);
                let outgoing = inner.current.take().expect("transitioning channel has a mixer");
                inner.transition = Some(Transition {
                    outgoing,
                    pos: 0,
                    len: transition_len.max(1),
                });
                inner.current = Some(incoming);
                tracing::info!(
                    channel = self.id,
                    theme = %theme_ref,
                    "in-flight transition collapsed into a new one"
                );
            }
        }
        // Sans auditeur, personne ne consomme : la production démarre au
        // premier attach
        if !inner.listeners.is_empty() {
            self.ensure_producer(&mut inner);
        }
        drop(inner);

        Ok(self.snapshot())
    }

    /// Arrête le canal : les mixers sont détruits, les auditeurs notifiés
    /// (leur flux se termine), l'état repasse idle
    pub fn stop(&self) -> ChannelSnapshot {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        if inner.state != ChannelStateKind::Idle {
            if let Some(token) = inner.producer.take() {
                token.cancel();
            }
            inner.current = None;
            inner.transition = None;
            inner.version += 1;
            inner.state = ChannelStateKind::Idle;
            for sink in inner.listeners.drain(..) {
                sink.shared.close();
            }
            inner.empty_since = Some(Instant::now());
            tracing::info!(channel = self.id, "channel stopped");
        }
        drop(inner);
        self.snapshot()
    }

    /// Attache un nouvel auditeur, qui rejoint le direct à la position
    /// courante. Le premier auditeur d'un canal en lecture démarre la boucle
    /// de production temps réel.
    pub fn attach_listener(self: &Arc<Self>) -> ListenerStream {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        let listener_id = inner.next_listener_id;
        inner.next_listener_id += 1;
        let (sink, stream) = spawn_listener(self.id, listener_id, &self.params);
        inner.listeners.push(sink);
        inner.empty_since = None;
        if inner.state != ChannelStateKind::Idle {
            self.ensure_producer(&mut inner);
        }
        tracing::info!(
            channel = self.id,
            listener = listener_id,
            total = inner.listeners.len(),
            "listener attached"
        );
        stream
    }

    /// Vrai si le canal peut être rendu au pool : plus d'auditeur depuis au
    /// moins `idle_timeout`, et pas idle (sinon rien à faire)
    pub(crate) fn reapable(&self, idle_timeout: Duration) -> bool {
        let inner = self.inner.lock().expect("channel mutex poisoned");
        inner.state != ChannelStateKind::Idle
            && inner.listeners.is_empty()
            && inner
                .empty_since
                .map(|t| t.elapsed() >= idle_timeout)
                .unwrap_or(false)
    }

    /// Instant du dernier passage à zéro du registre d'auditeurs, pour la
    /// politique LRU du pool
    pub(crate) fn empty_since(&self) -> Option<Instant> {
        let inner = self.inner.lock().expect("channel mutex poisoned");
        if inner.listeners.is_empty() {
            inner.empty_since
        } else {
            None
        }
    }

    fn ensure_producer(self: &Arc<Self>, inner: &mut ChannelInner) {
        if inner.producer.is_none() {
            let token = CancellationToken::new();
            inner.producer = Some(token.clone());
            spawn_producer(self.clone(), token);
        }
    }

    /// Produit et diffuse un bloc sous le verrou du canal. Retourne le bloc
    /// produit, ou `None` si le canal est idle.
    ///
    /// C'est le point d'entrée du modèle coopératif : la boucle de
    /// production temps réel l'appelle en cadence, mais un ordonnanceur
    /// externe (tests hors ligne, rendu plus vite que le réel) peut tout
    /// aussi bien piloter le canal lui-même tant qu'aucun auditeur n'a
    /// démarré la boucle.
    pub fn pull_block(&self, frames: usize) -> Option<Arc<AudioChunk>> {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");

        let chunk = match inner.state {
            ChannelStateKind::Idle | ChannelStateKind::Loading => return None,
            ChannelStateKind::Playing => {
                let mixer = inner.current.as_mut().expect("playing channel has a mixer");
                mixer.pull(frames)
            }
            ChannelStateKind::Transitioning => {
                let ChannelInner {
                    current,
                    transition,
                    ..
                } = &mut *inner;
                let mixer = current.as_mut().expect("transitioning channel has a mixer");
                let tr = transition.as_mut().expect("transitioning channel has a transition");

                let out_chunk = tr.outgoing.pull(frames);
                let in_chunk = mixer.pull(frames);

                let mut left = Vec::with_capacity(frames);
                let mut right = Vec::with_capacity(frames);
                for i in 0..frames {
                    let t = ((tr.pos + i as u64) as f32 / tr.len as f32).min(1.0);
                    let fade_out = (t * FRAC_PI_2).cos();
                    let fade_in = (t * FRAC_PI_2).sin();
                    left.push(out_chunk.left[i] * fade_out + in_chunk.left[i] * fade_in);
                    right.push(out_chunk.right[i] * fade_out + in_chunk.right[i] * fade_in);
                }
                tr.pos += frames as u64;

                let done = tr.pos >= tr.len;
                if done {
                    // Fin de fenêtre : le sortant est détruit
                    let finished = transition.take().expect("transition present");
                    drop(finished.outgoing);
                    inner.state = ChannelStateKind::Playing;
                    tracing::info!(channel = self.id, "theme transition complete");
                }

                AudioChunk::new(0, left, right, self.params.sample_rate)
            }
        };

        let mut chunk = chunk;
        chunk.order = inner.order;
        inner.order += 1;
        let chunk = Arc::new(chunk);

        Self::fan_out(&mut inner, chunk.clone());
        Some(chunk)
    }

    /// Diffuse un bloc à tous les auditeurs, sans jamais bloquer ; purge les
    /// auditeurs morts ou fermés
    fn fan_out(inner: &mut ChannelInner, chunk: Arc<AudioChunk>) {
        let before = inner.listeners.len();
        inner.listeners.retain(|sink| {
            if sink.shared.is_dead() || sink.shared.is_closed() {
                return false;
            }
            match sink.tx.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    // L'encodeur est à la traîne : le bloc est perdu pour cet
                    // auditeur seulement
                    sink.shared.note_pcm_drop(chunk.duration_sec());
                    true
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        if inner.listeners.is_empty() && before > 0 {
            inner.empty_since = Some(Instant::now());
        }
    }
}

/// Boucle de production d'un canal : tire un bloc, le diffuse, dort juste ce
/// qu'il faut pour rester en temps réel
fn spawn_producer(channel: Arc<Channel>, token: CancellationToken) {
    tokio::spawn(async move {
        tracing::info!(channel = channel.id, "producer loop started");
        let start = Instant::now();
        let mut audio_time = 0.0f64;

        loop {
            if token.is_cancelled() {
                break;
            }
            match channel.pull_block(PULL_CHUNK_FRAMES) {
                Some(chunk) => {
                    audio_time += chunk.duration_sec();
                    let ahead = audio_time - start.elapsed().as_secs_f64();
                    if ahead > 0.0 {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs_f64(ahead)) => {}
                        }
                    }
                }
                None => break,
            }
        }
        tracing::info!(channel = channel.id, "producer loop stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::BufferSource;
    use crate::mixer::TrackSpec;
    use crate::settings::{PlaybackMode, ThemeTuning, TrackSettings};

    fn tone_spec(theme_ref: &str, level: f32) -> ThemeSpec {
        let source = BufferSource::new("tone", vec![level; 4096], vec![level; 4096], 48000);
        ThemeSpec {
            theme_ref: theme_ref.into(),
            tuning: ThemeTuning::default(),
            tracks: vec![TrackSpec {
                source: Arc::new(source),
                settings: TrackSettings {
                    playback_mode: PlaybackMode::Continuous,
                    seamless_loop: true,
                    ..Default::default()
                },
            }],
        }
    }

    fn test_params() -> EngineParams {
        EngineParams {
            rng_seed: Some(1),
            crossfade_window_s: 0.1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_version_increases_on_load_and_stop() {
        let channel = Channel::new(1, test_params(), MasterGain::new(1.0));
        assert_eq!(channel.version(), 0);

        channel.load_theme(tone_spec("a", 0.5)).await.unwrap();
        assert_eq!(channel.version(), 1);
        assert_eq!(channel.state(), ChannelStateKind::Playing);

        channel.load_theme(tone_spec("b", 0.2)).await.unwrap();
        assert_eq!(channel.version(), 2);
        assert_eq!(channel.state(), ChannelStateKind::Transitioning);

        channel.stop();
        assert_eq!(channel.version(), 3);
        assert_eq!(channel.state(), ChannelStateKind::Idle);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_state_unchanged() {
        let channel = Channel::new(1, test_params(), MasterGain::new(1.0));
        let empty = ThemeSpec {
            theme_ref: "empty".into(),
            tuning: ThemeTuning::default(),
            tracks: vec![],
        };
        assert!(channel.load_theme(empty).await.is_err());
        assert_eq!(channel.state(), ChannelStateKind::Idle);
        assert_eq!(channel.version(), 0);

        channel.load_theme(tone_spec("a", 0.5)).await.unwrap();
        let empty = ThemeSpec {
            theme_ref: "empty".into(),
            tuning: ThemeTuning::default(),
            tracks: vec![],
        };
        assert!(channel.load_theme(empty).await.is_err());
        assert_eq!(channel.state(), ChannelStateKind::Playing);
        assert_eq!(channel.version(), 1);
    }

    #[tokio::test]
    async fn test_transition_crossfade_and_completion() {
        // Sans auditeur attaché, aucune boucle de production ne tourne :
        // le test pilote le canal au bloc près
        let channel = Channel::new(1, test_params(), MasterGain::new(1.0));
        channel.load_theme(tone_spec("a", 1.0)).await.unwrap();
        channel.pull_block(1024).unwrap();

        channel.load_theme(tone_spec("b", 1.0)).await.unwrap();
        assert_eq!(channel.state(), ChannelStateKind::Transitioning);

        // Fenêtre de 0.1 s = 4800 frames ; les deux sources valent 1.0,
        // la somme cos+sin reste dans [1, √2]
        let mut frames_seen = 0u64;
        while channel.state() == ChannelStateKind::Transitioning {
            let chunk = channel.pull_block(1024).unwrap();
            for (i, &s) in chunk.left.iter().enumerate() {
                if frames_seen + (i as u64) < 4800 {
                    assert!(
                        (0.99..=std::f32::consts::SQRT_2 + 0.01).contains(&s),
                        "transition sample out of equal-power bounds: {s}"
                    );
                }
            }
            frames_seen += 1024;
            assert!(frames_seen <= 8192, "transition never completed");
        }
        assert_eq!(channel.state(), ChannelStateKind::Playing);
    }

    #[tokio::test]
    async fn test_collapsed_transition() {
        let channel = Channel::new(1, test_params(), MasterGain::new(1.0));
        channel.load_theme(tone_spec("a", 1.0)).await.unwrap();
        channel.pull_block(1024).unwrap();

        channel.load_theme(tone_spec("b", 1.0)).await.unwrap();
        channel.pull_block(1024).unwrap();
        assert_eq!(channel.state(), ChannelStateKind::Transitioning);

        // Nouveau load en pleine transition : effondrée, la fenêtre repart
        // de zéro vers le thème c
        channel.load_theme(tone_spec("c", 1.0)).await.unwrap();
        assert_eq!(channel.state(), ChannelStateKind::Transitioning);
        assert_eq!(channel.version(), 3);

        // 4800 frames de fenêtre : complétée en 5 blocs
        for _ in 0..5 {
            channel.pull_block(1024).unwrap();
        }
        assert_eq!(channel.state(), ChannelStateKind::Playing);
        assert_eq!(
            channel.snapshot().current_theme_ref.as_deref(),
            Some("c")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reapable_after_idle_timeout() {
        let params = EngineParams {
            idle_channel_timeout_s: 30.0,
            ..test_params()
        };
        let channel = Channel::new(1, params, MasterGain::new(1.0));
        // L'horloge en pause sauterait le timeout d'ouverture pendant le
        // spawn_blocking : on charge en temps réel
        tokio::time::resume();
        channel.load_theme(tone_spec("a", 0.5)).await.unwrap();
        tokio::time::pause();

        assert!(!channel.reapable(Duration::from_secs(30)));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(channel.reapable(Duration::from_secs(30)));

        // Un auditeur attaché le protège
        let _stream = channel.attach_listener();
        assert!(!channel.reapable(Duration::from_secs(30)));
    }
}
