//! Mixage d'un thème : la somme des lecteurs actifs, normalisée
//!
//! Le mixer expose `pull(n)` : il tire `n` frames de chaque lecteur membre,
//! les somme, applique la normalisation maître `1/√(max(1, actifs))` — où
//! « actif » signifie enveloppe non nulle sur le dernier bloc — puis le gain
//! maître. Aucun écrêtage dur n'est appliqué dans le moteur ; la limite
//! saturante vit à l'entrée de l'encodeur.
//!
//! Le mixer n'est jamais repositionné dans le temps : il avance, c'est tout.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::AudioChunk;
use crate::clock::FrameClock;
use crate::decode::AudioSource;
use crate::error::{DecodeError, EngineError};
use crate::exclusion::ExclusionCoordinator;
use crate::player::RecordingPlayer;
use crate::settings::{EngineParams, ThemeTuning, TrackSettings};

/// Gain maître du processus, partagé entre tous les mixers
///
/// Stocké en bits f32 dans un atomique : lecture sans verrou sur le chemin
/// audio, écriture depuis le plan de contrôle.
#[derive(Debug, Clone)]
pub struct MasterGain(Arc<AtomicU32>);

impl MasterGain {
    pub fn new(gain: f32) -> Self {
        Self(Arc::new(AtomicU32::new(gain.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, gain: f32) {
        self.0.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }
}

/// Une piste à charger dans un thème : sa source et ses réglages, instantané
/// pris par valeur au chargement
pub struct TrackSpec {
    pub source: Arc<dyn AudioSource>,
    pub settings: TrackSettings,
}

/// Description complète d'un thème prêt à mixer
pub struct ThemeSpec {
    pub theme_ref: String,
    pub tuning: ThemeTuning,
    pub tracks: Vec<TrackSpec>,
}

impl std::fmt::Debug for ThemeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThemeSpec")
            .field("theme_ref", &self.theme_ref)
            .field("tuning", &self.tuning)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Mixer d'un thème : possède ses lecteurs, son horloge et son coordinateur
pub struct ThemeMixer {
    theme_ref: String,
    players: Vec<RecordingPlayer>,
    clock: Arc<FrameClock>,
    master_gain: MasterGain,
    order: u64,
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
}

impl std::fmt::Debug for ThemeMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThemeMixer")
            .field("theme_ref", &self.theme_ref)
            .field("players", &self.players.len())
            .field("order", &self.order)
            .finish()
    }
}

impl ThemeMixer {
    /// Construction asynchrone : chaque ouverture de décodeur tourne dans un
    /// worker bloquant sous `decode_open_timeout_s`. Un dépassement vaut
    /// échec de décodage pour cette piste seulement.
    pub async fn build(
        spec: ThemeSpec,
        params: &EngineParams,
        master_gain: MasterGain,
    ) -> Result<Self, EngineError> {
        let theme_ref = spec.theme_ref;
        let tuning = Arc::new(spec.tuning);
        let clock = Arc::new(FrameClock::new(params.sample_rate));
        let coordinator = Arc::new(ExclusionCoordinator::new(
            clock.clone(),
            tuning.min_gap_after_exclusive_s,
            tuning.initial_exclusive_delay_s,
        ));

        let mut players = Vec::with_capacity(spec.tracks.len());
        for (index, track) in spec.tracks.into_iter().enumerate() {
            let seed = track_seed(params.rng_seed, &theme_ref, index);
            let source = track.source.clone();
            let settings = track.settings.clone();
            let tuning_for_task = tuning.clone();
            let clock_for_task = clock.clone();
            let coordinator_for_task = coordinator.clone();

            let built = tokio::time::timeout(
                Duration::from_secs_f64(params.decode_open_timeout_s),
                tokio::task::spawn_blocking(move || {
                    RecordingPlayer::new(
                        track.source,
                        track.settings,
                        tuning_for_task,
                        clock_for_task,
                        coordinator_for_task,
                        seed,
                    )
                }),
            )
            .await;

            match built {
                Ok(Ok(player)) => players.push(player),
                Ok(Err(join_err)) => {
                    tracing::error!(
                        theme = %theme_ref,
                        track = source.label(),
                        "player construction panicked: {join_err}"
                    );
                    players.push(RecordingPlayer::silenced(
                        source,
                        settings,
                        clock.clone(),
                        DecodeError::Decode(format!("construction panicked: {join_err}")),
                    ));
                }
                Err(_) => {
                    players.push(RecordingPlayer::silenced(
                        source,
                        settings,
                        clock.clone(),
                        DecodeError::OpenTimeout(params.decode_open_timeout_s),
                    ));
                }
            }
        }

        Self::assemble(theme_ref, players, clock, master_gain)
    }

    /// Construction synchrone, sans timeout d'ouverture. Utilisée par les
    /// tests et les outils hors ligne.
    pub fn build_sync(
        spec: ThemeSpec,
        params: &EngineParams,
        master_gain: MasterGain,
    ) -> Result<Self, EngineError> {
        let theme_ref = spec.theme_ref;
        let tuning = Arc::new(spec.tuning);
        let clock = Arc::new(FrameClock::new(params.sample_rate));
        let coordinator = Arc::new(ExclusionCoordinator::new(
            clock.clone(),
            tuning.min_gap_after_exclusive_s,
            tuning.initial_exclusive_delay_s,
        ));

        let players = spec
            .tracks
            .into_iter()
            .enumerate()
            .map(|(index, track)| {
                RecordingPlayer::new(
                    track.source,
                    track.settings,
                    tuning.clone(),
                    clock.clone(),
                    coordinator.clone(),
                    track_seed(params.rng_seed, &theme_ref, index),
                )
            })
            .collect();

        Self::assemble(theme_ref, players, clock, master_gain)
    }

    fn assemble(
        theme_ref: String,
        players: Vec<RecordingPlayer>,
        clock: Arc<FrameClock>,
        master_gain: MasterGain,
    ) -> Result<Self, EngineError> {
        if players.is_empty() || players.iter().all(|p| p.is_disabled()) {
            return Err(EngineError::NoPlayableTracks(theme_ref));
        }

        let silenced = players.iter().filter(|p| p.is_disabled()).count();
        tracing::info!(
            theme = %theme_ref,
            tracks = players.len(),
            silenced,
            "theme mixer ready"
        );

        Ok(Self {
            theme_ref,
            players,
            clock,
            master_gain,
            order: 0,
            scratch_l: Vec::new(),
            scratch_r: Vec::new(),
        })
    }

    pub fn theme_ref(&self) -> &str {
        &self.theme_ref
    }

    /// Position courante du compteur de frames
    pub fn frames(&self) -> u64 {
        self.clock.frames()
    }

    pub fn clock(&self) -> Arc<FrameClock> {
        self.clock.clone()
    }

    /// Nombre de lecteurs réduits au silence par échec de décodage
    pub fn silenced_tracks(&self) -> usize {
        self.players.iter().filter(|p| p.is_disabled()).count()
    }

    /// Tire `n` frames mixées à la position courante, puis avance le
    /// compteur de frames
    pub fn pull(&mut self, n: usize) -> AudioChunk {
        self.scratch_l.resize(n, 0.0);
        self.scratch_r.resize(n, 0.0);
        let mut acc_l = vec![0.0f32; n];
        let mut acc_r = vec![0.0f32; n];

        let mut audible = 0usize;
        for player in &mut self.players {
            if player.fill(&mut self.scratch_l[..n], &mut self.scratch_r[..n]) {
                audible += 1;
                for i in 0..n {
                    acc_l[i] += self.scratch_l[i];
                    acc_r[i] += self.scratch_r[i];
                }
            }
        }

        let gain = self.master_gain.get() / (audible.max(1) as f32).sqrt();
        if (gain - 1.0).abs() > f32::EPSILON {
            for s in acc_l.iter_mut().chain(acc_r.iter_mut()) {
                *s *= gain;
            }
        }

        let chunk = AudioChunk::new(self.order, acc_l, acc_r, self.clock.sample_rate());
        self.order += 1;
        self.clock.advance(n as u64);
        chunk
    }
}

/// Graine par piste : graine moteur combinée à la référence du thème et à
/// l'index de la piste. Graine moteur absente → graine aléatoire.
fn track_seed(base: Option<u64>, theme_ref: &str, index: usize) -> u64 {
    let base = base.unwrap_or_else(rand::random);
    let mut hasher = DefaultHasher::new();
    theme_ref.hash(&mut hasher);
    index.hash(&mut hasher);
    base ^ hasher.finish()
}
