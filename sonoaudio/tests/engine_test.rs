//! Tests d'intégration du moteur : propriétés observables et scénarios de
//! bout en bout, pilotés hors ligne sur sources en mémoire
//!
//! Aucun fichier, aucune horloge murale : les canaux sont tirés au bloc près
//! via `pull_block`, les lecteurs via `fill`, et les tests temporels tournent
//! sous l'horloge tokio en pause.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sonoaudio::{
    AudioChunk, AudioSource, BufferSource, Channel, ChannelPool, ChannelStateKind, DecodeError,
    Decoder, EngineError, EngineParams, ExclusionCoordinator, FrameClock, MasterGain,
    PlaybackMode, RecordingPlayer, SessionController, ThemeSpec, ThemeSupplier, ThemeTuning,
    TrackOverlay, TrackSettings, TrackSpec, PULL_CHUNK_FRAMES,
};

const RATE: u32 = 48000;

fn params(seed: u64) -> EngineParams {
    EngineParams {
        rng_seed: Some(seed),
        ..Default::default()
    }
}

fn continuous(source: Arc<dyn AudioSource>, seamless: bool, volume: f32) -> TrackSpec {
    TrackSpec {
        source,
        settings: TrackSettings {
            playback_mode: PlaybackMode::Continuous,
            seamless_loop: seamless,
            volume,
            ..Default::default()
        },
    }
}

fn const_source(label: &str, level: f32, duration_s: f64) -> Arc<BufferSource> {
    let frames = (duration_s * RATE as f64) as usize;
    Arc::new(BufferSource::new(
        label,
        vec![level; frames],
        vec![level; frames],
        RATE,
    ))
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriété 1 - Continuité
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn continuity_no_silent_frames() {
    let spec = ThemeSpec {
        theme_ref: "bed".into(),
        tuning: ThemeTuning::default(),
        tracks: vec![
            continuous(const_source("bed", 0.3, 0.5), true, 1.0),
            TrackSpec {
                source: const_source("mute", 0.9, 0.5),
                settings: TrackSettings {
                    muted: true,
                    ..Default::default()
                },
            },
        ],
    };

    let channel = Channel::new(1, params(7), MasterGain::new(1.0));
    channel.load_theme(spec).await.unwrap();

    // 10 s de tirage : aucune frame nulle, la boucle seamless ne laisse
    // aucun trou
    let blocks = 10 * RATE as usize / PULL_CHUNK_FRAMES;
    for _ in 0..blocks {
        let chunk = channel.pull_block(PULL_CHUNK_FRAMES).unwrap();
        assert!(
            chunk.left.iter().all(|&s| s.abs() > 1e-6),
            "silent frame in continuous seamless bed"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriété 2 - Normalisation 1/√K
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn normalization_bounds_peak() {
    // Trois pistes à impulsions disjointes, crête 1.0 chacune : la sortie
    // culmine à 1/√3 ≤ master_gain
    let mut tracks = Vec::new();
    for k in 0..3usize {
        let mut data = vec![0.0f32; PULL_CHUNK_FRAMES];
        data[100 + 200 * k] = 1.0;
        tracks.push(continuous(
            Arc::new(BufferSource::new(format!("imp{k}"), data.clone(), data, RATE)),
            true,
            1.0,
        ));
    }
    let spec = ThemeSpec {
        theme_ref: "impulses".into(),
        tuning: ThemeTuning::default(),
        tracks,
    };

    let channel = Channel::new(1, params(7), MasterGain::new(1.0));
    channel.load_theme(spec).await.unwrap();

    let chunk = channel.pull_block(PULL_CHUNK_FRAMES).unwrap();
    let expected = 1.0 / 3.0f32.sqrt();
    assert!((chunk.peak() - expected).abs() < 1e-6);
    assert!(chunk.peak() <= 1.0 + 1e-6);
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriétés 3 & 4 - Exclusion mutuelle et cooldown (scénario B)
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn exclusive_pair_never_overlaps_and_respects_cooldown() {
    let tuning = ThemeTuning {
        sparse_min_interval_s: 40.0,
        sparse_max_interval_s: 40.0,
        sparse_variance: 0.0,
        sparse_startup_delay_s: 5.0,
        min_gap_after_exclusive_s: 30.0,
        initial_exclusive_delay_s: 10.0,
        track_fade_s: 0.0,
        ..Default::default()
    };
    let tuning = Arc::new(tuning);
    let clock = Arc::new(FrameClock::new(RATE));
    let coordinator = Arc::new(ExclusionCoordinator::new(clock.clone(), 30.0, 10.0));

    let settings = TrackSettings {
        playback_mode: PlaybackMode::Sparse,
        exclusive: true,
        presence: 1.0,
        ..Default::default()
    };
    let mut t1 = RecordingPlayer::new(
        const_source("t1", 0.5, 5.0),
        settings.clone(),
        tuning.clone(),
        clock.clone(),
        coordinator.clone(),
        11,
    );
    let mut t2 = RecordingPlayer::new(
        const_source("t2", 0.5, 5.0),
        settings,
        tuning,
        clock.clone(),
        coordinator,
        22,
    );

    // 10 minutes par blocs de 0.1 s
    let block = 4800usize;
    let blocks = 10 * 60 * RATE as usize / block;
    let mut l = vec![0.0f32; block];
    let mut r = vec![0.0f32; block];
    let mut activity = Vec::with_capacity(blocks);

    for _ in 0..blocks {
        let a1 = t1.fill(&mut l, &mut r);
        let a2 = t2.fill(&mut l, &mut r);
        assert!(!(a1 && a2), "two exclusive tracks audible on the same block");
        activity.push(a1 || a2);
        clock.advance(block as u64);
    }

    // Découpe en rafales d'activité et vérifie les silences inter-rafales
    let mut runs = 0;
    let mut gap_blocks = usize::MAX;
    let mut current_gap = 0usize;
    let mut in_run = false;
    for &active in &activity {
        if active {
            if !in_run {
                runs += 1;
                if runs > 1 {
                    gap_blocks = gap_blocks.min(current_gap);
                }
            }
            in_run = true;
            current_gap = 0;
        } else {
            in_run = false;
            current_gap += 1;
        }
    }

    assert!(runs >= 3, "expected several exclusive activations, got {runs}");
    // 30 s de cooldown = 300 blocs de 0.1 s ; marge pour la granularité
    assert!(
        gap_blocks >= 295,
        "exclusive activations separated by only {gap_blocks} blocks"
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriété 5 - Transition équi-puissance (scénario C)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn theme_swap_follows_equal_power_curve() {
    let engine = EngineParams {
        crossfade_window_s: 0.5,
        ..params(7)
    };
    let window = (0.5 * RATE as f64) as u64;

    let src_x = const_source("x", 1.0, 1.0);
    let spec_x = ThemeSpec {
        theme_ref: "x".into(),
        tuning: ThemeTuning::default(),
        tracks: vec![continuous(src_x.clone(), true, 1.0)],
    };
    let spec_y = ThemeSpec {
        theme_ref: "y".into(),
        tuning: ThemeTuning::default(),
        tracks: vec![continuous(const_source("y", 0.0, 1.0), true, 1.0)],
    };

    let channel = Channel::new(1, engine, MasterGain::new(1.0));
    channel.load_theme(spec_x).await.unwrap();
    for _ in 0..20 {
        channel.pull_block(PULL_CHUNK_FRAMES).unwrap();
    }

    let handles_before = Arc::strong_count(&src_x);
    channel.load_theme(spec_y).await.unwrap();
    assert_eq!(channel.state(), ChannelStateKind::Transitioning);

    // Pendant la fenêtre : sortie = 1.0·cos(πt/2W) + 0.0·sin(πt/2W)
    let mut t = 0u64;
    while channel.state() == ChannelStateKind::Transitioning {
        let chunk = channel.pull_block(PULL_CHUNK_FRAMES).unwrap();
        for (i, &s) in chunk.left.iter().enumerate() {
            let frame = t + i as u64;
            if frame < window {
                let expected =
                    ((frame as f32 / window as f32) * std::f32::consts::FRAC_PI_2).cos();
                assert!(
                    (s - expected).abs() < 1e-4,
                    "frame {frame}: got {s}, expected {expected}"
                );
            }
        }
        t += PULL_CHUNK_FRAMES as u64;
        assert!(t < window + 10 * PULL_CHUNK_FRAMES as u64, "transition stuck");
    }

    // Fenêtre close : le mixer de X est détruit, ses références retombent
    assert_eq!(channel.state(), ChannelStateKind::Playing);
    assert_eq!(channel.snapshot().current_theme_ref.as_deref(), Some("y"));
    assert!(Arc::strong_count(&src_x) < handles_before);
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriété 6 - Monotonie de la version
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn version_strictly_increases() {
    let channel = Channel::new(1, params(7), MasterGain::new(1.0));
    let mut last = channel.version();

    for theme in ["a", "b", "c"] {
        let spec = ThemeSpec {
            theme_ref: theme.into(),
            tuning: ThemeTuning::default(),
            tracks: vec![continuous(const_source(theme, 0.1, 0.2), true, 1.0)],
        };
        channel.load_theme(spec).await.unwrap();
        let v = channel.version();
        assert!(v > last);
        last = v;
    }

    channel.stop();
    assert!(channel.version() > last);
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriété 7 - Indépendance des auditeurs (scénario E)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn slow_listener_dies_without_stalling_peers() {
    let engine = EngineParams {
        listener_buffer_s: 0.5,
        listener_dead_after_drop_s: 2.0,
        ..params(7)
    };

    let spec = ThemeSpec {
        theme_ref: "bed".into(),
        tuning: ThemeTuning::default(),
        tracks: vec![continuous(const_source("bed", 0.3, 0.5), true, 1.0)],
    };

    let channel = Channel::new(1, engine, MasterGain::new(1.0));
    // L'horloge en pause sauterait le timeout d'ouverture pendant le
    // spawn_blocking : on charge en temps réel
    tokio::time::resume();
    channel.load_theme(spec).await.unwrap();
    tokio::time::pause();

    // A draine en continu, B ne draine jamais
    let mut listener_a = channel.attach_listener();
    let listener_b = channel.attach_listener();
    let b_shared = listener_b.shared();

    let a_bytes = Arc::new(AtomicUsize::new(0));
    let a_count = a_bytes.clone();
    tokio::spawn(async move {
        while let Some(bytes) = listener_a.recv().await {
            a_count.fetch_add(bytes.len(), Ordering::Relaxed);
        }
    });

    // B doit mourir en ≤ dead_after + buffer secondes d'audio ; large marge
    let mut died = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if b_shared.is_dead() {
            died = true;
            break;
        }
    }
    assert!(died, "stalled listener was never declared dead");
    assert!(b_shared.dropped_frames() > 0);

    // A continue de recevoir après la mort de B
    let before = a_bytes.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let after = a_bytes.load(Ordering::Relaxed);
    assert!(after > before, "surviving listener stopped receiving");

    // Le canal a détaché B de son registre
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(channel.listener_count(), 1);

    drop(listener_b);
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriété 8 - Cadence du planning sparse
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn sparse_schedule_rate_over_one_hour() {
    let tuning = Arc::new(ThemeTuning {
        track_fade_s: 0.0,
        ..Default::default()
    });
    let clock = Arc::new(FrameClock::new(RATE));
    let coordinator = Arc::new(ExclusionCoordinator::new(clock.clone(), 30.0, 60.0));

    let mut player = RecordingPlayer::new(
        const_source("shot", 0.5, 5.0),
        TrackSettings {
            playback_mode: PlaybackMode::Sparse,
            presence: 1.0,
            ..Default::default()
        },
        tuning,
        clock.clone(),
        coordinator,
        99,
    );

    // 1 heure par blocs de 1 s
    let block = RATE as usize;
    let mut l = vec![0.0f32; block];
    let mut r = vec![0.0f32; block];
    let mut plays = 0;
    let mut was_audible = false;
    for _ in 0..3600 {
        let audible = player.fill(&mut l, &mut r);
        if audible && !was_audible {
            plays += 1;
        }
        was_audible = audible;
        clock.advance(block as u64);
    }

    // presence = 1 → intervalle moyen 180 s ±30 % : ~20 lectures/heure
    assert!(
        (12..=28).contains(&plays),
        "expected ~3600/180 plays ±30%, got {plays}"
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Propriété 9 - Déterminisme à graine fixée
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn deterministic_output_across_runs() {
    async fn run_sequence() -> Vec<Arc<AudioChunk>> {
        let spec_a = ThemeSpec {
            theme_ref: "a".into(),
            tuning: ThemeTuning {
                sparse_min_interval_s: 2.0,
                sparse_max_interval_s: 3.0,
                ..Default::default()
            },
            tracks: vec![
                continuous(
                    Arc::new(BufferSource::sine("bed", 220.0, 0.5, 0.5, RATE)),
                    true,
                    0.8,
                ),
                TrackSpec {
                    source: Arc::new(BufferSource::sine("shot", 880.0, 0.9, 0.2, RATE)),
                    settings: TrackSettings {
                        playback_mode: PlaybackMode::Sparse,
                        ..Default::default()
                    },
                },
            ],
        };
        let spec_b = ThemeSpec {
            theme_ref: "b".into(),
            tuning: ThemeTuning::default(),
            tracks: vec![continuous(
                Arc::new(BufferSource::sine("other", 330.0, 0.4, 0.5, RATE)),
                true,
                1.0,
            )],
        };

        let channel = Channel::new(1, params(42), MasterGain::new(1.0));
        channel.load_theme(spec_a).await.unwrap();
        let mut chunks = Vec::new();
        for _ in 0..120 {
            chunks.push(channel.pull_block(PULL_CHUNK_FRAMES).unwrap());
        }
        channel.load_theme(spec_b).await.unwrap();
        for _ in 0..240 {
            chunks.push(channel.pull_block(PULL_CHUNK_FRAMES).unwrap());
        }
        chunks
    }

    let run1 = run_sequence().await;
    let run2 = run_sequence().await;
    assert_eq!(run1.len(), run2.len());
    for (c1, c2) in run1.iter().zip(run2.iter()) {
        assert_eq!(c1.left, c2.left);
        assert_eq!(c1.right, c2.right);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scénario A - Bed deux pistes, crossfade de boucle
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn loop_crossfade_bed_has_no_glitch() {
    let spec = ThemeSpec {
        theme_ref: "bed".into(),
        tuning: ThemeTuning {
            loop_crossfade_s: 0.5,
            ..Default::default()
        },
        tracks: vec![
            continuous(
                Arc::new(BufferSource::sine("a440", 440.0, 1.0, 2.0, RATE)),
                false,
                1.0,
            ),
            TrackSpec {
                source: const_source("silent", 0.0, 2.0),
                settings: TrackSettings {
                    muted: true,
                    ..Default::default()
                },
            },
        ],
    };

    let channel = Channel::new(1, params(7), MasterGain::new(1.0));
    channel.load_theme(spec).await.unwrap();

    // 5 s de sortie, deux passages de boucle
    let mut samples = Vec::new();
    for _ in 0..(5 * RATE as usize / PULL_CHUNK_FRAMES) {
        let chunk = channel.pull_block(PULL_CHUNK_FRAMES).unwrap();
        samples.extend_from_slice(&chunk.left);
    }

    // Pas de discontinuité : la pente reste bornée par celle de deux
    // sinusoïdes 440 Hz superposées
    for (i, pair) in samples.windows(2).enumerate() {
        assert!(
            (pair[1] - pair[0]).abs() < 0.13,
            "glitch at frame {i}: {} -> {}",
            pair[0],
            pair[1]
        );
    }

    // Pas de trou : aucune fenêtre de 100 frames entièrement silencieuse
    for (i, window) in samples.chunks(100).enumerate() {
        assert!(
            window.iter().any(|&s| s.abs() > 1e-4),
            "silent window at block {i}"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scénario D - Épuisement du pool (via sessions)
// ═══════════════════════════════════════════════════════════════════════════

struct TestSupplier;

#[async_trait::async_trait]
impl ThemeSupplier for TestSupplier {
    async fn list_themes(&self) -> Vec<String> {
        vec!["forest".into()]
    }

    async fn list_files(&self, theme_ref: &str) -> Result<Vec<TrackSpec>, EngineError> {
        if theme_ref != "forest" {
            return Err(EngineError::UnknownTheme(theme_ref.to_string()));
        }
        Ok(vec![continuous(const_source("wind", 0.2, 0.5), true, 1.0)])
    }

    async fn preset_overlay(
        &self,
        _theme_ref: &str,
        preset_ref: &str,
    ) -> Result<HashMap<String, TrackOverlay>, EngineError> {
        Err(EngineError::UnknownPreset(preset_ref.to_string()))
    }

    async fn theme_tuning(&self, _theme_ref: &str) -> Result<ThemeTuning, EngineError> {
        Ok(ThemeTuning::default())
    }
}

#[tokio::test]
async fn pool_exhaustion_then_recovery() {
    let engine = EngineParams {
        max_channels: 2,
        ..params(7)
    };
    let pool = ChannelPool::new(engine, MasterGain::new(1.0));
    let controller =
        SessionController::new(pool, Arc::new(TestSupplier), "http://host:8096", 20, 50);

    let s1 = controller
        .create(None, Some("forest".into()), vec![], None)
        .unwrap();
    let s2 = controller
        .create(None, Some("forest".into()), vec![], None)
        .unwrap();
    let s3 = controller
        .create(None, Some("forest".into()), vec![], None)
        .unwrap();

    controller.play(&s1.id).await.unwrap();
    controller.play(&s2.id).await.unwrap();

    let err = controller.play(&s3.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NoChannelAvailable));

    // s1 s'arrête : son canal, délié et sans auditeur, est réattribuable
    controller.stop(&s1.id).await.unwrap();
    let played = controller.play(&s3.id).await.unwrap();
    assert_eq!(played.channel_id, Some(1));
}

// ═══════════════════════════════════════════════════════════════════════════
// Scénario F - Échec de décodage isolé
// ═══════════════════════════════════════════════════════════════════════════

struct TruncatedSource;

impl AudioSource for TruncatedSource {
    fn label(&self) -> &str {
        "truncated"
    }
    fn sample_rate(&self) -> u32 {
        RATE
    }
    fn duration_frames(&self) -> Result<u64, DecodeError> {
        Err(DecodeError::Decode("unexpected end of stream".into()))
    }
    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        Err(DecodeError::Decode("unexpected end of stream".into()))
    }
}

#[tokio::test]
async fn decode_failure_silences_only_one_track() {
    let spec = ThemeSpec {
        theme_ref: "damaged".into(),
        tuning: ThemeTuning::default(),
        tracks: vec![
            continuous(const_source("t1", 0.25, 0.5), true, 1.0),
            continuous(Arc::new(TruncatedSource), true, 1.0),
            continuous(const_source("t3", 0.25, 0.5), true, 1.0),
        ],
    };

    let channel = Channel::new(1, params(7), MasterGain::new(1.0));
    // Le chargement réussit malgré la piste 2
    channel.load_theme(spec).await.unwrap();
    assert_eq!(channel.silenced_tracks(), 1);

    // Les pistes 1 et 3 jouent : 0.25 + 0.25 sommées puis 1/√2
    let chunk = channel.pull_block(PULL_CHUNK_FRAMES).unwrap();
    let expected = 0.5 / 2.0f32.sqrt();
    assert!((chunk.left[0] - expected).abs() < 1e-6);
}
