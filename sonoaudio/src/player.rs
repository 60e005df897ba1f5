//! Lecteur d'enregistrement : une piste, un fichier, une machine à états
//!
//! Le [`ThemeMixer`](crate::ThemeMixer) tire, le lecteur produit : à chaque
//! appel de `fill` le lecteur écrit sa contribution au mix pour le bloc
//! courant, multipliée par `volume × enveloppe(t)` avec l'enveloppe dans
//! `[0, 1]` selon le mode résolu.
//!
//! Modes :
//! - **continu** : bouclage permanent, enveloppe à 1 ; boucle tête-à-queue
//!   (`seamless_loop`) ou crossfade équi-puissance à la frontière
//! - **sparse** : lecture intégrale puis silence jusqu'à la prochaine
//!   activation tirée d'une distribution centrée sur la présence
//! - **presence** : fondus lents entre périodes actives et inactives dont le
//!   rapport cyclique suit `presence` ; le décodage est en pause pendant les
//!   périodes inactives
//!
//! Une piste exclusive demande l'autorisation au coordinateur avant toute
//! lecture audible. Un échec de décodage désactive le lecteur pour la durée
//! du thème : il émet du silence, rien ne remonte au mixer.

use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::FrameClock;
use crate::decode::{AudioSource, Decoder};
use crate::error::DecodeError;
use crate::exclusion::ExclusionCoordinator;
use crate::settings::{ResolvedMode, ThemeTuning, TrackSettings};

/// Courbes équi-puissance : `(fade_out, fade_in)` pour `t ∈ [0, 1]`
#[inline]
fn equal_power(t: f32) -> (f32, f32) {
    let t = t.clamp(0.0, 1.0);
    ((t * FRAC_PI_2).cos(), (t * FRAC_PI_2).sin())
}

// ═══════════════════════════════════════════════════════════════════════════
// LoopingReader - bouclage continu avec ou sans crossfade
// ═══════════════════════════════════════════════════════════════════════════

/// Bras secondaire pendant un crossfade de boucle
struct CrossfadeArm {
    decoder: Box<dyn Decoder>,
    /// Frames déjà écoulées dans la fenêtre de crossfade
    pos: u64,
}

/// Lit un fichier en boucle infinie
///
/// En mode seamless la fin enchaîne sur le début sans aucune frame de
/// silence. Sinon, à `duration − fenêtre` un second décodeur est armé au
/// début du fichier et les deux passages sont mélangés en équi-puissance.
struct LoopingReader {
    source: Arc<dyn AudioSource>,
    decoder: Box<dyn Decoder>,
    duration: u64,
    /// Frames lues dans le passage courant
    pos: u64,
    /// Fenêtre de crossfade en frames, 0 = seamless
    xfade_len: u64,
    arm: Option<CrossfadeArm>,
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
}

impl LoopingReader {
    fn new(
        source: Arc<dyn AudioSource>,
        duration: u64,
        seamless: bool,
        xfade_frames: u64,
    ) -> Result<Self, DecodeError> {
        let decoder = source.open()?;
        // Une fenêtre plus large que la moitié du fichier dégénère
        let xfade_len = if seamless {
            0
        } else {
            xfade_frames.min(duration / 2)
        };
        Ok(Self {
            source,
            decoder,
            duration,
            pos: 0,
            xfade_len,
            arm: None,
            scratch_l: Vec::new(),
            scratch_r: Vec::new(),
        })
    }

    /// Remplit intégralement les deux buffers, en bouclant autant que
    /// nécessaire
    fn read(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<(), DecodeError> {
        let n = left.len();
        let mut written = 0usize;
        // Garde-fou : un rewind qui ne rend toujours rien signifie un flux
        // vide, pas une boucle
        let mut stalled = false;

        while written < n {
            if self.xfade_len == 0 {
                let w = self
                    .decoder
                    .next_block(&mut left[written..], &mut right[written..])?;
                if w == 0 {
                    if stalled {
                        return Err(DecodeError::Decode("empty stream after rewind".into()));
                    }
                    stalled = true;
                    // Boucle tête-à-queue : on repart à zéro dans le même bloc
                    self.decoder.rewind()?;
                    self.pos = 0;
                    continue;
                }
                stalled = false;
                self.pos += w as u64;
                written += w;
                continue;
            }

            let xfade_start = self.duration.saturating_sub(self.xfade_len);

            if self.arm.is_none() && self.pos >= xfade_start {
                self.arm = Some(CrossfadeArm {
                    decoder: self.source.open()?,
                    pos: 0,
                });
            }

            match &mut self.arm {
                None => {
                    // Ne pas déborder dans la fenêtre de crossfade
                    let until = ((xfade_start - self.pos).min((n - written) as u64)) as usize;
                    let w = self.decoder.next_block(
                        &mut left[written..written + until],
                        &mut right[written..written + until],
                    )?;
                    if w == 0 {
                        if stalled {
                            return Err(DecodeError::Decode("empty stream after rewind".into()));
                        }
                        stalled = true;
                        // Fin de fichier avant la fenêtre annoncée
                        // (métadonnées optimistes) : coupe franche
                        tracing::debug!(
                            source = self.source.label(),
                            "early EOF before crossfade window, hard restart"
                        );
                        self.decoder.rewind()?;
                        self.pos = 0;
                        continue;
                    }
                    stalled = false;
                    self.pos += w as u64;
                    written += w;
                }
                Some(arm) => {
                    let take = ((self.xfade_len - arm.pos).min((n - written) as u64)) as usize;

                    // Passage sortant directement dans la sortie
                    let wp = self.decoder.next_block(
                        &mut left[written..written + take],
                        &mut right[written..written + take],
                    )?;
                    for i in wp..take {
                        left[written + i] = 0.0;
                        right[written + i] = 0.0;
                    }

                    // Passage entrant dans le scratch
                    self.scratch_l.clear();
                    self.scratch_l.resize(take, 0.0);
                    self.scratch_r.clear();
                    self.scratch_r.resize(take, 0.0);
                    let wi = arm
                        .decoder
                        .next_block(&mut self.scratch_l[..take], &mut self.scratch_r[..take])?;
                    for i in wi..take {
                        self.scratch_l[i] = 0.0;
                        self.scratch_r[i] = 0.0;
                    }

                    for i in 0..take {
                        let t = (arm.pos + i as u64) as f32 / self.xfade_len as f32;
                        let (fade_out, fade_in) = equal_power(t);
                        left[written + i] =
                            left[written + i] * fade_out + self.scratch_l[i] * fade_in;
                        right[written + i] =
                            right[written + i] * fade_out + self.scratch_r[i] * fade_in;
                    }

                    arm.pos += take as u64;
                    self.pos += take as u64;
                    written += take;
                }
            }

            let window_done = self
                .arm
                .as_ref()
                .map(|arm| arm.pos >= self.xfade_len)
                .unwrap_or(false);
            if window_done {
                // Promotion : l'entrant devient le passage courant
                let arm = self.arm.take().expect("crossfade arm present");
                self.decoder = arm.decoder;
                self.pos = self.xfade_len;
            }
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Machines à états par mode
// ═══════════════════════════════════════════════════════════════════════════

enum SparseState {
    /// Silence jusqu'à la frame d'activation planifiée
    Waiting { until: u64 },
    Playing {
        decoder: Box<dyn Decoder>,
        pos: u64,
        fade_frames: u64,
    },
}

enum PresencePhase {
    Active { until: u64 },
    FadeOut { pos: u64 },
    Inactive { until: u64 },
    FadeIn { pos: u64 },
}

enum PlayerState {
    Continuous(LoopingReader),
    Sparse(SparseState),
    Presence {
        reader: LoopingReader,
        phase: PresencePhase,
    },
    /// Piste coupée ou désactivée après échec de décodage : silence exact
    Silenced,
}

/// Lecteur d'une piste au sein d'un thème
pub struct RecordingPlayer {
    label: String,
    settings: TrackSettings,
    tuning: Arc<ThemeTuning>,
    source: Arc<dyn AudioSource>,
    clock: Arc<FrameClock>,
    exclusion: Option<Arc<ExclusionCoordinator>>,
    sample_rate: u32,
    duration_frames: u64,
    rng: StdRng,
    state: PlayerState,
    disabled: bool,
}

impl RecordingPlayer {
    /// Construit le lecteur et ouvre son premier décodeur si le mode le
    /// demande. Tout échec d'ouverture désactive le lecteur : il émettra du
    /// silence pour la durée du thème.
    pub fn new(
        source: Arc<dyn AudioSource>,
        settings: TrackSettings,
        tuning: Arc<ThemeTuning>,
        clock: Arc<FrameClock>,
        coordinator: Arc<ExclusionCoordinator>,
        seed: u64,
    ) -> Self {
        let label = source.label().to_string();
        let sample_rate = clock.sample_rate();
        let mut rng = StdRng::seed_from_u64(seed);

        let exclusion = settings.exclusive.then(|| {
            coordinator.register_track(&label);
            coordinator
        });

        let mut player = Self {
            label,
            settings,
            tuning,
            source,
            clock,
            exclusion,
            sample_rate,
            duration_frames: 0,
            rng: StdRng::seed_from_u64(0),
            state: PlayerState::Silenced,
            disabled: false,
        };

        if player.settings.muted {
            // Piste coupée : silence exact, aucun travail de décodage
            return player;
        }

        let duration = match player.source.duration_frames() {
            Ok(d) if d > 0 => d,
            Ok(_) => {
                player.fail(DecodeError::Decode("empty file".into()));
                return player;
            }
            Err(e) => {
                player.fail(e);
                return player;
            }
        };
        player.duration_frames = duration;

        let duration_s = duration as f64 / sample_rate as f64;
        let mode = player
            .tuning
            .resolve_mode(player.settings.playback_mode, duration_s);

        let state = match mode {
            ResolvedMode::Continuous => {
                let xfade = (player.tuning.loop_crossfade_s * sample_rate as f64) as u64;
                match LoopingReader::new(
                    player.source.clone(),
                    duration,
                    player.settings.seamless_loop,
                    xfade,
                ) {
                    Ok(reader) => PlayerState::Continuous(reader),
                    Err(e) => {
                        player.fail(e);
                        return player;
                    }
                }
            }
            ResolvedMode::Sparse => {
                let until = if player.settings.exclusive {
                    // Premier départ différé d'au moins le délai de démarrage
                    (player.tuning.sparse_startup_delay_s * sample_rate as f64) as u64
                } else {
                    // Fraction aléatoire de l'intervalle, pour étaler les
                    // pistes sparse au lancement du thème
                    let interval = sparse_interval_frames(
                        &player.tuning,
                        player.settings.presence,
                        sample_rate,
                        &mut rng,
                    );
                    (interval as f64 * rng.gen_range(0.0..1.0)) as u64
                };
                PlayerState::Sparse(SparseState::Waiting { until })
            }
            ResolvedMode::Presence => {
                let xfade = (player.tuning.loop_crossfade_s * sample_rate as f64) as u64;
                let reader = match LoopingReader::new(
                    player.source.clone(),
                    duration,
                    player.settings.seamless_loop,
                    xfade,
                ) {
                    Ok(reader) => reader,
                    Err(e) => {
                        player.fail(e);
                        return player;
                    }
                };
                let duty = f64::from(player.settings.presence).clamp(0.0, 1.0);
                // Les pistes exclusives démarrent toujours inactives, même à
                // pleine présence : chaque entrée en période active passe par
                // la barrière du coordinateur
                let phase = if duty >= 1.0 && !player.settings.exclusive {
                    PresencePhase::Active { until: u64::MAX }
                } else if duty <= 0.0 {
                    PresencePhase::Inactive { until: u64::MAX }
                } else if !player.settings.exclusive && rng.gen_bool(duty) {
                    let until = active_len_frames(&player.tuning, duty, sample_rate, &mut rng);
                    PresencePhase::Active { until }
                } else {
                    let until = if player.settings.exclusive {
                        0
                    } else {
                        inactive_len_frames(&player.tuning, duty, sample_rate, &mut rng)
                    };
                    PresencePhase::Inactive { until }
                };
                PlayerState::Presence { reader, phase }
            }
        };

        player.state = state;
        player.rng = rng;
        player
    }

    /// Lecteur désactivé d'office (timeout d'ouverture, panique de
    /// construction) : silence exact pour la durée du thème
    pub(crate) fn silenced(
        source: Arc<dyn AudioSource>,
        settings: TrackSettings,
        clock: Arc<FrameClock>,
        err: DecodeError,
    ) -> Self {
        let label = source.label().to_string();
        tracing::warn!(track = %label, error = %err, "track silenced for this theme session");
        let sample_rate = clock.sample_rate();
        Self {
            label,
            settings,
            tuning: Arc::new(ThemeTuning::default()),
            source,
            clock,
            exclusion: None,
            sample_rate,
            duration_frames: 0,
            rng: StdRng::seed_from_u64(0),
            state: PlayerState::Silenced,
            disabled: true,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Vrai si le lecteur a été réduit au silence par un échec de décodage
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Désactivation définitive pour la durée du thème, loggée une seule fois
    fn fail(&mut self, err: DecodeError) {
        tracing::warn!(track = %self.label, error = %err, "track silenced for this theme session");
        self.disabled = true;
        self.state = PlayerState::Silenced;
    }

    fn frames_for(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64) as u64
    }

    /// Délai avant nouvelle tentative quand le coordinateur refuse
    fn recheck_frames(&mut self) -> u64 {
        let hint = self
            .exclusion
            .as_ref()
            .map(|c| c.wait_hint_s())
            .unwrap_or(0.0);
        // Jitter pour éviter que toutes les pistes retentent au même bloc
        let jitter = self.rng.gen_range(0.5..3.0);
        self.frames_for(hint + jitter)
    }

    /// Produit le bloc courant de cette piste dans `left`/`right`
    /// (écrasés). Retourne `true` si au moins une frame a une enveloppe non
    /// nulle : c'est le critère d'« activité » de la normalisation du mixer.
    pub fn fill(&mut self, left: &mut [f32], right: &mut [f32]) -> bool {
        left.fill(0.0);
        right.fill(0.0);

        if self.settings.muted || self.disabled {
            return false;
        }

        match std::mem::replace(&mut self.state, PlayerState::Silenced) {
            PlayerState::Silenced => false,
            PlayerState::Continuous(reader) => self.fill_continuous(reader, left, right),
            PlayerState::Sparse(state) => self.fill_sparse(state, left, right),
            PlayerState::Presence { reader, phase } => {
                self.fill_presence(reader, phase, left, right)
            }
        }
    }

    fn fill_continuous(
        &mut self,
        mut reader: LoopingReader,
        left: &mut [f32],
        right: &mut [f32],
    ) -> bool {
        if let Err(e) = reader.read(left, right) {
            left.fill(0.0);
            right.fill(0.0);
            self.fail(e);
            return false;
        }
        let volume = self.settings.volume;
        if (volume - 1.0).abs() > f32::EPSILON {
            for s in left.iter_mut().chain(right.iter_mut()) {
                *s *= volume;
            }
        }
        self.state = PlayerState::Continuous(reader);
        true
    }

    fn fill_sparse(&mut self, state: SparseState, left: &mut [f32], right: &mut [f32]) -> bool {
        let mut state = state;
        let now = self.clock.frames();

        // L'activation peut tomber au milieu du bloc : on reste à la
        // granularité du bloc, la frame de départ est celle du bloc suivant
        loop {
            match state {
                SparseState::Waiting { until } => {
                    if now < until {
                        self.state = PlayerState::Sparse(SparseState::Waiting { until });
                        return false;
                    }

                    // Barrière d'exclusivité avant toute lecture audible
                    if let Some(coordinator) = self.exclusion.clone() {
                        let duration_s =
                            self.duration_frames as f64 / self.sample_rate as f64;
                        if !coordinator.try_start_playing(&self.label, duration_s) {
                            let until = now + self.recheck_frames();
                            self.state = PlayerState::Sparse(SparseState::Waiting { until });
                            return false;
                        }
                    }

                    match self.source.open() {
                        Ok(decoder) => {
                            let fade_s = self
                                .tuning
                                .track_fade_s
                                .min(self.duration_frames as f64 / self.sample_rate as f64 / 3.0);
                            state = SparseState::Playing {
                                decoder,
                                pos: 0,
                                fade_frames: self.frames_for(fade_s),
                            };
                            tracing::debug!(track = %self.label, "sparse playback starting");
                        }
                        Err(e) => {
                            if let Some(coordinator) = &self.exclusion {
                                coordinator.finish_playing(&self.label);
                            }
                            self.fail(e);
                            return false;
                        }
                    }
                }
                SparseState::Playing {
                    mut decoder,
                    pos,
                    fade_frames,
                } => {
                    let written = match decoder.next_block(left, right) {
                        Ok(w) => w,
                        Err(e) => {
                            if let Some(coordinator) = &self.exclusion {
                                coordinator.finish_playing(&self.label);
                            }
                            left.fill(0.0);
                            right.fill(0.0);
                            self.fail(e);
                            return false;
                        }
                    };

                    if written == 0 {
                        // Fin de lecture : cooldown, nouvel intervalle, réarmement
                        if let Some(coordinator) = &self.exclusion {
                            coordinator.finish_playing(&self.label);
                        }
                        let interval = sparse_interval_frames(
                            &self.tuning,
                            self.settings.presence,
                            self.sample_rate,
                            &mut self.rng,
                        );
                        tracing::debug!(
                            track = %self.label,
                            interval_s = interval / u64::from(self.sample_rate),
                            "sparse playback done, rearming"
                        );
                        self.state = PlayerState::Sparse(SparseState::Waiting {
                            until: now + interval,
                        });
                        return false;
                    }

                    let volume = self.settings.volume;
                    let fade_out_start = self.duration_frames.saturating_sub(fade_frames);
                    for i in 0..written {
                        let frame = pos + i as u64;
                        let mut env = 1.0f32;
                        if fade_frames > 0 && frame < fade_frames {
                            env = (frame as f32 / fade_frames as f32 * FRAC_PI_2).sin();
                        } else if fade_frames > 0 && frame >= fade_out_start {
                            let t = (frame - fade_out_start) as f32 / fade_frames as f32;
                            env = (t.min(1.0) * FRAC_PI_2).cos();
                        }
                        left[i] *= env * volume;
                        right[i] *= env * volume;
                    }

                    self.state = PlayerState::Sparse(SparseState::Playing {
                        decoder,
                        pos: pos + written as u64,
                        fade_frames,
                    });
                    return true;
                }
            }
        }
    }

    fn fill_presence(
        &mut self,
        mut reader: LoopingReader,
        phase: PresencePhase,
        left: &mut [f32],
        right: &mut [f32],
    ) -> bool {
        let now = self.clock.frames();
        let duty = f64::from(self.settings.presence).clamp(0.0, 1.0);
        let fade_frames = self.frames_for(self.tuning.presence_fade_s).max(1);
        let volume = self.settings.volume;

        let mut phase = phase;
        loop {
            match phase {
                PresencePhase::Inactive { until } => {
                    if now < until {
                        self.state = PlayerState::Presence {
                            reader,
                            phase: PresencePhase::Inactive { until },
                        };
                        return false;
                    }

                    // Entrée en période active : barrière d'exclusivité
                    if let Some(coordinator) = self.exclusion.clone() {
                        let expected_s = 2.0 * self.tuning.presence_fade_s
                            + duty * self.tuning.presence_period_s;
                        if !coordinator.try_start_playing(&self.label, expected_s) {
                            let until = now + self.recheck_frames();
                            self.state = PlayerState::Presence {
                                reader,
                                phase: PresencePhase::Inactive { until },
                            };
                            return false;
                        }
                    }
                    phase = PresencePhase::FadeIn { pos: 0 };
                }
                PresencePhase::FadeIn { pos } => {
                    if let Err(e) = reader.read(left, right) {
                        left.fill(0.0);
                        right.fill(0.0);
                        if let Some(coordinator) = &self.exclusion {
                            coordinator.finish_playing(&self.label);
                        }
                        self.fail(e);
                        return false;
                    }
                    for i in 0..left.len() {
                        let t = ((pos + i as u64) as f32 / fade_frames as f32).min(1.0);
                        let env = (t * FRAC_PI_2).sin() * volume;
                        left[i] *= env;
                        right[i] *= env;
                    }
                    let pos = pos + left.len() as u64;
                    let next = if pos >= fade_frames {
                        let until = now
                            + active_len_frames(&self.tuning, duty, self.sample_rate, &mut self.rng);
                        PresencePhase::Active { until }
                    } else {
                        PresencePhase::FadeIn { pos }
                    };
                    self.state = PlayerState::Presence {
                        reader,
                        phase: next,
                    };
                    return true;
                }
                PresencePhase::Active { until } => {
                    if now >= until {
                        phase = PresencePhase::FadeOut { pos: 0 };
                        continue;
                    }
                    if let Err(e) = reader.read(left, right) {
                        left.fill(0.0);
                        right.fill(0.0);
                        if let Some(coordinator) = &self.exclusion {
                            coordinator.finish_playing(&self.label);
                        }
                        self.fail(e);
                        return false;
                    }
                    if (volume - 1.0).abs() > f32::EPSILON {
                        for s in left.iter_mut().chain(right.iter_mut()) {
                            *s *= volume;
                        }
                    }
                    self.state = PlayerState::Presence {
                        reader,
                        phase: PresencePhase::Active { until },
                    };
                    return true;
                }
                PresencePhase::FadeOut { pos } => {
                    if let Err(e) = reader.read(left, right) {
                        left.fill(0.0);
                        right.fill(0.0);
                        if let Some(coordinator) = &self.exclusion {
                            coordinator.finish_playing(&self.label);
                        }
                        self.fail(e);
                        return false;
                    }
                    for i in 0..left.len() {
                        let t = ((pos + i as u64) as f32 / fade_frames as f32).min(1.0);
                        let env = (t * FRAC_PI_2).cos() * volume;
                        left[i] *= env;
                        right[i] *= env;
                    }
                    let pos = pos + left.len() as u64;
                    let next = if pos >= fade_frames {
                        // Période inactive : cooldown d'exclusivité, décodage en pause
                        if let Some(coordinator) = &self.exclusion {
                            coordinator.finish_playing(&self.label);
                        }
                        let until = now
                            + inactive_len_frames(
                                &self.tuning,
                                duty,
                                self.sample_rate,
                                &mut self.rng,
                            );
                        PresencePhase::Inactive { until }
                    } else {
                        PresencePhase::FadeOut { pos }
                    };
                    self.state = PlayerState::Presence {
                        reader,
                        phase: next,
                    };
                    return true;
                }
            }
        }
    }
}

/// Intervalle sparse : moyenne interpolée par la présence, variance uniforme
fn sparse_interval_frames(
    tuning: &ThemeTuning,
    presence: f32,
    sample_rate: u32,
    rng: &mut StdRng,
) -> u64 {
    let presence = f64::from(presence).clamp(0.0, 1.0);
    let mean = tuning.sparse_max_interval_s
        + (tuning.sparse_min_interval_s - tuning.sparse_max_interval_s) * presence;
    let variance = tuning.sparse_variance.clamp(0.0, 1.0);
    let factor = if variance > 0.0 {
        rng.gen_range(1.0 - variance..1.0 + variance)
    } else {
        1.0
    };
    ((mean * factor).max(0.0) * sample_rate as f64) as u64
}

/// Durée d'une période active presence, jitter ±30 %
fn active_len_frames(tuning: &ThemeTuning, duty: f64, sample_rate: u32, rng: &mut StdRng) -> u64 {
    let base = (duty * tuning.presence_period_s).max(2.0 * tuning.presence_fade_s);
    ((base * rng.gen_range(0.7..1.3)) * sample_rate as f64) as u64
}

/// Durée d'une période inactive presence, jitter ±30 %
fn inactive_len_frames(tuning: &ThemeTuning, duty: f64, sample_rate: u32, rng: &mut StdRng) -> u64 {
    let base = ((1.0 - duty) * tuning.presence_period_s).max(1.0);
    ((base * rng.gen_range(0.7..1.3)) * sample_rate as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::BufferSource;
    use crate::settings::PlaybackMode;

    const RATE: u32 = 48000;

    fn ramp_source(frames: usize) -> Arc<BufferSource> {
        let data: Vec<f32> = (0..frames).map(|i| (i + 1) as f32 / frames as f32).collect();
        Arc::new(BufferSource::new("ramp", data.clone(), data, RATE))
    }

    fn player_for(
        source: Arc<dyn AudioSource>,
        settings: TrackSettings,
        tuning: ThemeTuning,
        clock: &Arc<FrameClock>,
    ) -> RecordingPlayer {
        let coordinator = Arc::new(ExclusionCoordinator::new(
            clock.clone(),
            tuning.min_gap_after_exclusive_s,
            tuning.initial_exclusive_delay_s,
        ));
        RecordingPlayer::new(source, settings, Arc::new(tuning), clock.clone(), coordinator, 7)
    }

    fn pull(player: &mut RecordingPlayer, clock: &FrameClock, n: usize) -> (Vec<f32>, bool) {
        let mut l = vec![0.0; n];
        let mut r = vec![0.0; n];
        let audible = player.fill(&mut l, &mut r);
        clock.advance(n as u64);
        (l, audible)
    }

    #[test]
    fn test_seamless_loop_has_no_gap() {
        let clock = Arc::new(FrameClock::new(RATE));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Continuous,
            seamless_loop: true,
            ..Default::default()
        };
        // 1000 frames de rampe strictement positive
        let mut player = player_for(ramp_source(1000), settings, ThemeTuning::default(), &clock);

        // 4096 frames = 4 boucles et quelque ; aucune frame nulle
        let (l, audible) = pull(&mut player, &clock, 4096);
        assert!(audible);
        assert!(l.iter().all(|&s| s > 0.0), "gap found in seamless loop");
        // La frontière de boucle enchaîne fin → début
        assert!((l[999] - 1.0).abs() < 1e-6);
        assert!((l[1000] - 1.0 / 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_loop_crossfade_equal_power() {
        let clock = Arc::new(FrameClock::new(RATE));
        let tuning = ThemeTuning {
            loop_crossfade_s: 0.01, // 480 frames
            ..Default::default()
        };
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Continuous,
            seamless_loop: false,
            ..Default::default()
        };
        // Source constante à 1.0 : le crossfade cos+sin de deux signaux
        // identiques donne cos(t)+sin(t) ∈ [1, √2]
        let frames = 48000;
        let source = Arc::new(BufferSource::new(
            "const",
            vec![1.0; frames],
            vec![1.0; frames],
            RATE,
        ));
        let mut player = player_for(source, settings, tuning, &clock);

        let (l, _) = pull(&mut player, &clock, frames + 2048);
        for (i, &s) in l.iter().enumerate() {
            assert!(
                (0.99..=std::f32::consts::SQRT_2 + 0.01).contains(&s),
                "sample {i} out of crossfade bounds: {s}"
            );
        }
    }

    #[test]
    fn test_muted_is_silent_and_inactive() {
        let clock = Arc::new(FrameClock::new(RATE));
        let settings = TrackSettings {
            muted: true,
            ..Default::default()
        };
        let mut player = player_for(ramp_source(1000), settings, ThemeTuning::default(), &clock);
        let (l, audible) = pull(&mut player, &clock, 1024);
        assert!(!audible);
        assert!(l.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_sparse_waits_then_plays_fully() {
        let clock = Arc::new(FrameClock::new(RATE));
        let tuning = ThemeTuning {
            sparse_min_interval_s: 10.0,
            sparse_max_interval_s: 10.0,
            sparse_variance: 0.0,
            track_fade_s: 0.0,
            ..Default::default()
        };
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Sparse,
            presence: 1.0,
            ..Default::default()
        };
        // 2048 frames à 0.5
        let source = Arc::new(BufferSource::new(
            "shot",
            vec![0.5; 2048],
            vec![0.5; 2048],
            RATE,
        ));
        let mut player = player_for(source, settings, tuning, &clock);

        // Délai initial : fraction aléatoire de l'intervalle, ≤ 10 s
        let mut waited = 0u64;
        let mut started = false;
        for _ in 0..(11 * RATE as u64 / 1024) {
            let (l, audible) = pull(&mut player, &clock, 1024);
            if audible {
                assert!(l.iter().all(|&s| (s - 0.5).abs() < 1e-6));
                started = true;
                break;
            }
            assert!(l.iter().all(|&s| s == 0.0));
            waited += 1024;
        }
        assert!(started, "sparse track never started (waited {waited} frames)");

        // Deuxième bloc : fin de la lecture puis réarmement
        let (_, audible) = pull(&mut player, &clock, 1024);
        assert!(audible);
        let (_, audible) = pull(&mut player, &clock, 1024);
        assert!(!audible, "expected rearm silence after one-shot");
    }

    #[test]
    fn test_presence_full_duty_is_continuous() {
        let clock = Arc::new(FrameClock::new(RATE));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Presence,
            presence: 1.0,
            seamless_loop: true,
            ..Default::default()
        };
        let mut player = player_for(ramp_source(1000), settings, ThemeTuning::default(), &clock);
        for _ in 0..8 {
            let (l, audible) = pull(&mut player, &clock, 1024);
            assert!(audible);
            assert!(l.iter().all(|&s| s > 0.0));
        }
    }

    #[test]
    fn test_presence_zero_duty_is_silent() {
        let clock = Arc::new(FrameClock::new(RATE));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Presence,
            presence: 0.0,
            ..Default::default()
        };
        let mut player = player_for(ramp_source(1000), settings, ThemeTuning::default(), &clock);
        for _ in 0..8 {
            let (l, audible) = pull(&mut player, &clock, 1024);
            assert!(!audible);
            assert!(l.iter().all(|&s| s == 0.0));
        }
    }

    #[test]
    fn test_decode_failure_silences_track() {
        struct BrokenSource;
        impl AudioSource for BrokenSource {
            fn label(&self) -> &str {
                "broken"
            }
            fn sample_rate(&self) -> u32 {
                RATE
            }
            fn duration_frames(&self) -> Result<u64, DecodeError> {
                Err(DecodeError::Decode("truncated".into()))
            }
            fn open(&self) -> Result<Box<dyn Decoder>, DecodeError> {
                Err(DecodeError::Decode("truncated".into()))
            }
        }

        let clock = Arc::new(FrameClock::new(RATE));
        let mut player = player_for(
            Arc::new(BrokenSource),
            TrackSettings::default(),
            ThemeTuning::default(),
            &clock,
        );
        assert!(player.is_disabled());
        let (l, audible) = pull(&mut player, &clock, 1024);
        assert!(!audible);
        assert!(l.iter().all(|&s| s == 0.0));
    }
}
