//! Réglages de piste, résolution du mode de lecture et paramètres moteur
//!
//! Les réglages sont des instantanés pris par valeur au chargement du thème :
//! modifier un réglage en cours de diffusion passe par un nouveau
//! `load_theme` (éventuellement vers le même thème), qui reconstruit les
//! lecteurs.

use serde::{Deserialize, Serialize};

/// Mode de lecture d'une piste
///
/// - `Auto` : choisi au chargement d'après la durée du fichier
/// - `Continuous` : bouclage permanent, enveloppe à 1
/// - `Sparse` : lecture intégrale une fois, puis silence jusqu'à la
///   prochaine activation planifiée
/// - `Presence` : fondus lents entre périodes actives et inactives dont le
///   rapport cyclique suit `presence`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    #[default]
    Auto,
    Continuous,
    Sparse,
    Presence,
}

/// Mode effectif après résolution de `Auto`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMode {
    Continuous,
    Sparse,
    Presence,
}

/// Réglages d'une piste au sein d'un thème
///
/// Persistés par le fournisseur de thèmes, consommés en lecture seule par le
/// moteur.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackSettings {
    /// Gain linéaire d'amplitude, dans `[0, 1]`
    pub volume: f32,

    /// Molette de fréquence dans `[0, 1]` : en mode sparse règle
    /// l'intervalle entre lectures, en mode presence le rapport
    /// actif/inactif
    pub presence: f32,

    pub playback_mode: PlaybackMode,

    /// `true` : le fichier boucle tête-à-queue sans crossfade ;
    /// `false` : un crossfade est appliqué à la frontière de boucle
    pub seamless_loop: bool,

    /// La piste participe à la coordination du groupe d'exclusivité
    pub exclusive: bool,

    /// Piste coupée : contribue du silence exact et saute le décodage
    pub muted: bool,
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            presence: 1.0,
            playback_mode: PlaybackMode::Auto,
            seamless_loop: false,
            exclusive: false,
            muted: false,
        }
    }
}

/// Surcouche partielle de réglages, appliquée par un preset
///
/// Seuls les champs présents écrasent la valeur de base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackOverlay {
    pub volume: Option<f32>,
    pub presence: Option<f32>,
    pub playback_mode: Option<PlaybackMode>,
    pub seamless_loop: Option<bool>,
    pub exclusive: Option<bool>,
    pub muted: Option<bool>,
}

impl TrackOverlay {
    /// Applique la surcouche sur des réglages de base
    pub fn apply(&self, base: &mut TrackSettings) {
        if let Some(v) = self.volume {
            base.volume = v.clamp(0.0, 1.0);
        }
        if let Some(p) = self.presence {
            base.presence = p.clamp(0.0, 1.0);
        }
        if let Some(m) = self.playback_mode {
            base.playback_mode = m;
        }
        if let Some(s) = self.seamless_loop {
            base.seamless_loop = s;
        }
        if let Some(e) = self.exclusive {
            base.exclusive = e;
        }
        if let Some(m) = self.muted {
            base.muted = m;
        }
    }
}

/// Accordage par thème : seuils de classification, planification sparse,
/// périodes de présence, fenêtres de fondu
///
/// Tous surchageables thème par thème via le fournisseur.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeTuning {
    /// Au-delà de cette durée, `Auto` résout en `Continuous`
    pub long_file_threshold_s: f64,
    /// En deçà de cette durée, `Auto` résout en `Sparse`
    pub short_file_threshold_s: f64,

    /// Intervalle moyen entre lectures sparse à `presence = 1`
    pub sparse_min_interval_s: f64,
    /// Intervalle moyen entre lectures sparse à `presence = 0`
    pub sparse_max_interval_s: f64,
    /// Variance uniforme appliquée à l'intervalle (±fraction de la moyenne)
    pub sparse_variance: f64,
    /// Report minimal de la première activation d'une piste sparse exclusive
    pub sparse_startup_delay_s: f64,

    /// Silence obligatoire après la fin d'une lecture exclusive
    pub min_gap_after_exclusive_s: f64,
    /// Aucune lecture exclusive avant ce délai après le chargement du thème
    pub initial_exclusive_delay_s: f64,

    /// Période du cycle actif/inactif en mode presence
    pub presence_period_s: f64,
    /// Durée des fondus d'entrée/sortie de période active
    pub presence_fade_s: f64,

    /// Fondu d'attaque/retombée d'une lecture sparse
    pub track_fade_s: f64,

    /// Fenêtre du crossfade de boucle (pistes continues non seamless)
    pub loop_crossfade_s: f64,
}

impl Default for ThemeTuning {
    fn default() -> Self {
        Self {
            long_file_threshold_s: 60.0,
            short_file_threshold_s: 10.0,
            sparse_min_interval_s: 180.0,
            sparse_max_interval_s: 1800.0,
            sparse_variance: 0.30,
            sparse_startup_delay_s: 60.0,
            min_gap_after_exclusive_s: 30.0,
            initial_exclusive_delay_s: 60.0,
            presence_period_s: 90.0,
            presence_fade_s: 10.0,
            track_fade_s: 6.0,
            loop_crossfade_s: 1.5,
        }
    }
}

impl ThemeTuning {
    /// Résout le mode effectif d'une piste
    ///
    /// `Auto` est classé d'après la durée du fichier : long → continu,
    /// court → sparse, entre les deux → continu (matière de fond par défaut).
    pub fn resolve_mode(&self, mode: PlaybackMode, duration_s: f64) -> ResolvedMode {
        match mode {
            PlaybackMode::Continuous => ResolvedMode::Continuous,
            PlaybackMode::Sparse => ResolvedMode::Sparse,
            PlaybackMode::Presence => ResolvedMode::Presence,
            PlaybackMode::Auto => {
                if duration_s < self.short_file_threshold_s {
                    ResolvedMode::Sparse
                } else {
                    ResolvedMode::Continuous
                }
            }
        }
    }
}

/// Paramètres globaux du moteur, fixés au démarrage
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Cadence canonique interne en Hz ; tout le mixage se fait à ce taux
    pub sample_rate: u32,
    /// Nombre de canaux ; le pipeline est stéréo
    pub channels: u16,
    /// Débit de l'encodage MP3 en bits/s
    pub bitrate: u32,
    /// Taille du pool de canaux, bornée à `1..=10`
    pub max_channels: u32,
    /// Fenêtre du crossfade de transition de thème
    pub crossfade_window_s: f64,
    /// Profondeur du buffer de sortie d'un auditeur, en secondes d'audio
    /// compressé
    pub listener_buffer_s: f64,
    /// Durée de drop ininterrompu au-delà de laquelle un auditeur est
    /// déclaré mort
    pub listener_dead_after_drop_s: f64,
    /// Délai avant qu'un canal sans auditeur ni session ne repasse idle
    pub idle_channel_timeout_s: f64,
    /// Timeout souple d'ouverture d'un décodeur
    pub decode_open_timeout_s: f64,
    /// Graine RNG du moteur ; fixée, le mixage est bit-identique entre runs
    pub rng_seed: Option<u64>,
    /// Gain maître initial
    pub master_gain: f32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            max_channels: 6,
            crossfade_window_s: 3.0,
            listener_buffer_s: 2.0,
            listener_dead_after_drop_s: 10.0,
            idle_channel_timeout_s: 30.0,
            decode_open_timeout_s: 5.0,
            rng_seed: None,
            master_gain: 1.0,
        }
    }
}

impl EngineParams {
    /// Borne `max_channels` à la plage supportée
    pub fn clamped(mut self) -> Self {
        self.max_channels = self.max_channels.clamp(1, 10);
        self
    }
}
