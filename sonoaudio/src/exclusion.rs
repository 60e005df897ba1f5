//! Coordination d'exclusivité entre pistes d'un même thème
//!
//! Une instance par [`ThemeMixer`](crate::ThemeMixer). Garantit qu'au plus une
//! piste marquée `exclusive` est audible à un instant donné, avec un temps
//! mort obligatoire après chaque lecture et un plancher d'activation au
//! démarrage du thème. Le temps est lu sur l'horloge de frames du mixer,
//! jamais sur l'horloge murale.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::clock::FrameClock;

#[derive(Debug, Default)]
struct ExclusionState {
    /// Piste exclusive en cours de lecture
    playing: Option<String>,
    /// Instant (s) où la lecture courante se terminera
    play_end_s: f64,
    /// Dernière piste jouée, pour la règle de non-répétition
    last_played: Option<String>,
    /// Aucune lecture exclusive avant cet instant (s)
    cooldown_until_s: f64,
    registered: HashSet<String>,
}

/// Coordinateur d'exclusion mutuelle, lié à l'horloge du mixer
#[derive(Debug)]
pub struct ExclusionCoordinator {
    clock: Arc<FrameClock>,
    min_gap_s: f64,
    initial_delay_s: f64,
    state: Mutex<ExclusionState>,
}

impl ExclusionCoordinator {
    pub fn new(clock: Arc<FrameClock>, min_gap_s: f64, initial_delay_s: f64) -> Self {
        Self {
            clock,
            min_gap_s,
            initial_delay_s,
            state: Mutex::new(ExclusionState::default()),
        }
    }

    /// Déclare une piste exclusive auprès du coordinateur
    pub fn register_track(&self, name: &str) {
        let mut state = self.state.lock().expect("exclusion mutex poisoned");
        state.registered.insert(name.to_string());
        tracing::debug!(
            track = name,
            total = state.registered.len(),
            "exclusion group: track registered"
        );
    }

    /// Si la lecture déclarée est arrivée à son terme, bascule en cooldown.
    /// Filet de sécurité : les lecteurs appellent normalement
    /// `finish_playing` eux-mêmes.
    fn expire_if_done(&self, state: &mut ExclusionState, now: f64) {
        if state.playing.is_some() && now >= state.play_end_s {
            state.last_played = state.playing.take();
            state.cooldown_until_s = now + self.min_gap_s;
        }
    }

    /// Tente de démarrer une lecture exclusive
    ///
    /// Accordée ssi le plancher initial est passé, qu'aucune autre piste
    /// exclusive ne joue, que le cooldown est écoulé, et que la piste n'est
    /// pas celle qui vient de jouer (sauf si elle est seule inscrite).
    pub fn try_start_playing(&self, name: &str, expected_duration_s: f64) -> bool {
        let mut state = self.state.lock().expect("exclusion mutex poisoned");
        let now = self.clock.seconds();

        if now < self.initial_delay_s {
            return false;
        }

        self.expire_if_done(&mut state, now);

        if state.playing.is_some() {
            return false;
        }
        if now < state.cooldown_until_s {
            return false;
        }
        if state.last_played.as_deref() == Some(name) && state.registered.len() > 1 {
            return false;
        }

        state.playing = Some(name.to_string());
        state.play_end_s = now + expected_duration_s;
        tracing::debug!(
            track = name,
            duration_s = expected_duration_s,
            "exclusion group: playback granted"
        );
        true
    }

    /// Déclare la fin d'une lecture exclusive et arme le cooldown
    pub fn finish_playing(&self, name: &str) {
        let mut state = self.state.lock().expect("exclusion mutex poisoned");
        if state.playing.as_deref() == Some(name) {
            let now = self.clock.seconds();
            state.last_played = state.playing.take();
            state.play_end_s = 0.0;
            state.cooldown_until_s = now + self.min_gap_s;
            tracing::debug!(
                track = name,
                cooldown_s = self.min_gap_s,
                "exclusion group: playback finished"
            );
        }
    }

    /// Vrai si la piste ne peut pas jouer maintenant
    pub fn is_blocked(&self, name: &str) -> bool {
        let mut state = self.state.lock().expect("exclusion mutex poisoned");
        let now = self.clock.seconds();

        if now < self.initial_delay_s {
            return true;
        }

        self.expire_if_done(&mut state, now);

        if let Some(playing) = &state.playing {
            if playing != name {
                return true;
            }
        }
        if now < state.cooldown_until_s {
            return true;
        }
        if state.last_played.as_deref() == Some(name) && state.registered.len() > 1 {
            return true;
        }
        false
    }

    /// Estimation du délai (s) avant qu'une demande puisse aboutir
    ///
    /// Les lecteurs s'en servent pour espacer leurs nouvelles tentatives au
    /// lieu de solliciter le coordinateur à chaque bloc.
    pub fn wait_hint_s(&self) -> f64 {
        let state = self.state.lock().expect("exclusion mutex poisoned");
        let now = self.clock.seconds();

        if now < self.initial_delay_s {
            return self.initial_delay_s - now;
        }
        if state.playing.is_some() {
            let remaining = state.play_end_s - now;
            if remaining > 0.0 {
                return remaining + self.min_gap_s;
            }
        }
        if now < state.cooldown_until_s {
            return state.cooldown_until_s - now;
        }
        0.0
    }
}
