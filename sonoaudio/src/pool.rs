//! Pool de canaux : allocation bornée, liaison aux sessions, reaper
//!
//! Le pool détient `max_channels` canaux pré-créés (identités
//! `1..=max_channels`). Politique d'attribution pour une session qui demande
//! la lecture :
//!
//! 1. la session a déjà un canal lié → réutilisé tel quel ;
//! 2. sinon le canal idle de plus petit numéro ;
//! 3. sinon le canal sans auditeur ni liaison dont le dernier détachement est
//!    le plus ancien (LRU) : il est arrêté puis réattribué ;
//! 4. sinon `NoChannelAvailable`.
//!
//! Le reaper rend un canal au repos quand son registre d'auditeurs est vide
//! depuis `idle_channel_timeout_s` et qu'aucune session n'y est liée.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelSnapshot};
use crate::error::EngineError;
use crate::mixer::MasterGain;
use crate::settings::EngineParams;

pub struct ChannelPool {
    channels: Vec<Arc<Channel>>,
    /// session_id → channel_id
    bindings: Mutex<HashMap<String, u32>>,
    params: EngineParams,
}

impl ChannelPool {
    pub fn new(params: EngineParams, master_gain: MasterGain) -> Arc<Self> {
        let params = params.clamped();
        let channels = (1..=params.max_channels)
            .map(|id| Channel::new(id, params.clone(), master_gain.clone()))
            .collect();
        tracing::info!(max_channels = params.max_channels, "channel pool initialized");
        Arc::new(Self {
            channels,
            bindings: Mutex::new(HashMap::new()),
            params,
        })
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn channel(&self, id: u32) -> Result<Arc<Channel>, EngineError> {
        self.channels
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or(EngineError::UnknownChannel(id))
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.channels.iter().map(|c| c.snapshot()).collect()
    }

    /// Canal lié à une session, s'il existe
    pub fn binding_of(&self, session_id: &str) -> Option<u32> {
        self.bindings
            .lock()
            .expect("pool mutex poisoned")
            .get(session_id)
            .copied()
    }

    fn is_bound(&self, channel_id: u32) -> bool {
        self.bindings
            .lock()
            .expect("pool mutex poisoned")
            .values()
            .any(|&id| id == channel_id)
    }

    /// Attribue un canal à la session, selon la politique du module
    pub fn assign_or_reuse(&self, session_id: &str) -> Result<Arc<Channel>, EngineError> {
        let mut bindings = self.bindings.lock().expect("pool mutex poisoned");

        if let Some(&id) = bindings.get(session_id) {
            if let Some(channel) = self.channels.iter().find(|c| c.id() == id) {
                return Ok(channel.clone());
            }
        }

        let bound: HashSet<u32> = bindings.values().copied().collect();

        // Plus petit canal idle non lié
        if let Some(channel) = self.channels.iter().find(|c| {
            c.state() == crate::channel::ChannelStateKind::Idle && !bound.contains(&c.id())
        }) {
            bindings.insert(session_id.to_string(), channel.id());
            tracing::info!(session = session_id, channel = channel.id(), "channel assigned");
            return Ok(channel.clone());
        }

        // LRU parmi les canaux sans auditeur ni liaison
        let mut oldest: Option<(Arc<Channel>, tokio::time::Instant)> = None;
        for channel in &self.channels {
            if bound.contains(&channel.id()) {
                continue;
            }
            if let Some(since) = channel.empty_since() {
                if oldest.as_ref().map(|(_, t)| since < *t).unwrap_or(true) {
                    oldest = Some((channel.clone(), since));
                }
            }
        }
        if let Some((channel, _)) = oldest {
            tracing::info!(
                session = session_id,
                channel = channel.id(),
                "reassigning least-recently-used channel"
            );
            channel.stop();
            bindings.insert(session_id.to_string(), channel.id());
            return Ok(channel.clone());
        }

        Err(EngineError::NoChannelAvailable)
    }

    /// Délie la session de son canal. Le canal continue de jouer pour ses
    /// auditeurs restants ; le reaper le rendra au repos une fois vide.
    pub fn release(&self, session_id: &str) -> Option<u32> {
        let released = self
            .bindings
            .lock()
            .expect("pool mutex poisoned")
            .remove(session_id);
        if let Some(id) = released {
            tracing::info!(session = session_id, channel = id, "channel released");
        }
        released
    }

    /// Lance la tâche de récupération des canaux abandonnés
    pub fn spawn_reaper(self: &Arc<Self>, token: CancellationToken) {
        let pool = self.clone();
        let timeout = Duration::from_secs_f64(self.params.idle_channel_timeout_s);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        for channel in pool.channels() {
                            if channel.reapable(timeout) && !pool.is_bound(channel.id()) {
                                tracing::info!(channel = channel.id(), "reaping idle channel");
                                channel.stop();
                            }
                        }
                    }
                }
            }
        });
    }
}
