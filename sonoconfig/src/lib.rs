//! # sonoconfig - Configuration de Sonorium
//!
//! La configuration est typée de bout en bout : chaque section est une
//! struct serde avec ses valeurs par défaut, et un fichier partiel est
//! complété champ par champ par ces défauts au moment de la
//! désérialisation — il n'y a pas de fusion d'arbres YAML.
//!
//! Emplacements consultés, premier lisible gagnant :
//!
//! 1. chemin explicite passé à `load_config` ;
//! 2. variable d'environnement `SONORIUM_CONFIG` ;
//! 3. `./.sonorium.yml` ;
//! 4. `~/.sonorium.yml`.
//!
//! Les variables `SONORIUM_CONFIG__SECTION__CLE=valeur` s'appliquent par
//! dessus le document chargé. Au premier démarrage, quand aucun fichier
//! n'existe, le gabarit commenté embarqué est écrit au premier emplacement
//! accessible en écriture ; un fichier existant n'est jamais réécrit
//! derrière le dos de l'utilisateur.

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::{env, fs, sync::Arc};
use tracing::{debug, info};

use sonoaudio::{EngineParams, ThemeTuning};

/// Gabarit commenté, écrit tel quel au premier démarrage
const DEFAULT_CONFIG: &str = include_str!("sonorium.yaml");

const ENV_CONFIG_FILE: &str = "SONORIUM_CONFIG";
const ENV_PREFIX: &str = "SONORIUM_CONFIG__";
const CONFIG_FILE_NAME: &str = ".sonorium.yml";

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("Sonorium configuration is unusable"));
}

/// Configuration globale du processus
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    pub http_port: u16,
    pub base_url: String,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            http_port: 8096,
            base_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    pub master_gain: f32,
    pub rng_seed: Option<u64>,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            master_gain: 1.0,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_channels: u32,
    pub crossfade_window_s: f64,
    pub listener_buffer_s: f64,
    pub listener_dead_after_drop_s: f64,
    pub idle_channel_timeout_s: f64,
    pub decode_open_timeout_s: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_channels: 6,
            crossfade_window_s: 3.0,
            listener_buffer_s: 2.0,
            listener_dead_after_drop_s: 10.0,
            idle_channel_timeout_s: 30.0,
            decode_open_timeout_s: 5.0,
        }
    }
}

/// Section thèmes : racine des dossiers + accordage par défaut
///
/// L'accordage est repris tel quel par le fournisseur de thèmes, qui peut le
/// surcharger thème par thème via `theme.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemesSection {
    pub root: String,
    #[serde(flatten)]
    pub tuning: ThemeTuning,
}

impl Default for ThemesSection {
    fn default() -> Self {
        Self {
            root: "./themes".to_string(),
            tuning: ThemeTuning::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub default_volume: u8,
    pub max_sessions: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            default_volume: 50,
            max_sessions: 20,
        }
    }
}

/// La configuration typée complète
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SonoriumConfig {
    pub host: HostSection,
    pub audio: AudioSection,
    pub engine: EngineSection,
    pub themes: ThemesSection,
    pub sessions: SessionsSection,
}

/// Configuration chargée, avec son emplacement de sauvegarde
#[derive(Debug, Clone)]
pub struct Config {
    path: PathBuf,
    data: SonoriumConfig,
}

impl Config {
    /// Charge la configuration : premier candidat lisible, surcharges
    /// d'environnement, puis typage. Sans fichier, les défauts s'appliquent
    /// et le gabarit commenté est déposé pour la prochaine fois.
    pub fn load_config(explicit: &str) -> Result<Self> {
        let candidates = Self::candidate_paths(explicit);

        let mut loaded_from: Option<PathBuf> = None;
        let mut document = Value::Mapping(Mapping::new());
        for candidate in &candidates {
            match fs::read_to_string(candidate) {
                Ok(text) => {
                    document = serde_yaml::from_str(&text).map_err(|e| {
                        anyhow!("invalid YAML in '{}': {e}", candidate.display())
                    })?;
                    info!(config_file = %candidate.display(), "configuration loaded");
                    loaded_from = Some(candidate.clone());
                    break;
                }
                Err(_) => {
                    debug!(config_file = %candidate.display(), "no configuration at this location");
                }
            }
        }

        Self::apply_env_overrides(&mut document);

        // Les champs absents du document prennent leur valeur par défaut à
        // la désérialisation ; aucune fusion d'arbres n'est nécessaire
        let data: SonoriumConfig = serde_yaml::from_value(document)
            .map_err(|e| anyhow!("invalid configuration: {e}"))?;

        let path = match loaded_from {
            Some(path) => path,
            None => {
                let path = candidates
                    .iter()
                    .find(|c| Self::is_writable(c))
                    .cloned()
                    .ok_or_else(|| anyhow!("no writable location for the config file"))?;
                info!(config_file = %path.display(), "first run: writing the commented config template");
                fs::write(&path, DEFAULT_CONFIG)?;
                path
            }
        };

        Ok(Config { path, data })
    }

    /// Emplacements consultés, dans l'ordre de priorité
    fn candidate_paths(explicit: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if !explicit.is_empty() {
            candidates.push(PathBuf::from(explicit));
        }
        if let Ok(env_path) = env::var(ENV_CONFIG_FILE) {
            if !env_path.is_empty() {
                candidates.push(PathBuf::from(env_path));
            }
        }
        candidates.push(PathBuf::from(CONFIG_FILE_NAME));
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(CONFIG_FILE_NAME));
        }
        candidates
    }

    /// Réécrit la configuration courante à son emplacement
    pub fn save(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.data)?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    pub fn data(&self) -> &SonoriumConfig {
        &self.data
    }

    pub fn get_http_port(&self) -> u16 {
        self.data.host.http_port
    }

    /// URL de base annoncée aux transports ; dérivée de l'IP locale si vide
    pub fn get_base_url(&self) -> String {
        if !self.data.host.base_url.is_empty() {
            return self.data.host.base_url.trim_end_matches('/').to_string();
        }
        format!("http://{}:{}", guess_local_ip(), self.data.host.http_port)
    }

    pub fn get_themes_root(&self) -> PathBuf {
        PathBuf::from(&self.data.themes.root)
    }

    pub fn theme_tuning(&self) -> ThemeTuning {
        self.data.themes.tuning.clone()
    }

    /// Paramètres moteur dérivés de la configuration
    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            sample_rate: self.data.audio.sample_rate,
            channels: self.data.audio.channels,
            bitrate: self.data.audio.bitrate,
            max_channels: self.data.engine.max_channels,
            crossfade_window_s: self.data.engine.crossfade_window_s,
            listener_buffer_s: self.data.engine.listener_buffer_s,
            listener_dead_after_drop_s: self.data.engine.listener_dead_after_drop_s,
            idle_channel_timeout_s: self.data.engine.idle_channel_timeout_s,
            decode_open_timeout_s: self.data.engine.decode_open_timeout_s,
            rng_seed: self.data.audio.rng_seed,
            master_gain: self.data.audio.master_gain,
        }
        .clamped()
    }

    fn is_writable(path: &Path) -> bool {
        if path.exists() {
            fs::OpenOptions::new().append(true).open(path).is_ok()
        } else {
            path.parent()
                .map(|parent| parent.exists() || parent.as_os_str().is_empty())
                .unwrap_or(false)
        }
    }

    /// Surcharges `SONORIUM_CONFIG__SECTION__CLE=valeur` ; la valeur est
    /// parsée en YAML (nombres, booléens, chaînes)
    fn apply_env_overrides(document: &mut Value) {
        for (key, raw) in env::vars() {
            let Some(dotted) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let segments: Vec<String> = dotted.split("__").map(str::to_lowercase).collect();
            if segments.iter().any(|s| s.is_empty()) {
                continue;
            }
            let parsed: Value =
                serde_yaml::from_str(&raw).unwrap_or(Value::String(raw.clone()));
            info!(key = %dotted, "environment override applied");
            override_at(document, &segments, parsed);
        }
    }
}

/// Dépose `new_value` au chemin donné, en créant (ou remplaçant par) des
/// mappings intermédiaires au besoin
fn override_at(node: &mut Value, segments: &[String], new_value: Value) {
    match segments.split_first() {
        None => *node = new_value,
        Some((head, rest)) => {
            if !node.is_mapping() {
                *node = Value::Mapping(Mapping::new());
            }
            if let Value::Mapping(map) = node {
                let child = map
                    .entry(Value::String(head.clone()))
                    .or_insert(Value::Null);
                override_at(child, rest, new_value);
            }
        }
    }
}

/// Devine l'IP locale joignable depuis le LAN
pub fn guess_local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
