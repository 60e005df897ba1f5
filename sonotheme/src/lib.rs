//! # sonotheme - Fournisseur de thèmes sur dossiers
//!
//! Un thème est un sous-dossier de la racine configurée : ses fichiers audio
//! en sont les pistes. Un fichier `theme.yaml` optionnel dans le dossier
//! porte les réglages par piste, les surcharges d'accordage du thème et les
//! presets nommés :
//!
//! ```yaml
//! tuning:
//!   short_file_threshold_s: 8.0
//! tracks:
//!   thunder:
//!     playback_mode: sparse
//!     exclusive: true
//!     volume: 0.8
//! presets:
//!   night:
//!     thunder:
//!       muted: true
//! ```
//!
//! Le fournisseur ne surveille pas le système de fichiers : `reload()` est
//! explicite, conformément au contrat du moteur.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;

use sonoaudio::{
    EngineError, FileSource, ThemeSupplier, ThemeTuning, TrackOverlay, TrackSettings, TrackSpec,
};

/// Extensions de fichiers reconnues comme pistes audio
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg", "oga", "m4a", "aac"];

/// Nom du fichier de métadonnées d'un thème
const THEME_META_FILE: &str = "theme.yaml";

/// Contenu de `theme.yaml`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ThemeMeta {
    /// Surcharge partielle de l'accordage du thème
    tuning: Option<serde_yaml::Value>,
    /// Réglages par piste, indexés par label (nom de fichier sans extension)
    tracks: HashMap<String, TrackSettings>,
    /// Presets nommés : label → surcouche partielle
    presets: HashMap<String, HashMap<String, TrackOverlay>>,
}

#[derive(Debug)]
struct ThemeFolder {
    files: Vec<PathBuf>,
    meta: ThemeMeta,
}

/// Fournisseur de thèmes adossé à un dossier racine
pub struct FolderThemeSupplier {
    root: PathBuf,
    sample_rate: u32,
    default_tuning: ThemeTuning,
    themes: RwLock<HashMap<String, Arc<ThemeFolder>>>,
}

impl FolderThemeSupplier {
    pub fn new(root: impl Into<PathBuf>, sample_rate: u32, default_tuning: ThemeTuning) -> Self {
        Self {
            root: root.into(),
            sample_rate,
            default_tuning,
            themes: RwLock::new(HashMap::new()),
        }
    }

    /// Rescanne la racine. Les thèmes disparus sont oubliés, les nouveaux
    /// apparaissent ; les mixers déjà chargés ne sont pas affectés (leurs
    /// réglages sont des instantanés).
    pub fn reload(&self) -> Result<usize, EngineError> {
        let mut scanned = HashMap::new();

        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            EngineError::Supplier(format!(
                "cannot read themes root '{}': {e}",
                self.root.display()
            ))
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let folder = scan_theme_folder(&path);
            if folder.files.is_empty() {
                tracing::debug!(theme = name, "skipping folder without audio files");
                continue;
            }
            tracing::info!(
                theme = name,
                tracks = folder.files.len(),
                presets = folder.meta.presets.len(),
                "theme discovered"
            );
            scanned.insert(name.to_string(), Arc::new(folder));
        }

        let count = scanned.len();
        *self.themes.write().expect("themes lock poisoned") = scanned;
        tracing::info!(themes = count, root = %self.root.display(), "theme library loaded");
        Ok(count)
    }

    fn theme(&self, theme_ref: &str) -> Result<Arc<ThemeFolder>, EngineError> {
        self.themes
            .read()
            .expect("themes lock poisoned")
            .get(theme_ref)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTheme(theme_ref.to_string()))
    }
}

fn scan_theme_folder(path: &Path) -> ThemeFolder {
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();

    let meta_path = path.join(THEME_META_FILE);
    let meta = if meta_path.is_file() {
        match std::fs::read_to_string(&meta_path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_yaml::from_str::<ThemeMeta>(&text).map_err(|e| e.to_string()))
        {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(
                    path = %meta_path.display(),
                    "unreadable theme.yaml, using defaults: {e}"
                );
                ThemeMeta::default()
            }
        }
    } else {
        ThemeMeta::default()
    };

    ThemeFolder { files, meta }
}

/// Fusionne une surcharge YAML partielle sur l'accordage par défaut
fn merged_tuning(base: &ThemeTuning, overlay: Option<&serde_yaml::Value>) -> ThemeTuning {
    let Some(overlay) = overlay else {
        return base.clone();
    };
    if overlay.is_null() {
        return base.clone();
    }
    let Ok(mut value) = serde_yaml::to_value(base) else {
        return base.clone();
    };
    if let (serde_yaml::Value::Mapping(target), serde_yaml::Value::Mapping(source)) =
        (&mut value, overlay)
    {
        for (key, v) in source {
            target.insert(key.clone(), v.clone());
        }
    }
    serde_yaml::from_value(value).unwrap_or_else(|e| {
        tracing::warn!("invalid tuning override, using defaults: {e}");
        base.clone()
    })
}

fn label_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[async_trait]
impl ThemeSupplier for FolderThemeSupplier {
    async fn list_themes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .themes
            .read()
            .expect("themes lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    async fn list_files(&self, theme_ref: &str) -> Result<Vec<TrackSpec>, EngineError> {
        let folder = self.theme(theme_ref)?;
        Ok(folder
            .files
            .iter()
            .map(|path| {
                let label = label_of(path);
                let settings = folder.meta.tracks.get(&label).cloned().unwrap_or_default();
                TrackSpec {
                    source: Arc::new(FileSource::new(path.clone(), self.sample_rate)),
                    settings,
                }
            })
            .collect())
    }

    async fn preset_overlay(
        &self,
        theme_ref: &str,
        preset_ref: &str,
    ) -> Result<HashMap<String, TrackOverlay>, EngineError> {
        let folder = self.theme(theme_ref)?;
        folder
            .meta
            .presets
            .get(preset_ref)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPreset(preset_ref.to_string()))
    }

    async fn theme_tuning(&self, theme_ref: &str) -> Result<ThemeTuning, EngineError> {
        let folder = self.theme(theme_ref)?;
        Ok(merged_tuning(&self.default_tuning, folder.meta.tuning.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonoaudio::AudioSource;
    use std::fs;

    fn make_theme(root: &Path, name: &str, files: &[&str], meta: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for f in files {
            fs::write(dir.join(f), b"fake audio").unwrap();
        }
        if let Some(yaml) = meta {
            fs::write(dir.join(THEME_META_FILE), yaml).unwrap();
        }
    }

    fn supplier(root: &Path) -> FolderThemeSupplier {
        FolderThemeSupplier::new(root, 48000, ThemeTuning::default())
    }

    #[tokio::test]
    async fn test_scan_discovers_themes() {
        let tmp = tempfile::tempdir().unwrap();
        make_theme(tmp.path(), "forest", &["wind.mp3", "birds.wav", "notes.txt"], None);
        make_theme(tmp.path(), "empty", &["readme.md"], None);

        let s = supplier(tmp.path());
        assert_eq!(s.reload().unwrap(), 1);
        assert_eq!(s.list_themes().await, vec!["forest".to_string()]);

        let tracks = s.list_files("forest").await.unwrap();
        // Triées par nom de fichier : birds avant wind, notes.txt ignoré
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].source.label(), "birds");
        assert_eq!(tracks[1].source.label(), "wind");
    }

    #[tokio::test]
    async fn test_track_settings_and_presets() {
        let tmp = tempfile::tempdir().unwrap();
        make_theme(
            tmp.path(),
            "storm",
            &["thunder.mp3", "rain.mp3"],
            Some(
                r#"
tracks:
  thunder:
    playback_mode: sparse
    exclusive: true
    volume: 0.8
presets:
  calm:
    thunder:
      muted: true
"#,
            ),
        );

        let s = supplier(tmp.path());
        s.reload().unwrap();

        let tracks = s.list_files("storm").await.unwrap();
        let thunder = tracks
            .iter()
            .find(|t| t.source.label() == "thunder")
            .unwrap();
        assert!(thunder.settings.exclusive);
        assert!((thunder.settings.volume - 0.8).abs() < f32::EPSILON);
        let rain = tracks.iter().find(|t| t.source.label() == "rain").unwrap();
        assert!(!rain.settings.exclusive);

        let overlay = s.preset_overlay("storm", "calm").await.unwrap();
        assert_eq!(overlay["thunder"].muted, Some(true));

        assert!(matches!(
            s.preset_overlay("storm", "missing").await,
            Err(EngineError::UnknownPreset(_))
        ));
        assert!(matches!(
            s.list_files("desert").await,
            Err(EngineError::UnknownTheme(_))
        ));
    }

    #[tokio::test]
    async fn test_tuning_override() {
        let tmp = tempfile::tempdir().unwrap();
        make_theme(
            tmp.path(),
            "cave",
            &["drip.mp3"],
            Some("tuning:\n  short_file_threshold_s: 5.0\n"),
        );

        let s = supplier(tmp.path());
        s.reload().unwrap();

        let tuning = s.theme_tuning("cave").await.unwrap();
        assert!((tuning.short_file_threshold_s - 5.0).abs() < 1e-9);
        // Le reste vient des défauts
        assert!((tuning.sparse_min_interval_s - 180.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reload_forgets_removed_theme() {
        let tmp = tempfile::tempdir().unwrap();
        make_theme(tmp.path(), "forest", &["wind.mp3"], None);

        let s = supplier(tmp.path());
        s.reload().unwrap();
        assert_eq!(s.list_themes().await.len(), 1);

        fs::remove_dir_all(tmp.path().join("forest")).unwrap();
        s.reload().unwrap();
        assert!(s.list_themes().await.is_empty());
    }
}
