//! Décodage des fichiers source vers la cadence canonique
//!
//! Le moteur ne parle jamais directement à symphonia : il voit deux traits,
//! [`AudioSource`] (un fichier ouvrable, avec sa durée) et [`Decoder`] (un
//! flux de frames stéréo float à la cadence canonique). Deux instances de
//! décodeur peuvent être ouvertes en même temps par lecteur (primaire + bras
//! de crossfade).
//!
//! Le rééchantillonnage vers la cadence canonique est linéaire, avec retenue
//! du dernier échantillon entre deux blocs pour garder la continuité.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::DecodeError;

/// Flux de frames stéréo float à la cadence canonique
pub trait Decoder: Send {
    /// Écrit jusqu'à `left.len()` frames dans les deux buffers et retourne
    /// le nombre de frames écrites. `0` signifie la fin du fichier.
    fn next_block(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<usize, DecodeError>;

    /// Repositionne le décodeur au début du fichier
    fn rewind(&mut self) -> Result<(), DecodeError>;
}

/// Un fichier (ou buffer) audio ouvrable, dont chaque `open()` rend une
/// instance de décodeur indépendante
pub trait AudioSource: Send + Sync {
    fn label(&self) -> &str;

    /// Cadence de sortie des décodeurs rendus par `open()`
    fn sample_rate(&self) -> u32;

    /// Durée totale en frames à la cadence canonique
    fn duration_frames(&self) -> Result<u64, DecodeError>;

    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Rééchantillonneur linéaire
// ═══════════════════════════════════════════════════════════════════════════

/// Rééchantillonnage linéaire avec état entre blocs
///
/// La position fractionnaire et le dernier échantillon du bloc précédent sont
/// conservés, donc la sortie est continue même si les blocs d'entrée sont
/// découpés arbitrairement.
struct LinearResampler {
    /// Pas d'avancée dans la source par échantillon de sortie
    step: f64,
    /// Position fractionnaire dans l'entrée virtuelle (retenue + bloc courant)
    src_pos: f64,
    carry_l: f32,
    carry_r: f32,
    has_carry: bool,
}

impl LinearResampler {
    fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            step: source_rate as f64 / target_rate as f64,
            src_pos: 0.0,
            carry_l: 0.0,
            carry_r: 0.0,
            has_carry: false,
        }
    }

    fn reset(&mut self) {
        self.src_pos = 0.0;
        self.has_carry = false;
    }

    /// Consomme un bloc source et pousse les échantillons interpolés
    fn process(
        &mut self,
        in_l: &[f32],
        in_r: &[f32],
        out_l: &mut Vec<f32>,
        out_r: &mut Vec<f32>,
    ) {
        let carry = usize::from(self.has_carry);
        let virt_len = carry + in_l.len();
        if virt_len < 2 {
            // Pas assez de points pour interpoler, tout passe en retenue
            if let (Some(&l), Some(&r)) = (in_l.last(), in_r.last()) {
                self.carry_l = l;
                self.carry_r = r;
                self.has_carry = true;
            }
            return;
        }

        let has_carry = self.has_carry;
        let carry_l = self.carry_l;
        let carry_r = self.carry_r;
        let sample_at = move |idx: usize| -> (f32, f32) {
            if has_carry && idx == 0 {
                (carry_l, carry_r)
            } else {
                let i = idx - carry;
                (in_l[i], in_r[i])
            }
        };

        while self.src_pos + 1.0 < virt_len as f64 {
            let idx = self.src_pos as usize;
            let frac = (self.src_pos - idx as f64) as f32;
            let (l0, r0) = sample_at(idx);
            let (l1, r1) = sample_at(idx + 1);
            out_l.push(l0 * (1.0 - frac) + l1 * frac);
            out_r.push(r0 * (1.0 - frac) + r1 * frac);
            self.src_pos += self.step;
        }

        // Retenue du dernier échantillon pour le bloc suivant
        self.carry_l = in_l[in_l.len() - 1];
        self.carry_r = in_r[in_r.len() - 1];
        self.has_carry = true;
        self.src_pos -= (virt_len - 1) as f64;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FileSource - fichiers décodés par symphonia
// ═══════════════════════════════════════════════════════════════════════════

/// Fichier audio sur disque, décodé via symphonia
///
/// La durée est sondée paresseusement au premier accès : d'abord depuis les
/// métadonnées du conteneur, sinon en décodant le fichier entier pour compter
/// (plus lent mais exact).
pub struct FileSource {
    path: PathBuf,
    label: String,
    canonical_rate: u32,
    probed_duration: OnceLock<Result<u64, DecodeError>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, canonical_rate: u32) -> Self {
        let path = path.into();
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            path,
            label,
            canonical_rate,
            probed_duration: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn probe_duration(&self) -> Result<u64, DecodeError> {
        let opened = open_symphonia(&self.path)?;
        if let Some(n_frames) = opened.n_frames {
            // Durée issue des métadonnées, mise à l'échelle canonique
            let scaled =
                n_frames as f64 * self.canonical_rate as f64 / opened.source_rate as f64;
            return Ok(scaled.round() as u64);
        }

        // Pas de métadonnées de durée : décompte par décodage intégral
        tracing::debug!(
            path = %self.path.display(),
            "no duration metadata, counting frames by full decode"
        );
        let mut decoder = SymphoniaDecoder::from_opened(self.path.clone(), self.canonical_rate, opened);
        let mut l = vec![0.0f32; 8192];
        let mut r = vec![0.0f32; 8192];
        let mut total = 0u64;
        loop {
            let n = decoder.next_block(&mut l, &mut r)?;
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        Ok(total)
    }
}

impl AudioSource for FileSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn sample_rate(&self) -> u32 {
        self.canonical_rate
    }

    fn duration_frames(&self) -> Result<u64, DecodeError> {
        self.probed_duration
            .get_or_init(|| self.probe_duration())
            .clone()
    }

    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        let opened = open_symphonia(&self.path)?;
        Ok(Box::new(SymphoniaDecoder::from_opened(
            self.path.clone(),
            self.canonical_rate,
            opened,
        )))
    }
}

struct OpenedFile {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    source_rate: u32,
    n_frames: Option<u64>,
}

/// Sonde le conteneur et instancie le codec
fn open_symphonia(path: &Path) -> Result<OpenedFile, DecodeError> {
    let file = std::fs::File::open(path).map_err(|e| DecodeError::Open {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError::Open {
            path: path.display().to_string(),
            details: format!("unable to detect audio format: {e}"),
        })?;

    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Open {
            path: path.display().to_string(),
            details: format!("unsupported codec: {e}"),
        })?;

    let source_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| DecodeError::Open {
            path: path.display().to_string(),
            details: "missing sample rate".into(),
        })?;

    Ok(OpenedFile {
        track_id: track.id,
        n_frames: track.codec_params.n_frames,
        source_rate,
        format,
        decoder,
    })
}

/// Décodeur symphonia + downmix stéréo + rééchantillonnage canonique
struct SymphoniaDecoder {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    resampler: Option<LinearResampler>,
    pending_l: Vec<f32>,
    pending_r: Vec<f32>,
    pending_pos: usize,
    eof: bool,
}

impl SymphoniaDecoder {
    fn from_opened(path: PathBuf, canonical_rate: u32, opened: OpenedFile) -> Self {
        let resampler = (opened.source_rate != canonical_rate)
            .then(|| LinearResampler::new(opened.source_rate, canonical_rate));
        Self {
            path,
            format: opened.format,
            decoder: opened.decoder,
            track_id: opened.track_id,
            resampler,
            pending_l: Vec::new(),
            pending_r: Vec::new(),
            pending_pos: 0,
            eof: false,
        }
    }

    /// Décode le prochain paquet et alimente les buffers en attente.
    /// Retourne `false` sur fin de fichier.
    fn refill(&mut self) -> Result<bool, DecodeError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(DecodeError::Decode(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let channels = spec.channels.count();
                    let mut sample_buf =
                        SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    sample_buf.copy_interleaved_ref(decoded);
                    let samples = sample_buf.samples();
                    if samples.is_empty() {
                        continue;
                    }

                    let frames = samples.len() / channels.max(1);
                    let mut block_l = Vec::with_capacity(frames);
                    let mut block_r = Vec::with_capacity(frames);
                    match channels {
                        0 => continue,
                        1 => {
                            // Mono : dupliqué sur les deux canaux
                            block_l.extend_from_slice(samples);
                            block_r.extend_from_slice(samples);
                        }
                        n => {
                            // Les deux premiers canaux, le reste est ignoré
                            for frame in samples.chunks_exact(n) {
                                block_l.push(frame[0]);
                                block_r.push(frame[1]);
                            }
                        }
                    }

                    match &mut self.resampler {
                        Some(rs) => {
                            rs.process(&block_l, &block_r, &mut self.pending_l, &mut self.pending_r)
                        }
                        None => {
                            self.pending_l.extend_from_slice(&block_l);
                            self.pending_r.extend_from_slice(&block_r);
                        }
                    }

                    if self.pending_l.len() > self.pending_pos {
                        return Ok(true);
                    }
                    // Le rééchantillonneur peut ne rien produire sur un
                    // paquet minuscule, on continue
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::warn!(path = %self.path.display(), "skipping corrupted packet: {e}");
                    continue;
                }
                Err(e) => return Err(DecodeError::Decode(e.to_string())),
            }
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn next_block(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<usize, DecodeError> {
        let want = left.len().min(right.len());
        let mut written = 0;

        while written < want {
            if self.pending_pos >= self.pending_l.len() {
                self.pending_l.clear();
                self.pending_r.clear();
                self.pending_pos = 0;
                if self.eof || !self.refill()? {
                    self.eof = true;
                    break;
                }
            }

            let available = self.pending_l.len() - self.pending_pos;
            let take = available.min(want - written);
            left[written..written + take]
                .copy_from_slice(&self.pending_l[self.pending_pos..self.pending_pos + take]);
            right[written..written + take]
                .copy_from_slice(&self.pending_r[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            written += take;
        }

        Ok(written)
    }

    fn rewind(&mut self) -> Result<(), DecodeError> {
        // Réouverture complète : plus simple et plus sûr qu'un seek sur tous
        // les conteneurs
        let opened = open_symphonia(&self.path)?;
        self.format = opened.format;
        self.decoder = opened.decoder;
        self.track_id = opened.track_id;
        if let Some(rs) = &mut self.resampler {
            rs.reset();
        }
        self.pending_l.clear();
        self.pending_r.clear();
        self.pending_pos = 0;
        self.eof = false;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BufferSource - source en mémoire
// ═══════════════════════════════════════════════════════════════════════════

/// Source audio en mémoire, déjà à la cadence canonique
///
/// Sert de générateur de signal pour les tests et les démos : le moteur
/// complet peut tourner hors ligne sans un seul fichier sur disque.
pub struct BufferSource {
    label: String,
    sample_rate: u32,
    left: Arc<Vec<f32>>,
    right: Arc<Vec<f32>>,
}

impl BufferSource {
    pub fn new(
        label: impl Into<String>,
        left: Vec<f32>,
        right: Vec<f32>,
        sample_rate: u32,
    ) -> Self {
        debug_assert_eq!(left.len(), right.len());
        Self {
            label: label.into(),
            sample_rate,
            left: Arc::new(left),
            right: Arc::new(right),
        }
    }

    /// Sinusoïde stéréo identique sur les deux canaux
    pub fn sine(
        label: impl Into<String>,
        frequency: f64,
        amplitude: f32,
        duration_s: f64,
        sample_rate: u32,
    ) -> Self {
        let frames = (duration_s * sample_rate as f64) as usize;
        let samples: Vec<f32> = (0..frames)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                (amplitude as f64 * (2.0 * std::f64::consts::PI * frequency * t).sin()) as f32
            })
            .collect();
        Self::new(label, samples.clone(), samples, sample_rate)
    }

    /// Silence de la durée donnée
    pub fn silence(label: impl Into<String>, duration_s: f64, sample_rate: u32) -> Self {
        let frames = (duration_s * sample_rate as f64) as usize;
        Self::new(label, vec![0.0; frames], vec![0.0; frames], sample_rate)
    }
}

impl AudioSource for BufferSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn duration_frames(&self) -> Result<u64, DecodeError> {
        Ok(self.left.len() as u64)
    }

    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        Ok(Box::new(BufferDecoder {
            left: self.left.clone(),
            right: self.right.clone(),
            pos: 0,
        }))
    }
}

struct BufferDecoder {
    left: Arc<Vec<f32>>,
    right: Arc<Vec<f32>>,
    pos: usize,
}

impl Decoder for BufferDecoder {
    fn next_block(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<usize, DecodeError> {
        let want = left.len().min(right.len());
        let available = self.left.len() - self.pos;
        let take = available.min(want);
        left[..take].copy_from_slice(&self.left[self.pos..self.pos + take]);
        right[..take].copy_from_slice(&self.right[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }

    fn rewind(&mut self) -> Result<(), DecodeError> {
        self.pos = 0;
        Ok(())
    }
}
