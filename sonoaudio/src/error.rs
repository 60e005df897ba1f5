//! Taxonomie d'erreurs du moteur
//!
//! Les erreurs du plan de contrôle ([`EngineError`]) sont retournées de façon
//! synchrone à l'appelant. Les erreurs du chemin audio ([`DecodeError`]) sont
//! isolées au plus bas niveau : une piste indéchiffrable est réduite au
//! silence pour la durée du thème, un auditeur saturé est détaché — rien ne
//! remonte en cascade.

/// Erreurs du plan de contrôle, retournées par les opérations de canal,
/// de pool et de session.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Tous les canaux sont occupés et aucune session ne libère le sien.
    #[error("no channel available")]
    NoChannelAvailable,

    /// Référence de thème inconnue du fournisseur.
    #[error("unknown theme: {0}")]
    UnknownTheme(String),

    /// Référence de preset inconnue pour ce thème.
    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(u32),

    /// Le thème existe mais aucun de ses fichiers n'est lisible :
    /// le chargement échoue sans modifier l'état du canal.
    #[error("theme '{0}' has no playable track")]
    NoPlayableTracks(String),

    #[error("session limit reached ({0})")]
    TooManySessions(usize),

    /// La session n'a pas de thème sélectionné, impossible de lancer la lecture.
    #[error("session '{0}' has no theme selected")]
    NoThemeSelected(String),

    /// Défaillance du fournisseur de thèmes (scan, métadonnées illisibles...).
    #[error("theme supplier failure: {0}")]
    Supplier(String),
}

/// Erreurs du chemin de décodage. Jamais propagées au mixer ni aux
/// auditeurs : le lecteur concerné se désactive et émet du silence.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("cannot open '{path}': {details}")]
    Open { path: String, details: String },

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("no audio track found")]
    NoAudioTrack,

    /// L'ouverture a dépassé `decode_open_timeout_s` ; traitée comme un
    /// échec de décodage ordinaire.
    #[error("decoder open timed out after {0:.1}s")]
    OpenTimeout(f64),
}
