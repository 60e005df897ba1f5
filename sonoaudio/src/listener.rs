//! Encodeur par auditeur : PCM du canal → flux MP3 privé
//!
//! Chaque auditeur HTTP possède son propre encodeur et son propre buffer de
//! sortie borné. Le producteur du canal ne bloque jamais sur un auditeur :
//! la remise du PCM est en `try_send`, et le buffer de sortie applique une
//! politique de **drop du plus ancien** quand il déborde.
//!
//! Un auditeur qui droppe sans interruption pendant
//! `listener_dead_after_drop_s` secondes d'audio est déclaré mort : son
//! buffer est fermé, le flux HTTP se termine, et le canal le détache au
//! prochain bloc. Les autres auditeurs du même canal ne voient rien.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::chunk::{AudioChunk, PULL_CHUNK_FRAMES};
use crate::mp3::Mp3Encoder;
use crate::settings::EngineParams;

#[derive(Debug, Default)]
struct ListenerBuf {
    /// Frames encodées, avec leur durée d'audio en secondes
    deque: VecDeque<(Bytes, f64)>,
    /// Secondes d'audio actuellement en file
    queued_s: f64,
    /// Frames perdues depuis la création
    dropped_frames: u64,
    /// Secondes d'audio droppées sans interruption
    dropping_streak_s: f64,
}

/// État partagé entre la tâche d'encodage, le fan-out du canal et le flux
/// HTTP
#[derive(Debug)]
pub struct ListenerShared {
    channel_id: u32,
    listener_id: u64,
    /// Profondeur maximale du buffer de sortie, en secondes d'audio encodé
    capacity_s: f64,
    /// Durée de drop ininterrompu avant déclaration de mort
    dead_after_s: f64,
    buf: Mutex<ListenerBuf>,
    data_notify: Notify,
    dead: AtomicBool,
    closed: AtomicBool,
}

impl ListenerShared {
    fn new(channel_id: u32, listener_id: u64, capacity_s: f64, dead_after_s: f64) -> Self {
        Self {
            channel_id,
            listener_id,
            capacity_s,
            dead_after_s,
            buf: Mutex::new(ListenerBuf::default()),
            data_notify: Notify::new(),
            dead: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames encodées perdues par backpressure depuis la création
    pub fn dropped_frames(&self) -> u64 {
        self.buf.lock().expect("listener mutex poisoned").dropped_frames
    }

    /// Ferme le flux : `recv` rendra `None` une fois la file vidée
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data_notify.notify_one();
    }

    fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                channel = self.channel_id,
                listener = self.listener_id,
                "listener dead after sustained backpressure, detaching"
            );
            self.close();
        }
    }

    /// Empile une frame encodée ; droppe les plus anciennes si la file
    /// dépasse la capacité. Ne bloque jamais.
    fn push_encoded(&self, bytes: Bytes, duration_s: f64) {
        if self.is_closed() {
            return;
        }

        let mut buf = self.buf.lock().expect("listener mutex poisoned");
        buf.queued_s += duration_s;
        buf.deque.push_back((bytes, duration_s));

        let mut dropped_now = false;
        while buf.queued_s > self.capacity_s && buf.deque.len() > 1 {
            if let Some((_, dur)) = buf.deque.pop_front() {
                buf.queued_s -= dur;
                buf.dropped_frames += 1;
                buf.dropping_streak_s += dur;
                dropped_now = true;
            }
        }
        if !dropped_now {
            buf.dropping_streak_s = 0.0;
        } else if buf.dropping_streak_s >= self.dead_after_s {
            drop(buf);
            self.mark_dead();
            return;
        }
        drop(buf);
        self.data_notify.notify_one();
    }

    /// Comptabilise un bloc PCM perdu en amont de l'encodeur (file PCM
    /// saturée) : même régime que les drops de sortie
    pub(crate) fn note_pcm_drop(&self, duration_s: f64) {
        let streak = {
            let mut buf = self.buf.lock().expect("listener mutex poisoned");
            buf.dropped_frames += 1;
            buf.dropping_streak_s += duration_s;
            buf.dropping_streak_s
        };
        if streak >= self.dead_after_s {
            self.mark_dead();
        }
    }

    fn pop(&self) -> Option<Bytes> {
        let mut buf = self.buf.lock().expect("listener mutex poisoned");
        buf.deque.pop_front().map(|(bytes, dur)| {
            buf.queued_s -= dur;
            bytes
        })
    }
}

/// Côté consommateur : le handle que la couche HTTP draine
///
/// Le drop du handle ferme l'auditeur (déconnexion client) ; le canal le
/// détache au bloc suivant.
pub struct ListenerStream {
    shared: Arc<ListenerShared>,
}

impl ListenerStream {
    /// Prochaine frame encodée ; `None` quand le flux est terminé (canal
    /// arrêté, auditeur mort ou fermé)
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            if let Some(bytes) = self.shared.pop() {
                return Some(bytes);
            }
            if self.shared.is_closed() {
                return None;
            }
            self.shared.data_notify.notified().await;
        }
    }

    pub fn shared(&self) -> Arc<ListenerShared> {
        self.shared.clone()
    }
}

impl Drop for ListenerStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Côté canal : l'entrée PCM d'un auditeur dans le registre de fan-out
pub(crate) struct ListenerSink {
    pub tx: mpsc::Sender<Arc<AudioChunk>>,
    pub shared: Arc<ListenerShared>,
}

/// Crée un auditeur : file PCM bornée, tâche d'encodage dédiée, handle de
/// drainage. L'auditeur rejoint le direct : premier PCM reçu = position
/// courante du canal, sans pre-roll.
pub(crate) fn spawn_listener(
    channel_id: u32,
    listener_id: u64,
    params: &EngineParams,
) -> (ListenerSink, ListenerStream) {
    let chunks_per_buffer = (params.listener_buffer_s * params.sample_rate as f64
        / PULL_CHUNK_FRAMES as f64)
        .ceil() as usize;
    let (tx, mut rx) = mpsc::channel::<Arc<AudioChunk>>(chunks_per_buffer.max(4));

    let shared = Arc::new(ListenerShared::new(
        channel_id,
        listener_id,
        params.listener_buffer_s,
        params.listener_dead_after_drop_s,
    ));

    let task_shared = shared.clone();
    let sample_rate = params.sample_rate;
    let bitrate = params.bitrate;
    tokio::spawn(async move {
        let mut encoder = match Mp3Encoder::new(sample_rate, bitrate) {
            Ok(encoder) => encoder,
            Err(e) => {
                tracing::error!(
                    channel = channel_id,
                    listener = listener_id,
                    "listener encoder init failed: {e}"
                );
                task_shared.close();
                return;
            }
        };

        // Durée PCM ingérée dont les octets ne sont pas encore sortis de
        // LAME ; attribuée à la prochaine frame émise
        let mut pending_s = 0.0f64;

        while let Some(chunk) = rx.recv().await {
            if task_shared.is_closed() || task_shared.is_dead() {
                break;
            }
            pending_s += chunk.duration_sec();
            match encoder.encode(&chunk.left, &chunk.right) {
                Ok(bytes) if !bytes.is_empty() => {
                    task_shared.push_encoded(bytes, pending_s);
                    pending_s = 0.0;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        channel = channel_id,
                        listener = listener_id,
                        "encode failed, closing listener: {e}"
                    );
                    break;
                }
            }
        }

        if let Ok(bytes) = encoder.flush() {
            if !bytes.is_empty() {
                task_shared.push_encoded(bytes, pending_s);
            }
        }
        task_shared.close();
        tracing::debug!(
            channel = channel_id,
            listener = listener_id,
            "listener encoder task finished"
        );
    });

    (
        ListenerSink {
            tx,
            shared: shared.clone(),
        },
        ListenerStream { shared },
    )
}
