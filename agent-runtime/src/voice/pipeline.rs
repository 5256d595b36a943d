//! The voice turn pipeline (§4.6): VAD → transcribe → agent turn → sentence-
//! chunked TTS → audio frames out, one turn at a time per connection.
//!
//! The turn-producer stream and the synthesis/playback consumer run as two
//! independently spawned tasks joined only by a bounded channel of
//! sentences — the *i*-th sentence's audio can ship while the *i+1*-th is
//! still being generated and synthesized. A direct call chain here (ship
//! sentence *i*'s audio only once sentence *i+1* has also finished
//! synthesizing) is exactly the ordering bug spec.md §9 calls out; the
//! bounded channel is what rules it out structurally rather than by
//! convention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::VoiceError;
use crate::voice::sentence_chunker::SentenceChunker;

/// Minimum sentence length shipped to TTS on its own; shorter fragments
/// are folded into the next boundary by the chunker.
const MIN_SENTENCE_LEN: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VoiceControl {
    StartCall,
    EndCall,
    Interrupt,
    EndOfSpeech,
    TextMessage(String),
}

#[async_trait]
pub trait VoiceActivityDetector: Send + Sync {
    async fn check_end_of_turn(&self, audio: &[u8]) -> bool;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, VoiceError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, VoiceError>;
}

/// The agent-turn collaborator: streams response text tokens into `tokens`
/// as they are produced, the same `mpsc`-producer convention the rest of
/// the runtime uses for streaming output.
#[async_trait]
pub trait TurnProducer: Send + Sync {
    async fn respond(&self, text: String, tokens: mpsc::Sender<String>) -> Result<(), VoiceError>;
}

/// A FIFO-trimmed ring of raw PCM bytes, capped at roughly 30s of audio at
/// the caller's chosen byte rate (§4.6 contract b).
pub struct AudioBuffer {
    max_bytes: usize,
    data: std::collections::VecDeque<u8>,
}

impl AudioBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            data: std::collections::VecDeque::new(),
        }
    }

    pub fn push(&mut self, frame: &[u8]) {
        self.data.extend(frame.iter().copied());
        while self.data.len() > self.max_bytes {
            self.data.pop_front();
        }
    }

    pub fn drain(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// One connection's voice state machine and in-flight turn, if any.
pub struct VoicePipeline {
    state: Mutex<VoiceState>,
    buffer: Mutex<AudioBuffer>,
    active: Mutex<Option<CancellationToken>>,
}

impl VoicePipeline {
    pub fn new(buffer_cap_bytes: usize) -> Self {
        Self {
            state: Mutex::new(VoiceState::Idle),
            buffer: Mutex::new(AudioBuffer::new(buffer_cap_bytes)),
            active: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> VoiceState {
        *self.state.lock().await
    }

    pub async fn push_audio(&self, frame: &[u8]) {
        self.buffer.lock().await.push(frame);
    }

    /// A new utterance or an explicit `interrupt` aborts whatever turn is
    /// currently in flight (§4.6 contract a) before starting the next one.
    pub async fn interrupt(&self) {
        if let Some(token) = self.active.lock().await.take() {
            token.cancel();
        }
        *self.state.lock().await = VoiceState::Listening;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run_turn(
        &self,
        vad: Arc<dyn VoiceActivityDetector>,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn Synthesizer>,
        turn: Arc<dyn TurnProducer>,
        audio_out: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), VoiceError> {
        self.interrupt().await;
        let cancel = CancellationToken::new();
        *self.active.lock().await = Some(cancel.clone());

        let audio = self.buffer.lock().await.drain();
        if !vad.check_end_of_turn(&audio).await {
            *self.active.lock().await = None;
            return Ok(());
        }

        *self.state.lock().await = VoiceState::Thinking;
        let text = transcriber.transcribe(&audio).await?;

        let (token_tx, mut token_rx) = mpsc::channel::<String>(32);
        let (sentence_tx, mut sentence_rx) = mpsc::channel::<String>(8);

        let producer_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = producer_cancel.cancelled() => {}
                _ = turn.respond(text, token_tx) => {}
            }
        });

        let chunker_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut chunker = SentenceChunker::new(MIN_SENTENCE_LEN);
            loop {
                tokio::select! {
                    _ = chunker_cancel.cancelled() => return,
                    maybe_tok = token_rx.recv() => {
                        match maybe_tok {
                            Some(tok) => {
                                for sentence in chunker.push(&tok) {
                                    if sentence_tx.send(sentence).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            if let Some(tail) = chunker.flush() {
                let _ = sentence_tx.send(tail).await;
            }
        });

        *self.state.lock().await = VoiceState::Speaking;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_sentence = sentence_rx.recv() => {
                    match maybe_sentence {
                        Some(sentence) => {
                            let audio = synthesizer.synthesize(&sentence).await?;
                            if audio_out.send(audio).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        *self.state.lock().await = VoiceState::Listening;
        *self.active.lock().await = None;
        Ok(())
    }
}

pub fn default_buffer_cap(sample_rate_hz: u32, bytes_per_sample: u32, seconds: u32) -> usize {
    (sample_rate_hz * bytes_per_sample * seconds) as usize
}
