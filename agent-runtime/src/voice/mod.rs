//! The Voice Pipeline (§4.6): a per-connection state machine over VAD,
//! transcription, a streaming agent turn, and sentence-chunked TTS.

pub mod pipeline;
pub mod sentence_chunker;

pub use pipeline::{
    default_buffer_cap, AudioBuffer, Synthesizer, Transcriber, TurnProducer, VoiceActivityDetector,
    VoiceControl, VoicePipeline, VoiceState,
};
pub use sentence_chunker::SentenceChunker;
