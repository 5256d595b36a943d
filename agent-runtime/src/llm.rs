//! Narrow streaming collaborator interfaces for the LLM/STT/TTS providers a
//! `ChatHandler` or `TurnProducer` implementation calls through (§1: these
//! providers are explicitly out of scope for the runtime itself — only the
//! interface shape is owned here).

use async_trait::async_trait;
use tokio::sync::mpsc;

use agent_wire::chat::WireMessage;

use crate::error::AgentError;

/// Usage accounting for one completion call, when the provider reports it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A streaming chat completion collaborator: given the working context's
/// messages, emits text tokens through `tokens` as they arrive and returns
/// once the completion is done (or the caller's cancellation fires).
///
/// This is the same producer/consumer shape `ChatHandler::on_chat_message`
/// and `TurnProducer::respond` use elsewhere in this crate — a streaming
/// provider is just another collaborator a handler awaits at a suspension
/// point (§4.3's "awaiting the LLM/STT/TTS/HTTP collaborators").
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_completion(
        &self,
        messages: &[WireMessage],
        tokens: mpsc::Sender<String>,
    ) -> Result<Option<LlmUsage>, AgentError>;
}

/// Speech-to-text collaborator. Distinct from [`crate::voice::Transcriber`]
/// only in name — kept as its own trait here so a chat-only deployment
/// (no voice pipeline compiled in) can still depend on a narrow STT
/// interface without pulling in voice-pipeline state machinery.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, AgentError>;
}

/// Text-to-speech collaborator, with an optional streaming variant for
/// providers that can emit audio before the full utterance is synthesized.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AgentError>;

    /// Default: synthesize the whole utterance and ship it as one frame.
    /// Providers capable of incremental synthesis override this to send
    /// multiple frames through `audio_out` instead.
    async fn synthesize_stream(
        &self,
        text: &str,
        audio_out: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), AgentError> {
        let audio = self.synthesize(text).await?;
        let _ = audio_out.send(audio).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLlm(&'static str);

    #[async_trait]
    impl LanguageModel for FixedLlm {
        async fn stream_completion(
            &self,
            _messages: &[WireMessage],
            tokens: mpsc::Sender<String>,
        ) -> Result<Option<LlmUsage>, AgentError> {
            tokens.send(self.0.to_string()).await.ok();
            Ok(Some(LlmUsage {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
            }))
        }
    }

    struct FixedTts;

    #[async_trait]
    impl TextToSpeech for FixedTts {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AgentError> {
            Ok(text.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn language_model_streams_tokens_and_reports_usage() {
        let llm = FixedLlm("hello");
        let (tx, mut rx) = mpsc::channel(4);
        let usage = llm.stream_completion(&[], tx).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(usage.unwrap().total_tokens, 2);
    }

    #[tokio::test]
    async fn text_to_speech_default_stream_ships_one_frame() {
        let tts = FixedTts;
        let (tx, mut rx) = mpsc::channel(4);
        tts.synthesize_stream("hi", tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(b"hi".to_vec()));
    }
}
