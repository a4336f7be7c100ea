//! One-shot voice endpoints: recognition only, or the full upload pipeline
//!
//! These reuse the collaborators of the socket sessions but run without
//! barge-in or admission control.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use base64::Engine;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiState;
use crate::agent::collect_reply;
use crate::pipeline::{Segmenter, strip_marker};
use crate::voice::{accept_transcript, is_wav, wav_to_pcm16};

/// Build voice router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/asr", post(asr))
        .route("/process_audio", post(process_audio))
        .with_state(state)
}

/// Recognition request: base64-encoded WAV or raw 16 kHz PCM
#[derive(Debug, Deserialize)]
pub struct AsrRequest {
    pub wav: String,
}

/// Recognition result; `code` is 0 on success and 1 on failure
#[derive(Debug, Serialize, Deserialize)]
pub struct AsrResponse {
    pub code: u8,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res: Option<String>,
}

/// Recognize an uploaded clip. Failures are reported in the body.
async fn asr(State(state): State<Arc<ApiState>>, Json(request): Json<AsrRequest>) -> Json<AsrResponse> {
    let result: Result<String, String> = async {
        let audio = base64::engine::general_purpose::STANDARD
            .decode(request.wav.trim())
            .map_err(|e| format!("invalid base64 audio: {e}"))?;
        let pcm = to_pcm(&audio).map_err(|e| e.to_string())?;
        state
            .services
            .transcriber
            .transcribe(&pcm)
            .await
            .map_err(|e| e.to_string())
    }
    .await;

    Json(match result {
        Ok(text) => AsrResponse {
            code: 0,
            msg: "ok".to_string(),
            res: Some(text),
        },
        Err(msg) => {
            tracing::warn!(error = %msg, "asr request failed");
            AsrResponse {
                code: 1,
                msg,
                res: None,
            }
        }
    })
}

/// Response body of the upload pipeline
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFormat {
    /// Recognized and reply text as JSON
    #[default]
    Json,
    /// Synthesized reply streamed as `audio/mpeg`
    Audio,
}

#[derive(Debug, Deserialize)]
pub struct ProcessQuery {
    #[serde(default)]
    pub response_format: UploadFormat,
}

/// Stage durations in seconds
#[derive(Debug, Serialize, Deserialize)]
pub struct Timing {
    pub asr_duration: f64,
    pub llm_duration: f64,
    pub total_duration: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub code: u8,
    pub msg: String,
    pub session_id: String,
    pub user_text: String,
    pub ai_text: String,
    pub timing: Timing,
}

/// Recognize, reply and optionally synthesize one uploaded utterance
async fn process_audio(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ProcessQuery>,
    body: Bytes,
) -> Result<Response, VoiceError> {
    let started = Instant::now();
    let session_id = Uuid::new_v4();

    if body.is_empty() {
        return Err(VoiceError::BadRequest("Empty audio data".to_string()));
    }
    let pcm = to_pcm(&body).map_err(|e| VoiceError::BadRequest(e.to_string()))?;
    tracing::info!(%session_id, bytes = body.len(), "processing uploaded audio");

    let asr_started = Instant::now();
    let transcript = state
        .services
        .transcriber
        .transcribe(&pcm)
        .await
        .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
    let asr_duration = asr_started.elapsed();
    let user_text = accept_transcript(&transcript)
        .ok_or_else(|| VoiceError::Unrecognized(transcript.clone()))?
        .to_string();

    let llm_started = Instant::now();
    let stream = state
        .services
        .generator
        .generate_stream(&[], &user_text)
        .await
        .map_err(|e| VoiceError::GenerationFailed(e.to_string()))?;
    let ai_text = collect_reply(stream)
        .await
        .map(|reply| strip_marker(&reply).trim().to_string())
        .map_err(|e| VoiceError::GenerationFailed(e.to_string()))?;
    let llm_duration = llm_started.elapsed();

    if ai_text.is_empty() {
        return Err(VoiceError::GenerationFailed("reply was empty".to_string()));
    }
    tracing::info!(
        %session_id,
        asr_ms = asr_duration.as_millis(),
        llm_ms = llm_duration.as_millis(),
        "upload reply ready"
    );

    match query.response_format {
        UploadFormat::Json => Ok(Json(ProcessResponse {
            code: 0,
            msg: "ok".to_string(),
            session_id: session_id.to_string(),
            user_text,
            ai_text,
            timing: Timing {
                asr_duration: asr_duration.as_secs_f64(),
                llm_duration: llm_duration.as_secs_f64(),
                total_duration: started.elapsed().as_secs_f64(),
            },
        })
        .into_response()),
        UploadFormat::Audio => {
            let mut segmenter = Segmenter::new(state.first_sentence_deadline);
            segmenter.push(&ai_text);
            let sentences = segmenter.finish();

            let synthesizer = Arc::clone(&state.services.synthesizer);
            let audio = futures::stream::iter(sentences)
                .then(move |sentence| {
                    let synthesizer = Arc::clone(&synthesizer);
                    async move { synthesizer.synthesize_stream(&sentence).await }
                })
                .try_flatten()
                .inspect_err(move |e| tracing::warn!(%session_id, error = %e, "upload synthesis failed"));

            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "audio/mpeg".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=reply_{session_id}.mp3"),
                    ),
                ],
                [("x-session-id", session_id.to_string())],
                Body::from_stream(audio),
            )
                .into_response())
        }
    }
}

/// Accept WAV containers or raw 16 kHz mono PCM
fn to_pcm(audio: &[u8]) -> crate::Result<Vec<u8>> {
    if is_wav(audio) {
        wav_to_pcm16(audio)
    } else {
        Ok(audio.to_vec())
    }
}

/// Voice API errors
#[derive(Debug)]
pub enum VoiceError {
    BadRequest(String),
    Unrecognized(String),
    TranscriptionFailed(String),
    GenerationFailed(String),
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Unrecognized(text) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "recognition_failed",
                format!("speech recognition failed: {text}"),
            ),
            Self::TranscriptionFailed(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "transcription_failed", msg),
            Self::GenerationFailed(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "generation_failed", msg),
        };

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}
