use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use crewdeck_store::queries::event::EventRefs;
use crewdeck_store::queries::inference::{self, NewInferenceCall};
use crewdeck_store::{Result, Storage};
use crewdeck_types::InferenceLevel;
use sha2::{Digest, Sha256};

/// Errors from the inference oracle.
#[derive(Debug)]
pub enum OracleError {
    Unavailable(String),
    Timeout,
    Malformed(String),
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Unavailable(msg) => write!(f, "Oracle unavailable: {}", msg),
            OracleError::Timeout => write!(f, "Oracle call timed out"),
            OracleError::Malformed(msg) => write!(f, "Oracle returned malformed output: {}", msg),
        }
    }
}

impl std::error::Error for OracleError {}

/// The external inference service, reduced to one call. Implementations
/// carry their own transport and timeout; callers never retry here.
pub trait Oracle: Send + Sync {
    fn infer(&self, prompt: &str) -> std::result::Result<String, OracleError>;
}

impl<F> Oracle for F
where
    F: Fn(&str) -> std::result::Result<String, OracleError> + Send + Sync,
{
    fn infer(&self, prompt: &str) -> std::result::Result<String, OracleError> {
        self(prompt)
    }
}

pub fn input_hash(prompt: &str) -> String {
    format!("{:x}", Sha256::digest(prompt.as_bytes()))
}

/// Idempotent wrapper: every call is logged to `inference_calls`, and a
/// repeated input hash is served from the log without spending tokens.
pub struct CachingOracle {
    storage: Storage,
    inner: Arc<dyn Oracle>,
}

impl CachingOracle {
    pub fn new(storage: Storage, inner: Arc<dyn Oracle>) -> Self {
        Self { storage, inner }
    }

    /// Returns `(output, cached)`.
    pub fn infer(
        &self,
        level: InferenceLevel,
        prompt: &str,
        refs: EventRefs,
    ) -> Result<(String, bool)> {
        let hash = input_hash(prompt);
        let db = self.storage.connect()?;

        if let Some(output) = inference::cached_output(db.conn(), &hash)? {
            inference::insert(
                db.conn(),
                &NewInferenceCall {
                    level,
                    input_hash: &hash,
                    cached: true,
                    input_text: None,
                    output_text: Some(&output),
                    tokens_in: None,
                    tokens_out: None,
                    cost_usd: None,
                    latency_ms: Some(0),
                    refs,
                },
                Utc::now(),
            )?;
            return Ok((output, true));
        }

        let started = Instant::now();
        let output = self
            .inner
            .infer(prompt)
            .map_err(|e| crewdeck_store::Error::Query(e.to_string()))?;
        let latency_ms = started.elapsed().as_millis() as i64;

        inference::insert(
            db.conn(),
            &NewInferenceCall {
                level,
                input_hash: &hash,
                cached: false,
                input_text: Some(prompt),
                output_text: Some(&output),
                tokens_in: Some(estimate_tokens(prompt)),
                tokens_out: Some(estimate_tokens(&output)),
                cost_usd: None,
                latency_ms: Some(latency_ms),
                refs,
            },
            Utc::now(),
        )?;
        Ok((output, false))
    }
}

// Rough byte-based token estimate for the call log; providers that report
// real counts should override these columns out of band.
fn estimate_tokens(text: &str) -> i64 {
    (text.len() as i64 / 4).max(1)
}
