//! Signing many documents at once.

use super::orchestrator::SignatureEngine;
use super::types::{SignatureRecord, SignatureRequest};
use crate::error::{Error, Result};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of one request in a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Position of the request in the batch
    pub index: usize,
    /// Document the request signed
    pub input: PathBuf,
    /// The record, or why the request failed
    pub result: Result<SignatureRecord>,
}

impl BatchOutcome {
    /// Whether the request reached its requested level.
    pub fn is_complete(&self) -> bool {
        self.result.as_ref().is_ok_and(SignatureRecord::is_complete)
    }
}

/// Runs independent signing requests on a bounded worker pool.
///
/// Requests may share one key; an HSM key hands out sessions from its own
/// pool, so at most that many signatures are computed at the same time.
#[derive(Debug, Clone)]
pub struct BatchSigner {
    engine: Arc<SignatureEngine>,
    max_parallel: usize,
}

impl BatchSigner {
    /// Batch signer over `engine` with at most `max_parallel` requests in flight.
    pub fn new(engine: Arc<SignatureEngine>, max_parallel: usize) -> Self {
        Self {
            engine,
            max_parallel: max_parallel.max(1),
        }
    }

    /// The engine requests run on.
    pub fn engine(&self) -> &Arc<SignatureEngine> {
        &self.engine
    }

    /// Sign every request. Outcomes come back in request order; one failed
    /// request does not stop the others.
    pub fn sign_all(&self, requests: &[SignatureRequest]) -> Result<Vec<BatchOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for (i, request) in requests.iter().enumerate() {
            if requests[..i].iter().any(|other| other.output == request.output) {
                return Err(Error::Config(format!(
                    "requests write the same output {}",
                    request.output.display()
                )));
            }
        }

        let threads = requests.len().min(self.max_parallel);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::InvariantViolation(format!("cannot start batch workers: {}", e)))?;
        log::info!("Signing {} document(s) on {} worker(s)", requests.len(), threads);

        let outcomes: Vec<BatchOutcome> = pool.install(|| {
            requests
                .par_iter()
                .enumerate()
                .map(|(index, request)| {
                    let result = self.engine.sign(request);
                    if let Err(e) = &result {
                        log::warn!("Batch request {} ({}) failed: {}", index, request.input.display(), e);
                    }
                    BatchOutcome {
                        index,
                        input: request.input.clone(),
                        result,
                    }
                })
                .collect()
        });
        let done = outcomes.iter().filter(|o| o.is_complete()).count();
        log::info!("Batch finished: {}/{} reached the requested level", done, outcomes.len());
        Ok(outcomes)
    }
}
