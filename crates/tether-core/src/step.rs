//! Pipeline step that sends batch parts through a supervised subprocess.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::field;

use crate::config::SubprocessConfig;
use crate::error::{Error, Result};
use crate::ipc::{Codec, ProcessSupervisor};
use crate::message::{Batch, Part};
use crate::metrics::StepMetrics;

/// Replaces each targeted part of a batch with the subprocess's answer to it.
///
/// With the `lines` send codec every line of a part is a separate request and
/// the answers are joined back together with newlines. The other codecs send
/// the whole part as one frame.
///
/// Batches are processed one at a time; concurrent [`process`](Self::process)
/// calls queue up behind each other.
pub struct SubprocessStep {
    config: SubprocessConfig,
    supervisor: ProcessSupervisor,
    metrics: Arc<StepMetrics>,
    batch_lock: Mutex<()>,
}

impl SubprocessStep {
    /// Start the subprocess described by `config`.
    pub fn new(config: SubprocessConfig) -> Result<Self> {
        let supervisor = ProcessSupervisor::new(&config)?;
        Ok(Self {
            config,
            supervisor,
            metrics: Arc::new(StepMetrics::new()),
            batch_lock: Mutex::new(()),
        })
    }

    /// The configuration this step was built from.
    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    /// Counters for this step.
    pub fn metrics(&self) -> Arc<StepMetrics> {
        self.metrics.clone()
    }

    /// The supervisor of the underlying process.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Run every targeted part of `batch` through the subprocess.
    ///
    /// Failures never abort the batch: a failed part keeps its original
    /// bytes and carries the error text instead. With the `lines` codec only
    /// the failed lines keep their original bytes; the other lines are still
    /// sent and answered.
    pub fn process(&self, mut batch: Batch) -> Batch {
        let _guard = self
            .batch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for index in self.targets(&batch) {
            self.metrics.incr_count(1);
            let span = tracing::info_span!("subprocess.part", index, error = field::Empty);
            let _entered = span.enter();

            let Some(part) = batch.get_mut(index) else {
                continue;
            };
            if let Some(e) = self.process_part(part) {
                span.record("error", field::display(&e));
                part.flag_error(&e);
            }
        }

        self.metrics.incr_batch_sent();
        batch
    }

    /// Request shutdown of the subprocess without waiting.
    pub fn close_async(&self) {
        self.supervisor.close_async();
    }

    /// Wait for the subprocess to be released.
    pub fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.supervisor.wait_for_close(timeout)
    }

    /// Resolve the configured part selection against `batch`.
    fn targets(&self, batch: &Batch) -> Vec<usize> {
        if self.config.parts.is_empty() {
            return (0..batch.len()).collect();
        }
        self.config
            .parts
            .iter()
            .filter_map(|&index| {
                let resolved = batch.resolve_index(index);
                if resolved.is_none() {
                    tracing::warn!(
                        "Part index {} is out of range for a batch of {} parts",
                        index,
                        batch.len()
                    );
                }
                resolved
            })
            .collect()
    }

    /// Exchange one part and return the last failure, if any.
    fn process_part(&self, part: &mut Part) -> Option<Error> {
        match self.config.codec_send {
            Codec::Lines => {
                let (data, failure) = self.exchange_lines(part.data());
                part.set_data(data);
                failure
            }
            codec => match self.exchange_framed(codec, part.data()) {
                Ok(response) => {
                    part.set_data(response);
                    None
                }
                Err(e) => Some(e),
            },
        }
    }

    /// Send each line separately and join the answers.
    ///
    /// A line whose exchange fails keeps its original bytes. A trailing
    /// newline leaves an empty last segment, which is kept as an empty answer
    /// without being sent so the output ends in a newline too.
    fn exchange_lines(&self, payload: &[u8]) -> (Vec<u8>, Option<Error>) {
        let segments: Vec<&[u8]> = payload.split(|&b| b == b'\n').collect();
        let last = segments.len() - 1;

        let mut results = Vec::with_capacity(segments.len());
        let mut failure = None;
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() && i == last && last > 0 {
                results.push(Vec::new());
                continue;
            }
            match self.exchange_framed(Codec::Lines, segment) {
                Ok(response) => results.push(response),
                Err(e) => {
                    results.push(segment.to_vec());
                    failure = Some(e);
                }
            }
        }
        (results.join(&b'\n'), failure)
    }

    /// One request/response round trip. Every failure is logged and counted.
    fn exchange_framed(&self, codec: Codec, payload: &[u8]) -> Result<Vec<u8>> {
        let outcome = codec
            .frame(payload.len())
            .map_err(Error::from)
            .and_then(|frame| {
                self.supervisor
                    .exchange(frame.prolog.as_deref(), payload, frame.epilog)
            });
        match outcome {
            Ok(response) => {
                tracing::debug!("Subprocess answered {} bytes", response.len());
                self.metrics.incr_sent();
                Ok(response)
            }
            Err(e) => {
                tracing::error!("Failed to send message to subprocess: {}", e);
                self.metrics.incr_error();
                Err(e)
            }
        }
    }
}
