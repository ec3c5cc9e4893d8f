//! Run command implementation for Tether CLI.
//!
//! Reads newline-delimited messages, groups them into batches, sends them
//! through the subprocess step and prints one line per message.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::{Batch, Codec, SubprocessConfig, SubprocessStep};

/// Options for `tether run`.
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub batch_size: usize,
    pub codec_send: Option<Codec>,
    pub codec_recv: Option<Codec>,
    pub parts: Vec<isize>,
    pub max_buffer: Option<usize>,
    pub close_timeout: Duration,
    pub fail_on_error: bool,
    pub command: Vec<String>,
}

/// How a run ended.
pub enum Outcome {
    Completed,
    Interrupted,
}

#[derive(Debug, Default)]
struct Summary {
    messages: usize,
    failed: usize,
    batches: usize,
}

/// Build the step config from the config file plus command line overrides.
fn resolve_config(options: &RunOptions) -> anyhow::Result<SubprocessConfig> {
    let mut config = match &options.config {
        Some(path) => SubprocessConfig::from_path(path)?,
        None => SubprocessConfig::default(),
    };

    if let Some((name, args)) = options.command.split_first() {
        config.name = name.clone();
        config.args = args.to_vec();
    }
    if let Some(codec) = options.codec_send {
        config.codec_send = codec;
    }
    if let Some(codec) = options.codec_recv {
        config.codec_recv = codec;
    }
    if !options.parts.is_empty() {
        config.parts = options.parts.clone();
    }
    if let Some(max_buffer) = options.max_buffer {
        config.max_buffer = max_buffer;
    }

    config.validate()?;
    Ok(config)
}

/// Execute `tether run`.
pub async fn execute(options: RunOptions) -> anyhow::Result<Outcome> {
    if options.batch_size == 0 {
        anyhow::bail!("--batch-size must be at least 1");
    }
    let start = Instant::now();

    let config = resolve_config(&options)?;
    tracing::debug!("Running {}", config.command_line());

    let input: Box<dyn BufRead + Send> = match &options.input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let step = Arc::new(SubprocessStep::new(config)?);

    // The step does synchronous IPC, which would otherwise block the runtime
    let worker = {
        let step = step.clone();
        let batch_size = options.batch_size;
        tokio::task::spawn_blocking(move || pump(&step, input, batch_size))
    };

    let summary = tokio::select! {
        joined = worker => joined??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            shutdown(step, options.close_timeout).await;
            return Ok(Outcome::Interrupted);
        }
    };

    let metrics = step.metrics().snapshot();
    shutdown(step, options.close_timeout).await;

    tracing::info!(
        "Processed {} messages in {} batches in {:.2}s ({} sent, {} failed)",
        summary.messages,
        summary.batches,
        start.elapsed().as_secs_f64(),
        metrics.sent,
        summary.failed
    );

    if options.fail_on_error && summary.failed > 0 {
        anyhow::bail!("{} of {} messages failed", summary.failed, summary.messages);
    }
    Ok(Outcome::Completed)
}

/// Close the step and wait for the subprocess to go away.
async fn shutdown(step: Arc<SubprocessStep>, timeout: Duration) {
    step.close_async();
    let waited = tokio::task::spawn_blocking(move || step.wait_for_close(timeout)).await;
    match waited {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("{}", e.with_hint()),
        Err(e) => tracing::error!("Task join error: {}", e),
    }
}

/// Feed input lines through the step batch by batch.
fn pump(
    step: &SubprocessStep,
    input: Box<dyn BufRead + Send>,
    batch_size: usize,
) -> anyhow::Result<Summary> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut summary = Summary::default();
    let mut pending = Vec::with_capacity(batch_size);

    for line in input.split(b'\n') {
        pending.push(line?);
        if pending.len() == batch_size {
            flush_batch(step, &mut pending, &mut out, &mut summary)?;
        }
    }
    if !pending.is_empty() {
        flush_batch(step, &mut pending, &mut out, &mut summary)?;
    }
    Ok(summary)
}

fn flush_batch(
    step: &SubprocessStep,
    pending: &mut Vec<Vec<u8>>,
    out: &mut impl Write,
    summary: &mut Summary,
) -> io::Result<()> {
    let batch = step.process(Batch::from_payloads(pending.drain(..)));
    for (index, part) in batch.iter().enumerate() {
        if let Some(error) = part.error() {
            eprintln!("message {}: {}", summary.messages + index + 1, error);
            summary.failed += 1;
        }
        out.write_all(part.data())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    summary.messages += batch.len();
    summary.batches += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RunOptions {
        RunOptions {
            config: None,
            input: None,
            batch_size: 1,
            codec_send: None,
            codec_recv: None,
            parts: Vec::new(),
            max_buffer: None,
            close_timeout: Duration::from_secs(1),
            fail_on_error: false,
            command: Vec::new(),
        }
    }

    #[test]
    fn test_defaults_to_cat() {
        let config = resolve_config(&options()).unwrap();
        assert_eq!(config, SubprocessConfig::default());
    }

    #[test]
    fn test_command_line_overrides() {
        let mut opts = options();
        opts.command = vec!["sh".to_string(), "-c".to_string(), "cat".to_string()];
        opts.codec_recv = Some(Codec::Netstring);
        opts.parts = vec![-1];
        opts.max_buffer = Some(32);

        let config = resolve_config(&opts).unwrap();
        assert_eq!(config.name, "sh");
        assert_eq!(config.args, vec!["-c", "cat"]);
        assert_eq!(config.codec_send, Codec::Lines);
        assert_eq!(config.codec_recv, Codec::Netstring);
        assert_eq!(config.parts, vec![-1]);
        assert_eq!(config.max_buffer, 32);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut opts = options();
        opts.max_buffer = Some(0);
        assert!(resolve_config(&opts).is_err());
    }
}
