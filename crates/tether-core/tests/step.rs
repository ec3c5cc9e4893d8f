//! Integration tests for the subprocess pipeline step.

#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether_core::{Batch, Codec, Error, SubprocessConfig, SubprocessStep};

/// Uppercase each line. One `tr` per line, since a long-lived `tr`
/// block-buffers its output.
const UPPERCASE: &str = r#"while IFS= read -r l; do printf '%s\n' "$l" | tr a-z A-Z; done"#;

fn sh(script: &str) -> SubprocessConfig {
    SubprocessConfig::new("sh").with_args(["-c", script])
}

fn payloads(batch: &Batch) -> Vec<String> {
    batch
        .iter()
        .map(|part| String::from_utf8_lossy(part.data()).into_owned())
        .collect()
}

#[test]
fn test_uppercase_lines() {
    let step = SubprocessStep::new(sh(UPPERCASE)).unwrap();

    let out = step.process(Batch::from_payloads(["a\nb\n", "hello world", "\n"]));
    assert_eq!(payloads(&out), vec!["A\nB\n", "HELLO WORLD", "\n"]);
    assert_eq!(out.failed_count(), 0);

    let metrics = step.metrics().snapshot();
    assert_eq!(metrics.count, 3);
    assert_eq!(metrics.sent, 4);
    assert_eq!(metrics.batch_sent, 1);
}

#[test]
fn test_lines_requests_netstring_responses() {
    let config = sh(r#"while IFS= read -r l; do printf '%d:%s,' "${#l}" "$l"; done"#)
        .with_codecs(Codec::Lines, Codec::Netstring);
    let step = SubprocessStep::new(config).unwrap();

    let out = step.process(Batch::from_payloads(["abc", "x\ny", ""]));
    assert_eq!(payloads(&out), vec!["abc", "x\ny", ""]);
    assert_eq!(step.metrics().snapshot().sent, 4);
}

#[test]
fn test_netstring_and_length_prefixed_through_cat() {
    for codec in [Codec::Netstring, Codec::LengthPrefixedU32Be] {
        let config = SubprocessConfig::new("cat").with_codecs(codec, codec);
        let step = SubprocessStep::new(config).unwrap();

        let out = step.process(Batch::from_payloads(["one,two:three", "", "line\nbreak"]));
        assert_eq!(payloads(&out), vec!["one,two:three", "", "line\nbreak"], "{}", codec);
        assert_eq!(step.metrics().snapshot().sent, 3);
    }
}

#[test]
fn test_stderr_flags_part_and_keeps_data() {
    let config = sh(r#"while IFS= read -r l; do
        if [ "$l" = bad ]; then echo "rejected: $l" >&2; else echo "ok $l"; fi
    done"#)
    .with_stderr_window(Duration::from_millis(100));
    let step = SubprocessStep::new(config).unwrap();

    let out = step.process(Batch::from_payloads(["good", "bad", "fine"]));
    assert_eq!(payloads(&out), vec!["ok good", "bad", "ok fine"]);

    let failed = out.get(1).unwrap();
    assert!(failed.is_failed());
    assert_eq!(failed.error(), Some("rejected: bad"));
    assert!(!out.get(0).unwrap().is_failed());

    let metrics = step.metrics().snapshot();
    assert_eq!(metrics.error, 1);
    assert_eq!(metrics.sent, 2);
}

fn reject_bad_lines() -> SubprocessConfig {
    sh(r#"while IFS= read -r l; do
        case "$l" in
            bad*) echo "no $l" >&2 ;;
            *) echo "$l!" ;;
        esac
    done"#)
    .with_stderr_window(Duration::from_millis(100))
}

#[test]
fn test_failed_line_keeps_its_bytes() {
    let step = SubprocessStep::new(reject_bad_lines()).unwrap();

    let out = step.process(Batch::from_payloads(["first\nbad\nlast"]));
    assert_eq!(payloads(&out), vec!["first!\nbad\nlast!"]);
    assert_eq!(out.get(0).unwrap().error(), Some("no bad"));

    let metrics = step.metrics().snapshot();
    assert_eq!(metrics.count, 1);
    assert_eq!(metrics.sent, 2);
    assert_eq!(metrics.error, 1);
}

#[test]
fn test_part_carries_last_line_error() {
    let step = SubprocessStep::new(reject_bad_lines()).unwrap();

    let out = step.process(Batch::from_payloads(["bad1\nok\nbad2", "fine"]));
    assert_eq!(payloads(&out), vec!["bad1\nok!\nbad2", "fine!"]);
    assert_eq!(out.get(0).unwrap().error(), Some("no bad2"));
    assert_eq!(out.get(1).unwrap().error(), None);

    let metrics = step.metrics().snapshot();
    assert_eq!(metrics.sent, 2);
    assert_eq!(metrics.error, 2);
}

#[test]
fn test_concurrent_callers_stay_paired() {
    let step = Arc::new(SubprocessStep::new(SubprocessConfig::new("cat")).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|id| {
            let step = step.clone();
            thread::spawn(move || {
                for n in 0..25 {
                    let message = format!("{}:{}", id, n);
                    let out = step.process(Batch::from_payloads([message.clone()]));
                    assert_eq!(payloads(&out), vec![message]);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let metrics = step.metrics().snapshot();
    assert_eq!(metrics.batch_sent, 200);
    assert_eq!(metrics.sent, 200);
}

#[test]
fn test_process_after_close_flags_parts() {
    let step = SubprocessStep::new(SubprocessConfig::new("cat")).unwrap();
    step.close_async();
    step.wait_for_close(Duration::from_secs(5)).unwrap();

    let out = step.process(Batch::from_payloads(["late"]));
    assert_eq!(payloads(&out), vec!["late"]);
    assert_eq!(out.get(0).unwrap().error(), Some("subprocess is closed"));
}

#[test]
fn test_missing_command_fails_construction() {
    let config = SubprocessConfig::new("tether-no-such-command");
    assert!(matches!(
        SubprocessStep::new(config),
        Err(Error::Spawn { .. })
    ));
}
