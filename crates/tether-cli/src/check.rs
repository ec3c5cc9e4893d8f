//! Check command implementation for Tether CLI.

use std::path::Path;

use tether_core::SubprocessConfig;

/// Validate a config file and report what it would run.
pub fn execute(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = SubprocessConfig::from_path(path)?;
    let program = config.resolve_program()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("{}: ok", path.display());
    println!("  command: {} ({})", config.command_line(), program.display());
    println!("  codecs:  {} -> {}", config.codec_send, config.codec_recv);
    if config.parts.is_empty() {
        println!("  parts:   all");
    } else {
        let parts: Vec<String> = config.parts.iter().map(ToString::to_string).collect();
        println!("  parts:   {}", parts.join(", "));
    }
    println!("  max_buffer: {} bytes", config.max_buffer);
    Ok(())
}
