//! `csfle` CLI tool for local master keys and envelope inspection.

#![warn(clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bson::Binary;
use clap::{Parser, Subcommand};
use csfle::envelope::{parse_envelope, parse_marking, EncryptedEnvelope, Marking, ENCRYPTED, INTENT_TO_ENCRYPT};
use csfle_key_file::LocalKeyFile;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csfle")]
#[command(about = "Client-side field-level encryption CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new local master key file
    Keygen {
        /// Path of the key file to create
        #[arg(short, long, default_value = "./master.key")]
        output: PathBuf,
    },
    /// Describe an encrypted envelope or marking payload
    Inspect {
        /// Base64 of the binary payload
        payload: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Keygen { output } => keygen(&output),
        Commands::Inspect { payload } => {
            for line in inspect(&payload)? {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn keygen(output: &Path) -> Result<()> {
    let key_file = LocalKeyFile::init(output)
        .with_context(|| format!("failed to create key file {}", output.display()))?;
    println!("Local master key written to {}", key_file.path().display());
    println!("Pass its contents as kmsProviders.local.key");
    Ok(())
}

/// Decodes `payload` as an envelope, then as a marking.
fn inspect(payload: &str) -> Result<Vec<String>> {
    let bytes = STANDARD.decode(payload.trim()).context("payload is not valid base64")?;

    let as_envelope = Binary { subtype: ENCRYPTED, bytes: bytes.clone() };
    if let Ok(envelope) = parse_envelope(&as_envelope) {
        return Ok(describe_envelope(&envelope));
    }

    let as_marking = Binary { subtype: INTENT_TO_ENCRYPT, bytes };
    match parse_marking(&as_marking) {
        Ok(marking) => Ok(describe_marking(&marking)),
        Err(e) => bail!("payload is neither an envelope nor a marking: {e}"),
    }
}

fn describe_envelope(envelope: &EncryptedEnvelope) -> Vec<String> {
    vec![
        "type:       encrypted envelope".to_string(),
        format!("key id:     {}", envelope.key_id()),
        format!("iv:         {}", hex::encode(envelope.iv())),
        format!("ciphertext: {} bytes", envelope.ciphertext().len()),
    ]
}

fn describe_marking(marking: &Marking) -> Vec<String> {
    let mut lines = vec![
        "type:       intent-to-encrypt marking".to_string(),
        format!("key:        {}", marking.key_ref()),
        format!("iv:         {}", hex::encode(marking.iv())),
        format!("value type: {:?}", marking.value().element_type()),
    ];
    if let Some(algorithm) = marking.algorithm() {
        lines.push(format!("algorithm:  {algorithm}"));
    }
    if let Some(hint) = marking.alt_name_hint() {
        lines.push(format!("alt name:   {hint}"));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{Bson, Uuid};
    use csfle::data_key::{Algorithm, KeyRef};

    #[test]
    fn test_inspect_envelope_hides_ciphertext() {
        let id = Uuid::new();
        let envelope = EncryptedEnvelope::new(id, [0xab; 16], vec![0xcd; 40]);
        let payload = STANDARD.encode(envelope.to_binary().unwrap().bytes);

        let lines = inspect(&payload).unwrap();
        assert!(lines[0].contains("envelope"));
        assert!(lines[1].contains(&id.to_string()));
        assert!(lines[2].contains(&"ab".repeat(16)));
        assert!(lines[3].contains("40 bytes"));
        assert!(!lines.join("\n").contains("cdcd"));
    }

    #[test]
    fn test_inspect_marking_hides_value() {
        let marking = Marking::new(KeyRef::AltName("ssn-key".to_string()), [1; 16], Bson::String("457-55-5462".to_string()))
            .with_algorithm(Algorithm::Deterministic);
        let payload = STANDARD.encode(marking.to_binary().unwrap().bytes);

        let text = inspect(&payload).unwrap().join("\n");
        assert!(text.contains("marking"));
        assert!(text.contains("ssn-key"));
        assert!(text.contains("Deterministic"));
        assert!(!text.contains("457-55-5462"));
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        assert!(inspect("not base64!").is_err());
        assert!(inspect(&STANDARD.encode([1, 2, 3])).is_err());
    }

    #[test]
    fn test_keygen_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");

        keygen(&path).unwrap();
        assert!(keygen(&path).is_err());
    }
}
