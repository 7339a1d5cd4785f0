//! Basic usage example for `csfle`.
//!
//! Runs against an in-memory key vault and a markings service that marks
//! the `ssn` field of inserted documents.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use csfle::envelope::Marking;
use csfle::prelude::*;
use csfle_key_file::LocalKeyFile;
use secrecy::ExposeSecret;

#[derive(Default)]
struct InMemory {
    keys: Mutex<Vec<Document>>,
}

#[async_trait]
impl CommandRunner for InMemory {
    async fn run_command(&self, _db: &str, command: Document) -> Result<Document, BoxError> {
        match command.keys().next().map(String::as_str) {
            Some("insert") => {
                for d in command.get_array("documents")? {
                    self.keys.lock().map_err(|_| "poisoned")?.push(d.as_document().cloned().ok_or("bad key")?);
                }
                Ok(doc! { "ok": 1 })
            }
            Some("find") => {
                let batch: Vec<Bson> =
                    self.keys.lock().map_err(|_| "poisoned")?.iter().cloned().map(Bson::Document).collect();
                Ok(doc! { "ok": 1, "cursor": { "id": 0_i64, "firstBatch": batch } })
            }
            Some("markFields") => {
                let mut data = command.get_array("data")?[0].as_document().cloned().ok_or("bad data")?;
                for item in data.get_array_mut("documents")?.iter_mut() {
                    if let Bson::Document(d) = item {
                        if let Some(ssn) = d.get("ssn").cloned() {
                            let marking = Marking::new(KeyRef::AltName("ssn-key".to_string()), [0; 16], ssn)
                                .with_algorithm(Algorithm::Deterministic);
                            d.insert("ssn", Bson::Binary(marking.to_binary()?));
                        }
                    }
                }
                Ok(doc! { "ok": 1, "data": [data] })
            }
            other => Err(format!("unsupported command {other:?}").into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("csfle Basic Usage Example");
    println!("=========================\n");

    let key_path = std::env::temp_dir().join(format!("csfle-example-{}.key", bson::Uuid::new()));
    let key_file = LocalKeyFile::init(&key_path)?;
    let master_key = key_file.load_base64()?;
    println!("✓ Local master key written to {}\n", key_file.path().display());

    let options = EngineOptions::new("keyvault.datakeys")
        .with_local_key(master_key.expose_secret().as_str())
        .with_schema("medical.patients", doc! { "bsonType": "object" });

    let runner: Arc<dyn CommandRunner> = Arc::new(InMemory::default());
    let engine = EncryptionEngine::builder(options).key_vault(runner.clone()).markings(runner).open()?;

    let key_id = engine.create_data_key(MasterKey::Local, vec!["ssn-key".to_string()]).await?;
    println!("✓ Data key created: {key_id}\n");

    let command = doc! {
        "insert": "patients",
        "documents": [{ "name": "Jon Doe", "ssn": "457-55-5462" }],
    };
    println!("Command:   {command}");

    let encrypted = engine.auto_encrypt("medical", command).await?;
    println!("Encrypted: {encrypted}\n");

    let decrypted = engine.auto_decrypt("medical", encrypted).await?;
    println!("Decrypted: {decrypted}");

    engine.close();
    std::fs::remove_file(key_path)?;
    Ok(())
}
