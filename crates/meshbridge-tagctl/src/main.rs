//! meshbridge-tagctl - bulk JSON importer for node tags
//!
//! Input is a single JSON object: `{ node_public_key: { tag_key: {value_type,
//! value}, ... }, ... }`. Each node is validated before any writes happen for
//! it; by default the whole file is rejected if any record fails validation,
//! unless `--continue-on-error` is given.

use clap::Parser;
use meshbridge_core::{NodeTag, PublicKey, TagValue};
use meshbridged::store::Store;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "meshbridge-tagctl")]
#[command(about = "Bulk-import node tags from a JSON file into the meshbridge store")]
struct Args {
    /// Path to the meshbridge sled database.
    #[arg(long, env = "MESHCORE_DB_PATH")]
    db_path: PathBuf,

    /// Path to the JSON file to import.
    file: PathBuf,

    /// Validate and print a summary without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Only validate the file, skip printing an import summary.
    #[arg(long)]
    validate_only: bool,

    /// Keep processing remaining records after a record fails.
    #[arg(long)]
    continue_on_error: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct TagRecord {
    value_type: String,
    value: serde_json::Value,
}

#[derive(Debug)]
struct RecordError {
    node_public_key: String,
    tag_key: Option<String>,
    message: String,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tag_key {
            Some(key) => write!(f, "node {}..., tag '{}': {}", &self.node_public_key[..8.min(self.node_public_key.len())], key, self.message),
            None => write!(f, "node {}...: {}", &self.node_public_key[..8.min(self.node_public_key.len())], self.message),
        }
    }
}

fn parse_tag_value(record: &TagRecord) -> Result<TagValue, String> {
    match record.value_type.as_str() {
        "string" => record
            .value
            .as_str()
            .map(|s| TagValue::String(s.to_string()))
            .ok_or_else(|| "value_type 'string' requires a string value".to_string()),
        "number" => record
            .value
            .as_f64()
            .map(TagValue::Number)
            .ok_or_else(|| "value_type 'number' requires a numeric value".to_string()),
        "boolean" => record
            .value
            .as_bool()
            .map(TagValue::Boolean)
            .ok_or_else(|| "value_type 'boolean' requires a boolean value".to_string()),
        "coordinate" => {
            let latitude = record.value.get("latitude").and_then(|v| v.as_f64());
            let longitude = record.value.get("longitude").and_then(|v| v.as_f64());
            match (latitude, longitude) {
                (Some(latitude), Some(longitude)) => {
                    let tag = TagValue::Coordinate { latitude, longitude };
                    tag.validate().map_err(|e| e.to_string())?;
                    Ok(tag)
                }
                _ => Err("value_type 'coordinate' requires an object with 'latitude' and 'longitude'".to_string()),
            }
        }
        other => Err(format!("unknown value_type '{other}'")),
    }
}

/// Validate the whole file up front, returning per-record errors without
/// touching the store.
fn validate(data: &HashMap<String, HashMap<String, TagRecord>>) -> Vec<RecordError> {
    let mut errors = Vec::new();
    for (node_key, tags) in data {
        let Ok(_) = PublicKey::new(node_key) else {
            errors.push(RecordError {
                node_public_key: node_key.clone(),
                tag_key: None,
                message: "invalid public key: must be 64 hex characters".to_string(),
            });
            continue;
        };
        for (tag_key, record) in tags {
            if let Err(message) = parse_tag_value(record) {
                errors.push(RecordError { node_public_key: node_key.clone(), tag_key: Some(tag_key.clone()), message });
            }
        }
    }
    errors
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("meshbridge_tagctl=info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let raw = match std::fs::read_to_string(&args.file) {
        Ok(raw) => raw,
        Err(e) => {
            error!("cannot read {}: {}", args.file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let data: HashMap<String, HashMap<String, TagRecord>> = match serde_json::from_str(&raw) {
        Ok(data) => data,
        Err(e) => {
            error!("invalid JSON in {}: {}", args.file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let node_count = data.len();
    let tag_count: usize = data.values().map(|t| t.len()).sum();
    let errors = validate(&data);
    if !errors.is_empty() {
        warn!("validation errors:");
        for e in &errors {
            warn!("  {}", e);
        }
        if !args.continue_on_error {
            error!("{} of {} records failed validation, aborting", errors.len(), tag_count);
            return ExitCode::FAILURE;
        }
    }
    info!(node_count, tag_count, "validated import file");

    if args.validate_only {
        return ExitCode::SUCCESS;
    }

    if args.dry_run {
        info!("dry run: would update {} nodes with {} tags", node_count, tag_count);
        return ExitCode::SUCCESS;
    }

    let store = match Store::open(&args.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open store at {}: {}", args.db_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let now = now_unix();
    let mut nodes_processed = 0usize;
    let mut tags_processed = 0usize;
    let mut write_errors = Vec::new();

    for (node_key, tags) in &data {
        let Ok(public_key) = PublicKey::new(node_key) else { continue };
        let mut node_ok = true;
        for (tag_key, record) in tags {
            let value = match parse_tag_value(record) {
                Ok(value) => value,
                Err(_) => continue, // already reported during validation
            };
            let tag = NodeTag { node_public_key: public_key.clone(), key: tag_key.clone(), value, updated_at: now };
            match store.upsert_tag(&tag, now) {
                Ok(()) => {
                    tags_processed += 1;
                    if args.verbose {
                        info!("  {} = {:?}", tag_key, tag.value);
                    }
                }
                Err(e) => {
                    node_ok = false;
                    write_errors.push(RecordError {
                        node_public_key: node_key.clone(),
                        tag_key: Some(tag_key.clone()),
                        message: e.to_string(),
                    });
                    if !args.continue_on_error {
                        error!("failed to write tag, aborting: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            }
        }
        if node_ok && args.verbose {
            info!("processed node {}", node_key);
        }
        nodes_processed += 1;
    }
    store.flush().ok();

    if write_errors.is_empty() {
        info!("successfully updated {} nodes with {} tags", nodes_processed, tags_processed);
        ExitCode::SUCCESS
    } else {
        warn!("partially completed: {} nodes, {} tags, {} errors", nodes_processed, tags_processed, write_errors.len());
        ExitCode::FAILURE
    }
}
