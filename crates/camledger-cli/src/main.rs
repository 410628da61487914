use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use camledger_core::{BlockchainConfig, BlockchainManager, HashingService};
use camledger_storage::{open_backend, Backend};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_NODE: &str = "http://127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(name = "camledger", version)]
#[command(about = "Operator tool for the camera integrity ledger")]
struct Cli {
    /// Data directory holding chain.json and the block files
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Storage backend: fs or sled
    #[arg(long, global = true, default_value_t = Backend::Fs)]
    backend: Backend,

    /// Ledger config as JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print ledger status from the data directory, or from a node with --node
    Status {
        #[arg(long)]
        node: Option<String>,
    },
    /// Verify the chain; exits non-zero on any mismatch
    Verify,
    /// Export finalized blocks as a JSON array
    Export {
        #[arg(long)]
        start: Option<u32>,
        #[arg(long)]
        end: Option<u32>,
        /// Write to this file instead of stdout
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Replace the chain with an exported document
    Import { file: PathBuf },
    /// Print one finalized block
    ShowBlock { number: u32 },
    /// Print the SHA-256 digest of a file
    HashFile { path: PathBuf },
    /// Submit a transaction to a running node
    Submit {
        /// Node base URL
        #[arg(long, default_value = DEFAULT_NODE)]
        node: String,
        #[command(subcommand)]
        tx: SubmitTx,
    },
}

#[derive(Subcommand, Debug)]
enum SubmitTx {
    Image(PayloadArgs),
    Detection {
        #[command(flatten)]
        payload: PayloadArgs,
        #[arg(long)]
        confidence: f32,
    },
    Sensor(PayloadArgs),
    Event {
        #[arg(value_enum)]
        kind: EventKind,
        event: String,
        #[arg(long)]
        metadata: Option<String>,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct PayloadArgs {
    /// Precomputed SHA-256 digest, 64 hex characters
    #[arg(long, conflicts_with_all = ["path", "text"])]
    digest: Option<String>,
    /// Size in bytes of the data behind --digest
    #[arg(long, requires = "digest")]
    size: Option<u64>,
    /// File to hash, relative to the node's --capture-dir
    #[arg(long, conflicts_with = "text")]
    path: Option<PathBuf>,
    /// Inline payload, hashed as UTF-8
    #[arg(long)]
    text: Option<String>,
    /// Metadata, usually a JSON object
    #[arg(long)]
    metadata: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EventKind {
    System,
    Power,
    Network,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::System => "system",
            EventKind::Power => "power",
            EventKind::Network => "network",
        }
    }
}

#[derive(Serialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct TxBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    data_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
}

impl From<&PayloadArgs> for TxBody {
    fn from(args: &PayloadArgs) -> Self {
        TxBody {
            data_hash: args.digest.clone(),
            size: args.size,
            path: args.path.clone(),
            text: args.text.clone(),
            metadata: args.metadata.clone(),
            ..Default::default()
        }
    }
}

/// Route under `/tx/` and request body for a submission.
fn submit_request(tx: &SubmitTx) -> (&'static str, TxBody) {
    match tx {
        SubmitTx::Image(payload) => ("image", TxBody::from(payload)),
        SubmitTx::Sensor(payload) => ("sensor", TxBody::from(payload)),
        SubmitTx::Detection {
            payload,
            confidence,
        } => (
            "detection",
            TxBody {
                confidence: Some(*confidence),
                ..TxBody::from(payload)
            },
        ),
        SubmitTx::Event {
            kind,
            event,
            metadata,
        } => (
            "event",
            TxBody {
                kind: Some(kind.as_str()),
                event: Some(event.clone()),
                metadata: metadata.clone(),
                ..Default::default()
            },
        ),
    }
}

fn open_ledger(cli: &Cli) -> Result<BlockchainManager> {
    let config = match &cli.config {
        Some(path) => BlockchainConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => BlockchainConfig::default(),
    };
    let storage = open_backend(cli.backend, &cli.data_dir)?;
    let mut manager = BlockchainManager::with_system_clock(storage);
    manager
        .initialize(config)
        .with_context(|| format!("open ledger at {}", cli.data_dir.display()))?;
    Ok(manager)
}

/// Commands that work on the data directory directly.
fn run_offline(cli: &Cli) -> Result<String> {
    let out = match &cli.cmd {
        Command::HashFile { path } => {
            let hash = HashingService::new()
                .hash_file(path)
                .with_context(|| format!("hash {}", path.display()))?;
            let size = fs::metadata(path)?.len();
            format!("{hash}  {size}  {}", path.display())
        }
        Command::Status { .. } => {
            let ledger = open_ledger(cli)?;
            serde_json::to_string_pretty(&ledger.status())?
        }
        Command::Verify => {
            let mut ledger = open_ledger(cli)?;
            let report = ledger.verify_integrity()?;
            let text = serde_json::to_string_pretty(&report)?;
            if !report.is_clean() {
                println!("{text}");
                bail!("chain has {} integrity mismatch(es)", report.mismatches());
            }
            text
        }
        Command::Export { start, end, out } => {
            let ledger = open_ledger(cli)?;
            let range = match (start, end) {
                (None, None) => None,
                (start, end) => {
                    let tip = ledger.latest_block().map(|b| b.number()).unwrap_or(0);
                    Some(start.unwrap_or(0)..=end.unwrap_or(tip))
                }
            };
            let doc = ledger.export_chain(range)?;
            match out {
                Some(path) => {
                    fs::write(path, &doc).with_context(|| format!("write {}", path.display()))?;
                    format!("exported chain to {}", path.display())
                }
                None => doc,
            }
        }
        Command::Import { file } => {
            let doc = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
            let mut ledger = open_ledger(cli)?;
            let report = ledger.import_chain(&doc)?;
            serde_json::to_string_pretty(&report)?
        }
        Command::ShowBlock { number } => {
            let ledger = open_ledger(cli)?;
            match ledger.get_block(*number)? {
                Some(block) => block.serialize()?,
                None => bail!("block {number} does not exist"),
            }
        }
        Command::Submit { .. } => bail!("submit needs a running node"),
    };
    Ok(out)
}

async fn get_text(url: &str) -> Result<String> {
    let res = reqwest::get(url).await.with_context(|| format!("GET {url}"))?;
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        bail!("node answered {status}: {body}");
    }
    Ok(body)
}

async fn submit(node: &str, tx: &SubmitTx) -> Result<String> {
    let (route, body) = submit_request(tx);
    let url = format!("{}/tx/{route}", node.trim_end_matches('/'));
    debug!(%url, "submitting transaction");
    let res = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        bail!("node answered {status}: {text}");
    }
    Ok(text)
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let out = match &cli.cmd {
        Command::Status { node: Some(node) } => {
            get_text(&format!("{}/status", node.trim_end_matches('/'))).await?
        }
        Command::Submit { node, tx } => submit(node, tx).await?,
        _ => run_offline(&cli)?,
    };
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn detection_submission_body() {
        let cli = parse(&[
            "camledger", "submit", "detection", "--text", "deer", "--confidence", "0.8",
            "--metadata", r#"{"label":"deer"}"#,
        ]);
        let Command::Submit { node, tx } = &cli.cmd else {
            panic!("expected submit");
        };
        assert_eq!(node, DEFAULT_NODE);
        let (route, body) = submit_request(tx);
        assert_eq!(route, "detection");
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["text"], "deer");
        assert_eq!(v["metadata"], r#"{"label":"deer"}"#);
        assert!((v["confidence"].as_f64().unwrap() - 0.8).abs() < 1e-6);
        assert!(v.get("dataHash").is_none());
    }

    #[test]
    fn event_submission_body() {
        let cli = parse(&["camledger", "submit", "event", "power", "battery_low"]);
        let Command::Submit { tx, .. } = &cli.cmd else {
            panic!("expected submit");
        };
        let (route, body) = submit_request(tx);
        assert_eq!(route, "event");
        assert_eq!(body.kind, Some("power"));
        assert_eq!(body.event.as_deref(), Some("battery_low"));
    }

    #[test]
    fn payload_sources_are_exclusive() {
        let digest = "ab".repeat(32);
        assert!(Cli::try_parse_from([
            "camledger", "submit", "image", "--digest", digest.as_str(), "--text", "x",
        ])
        .is_err());
        assert!(Cli::try_parse_from(["camledger", "submit", "image", "--size", "10"]).is_err());
    }

    #[test]
    fn hash_file_prints_digest_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.bin");
        fs::write(&path, b"abc").unwrap();
        let cli = parse(&["camledger", "hash-file", path.to_str().unwrap()]);
        let out = run_offline(&cli).unwrap();
        assert!(out.starts_with(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  3  "
        ));
    }

    #[test]
    fn offline_export_import_verify() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let data = data.to_str().unwrap();
        let export = dir.path().join("chain-export.json");

        let out = run_offline(&parse(&["camledger", "--data-dir", data, "show-block", "0"])).unwrap();
        assert!(out.contains("\"blockNumber\": 0"));

        let out = run_offline(&parse(&[
            "camledger", "--data-dir", data, "export", "--out", export.to_str().unwrap(),
        ]))
        .unwrap();
        assert!(out.starts_with("exported chain"));

        let out = run_offline(&parse(&[
            "camledger", "--data-dir", data, "import", export.to_str().unwrap(),
        ]))
        .unwrap();
        let report: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(report["blocksChecked"], 1);

        let out = run_offline(&parse(&["camledger", "--data-dir", data, "verify"])).unwrap();
        assert!(out.contains("\"invalidBlocks\": []"));

        assert!(run_offline(&parse(&["camledger", "--data-dir", data, "show-block", "9"])).is_err());
    }
}
