//! Sign a PDF at a PAdES level
//!
//! Usage:
//!   pades-sign --config sign.json
//!   pades-sign --config sign.json --level B-LT --input in.pdf --output out.pdf
//!
//! Prints the signature record as JSON. `RUST_LOG=debug` shows each stage.

use pades_oxide::config::{EngineConfig, LtvMode};
use pades_oxide::signatures::{PadesLevel, SignatureEngine};
use std::path::PathBuf;
use std::process::ExitCode;

struct SignArgs {
    config: PathBuf,
    level: Option<PadesLevel>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
}

impl SignArgs {
    fn from_args() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut level = None;
        let mut input = None;
        let mut output = None;

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--config" | "-c" => {
                    config = Some(PathBuf::from(value.ok_or("--config needs a path")?));
                    i += 1;
                },
                "--level" | "-l" => {
                    let value = value.ok_or("--level needs B-B, B-T, B-LT or B-LTA")?;
                    level = Some(value.parse::<PadesLevel>().map_err(|e| e.to_string())?);
                    i += 1;
                },
                "--input" | "-i" => {
                    input = Some(PathBuf::from(value.ok_or("--input needs a path")?));
                    i += 1;
                },
                "--output" | "-o" => {
                    output = Some(PathBuf::from(value.ok_or("--output needs a path")?));
                    i += 1;
                },
                "--help" | "-h" => {
                    return Err("usage: pades-sign --config cfg.json [--level B-LT] [--input in.pdf] [--output out.pdf]"
                        .to_string())
                },
                other => return Err(format!("unknown argument '{}'", other)),
            }
            i += 1;
        }

        Ok(Self {
            config: config.ok_or("--config is required")?,
            level,
            input,
            output,
        })
    }
}

fn run(args: SignArgs) -> pades_oxide::Result<bool> {
    let mut config = EngineConfig::from_file(&args.config)?;
    if let Some(level) = args.level {
        config = config.with_level(level);
    }
    if let Some(input) = args.input {
        config.input = Some(input);
    }
    if let Some(output) = args.output {
        config.output = Some(output);
    }
    config.validate()?;

    let engine = SignatureEngine::from_config(&config)?;
    let key = config.load_key()?;
    let request = config.signature_request(key.clone())?;
    let result = engine.sign(&request);
    key.release();
    let record = result?;
    println!("{}", serde_json::to_string_pretty(&record).unwrap_or_default());

    let target = config.signature.level;
    if config.signature.ltv_mode == LtvMode::TwoStep && target.needs_revocation() && record.is_complete() {
        let report = engine.add_verification_info(&record.output, &record.output)?;
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        if !report.complete {
            return Ok(false);
        }
        if target == PadesLevel::BLTA {
            engine.add_document_timestamp(&record.output, &record.output, config.signature.hash)?;
        }
        return Ok(true);
    }
    Ok(record.is_complete())
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match SignArgs::from_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(2);
        },
    };
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("Requested level not reached; see warnings");
            ExitCode::from(3)
        },
        Err(e) => {
            eprintln!("Error ({:?}): {}", e.kind(), e);
            ExitCode::FAILURE
        },
    }
}
