//! Verify the signatures of a PDF
//!
//! Usage:
//!   pades-verify signed.pdf
//!   pades-verify signed.pdf --trust root.der --trust other-root.pem
//!
//! Prints one JSON object per signature. Exits with 1 when any signature
//! fails its integrity check.

use pades_oxide::config::read_certificates;
use pades_oxide::signatures::SignatureVerifier;
use std::path::PathBuf;
use std::process::ExitCode;

struct VerifyArgs {
    file: PathBuf,
    trust: Vec<PathBuf>,
}

impl VerifyArgs {
    fn from_args() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().collect();
        let mut file = None;
        let mut trust = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--trust" | "-t" => {
                    i += 1;
                    let path = args.get(i).ok_or("--trust needs a certificate file")?;
                    trust.push(PathBuf::from(path));
                },
                "--help" | "-h" => return Err("usage: pades-verify <file.pdf> [--trust root.der]...".to_string()),
                other if file.is_none() && !other.starts_with('-') => file = Some(PathBuf::from(other)),
                other => return Err(format!("unexpected argument '{}'", other)),
            }
            i += 1;
        }

        Ok(Self {
            file: file.ok_or("a PDF file is required")?,
            trust,
        })
    }
}

fn run(args: VerifyArgs) -> pades_oxide::Result<bool> {
    let verifier = SignatureVerifier::new().with_trusted_roots(&read_certificates(&args.trust)?)?;
    let results = verifier.verify_file(&args.file)?;
    if results.is_empty() {
        eprintln!("{}: no signatures", args.file.display());
    }
    println!("{}", serde_json::to_string_pretty(&results).unwrap_or_default());
    Ok(results.iter().all(|r| r.valid))
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match VerifyArgs::from_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(2);
        },
    };
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error ({:?}): {}", e.kind(), e);
            ExitCode::from(2)
        },
    }
}
