use std::env;
use std::fs;

use govfx::evidence::EvidencePack;
use govfx::replay::{compare, compare_decisions, ReplayReport};
use govfx::risk::RiskGateDecision;
use serde_json::Value;

fn load(path: &str) -> Value {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("cannot read {}: {}", path, err);
            std::process::exit(2);
        }
    };
    match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{} is not JSON: {}", path, err);
            std::process::exit(2);
        }
    }
}

fn run(baseline: Value, candidate: Value) -> Result<ReplayReport, serde_json::Error> {
    // unsupported schema versions are reported by compare, not rejected here
    if baseline.get("gate_id").is_some() {
        let b: RiskGateDecision = serde_json::from_value(baseline)?;
        let c: RiskGateDecision = serde_json::from_value(candidate)?;
        return Ok(compare_decisions(&b, &c));
    }
    let b: EvidencePack = serde_json::from_value(baseline)?;
    let c: EvidencePack = serde_json::from_value(candidate)?;
    Ok(compare(&b, &c))
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: replay_check <baseline.json> <candidate.json>");
        std::process::exit(2);
    }
    let report = match run(load(&args[1]), load(&args[2])) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("not an evidence pack or gate decision: {}", err);
            std::process::exit(2);
        }
    };
    match serde_json::to_string_pretty(&report) {
        Ok(s) => println!("{}", s),
        Err(err) => eprintln!("cannot render report: {}", err),
    }
    std::process::exit(if report.passed() { 0 } else { 1 });
}
