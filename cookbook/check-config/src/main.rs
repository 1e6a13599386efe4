use std::env;
use std::process::ExitCode;

use natkit::{init_logging, AppConfig};
use tracing::info;

fn main() -> ExitCode {
    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: check-config <config.toml>");
        return ExitCode::FAILURE;
    };

    let cfg = match AppConfig::from_env_or_file(&path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_logging(&cfg.logging) {
        eprintln!("{err}");
    }

    for (name, llm) in &cfg.llms {
        let sampling = llm.sampling();
        info!(
            name = %name,
            provider = llm.type_name(),
            model = llm.model_name(),
            temperature = ?sampling.temperature,
            top_p = ?sampling.top_p,
            thinking_prompt = ?llm.thinking_system_prompt(),
            "llm ok"
        );
    }

    match &cfg.telemetry.data_flywheel {
        Some(dfw) => info!(endpoint = %dfw.endpoint, index = %dfw.index, "data flywheel export configured"),
        None => info!("data flywheel export disabled"),
    }

    println!("{path}: {} llm(s) valid", cfg.llms.len());
    ExitCode::SUCCESS
}
