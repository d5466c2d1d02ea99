use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use control_mappings::apis::mitre_attack::source_for;
use control_mappings::config::{Config, Overrides};
use control_mappings::logging;
use control_mappings::pipeline::Pipeline;

/// Parse the NIST 800-53 revision 4 controls and ATT&CK mappings into STIX 2.0 bundles
#[derive(Parser)]
#[command(name = "control_mappings")]
#[command(version)]
struct Cli {
    /// TSV file of NIST 800-53 revision 4 controls [default: data/800-53-r4-controls.tsv]
    #[arg(long, env = "CONTROL_MAPPINGS_INPUT_CONTROLS")]
    input_controls: Option<PathBuf>,

    /// TSV file mapping controls to ATT&CK techniques [default: data/800-53-r4-mappings.tsv]
    #[arg(long, env = "CONTROL_MAPPINGS_INPUT_MAPPINGS")]
    input_mappings: Option<PathBuf>,

    /// Output bundle for the controls. If it already exists, its STIX ids are
    /// reused so they don't change between runs [default: data/800-53-r4-controls.json]
    #[arg(long, env = "CONTROL_MAPPINGS_OUTPUT_CONTROLS")]
    output_controls: Option<PathBuf>,

    /// Output bundle for the mappings; existing ids are reused the same way
    /// [default: data/800-53-r4-mappings.json]
    #[arg(long, env = "CONTROL_MAPPINGS_OUTPUT_MAPPINGS")]
    output_mappings: Option<PathBuf>,

    /// URL (or local path) of the ATT&CK STIX bundle used to resolve technique ids
    #[arg(long, env = "CONTROL_MAPPINGS_ATTACK_DATA")]
    attack_data: Option<String>,

    /// Optional TOML config file
    #[arg(long, env = "CONTROL_MAPPINGS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let _guard = logging::init_logging(config.logging.log_dir.as_deref());

    let settings = config.resolve(Overrides {
        input_controls: cli.input_controls,
        input_mappings: cli.input_mappings,
        output_controls: cli.output_controls,
        output_mappings: cli.output_mappings,
        attack_data: cli.attack_data,
    });

    let source = source_for(&settings.attack_data, settings.attack_timeout)?;

    match Pipeline::run(&settings, source.as_ref()).await {
        Ok(result) => {
            info!("Controls written to {}", result.output_controls);
            info!("Mappings written to {}", result.output_mappings);
            Ok(())
        }
        Err(e) => {
            error!("Conversion failed: {}", e);
            Err(e).context("conversion failed")
        }
    }
}
