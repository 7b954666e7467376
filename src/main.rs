use std::process::ExitCode;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "overlan",
    version,
    about = "overlan - overlay L2 switch dataplane and edge point"
)]
struct Cli {
    /// Path to the overlan config file (.toml/.yaml/.yml). If omitted, uses
    /// OVERLAN_CONFIG, then auto-detects overlan.toml > overlan.yaml >
    /// overlan.yml from CWD, then falls back to the OS default config dir.
    #[arg(long, env = "OVERLAN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match overlan::run(cli.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("overlan: {:#}", err.source());
            ExitCode::from(err.exit_code())
        }
    }
}
