use gdrive_mirrord::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: gdrive-mirrord [--help]");
    println!();
    println!("Mirrors a Google Drive folder into a local directory.");
    println!("Configuration comes from the environment (or a .env file):");
    println!("  GDRIVE_ACCESS_TOKEN     OAuth access token (required)");
    println!("  GDRIVE_ROOT_FOLDER_ID   folder to mirror (default: root)");
    println!("  GDRIVE_MIRROR_DIR       local mirror directory");
    println!("  GDRIVE_STATE_DIR        where files.json, transform.json and quota.json live");
    println!("  GDRIVE_POLL_SECS        seconds between sync passes");
    println!("  GDRIVE_FULL_SYNC_EVERY  run a full tree walk every n passes");
    println!("  GDRIVE_QUOTA_QUERIES    starting request budget per window");
    println!("  GDRIVE_QUOTA_SECONDS    window length in seconds");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_usage();
            return Ok(());
        }
        CliMode::Run => {}
    }
    tracing::info!("gdrive-mirrord v{}", env!("CARGO_PKG_VERSION"));
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["gdrive-mirrord".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["gdrive-mirrord".to_string(), "-h".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        let err = parse_cli_mode(vec!["gdrive-mirrord".to_string(), "--logout".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("--logout"));
    }
}
