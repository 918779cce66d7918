mod handlers;

use clap::{CommandFactory, Parser};
use metrofleet::{
    cli::{MetrofleetArgs, MetrofleetSubcommand},
    config::FleetConfig,
    FleetResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> FleetResult<()> {
    let args = MetrofleetArgs::parse();

    let default_level = if args.verbose { "metrofleet=debug" } else { "metrofleet=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(subcommand) = args.subcommand else {
        MetrofleetArgs::command().print_help()?;
        return Ok(());
    };

    let config = FleetConfig::load(&args.config).await?;

    match subcommand {
        MetrofleetSubcommand::Provision {
            task_id,
            user_id,
            watch,
        } => {
            handlers::provision_subcommand(&config, &task_id, &user_id, watch).await?;
        }
        MetrofleetSubcommand::Status { task_id } => {
            handlers::status_subcommand(&config, &task_id).await?;
        }
        MetrofleetSubcommand::List => {
            handlers::list_subcommand(&config).await?;
        }
        MetrofleetSubcommand::Logs {
            task_id,
            limit,
            inspect,
        } => {
            handlers::logs_subcommand(&config, &task_id, limit, inspect).await?;
        }
        MetrofleetSubcommand::Stop { task_id } => {
            handlers::stop_subcommand(&config, &task_id).await?;
        }
        MetrofleetSubcommand::Delete { task_id } => {
            handlers::delete_subcommand(&config, &task_id).await?;
        }
        MetrofleetSubcommand::Sweep { watch } => {
            handlers::sweep_subcommand(&config, watch).await?;
        }
        MetrofleetSubcommand::Probe { url } => {
            handlers::probe_subcommand(&config, &url).await?;
        }
        MetrofleetSubcommand::Qr {
            url,
            format,
            size,
            level,
            margin,
            output,
        } => {
            handlers::qr_subcommand(&config, url, format, size, level, margin, output).await?;
        }
    }

    Ok(())
}
