use std::path::PathBuf;

use clap::Parser;

use crate::{
    artifact::{ErrorCorrectionLevel, QrFormat},
    config::METROFLEET_CONFIG_FILENAME,
};

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// metrofleet - Provisions and watches over remote bundler sandboxes for live app previews
#[derive(Debug, Parser)]
#[command(name = "metrofleet", author, about, version, styles=styles::styles())]
pub struct MetrofleetArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<MetrofleetSubcommand>,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = METROFLEET_CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands for managing sandboxes
#[derive(Debug, Parser)]
pub enum MetrofleetSubcommand {
    /// Provision a sandbox for a task and print its connection code
    #[command(name = "provision")]
    Provision {
        /// The task the sandbox previews
        #[arg(short, long)]
        task_id: String,

        /// The user that owns the task
        #[arg(short, long)]
        user_id: String,

        /// Keep health monitoring the sandbox until interrupted
        #[arg(short, long)]
        watch: bool,
    },

    /// Show the stored and remote status of a task's sandbox
    #[command(name = "status")]
    Status {
        /// The task the sandbox previews
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// List every sandbox record
    #[command(name = "list")]
    List,

    /// Print recent bundler logs of a task's sandbox
    #[command(name = "logs")]
    Logs {
        /// The task the sandbox previews
        #[arg(value_name = "TASK_ID")]
        task_id: String,

        /// Maximum number of lines
        #[arg(short = 'n', long, default_value_t = 100)]
        limit: u32,

        /// Classify the logs and recover the sandbox if they show a failure
        #[arg(short, long)]
        inspect: bool,
    },

    /// Stop a task's sandbox
    #[command(name = "stop")]
    Stop {
        /// The task the sandbox previews
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Delete everything behind a task's sandbox
    #[command(name = "delete")]
    Delete {
        /// The task the sandbox previews
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Stop sandboxes that have been idle for too long
    #[command(name = "sweep")]
    Sweep {
        /// Keep sweeping on the configured interval until interrupted
        #[arg(short, long)]
        watch: bool,
    },

    /// Probe a bundler endpoint once
    #[command(name = "probe")]
    Probe {
        /// The base URL of the bundler
        #[arg(value_name = "URL")]
        url: String,
    },

    /// Render a URL as a QR connection code
    #[command(name = "qr")]
    Qr {
        /// The URL to encode
        #[arg(value_name = "URL")]
        url: String,

        /// Output encoding, `svg` or `png`
        #[arg(short, long, default_value_t = QrFormat::Svg)]
        format: QrFormat,

        /// The side of the image in pixels
        #[arg(short, long)]
        size: Option<u32>,

        /// Error-correction level, one of `L`, `M`, `Q` or `H`
        #[arg(short, long, default_value_t = ErrorCorrectionLevel::M)]
        level: ErrorCorrectionLevel,

        /// The quiet zone in modules
        #[arg(short, long)]
        margin: Option<u32>,

        /// Write the code to a file instead of stdout. PNG output is written as raw bytes.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_well_formed() {
        MetrofleetArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_qr_options() {
        let args = MetrofleetArgs::parse_from([
            "metrofleet",
            "qr",
            "https://preview.up.railway.app",
            "--format",
            "png",
            "--level",
            "h",
            "--size",
            "512",
        ]);

        match args.subcommand {
            Some(MetrofleetSubcommand::Qr {
                url,
                format,
                size,
                level,
                margin,
                output,
            }) => {
                assert_eq!(url, "https://preview.up.railway.app");
                assert_eq!(format, QrFormat::Png);
                assert_eq!(size, Some(512));
                assert_eq!(level, ErrorCorrectionLevel::H);
                assert_eq!(margin, None);
                assert_eq!(output, None);
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
        assert_eq!(args.config, PathBuf::from(METROFLEET_CONFIG_FILENAME));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = MetrofleetArgs::parse_from([
            "metrofleet",
            "sweep",
            "--watch",
            "--config",
            "fleet.toml",
            "-v",
        ]);

        assert!(args.verbose);
        assert_eq!(args.config, PathBuf::from("fleet.toml"));
        assert!(matches!(
            args.subcommand,
            Some(MetrofleetSubcommand::Sweep { watch: true })
        ));
    }
}
