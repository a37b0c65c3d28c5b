//! Labvisor CLI (labvisorctl)

use anyhow::Result;
use clap::{Parser, Subcommand};
use labvisor_service::config::DEFAULT_CONFIG_PATHS;
use labvisorctl::commands::{CheckCommand, SimulateCommand, SimulateOptions};

#[derive(Parser)]
#[command(name = "labvisorctl")]
#[command(about = "Labvisor hypervisor orchestration CLI")]
#[command(version)]
#[command(long_about = "
Labvisor hypervisor orchestration CLI

Checks pool configurations and runs lab deployments against simulated
hosts. Any configuration key can be overridden from the environment with
the LABVISOR_ prefix, e.g. LABVISOR_HYPERVISOR__PASSWORD.

Examples:
  labvisorctl check                               # Check /etc/labvisor/labvisor.toml
  labvisorctl check -c ./labvisor.toml            # Check a specific file
  labvisorctl simulate                            # Deploy the sample lab
  labvisorctl simulate -l lab.json -t demo        # Deploy a lab under tag 'demo'
  labvisorctl simulate --format json --cleanup    # Print JSON, then tear down
")]
struct Cli {
    /// Enable verbose output
    #[arg(short = 'V', long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    Check {
        /// Configuration file to check
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATHS[0])]
        config: String,
    },

    /// Deploy a lab on simulated hosts
    Simulate {
        /// Pool configuration; the hypervisor type is forced to mock
        #[arg(short, long)]
        config: Option<String>,

        /// Lab definition (JSON deployment context)
        #[arg(short, long)]
        lab: Option<String>,

        /// Isolation tag, random when omitted
        #[arg(short, long)]
        tag: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Delete the lab again after deploying it
        #[arg(long)]
        cleanup: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let result = match cli.command {
        Commands::Check { config } => CheckCommand::new().execute(&config).await,

        Commands::Simulate {
            config,
            lab,
            tag,
            format,
            cleanup,
        } => {
            let options = SimulateOptions {
                config,
                lab,
                tag,
                format,
                cleanup,
            };
            SimulateCommand::new().execute(&options).await
        }
    };

    match result {
        Ok(()) => {
            if !cli.quiet {
                log::info!("Command completed successfully");
            }
            std::process::exit(0);
        }
        Err(e) => {
            if !cli.quiet {
                eprintln!("Error: {}", e);

                if cli.verbose || cli.debug {
                    for cause in e.chain().skip(1) {
                        eprintln!("  Caused by: {}", cause);
                    }
                }
            }
            std::process::exit(1);
        }
    }
}
