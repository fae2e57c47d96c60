use crate::demo::{run_demo, DemoArgs};
use crate::server;
use admissions::error::AppError;
use admissions::workflows::admissions::MAX_GRACE_PERIOD_DAYS;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "Admissions Orchestrator",
    about = "Run the admissions lifecycle service, its retention sweep, or a scripted walkthrough",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run one retention sweep against the configured store and print the report
    Sweep(SweepArgs),
    /// Walk an applicant from exam ticket to enrolled student against in-memory collaborators
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

#[derive(Args, Debug, Default)]
pub(crate) struct SweepArgs {
    /// Override RETENTION_GRACE_PERIOD_DAYS for this run
    #[arg(
        long,
        value_parser = clap::value_parser!(u32).range(0..=i64::from(MAX_GRACE_PERIOD_DAYS))
    )]
    pub(crate) grace_days: Option<u32>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Sweep(args) => server::sweep_once(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}
