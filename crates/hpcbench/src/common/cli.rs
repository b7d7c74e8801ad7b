use std::path::PathBuf;

use clap::Parser;

use crate::client::output::outputs::Outputs;

#[derive(clap::ValueEnum, Clone, Copy)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to the orchestrator configuration file (TOML)
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "HPCBENCH_CONFIG",
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: Option<PathBuf>,

    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Sets output formatting
    #[arg(
        long,
        env = "HPCBENCH_OUTPUT_MODE",
        default_value_t = Outputs::Cli,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub output_mode: Outputs,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "HPCBENCH_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::HPCBENCH_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Submit all stages of a recipe, waiting for node assignments where needed
    Run(RunOpts),
    /// Print the batch scripts of a recipe without submitting anything
    Script(ScriptOpts),
    /// Query the scheduler state of submitted jobs, lists all jobs of the user without ids
    Status(StatusOpts),
    /// Cancel submitted jobs
    Cancel(CancelOpts),
    /// Download a file from the cluster
    Download(DownloadOpts),
    /// List available job types
    Types,
}

#[derive(Parser)]
pub struct RunOpts {
    /// Recipe file (TOML)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub recipe: PathBuf,

    /// Cancel the submitted jobs when a later stage fails
    #[arg(long)]
    pub cancel_on_error: bool,
}

#[derive(Parser)]
pub struct ScriptOpts {
    /// Recipe file (TOML)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub recipe: PathBuf,

    /// Print only the script of this stage
    #[arg(long)]
    pub stage: Option<String>,
}

#[derive(Parser)]
pub struct StatusOpts {
    /// Slurm job ids
    pub scheduler_ids: Vec<String>,
}

#[derive(Parser)]
pub struct CancelOpts {
    /// Slurm job ids
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub scheduler_ids: Vec<String>,

    /// Cancel all queued and running hpcbench jobs of the user
    #[arg(long)]
    pub all: bool,
}

#[derive(Parser)]
pub struct DownloadOpts {
    /// Path of the file on the cluster
    pub remote_path: String,

    /// Local destination
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub output: PathBuf,
}
