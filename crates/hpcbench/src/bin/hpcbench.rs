use std::io::IsTerminal;

use clap::Parser;
use cli_table::ColorChoice;

use hpcbench::client::commands::{
    command_cancel, command_download, command_run, command_script, command_status, command_types,
};
use hpcbench::client::globalsettings::GlobalSettings;
use hpcbench::client::output::cli::CliOutput;
use hpcbench::client::output::json::JsonOutput;
use hpcbench::client::output::outputs::{Output, Outputs};
use hpcbench::common::cli::{ColorPolicy, CommonOpts, RootOptions, SubCommand};
use hpcbench::common::config::OrchestratorConfig;
use hpcbench::common::setup::setup_logging;

fn make_global_settings(opts: CommonOpts) -> anyhow::Result<GlobalSettings> {
    let config = OrchestratorConfig::load(opts.config.as_deref())?;

    let color_policy = match opts.colors {
        ColorPolicy::Always => ColorChoice::AlwaysAnsi,
        ColorPolicy::Auto => {
            if std::io::stdout().is_terminal() {
                ColorChoice::Auto
            } else {
                ColorChoice::Never
            }
        }
        ColorPolicy::Never => ColorChoice::Never,
    };

    // Create Printer
    let printer: Box<dyn Output> = match opts.output_mode {
        Outputs::Cli => {
            // Set colored public for CLI
            match color_policy {
                ColorChoice::Always | ColorChoice::AlwaysAnsi => {
                    colored::control::set_override(true)
                }
                ColorChoice::Never => colored::control::set_override(false),
                _ => {}
            }

            Box::new(CliOutput::new(color_policy))
        }
        Outputs::Json => Box::<JsonOutput>::default(),
    };

    Ok(GlobalSettings::new(config, printer))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> hpcbench::Result<()> {
    let top_opts = RootOptions::parse();

    setup_logging(top_opts.common.debug);

    let output_mode = top_opts.common.output_mode;
    let gsettings = match make_global_settings(top_opts.common) {
        Ok(gsettings) => gsettings,
        Err(error) => {
            let printer: Box<dyn Output> = match output_mode {
                Outputs::Cli => Box::new(CliOutput::new(ColorChoice::Auto)),
                Outputs::Json => Box::<JsonOutput>::default(),
            };
            printer.print_error(error.context("Cannot load configuration"));
            std::process::exit(1);
        }
    };

    let result = match top_opts.subcmd {
        SubCommand::Run(opts) => command_run(&gsettings, opts).await,
        SubCommand::Script(opts) => command_script(&gsettings, opts),
        SubCommand::Status(opts) => command_status(&gsettings, opts).await,
        SubCommand::Cancel(opts) => command_cancel(&gsettings, opts).await,
        SubCommand::Download(opts) => command_download(&gsettings, opts).await,
        SubCommand::Types => command_types(&gsettings),
    };

    if let Err(e) = result {
        gsettings.printer().print_error(e);
        std::process::exit(1);
    }

    Ok(())
}
