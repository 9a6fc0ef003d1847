use clap::Parser;
use vprbench::Opts;
use vprbench::cli::SubCommandExtend;
use vprbench::config::SubCommand;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Info(config) => config.run(&opts).await,
        SubCommand::Show(config) => config.run(&opts).await,
        SubCommand::Matches(config) => config.run(&opts).await,
        SubCommand::Check(config) => config.run(&opts).await,
    }
}
