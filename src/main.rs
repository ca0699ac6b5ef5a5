use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use logging::init_logging;
use server::serve;

mod compose;
mod logging;
mod model;
mod notify;
mod push;
mod rate_limiter;
mod schedule;
mod server;
mod server_state;
mod store;

#[derive(Parser)]
struct Opts {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    Serve {
        #[clap(short, long)]
        port: Option<u16>,

        #[clap(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let opts = Opts::parse();

    match opts.subcmd {
        SubCommand::Serve { port, db } => {
            serve(port, db).await?;
        }
    }

    Ok(())
}
