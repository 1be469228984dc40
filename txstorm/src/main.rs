use anyhow::Context;
use clap::Parser;
use tokio::runtime::Builder;
use txstorm::{cfg::ModeConfig, cmd::Cmd, runtime::Runtime};

pub fn main() {
    let cmd = Cmd::parse();
    if let Err(err) = txstorm::logging::init(cmd.verbose as usize) {
        eprintln!("ERROR: failed to initialize logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(cmd) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), anyhow::Error> {
    let cfg: ModeConfig = cmd.mode.try_into()?;

    Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .thread_name("runtime")
        .build()
        .context("failed to build runtime")?
        .block_on(async {
            let runtime = Runtime::new(cfg);

            runtime.run().await
        })?;

    Ok(())
}
