use anyhow::Context;
use clap::Parser;
use std::io::Write;

mod amp;
mod argument;
mod checkpoint;
mod clip;
mod data_loader;
mod decoder;
mod error;
mod hcpe;
mod loss;
mod neuralnet;
mod optimizer;
mod swa;
mod training;

pub use error::{Result, TrainError};

/// log lines as "YYYY/MM/DD HH:MM:SS<TAB>LEVEL<TAB>message".
fn init_logger(path : &Option<String>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("debug"));
    builder
        .format(|buf, record| {
            writeln!(buf, "{}\t{}\t{}",
                chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
                record.level(), record.args())
        })
        .write_style(env_logger::WriteStyle::Never);

    if let Some(path) = path {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create log file {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }
    builder.try_init().context("failed to initialize logger")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let arg = argument::Arg::parse();
    init_logger(&arg.log)?;

    let mut training = training::Training::try_from(arg)
        .context("invalid arguments")?;
    training.run().context("training failed")?;
    Ok(())
}
