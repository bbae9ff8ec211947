use clap::Parser;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use udiald::cli::{AppMode, Cli};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let failed = err.use_stderr();
            let _ = err.print();
            // Usage errors share the invalid-arguments exit code.
            return ExitCode::from(if failed { 1 } else { 0 });
        }
    };

    if let Err(err) = color_eyre::install() {
        eprintln!("failed to install error reporting: {err}");
        return ExitCode::from(2);
    }

    init_tracing(&cli);

    match udiald::program::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(err.exit_code()),
    }
}

fn init_tracing(cli: &Cli) {
    let level = match cli.verbosity() {
        i8::MIN..=-2 => LevelFilter::OFF,
        -1 => LevelFilter::WARN,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.app() == AppMode::Dial {
        // pppd captures our stderr; timestamps are already added there.
        builder.without_time().init();
    } else {
        builder.init();
    }
}
