//! Main entry point for the pfa CLI app

use std::io;
use std::process::ExitCode;

use pfa::cli::{self, Commands, CreateArgs, ExtractArgs, ListArgs};
use pfa::extract::{input_paths, ArchiveReader};
use pfa::{lister, remote, workers};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_env("PFA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();

    let command = match cli::parse() {
        Ok(command) => command,
        Err(e) => {
            let _ = e.print();
            // help and version are not failures
            return if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    match run_app(command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_app(command: Commands) -> pfa::Result<ExitCode> {
    match command {
        Commands::Create(args) => create(&args),
        Commands::List(args) => list(&args),
        Commands::Extract(args) => extract(&args),
    }
}

fn create(args: &CreateArgs) -> pfa::Result<ExitCode> {
    let config = args.to_config();
    let compressing = config.codec.is_compressing();

    if args.remote_agent {
        let stats = remote::run_remote_agent(io::stdin().lock(), &args.output, &config)?;
        for line in stats.summary_lines(compressing) {
            println!("{line}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let summary = workers::create_archive(&args.inputs, &args.output, &config)?;
    println!("{}", summary.scan_line());
    for stats in &summary.streams {
        for line in stats.summary_lines(compressing && stats.compressed_bytes > 0) {
            println!("{line}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn list(args: &ListArgs) -> pfa::Result<ExitCode> {
    let paths = input_paths(&args.input)?;
    let entries = lister::list_streams(&paths)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{}", entry.display_line());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn extract(args: &ExtractArgs) -> pfa::Result<ExitCode> {
    let mut reader = ArchiveReader::new(args.to_options());
    for path in input_paths(&args.input)? {
        reader.add_path(path)?;
    }
    let report = reader.finish()?;
    for issue in &report.issues {
        eprintln!("{issue}");
    }
    println!("{}", report.summary_line());
    Ok(if report.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
