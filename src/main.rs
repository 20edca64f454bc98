use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ristretto::runtime::Runtime;

/// Execute the main method of a compiled Java class file.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the .class file to run.
    class_file: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let prefix = match args.class_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            format!("{}/", parent.display())
        }
        _ => String::new(),
    };
    let class_name = match args.class_file.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => stem.to_string(),
        None => {
            eprintln!("error: {} is not a class file path", args.class_file.display());
            return ExitCode::FAILURE;
        }
    };

    let mut runtime = Runtime::new(&prefix);
    match runtime.run_main(&class_name) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
