use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, metadata::LevelFilter};
use tracing_subscriber::{prelude::*, EnvFilter};
use verikit_foundation::{
    errors::{sink::CountingSink, Diagnostic},
    source::SourceManager,
};
use verikit_preprocessor::{to_source_text, Preprocessor, PreprocessorOptions};

#[derive(Subcommand)]
enum Command {
    /// Run the preprocessor over a file and print the resulting source text.
    Preprocess {
        /// The file to preprocess.
        filename: PathBuf,

        /// Additional files that may be pulled in via `include.
        #[clap(short, long)]
        include: Vec<PathBuf>,

        /// Macros to predefine, as NAME or NAME=integer.
        #[clap(short = 'D', long = "define")]
        defines: Vec<String>,
    },

    /// Run the preprocessor and dump the token stream with provenance.
    Tokens {
        /// The file to preprocess.
        filename: PathBuf,
    },
}

#[derive(Parser)]
struct Args {
    /// Tool to run.
    #[clap(subcommand)]
    command: Command,
}

fn read_into(sm: &mut SourceManager, path: &PathBuf) -> anyhow::Result<verikit_foundation::source::BufferId> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read source file at {path:?}"))?;
    Ok(sm.add_file(path.to_string_lossy().into_owned(), source))
}

fn parse_defines(defines: &[String]) -> Vec<(String, i64)> {
    defines
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, value)) => (name.to_string(), value.parse().unwrap_or(0)),
            None => (entry.clone(), 1),
        })
        .collect()
}

fn emit_all(diagnostics: Vec<Diagnostic>, sm: &SourceManager) -> anyhow::Result<()> {
    if !diagnostics.is_empty() {
        info!("Finished with the following diagnostics:");
        for diagnostic in diagnostics {
            diagnostic.emit_to_stderr(sm)?;
        }
    }
    Ok(())
}

fn fallible_main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Preprocess {
            filename,
            include,
            defines,
        } => {
            let mut sm = SourceManager::new();
            for path in &include {
                read_into(&mut sm, path)?;
            }
            let main = read_into(&mut sm, &filename)?;

            let mut sink = CountingSink::new(Vec::new());
            let options = PreprocessorOptions {
                predefines: parse_defines(&defines),
                ..Default::default()
            };
            let tokens = {
                let mut preprocessor = Preprocessor::new(&mut sm, &mut sink, options);
                preprocessor.push_source(main);
                debug!("preprocessing {filename:?}");
                preprocessor.preprocess()
            };

            println!("{}", to_source_text(&tokens));
            let num_errors = sink.num_errors;
            emit_all(sink.inner, &sm)?;
            if num_errors > 0 {
                anyhow::bail!("preprocessing failed with {num_errors} error(s)");
            }
        }
        Command::Tokens { filename } => {
            let mut sm = SourceManager::new();
            let main = read_into(&mut sm, &filename)?;

            let mut diagnostics = vec![];
            let mut preprocessor =
                Preprocessor::new(&mut sm, &mut diagnostics, PreprocessorOptions::default());
            preprocessor.push_source(main);
            let tokens = preprocessor.preprocess();

            for token in &tokens {
                let location = token.location();
                println!(
                    "{:?} {:?} at {}:{}:{}",
                    token.kind(),
                    token.raw_text(),
                    sm.file_name(location),
                    sm.line_number(location),
                    sm.column_number(location),
                );
            }
            emit_all(diagnostics, &sm)?;
        }
    }

    Ok(())
}

fn main() {
    let subscriber = tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        );
    tracing::subscriber::set_global_default(subscriber)
        .expect("cannot set default tracing subscriber");

    match fallible_main() {
        Ok(_) => (),
        Err(err) => {
            error!("in fallible_main: {err:?}");
            std::process::exit(1);
        }
    }
}
