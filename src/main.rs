use clap::{Parser, Subcommand};
use rayon::prelude::*;
use scripture_assembler::catalog::CatalogClient;
use scripture_assembler::config::{self, AssemblerConfig};
use scripture_assembler::control::RunControl;
use scripture_assembler::generate::{self, Pipeline};
use scripture_assembler::http::{HttpClient, UreqClient};
use scripture_assembler::key::document_request_key;
use scripture_assembler::output;
use scripture_assembler::render::CommandRenderer;
use scripture_assembler::types::DocumentRequest;
use scripture_assembler::usfm::{self, UsfmOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "scripture-assembler")]
#[command(about = "Assemble interleaved scripture and translation-helps documents")]
#[command(long_about = "\
Assemble interleaved scripture and translation-helps documents

A document request is a JSON file naming resources and a strategy:

  {
    \"assembly_strategy_kind\": \"book\",
    \"resource_requests\": [
      { \"lang_code\": \"en\", \"resource_type\": \"ulb-wa\", \"resource_code\": \"jud\" },
      { \"lang_code\": \"en\", \"resource_type\": \"tn-wa\",  \"resource_code\": \"jud\" }
    ],
    \"generate_pdf\": false
  }

Strategies:
  book      each resource's whole chapter in turn
  chapter   like book, one chapter at a time
  verse     all resources interleaved verse by verse

Each request is written to {output_dir}/{key}.html, where the key is a
hash of the strategy and the resource triples.

Run 'scripture-assembler gen-config' to generate a documented config.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file (stock defaults apply when absent)
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Override [paths] working_dir
    #[arg(long, global = true)]
    working_dir: Option<PathBuf>,

    /// Override [paths] output_dir
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate documents from request JSON files
    Assemble {
        /// Request files, run concurrently
        #[arg(required = true)]
        requests: Vec<PathBuf>,
    },
    /// Print the document key for a request file
    Key { request: PathBuf },
    /// Parse a USFM file and print its chapter outline
    ParseUsfm {
        file: PathBuf,
        /// Three-letter book id, e.g. `jud`
        #[arg(long)]
        book: String,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Assemble { ref requests } => {
            let config = load_config(&cli)?;
            let failures = assemble(&config, requests)?;
            if failures > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Key { ref request } => {
            let json = std::fs::read_to_string(request)?;
            let request = DocumentRequest::from_json(&json)?;
            println!("{}", document_request_key(&request));
        }
        Command::ParseUsfm { ref file, ref book } => {
            let source = std::fs::read_to_string(file)?;
            let doc = usfm::parse_usfm(&source, &book.to_lowercase(), &UsfmOptions::default())?;
            output::print_usfm_outline(&doc);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Logs go to stderr so stdout stays parseable. `RUST_LOG` overrides.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<AssemblerConfig, config::ConfigError> {
    let mut config = config::load_config(&cli.config)?;
    if let Some(dir) = &cli.working_dir {
        config.paths.working_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.paths.output_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Run every request on a pool sized by `[run] max_parallel_runs`. Results
/// print in argument order. Returns the number of failed runs.
fn assemble(config: &AssemblerConfig, requests: &[PathBuf]) -> Result<usize, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.paths.output_dir)?;
    std::fs::create_dir_all(&config.paths.working_dir)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config::effective_parallel_runs(&config.run))
        .build()?;
    let http: Arc<dyn HttpClient> = Arc::new(UreqClient::new(&config.http));
    let catalog = CatalogClient::new(Arc::clone(&http), config);
    let renderer = CommandRenderer::new(&config.render);
    let pipeline = Pipeline {
        config,
        catalog: &catalog,
        http: http.as_ref(),
        renderer: &renderer,
    };

    let results: Vec<_> = pool.install(|| {
        requests
            .par_iter()
            .map(|path| run_file(&pipeline, config, path))
            .collect()
    });

    let mut failures = 0;
    for (path, result) in requests.iter().zip(results) {
        match result {
            Ok(Ok(outcome)) => output::print_run_outcome(&outcome),
            Ok(Err(failure)) => {
                failures += 1;
                output::print_run_failure(&failure);
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", path.display(), e);
            }
        }
    }
    Ok(failures)
}

fn run_file(
    pipeline: &Pipeline<'_>,
    config: &AssemblerConfig,
    path: &Path,
) -> std::io::Result<Result<generate::RunOutcome, generate::RunFailure>> {
    let json = std::fs::read_to_string(path)?;
    let control = RunControl::new().with_wall_clock_secs(config.run.wall_clock_secs);
    tracing::debug!(request = %path.display(), "read request");
    Ok(generate::generate_from_json(pipeline, &json, &control))
}
