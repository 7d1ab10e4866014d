use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use llama_cli::{build_policy, generate, load_config, memory_report, GenerateRequest, MemorySource};
use llama_stream::SessionConfig;
use tracing_subscriber::EnvFilter;

/// Streaming generation demo on a scripted backend
#[derive(Parser)]
#[command(name = "llama-cli", version)]
struct Cli {
    /// Pretend this many MiB of memory are available instead of reading the host.
    #[arg(long, global = true)]
    available_mb: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the resource policy's view of memory as JSON.
    Memory,

    /// Generate text from a prompt.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Session config as JSON; flags below override it.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum number of tokens to generate.
        #[arg(short, long)]
        max_tokens: Option<usize>,

        /// Context window capacity in tokens (0 = policy recommendation).
        #[arg(short, long)]
        window: Option<usize>,

        /// Text the scripted backend cycles through.
        #[arg(long, default_value = "the quick brown fox jumps over the lazy dog. ")]
        script: String,

        /// Run on the producer/processor pipeline.
        #[arg(long)]
        threaded: bool,

        /// Print a JSON report instead of streaming text.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let memory = match cli.available_mb {
        Some(available_mb) => MemorySource::Fixed { available_mb },
        None => MemorySource::Host,
    };
    let policy = match build_policy(memory) {
        Ok(policy) => policy,
        Err(e) => fail(&e),
    };

    match cli.command {
        Command::Memory => print_json(&memory_report(&policy)),
        Command::Generate {
            prompt,
            config,
            max_tokens,
            window,
            script,
            threaded,
            json,
        } => {
            let mut session = match config {
                Some(path) => load_config(&path).unwrap_or_else(|e| fail(&e)),
                None => SessionConfig::default(),
            };
            if let Some(max_tokens) = max_tokens {
                session.max_output_tokens = max_tokens;
            }
            if let Some(window) = window {
                session.window_capacity = window;
            }
            let request = GenerateRequest {
                prompt,
                config: session,
                script,
                threaded,
            };

            let stream = !json;
            let report = generate(policy, &request, move |text| {
                if stream {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            })
            .unwrap_or_else(|e| fail(&e));

            if json {
                print_json(&report);
            } else {
                println!();
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => fail(&e),
    }
}

fn fail(err: &dyn std::fmt::Display) -> ! {
    eprintln!("error: {err}");
    std::process::exit(1);
}
