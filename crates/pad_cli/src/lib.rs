//! Command-line host for GraphQL pads.
//!
//! # Usage
//!
//! ```bash
//! # Serve the starter pad
//! pad serve --port 4000
//!
//! # Serve with tenant secrets
//! PAD_USER_CONTEXT='[{"key":"APOLLO_ENGINE_KEY","value":"service:x"}]' pad serve
//!
//! # Check that the pad loads
//! pad check
//!
//! # Run one query in-process
//! pad query '{ hello }' --header authorization:token
//! ```

pub mod starter;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use pad_runtime::{Invocation, LoadState, PadRuntime, RuntimeConfig};
use std::path::PathBuf;
use std::sync::Arc;

type CliResult = Result<i32, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "pad")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Runtime settings shared by the commands that load a pad.
#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Host to bind to
    #[arg(long, env = "PAD_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PAD_PORT", default_value_t = 4000)]
    pub port: u16,

    /// Secrets payload: a JSON list of {key, value} entries
    #[arg(long, env = "PAD_USER_CONTEXT", conflicts_with = "user_context_file")]
    pub user_context: Option<String>,

    /// Read the secrets payload from a file
    #[arg(long)]
    pub user_context_file: Option<PathBuf>,

    /// Public URL of this pad
    #[arg(long, env = "PAD_URL")]
    pub url: Option<String>,

    /// Worker threads of the runtime (1 runs on the current thread)
    #[arg(long, env = "PAD_WORKER_THREADS", default_value_t = 1)]
    pub worker_threads: usize,

    /// Endpoint receiving trace report batches
    #[arg(long, env = "PAD_REPORTING_ENDPOINT")]
    pub reporting_endpoint: Option<String>,

    /// Largest request body accepted, in bytes
    #[arg(long, env = "PAD_MAX_BODY_BYTES", default_value_t = pad_runtime::config::DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,
}

impl RuntimeArgs {
    /// Builds the runtime configuration, reading the secrets file if one is given.
    pub fn to_config(&self) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
        let mut config = RuntimeConfig::new()
            .host(self.host.clone())
            .port(self.port)
            .worker_threads(self.worker_threads)
            .max_body_bytes(self.max_body_bytes);

        if let Some(path) = &self.user_context_file {
            config = config.user_context(std::fs::read_to_string(path)?.trim().to_string());
        } else if let Some(payload) = &self.user_context {
            config = config.user_context(payload.clone());
        }
        if let Some(url) = &self.url {
            config = config.platform_url(url.clone());
        }
        if let Some(endpoint) = &self.reporting_endpoint {
            config = config.reporting_endpoint(endpoint.clone());
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the pad over HTTP
    Serve {
        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Load the pad and report whether it is ready
    Check {
        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Run a single query against the pad
    Query {
        /// GraphQL query text
        query: String,

        /// Variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        /// Operation to run
        #[arg(long)]
        operation_name: Option<String>,

        /// Request header as name:value (repeatable)
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Print version information
    Version,
}

/// Parses `name:value`.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected name:value, got {:?}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {:?}", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub fn run(cli: Cli) -> CliResult {
    match cli.command {
        Commands::Serve { runtime } => serve(&runtime.to_config()?),
        Commands::Check { runtime } => check(&runtime.to_config()?, cli.verbose),
        Commands::Query {
            query,
            variables,
            operation_name,
            headers,
            runtime,
        } => {
            let mut body = serde_json::json!({ "query": query });
            if let Some(raw) = variables {
                body["variables"] = serde_json::from_str(&raw)?;
            }
            if let Some(name) = operation_name {
                body["operationName"] = serde_json::Value::String(name);
            }
            run_query(&runtime.to_config()?, &body, &headers)
        }
        Commands::Version => {
            println!("pad {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

fn serve(config: &RuntimeConfig) -> CliResult {
    let runtime = config.build_runtime()?;
    runtime.block_on(async {
        let pad = Arc::new(PadRuntime::load(starter::starter_module, config));
        if let Some(fault) = pad.state().fault() {
            eprintln!(
                "{} pad failed to load, every request will answer: {}",
                "Warning:".yellow().bold(),
                fault
            );
        }

        println!();
        println!("{} http://{}", "Serving pad at".green().bold(), config.addr());
        println!();
        pad_runtime::http::serve(pad, &config.addr()).await
    })?;
    Ok(0)
}

fn check(config: &RuntimeConfig, verbose: bool) -> CliResult {
    let pad = PadRuntime::load(starter::starter_module, config);
    match pad.state() {
        LoadState::Loaded(ready) => {
            println!("{} pad is ready", "READY".green().bold());
            if verbose {
                let kind = if ready.schema().is_lazy() { "lazy" } else { "static" };
                println!("  {} {}", "schema:".blue(), kind);
            }
            Ok(0)
        }
        LoadState::Faulted(fault) => {
            eprintln!(
                "{} [{}] {}",
                "FAULTED".red().bold(),
                fault.code(),
                fault
            );
            Ok(1)
        }
    }
}

fn run_query(
    config: &RuntimeConfig,
    body: &serde_json::Value,
    headers: &[(String, String)],
) -> CliResult {
    let invocation = headers.iter().fold(
        Invocation::post_json("/", body).secrets(config.secrets.clone()),
        |invocation, (name, value)| invocation.header(name, value.clone()),
    );

    let runtime = config.build_runtime()?;
    let response = runtime.block_on(async {
        let pad = PadRuntime::load(starter::starter_module, config);
        pad.handle(invocation).await
    });

    println!("{}", serde_json::to_string_pretty(&response.body)?);
    if response.is_fault() {
        eprintln!("{} {}", "Error:".red().bold(), response.status);
        return Ok(1);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization: Bearer x"),
            Ok(("Authorization".to_string(), "Bearer x".to_string()))
        );
        assert_eq!(
            parse_header("x-url:http://a"),
            Ok(("x-url".to_string(), "http://a".to_string()))
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header(":x").is_err());
    }

    #[test]
    fn test_query_args() {
        let cli = Cli::parse_from([
            "pad",
            "query",
            "{ hello }",
            "--header",
            "a:b",
            "--port",
            "5000",
            "--user-context",
            "[]",
            "--max-body-bytes",
            "2048",
        ]);
        match cli.command {
            Commands::Query {
                query,
                headers,
                runtime,
                ..
            } => {
                assert_eq!(query, "{ hello }");
                assert_eq!(headers, vec![("a".to_string(), "b".to_string())]);
                let config = runtime.to_config().unwrap();
                assert_eq!(config.port, 5000);
                assert_eq!(config.secrets.user_context, "[]");
                assert_eq!(config.max_body_bytes, 2048);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_user_context_file() {
        let path = std::env::temp_dir().join(format!("pad-cli-secrets-{}.json", std::process::id()));
        std::fs::write(&path, "[{\"key\":\"a\",\"value\":\"b\"}]\n").unwrap();

        let cli = Cli::parse_from([
            "pad",
            "check",
            "--user-context-file",
            path.to_str().unwrap(),
        ]);
        let Commands::Check { runtime } = cli.command else {
            panic!("expected check");
        };
        let config = runtime.to_config().unwrap();
        assert_eq!(config.secrets.user_context, "[{\"key\":\"a\",\"value\":\"b\"}]");

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_check_starter() {
        assert_eq!(check(&RuntimeConfig::new(), true).unwrap(), 0);
    }

    #[test]
    fn test_query_starter() {
        let body = serde_json::json!({ "query": "{ hello }" });
        assert_eq!(run_query(&RuntimeConfig::new(), &body, &[]).unwrap(), 0);
    }
}
