use clap::{Parser, ValueEnum};
use metrics_exporter_statsd::StatsdBuilder;
use nameservice::NameService;
use nameservice::config::AddTripleConfig;
use proxy::QueryProcessor;
use shared::backend::{Backend, BackendConfig};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Racing reverse proxy for SPARQL engines: prefers a fast primary backend,
/// falls back to a slower secondary one, and optionally enhances queries
/// with name triples before forwarding them.
#[derive(Parser, Debug)]
#[command(
    after_help = "Example invocation for Wikidata:\n\n\
        sparql-proxy --port 8904 \\\n\
        \x20 --add-triple \"@en@<http://www.w3.org/2000/01/rdf-schema#label>||1\" \\\n\
        \x20 --backend-1 \"https://qlever.cs.uni-freiburg.de/api/wikidata\" \\\n\
        \x20 --backend-2 \"https://qlever.cs.uni-freiburg.de/api/wikidata\" \\\n\
        \x20 --timeout-1 0.5 --timeout-2 30.0 --pin-results-backend-2"
)]
struct Cli {
    /// Run the proxy on this port
    #[arg(long)]
    port: u16,

    /// Primary backend (preferred whenever it responds in time)
    #[arg(long, default_value = "https://qlever.cs.uni-freiburg.de:443/api/wikidata")]
    backend_1: String,

    /// Fallback backend, asked the simpler query when backend 1 does not
    /// respond in time. Empty (the default) means same as backend 1.
    #[arg(long, default_value = "")]
    backend_2: String,

    /// Timeout in seconds for backend 1, when asking parallel queries
    #[arg(long, default_value_t = 0.5)]
    timeout_1: f64,

    /// Timeout in seconds for backend 2, when asking parallel queries
    #[arg(long, default_value_t = 5.0)]
    timeout_2: f64,

    /// Timeout in seconds for backend 1, when asking ordinary queries
    #[arg(long, default_value_t = 10.0)]
    timeout: f64,

    /// Suffix for the subject variable of an added triple (can be empty)
    #[arg(long, default_value = "_id")]
    subject_var_suffix: String,

    /// Configuration for adding a triple, in the form
    /// <predicate>|<suffix>|<position>; repeatable
    #[arg(
        long = "add-triple",
        default_value = "@en@<http://www.w3.org/2000/01/rdf-schema#label>||1"
    )]
    add_triple: Vec<String>,

    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Pin results from backend 2 to the upstream cache permanently
    #[arg(long)]
    pin_results_backend_2: bool,

    /// Clear backend 2's cache on startup, including pinned results
    #[arg(long)]
    clear_cache_2: bool,

    /// Show cache stats for backend 2 after every query
    #[arg(long, default_value_t = true)]
    show_cache_stats_2: bool,

    /// StatsD host for metrics; metrics are disabled when unset
    #[arg(long)]
    statsd_host: Option<String>,

    #[arg(long, default_value_t = 8125)]
    statsd_port: u16,

    /// Sentry DSN for crash reporting; disabled when unset
    #[arg(long)]
    sentry_dsn: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    #[value(name = "INFO")]
    Info,
    #[value(name = "DEBUG")]
    Debug,
    #[value(name = "ERROR")]
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Backend(#[from] shared::backend::BackendError),

    #[error(transparent)]
    Config(#[from] nameservice::config::ConfigError),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help and version land here too; only real parse errors fail.
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(cli.log_level))
        .init();
    tracing::info!("Log level is {:?}", cli.log_level);

    let _sentry_guard = cli.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), StartupError> {
    if let Some(host) = &cli.statsd_host {
        let recorder = StatsdBuilder::from(host.as_str(), cli.statsd_port)
            .build(Some("sparql_proxy"))
            .map_err(|e| StartupError::Metrics(e.to_string()))?;
        metrics::set_global_recorder(recorder)
            .map_err(|e| StartupError::Metrics(e.to_string()))?;
    }

    let backend_2_url = if cli.backend_2.is_empty() {
        cli.backend_1.clone()
    } else {
        cli.backend_2.clone()
    };

    let backend_1 = Arc::new(Backend::new(BackendConfig::new(
        cli.backend_1.clone(),
        Duration::from_secs_f64(cli.timeout_1),
        1,
    ))?);

    let mut config_2 = BackendConfig::new(backend_2_url, Duration::from_secs_f64(cli.timeout_2), 2);
    config_2.pin_results = cli.pin_results_backend_2;
    config_2.clear_cache_on_start = cli.clear_cache_2;
    config_2.always_show_cache_stats = cli.show_cache_stats_2;
    let backend_2 = Arc::new(Backend::new(config_2)?);

    let mut configs = Vec::with_capacity(cli.add_triple.len());
    for arg in &cli.add_triple {
        configs.push(AddTripleConfig::parse(arg)?);
    }

    let name_service = if configs.is_empty() {
        tracing::info!("Name service is NOT active, pass --add-triple to activate");
        None
    } else {
        let service = NameService::new(backend_2.clone(), cli.subject_var_suffix.clone(), configs)?;
        tracing::info!(
            "Name service is ACTIVE (only for queries to backend 1, probing backend 2), configs are:"
        );
        for config in service.configs() {
            tracing::info!("{config}");
        }
        Some(Arc::new(service))
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cli, backend_1, backend_2, name_service))
}

async fn serve(
    cli: Cli,
    backend_1: Arc<Backend>,
    backend_2: Arc<Backend>,
    name_service: Option<Arc<NameService>>,
) -> Result<(), StartupError> {
    backend_1.init().await;
    backend_2.init().await;
    backend_2.show_cache_stats().await;
    tracing::info!("Timeout for single-backend queries is {:.1}s", cli.timeout);

    let processor = Arc::new(QueryProcessor::new(
        backend_1,
        backend_2,
        Duration::from_secs_f64(cli.timeout),
        name_service,
    ));

    tokio::select! {
        result = proxy::run("0.0.0.0", cli.port, processor) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Received ctrl-c, shutting down"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["sparql-proxy", "--port", "8904"]).unwrap();
        assert_eq!(cli.port, 8904);
        assert_eq!(cli.backend_2, "");
        assert_eq!(cli.timeout_1, 0.5);
        assert_eq!(cli.timeout_2, 5.0);
        assert_eq!(cli.timeout, 10.0);
        assert_eq!(cli.subject_var_suffix, "_id");
        assert_eq!(
            cli.add_triple,
            vec!["@en@<http://www.w3.org/2000/01/rdf-schema#label>||1"]
        );
        assert!(!cli.pin_results_backend_2);
        assert!(cli.show_cache_stats_2);
    }

    #[test]
    fn test_add_triple_is_repeatable() {
        let cli = Cli::try_parse_from([
            "sparql-proxy",
            "--port",
            "8904",
            "--add-triple",
            "<http://example.org/name>|_name|1",
            "--add-triple",
            "<http://example.org/image>|_image|0",
        ])
        .unwrap();
        assert_eq!(cli.add_triple.len(), 2);
    }

    #[test]
    fn test_port_is_required() {
        assert!(Cli::try_parse_from(["sparql-proxy"]).is_err());
    }
}
