use std::env;
use std::process;
use std::sync::Arc;

use stackdriver_exporter::client::auth::{
    discover_credentials, CredentialEnvironment, MONITORING_READ_SCOPE, PROJECTS_READ_SCOPE,
};
use stackdriver_exporter::client::{HyperTransport, TimeoutLayer, Transport};
use stackdriver_exporter::config::{options, usage};
use stackdriver_exporter::discovery::resolve_projects;
use stackdriver_exporter::handler::VERSION;
use stackdriver_exporter::{
    create_api_client, server, spawn_delta_sweeper, DeltaStores, ExporterConfig, LogLevel,
    RegistryAssembler, Router, StartupError,
};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn init_logging(level: LogLevel) {
    let level = match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };
    // RUST_LOG, when set, refines the level given on the command line.
    let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: ExporterConfig) -> Result<(), StartupError> {
    let token_transport: Arc<dyn Transport> =
        Arc::new(TimeoutLayer::new(HyperTransport::new()?, config.client.timeout));
    let credentials = discover_credentials(
        &CredentialEnvironment::from_env(),
        token_transport,
        &[MONITORING_READ_SCOPE, PROJECTS_READ_SCOPE],
    )
    .await?;
    let client = create_api_client(&config.client, credentials.tokens)?;

    let projects = resolve_projects(
        &client,
        &config.project_ids,
        config.projects_filter.as_deref(),
        credentials.project_id.as_deref(),
    )
    .await?;

    info!(
        version = VERSION,
        projects = ?projects,
        projects_filter = config.projects_filter.as_deref().unwrap_or(""),
        metric_prefixes = ?config.collector.metric_type_prefixes,
        extra_filters = ?config.collector.extra_filters.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "starting stackdriver-exporter"
    );

    let deltas = DeltaStores::new(config.aggregate_deltas_ttl);
    if config.collector.aggregate_deltas {
        spawn_delta_sweeper(deltas.clone());
    }

    let assembler = RegistryAssembler::new(projects, config.collector.clone(), client, deltas);
    assembler.validate()?;

    let router = Router::for_exporter(&config.web, Arc::new(assembler))?;
    let listener = server::bind(config.web.listen_address)?;
    info!(address = %config.web.listen_address, path = %config.web.telemetry_path, "listening");

    server::serve(listener, Arc::new(router)).await?;
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("stackdriver-exporter");
    let opts = options();

    let matches = match opts.parse(args.get(1..).unwrap_or_default()) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{f}");
            eprint!("{}", usage(program, &opts));
            process::exit(2);
        }
    };

    if matches.opt_present("help") {
        print!("{}", usage(program, &opts));
        return;
    }
    if matches.opt_present("version") {
        println!("stackdriver-exporter {VERSION}");
        return;
    }

    let config = match ExporterConfig::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprint!("{}", usage(program, &opts));
            process::exit(2);
        }
    };

    init_logging(config.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to create the runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %e, "exporter failed");
        process::exit(1);
    }
}
