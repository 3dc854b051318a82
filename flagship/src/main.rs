use anyhow::Context;
use clap::{Args, Parser};
use std::path::PathBuf;
use std::sync::Arc;

mod config;
use config::{Config, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Run the SDK gateway, the event persisters, and an in-process bus in
    /// one process
    Standalone(StandaloneArgs),
    /// Show all metrics definitions as markdown table
    ShowMetrics,
}

#[derive(Args, Debug)]
struct StandaloneArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> anyhow::Result<()> {
    let cmd = CliCommand::parse();

    match &cmd {
        CliCommand::Standalone(args) => {
            let config = Config::from_file(&args.config_file_path)?;
            init_statsd_recorder("flagship", config.common.metrics.as_ref());

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(run_standalone(config))
        }
        CliCommand::ShowMetrics => {
            let mut all = Vec::new();
            all.extend_from_slice(gateway::metrics_defs::ALL_METRICS);
            all.extend_from_slice(persister::metrics_defs::ALL_METRICS);
            println!("{}", shared::metrics_defs::render_table(&all));
            Ok(())
        }
    }
}

/// Wires gateway → in-process topics → one persister per persisted topic,
/// with in-memory caches/storage and the filesystem warehouse sink.
async fn run_standalone(config: Config) -> anyhow::Result<()> {
    let gateway_config = config.gateway.context("Missing gateway config")?;
    let persister_config = config.persister.context("Missing persister config")?;
    let upstreams = config.upstreams.context("Missing upstreams config")?;

    let remote_cache = Arc::new(shared::cache::InMemoryRemoteCache::new());
    let storage = Arc::new(feature::storage::InMemoryUserEvaluationsStorage::new());
    let account_client = Arc::new(gateway::account::HttpAccountClient::new(
        upstreams.account_service_url.clone(),
    ));
    let feature_client = Arc::new(feature::client::HttpFeatureClient::new(
        upstreams.feature_service_url.clone(),
    ));

    let goal_topic = shared::pubsub::InProcessTopic::new();
    let goal_batch_topic = shared::pubsub::InProcessTopic::new();
    let evaluation_topic = shared::pubsub::InProcessTopic::new();
    let metrics_topic = shared::pubsub::InProcessTopic::new();
    let user_topic = shared::pubsub::InProcessTopic::new();

    let service = Arc::new(gateway::service::GatewayService::new(
        account_client,
        feature_client.clone(),
        storage.clone(),
        gateway::service::GatewayPublishers {
            goal: Arc::new(goal_topic.clone()),
            goal_batch: Arc::new(goal_batch_topic.clone()),
            evaluation: Arc::new(evaluation_topic.clone()),
            metrics: Arc::new(metrics_topic.clone()),
            user: Arc::new(user_topic.clone()),
        },
        remote_cache,
        gateway_config.options(),
    ));

    let datastore = Arc::new(persister::datastore::FsDatastoreWriter::new(
        persister_config.datastore_dir.clone(),
    ));
    let options = persister_config.options();

    // One pipeline per persisted topic, the way the persister deploys
    // against its bus subscriptions. Goal-batch and metrics topics are
    // consumed elsewhere.
    let persisters: Vec<persister::Persister> = [
        Arc::new(goal_topic.clone()),
        Arc::new(evaluation_topic.clone()),
        Arc::new(user_topic.clone()),
    ]
    .into_iter()
    .map(|topic| {
        persister::Persister::new(
            feature_client.clone(),
            topic,
            datastore.clone(),
            storage.clone(),
            None,
            options.clone(),
        )
    })
    .collect();
    for p in &persisters {
        p.start();
    }

    let shutdown = shared::shutdown::ShutdownSignal::new();
    let server = tokio::spawn(gateway::run(
        gateway_config,
        service,
        shutdown.handle(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.shutdown();
    let _ = server.await;
    for topic in [goal_topic, goal_batch_topic, evaluation_topic, metrics_topic, user_topic] {
        topic.close();
    }
    for p in &persisters {
        p.stop().await;
    }
    Ok(())
}

pub fn init_statsd_recorder(prefix: &str, metrics_config: Option<&MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host.clone(), *statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
