use anyhow::Context;
use dicom_bridge::config::{AppConfig, TelemetryConfig};
use dicom_bridge::dimse::cmove::RetrieveRouter;
use dicom_bridge::error::Backoff;
use dicom_bridge::grouping::{GroupingEngine, GroupingOptions};
use dicom_bridge::inference::store::RequestStore;
use dicom_bridge::inference::worker::{RequestWorker, WorkerOptions};
use dicom_bridge::ingest::{InstanceNotifier, StoreServiceClassProvider};
use dicom_bridge::platform::http::HttpPlatformClient;
use dicom_bridge::platform::{JobSink, JobSubmitter};
use dicom_bridge::registry::AeRegistry;
use dicom_bridge::retrieve::{CompositeRetriever, DicomWebRetriever, DimseRetriever, Retriever};
use dicom_bridge::storage::StagingStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Capacity of each notifier subscription channel.
const NOTIFIER_CAPACITY: usize = 256;

fn init_telemetry(config: &TelemetryConfig) -> Result<(), anyhow::Error> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(config.level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = AppConfig::new().context("Failed to load application config")?;
	init_telemetry(&config.telemetry)?;
	debug!("Config: {config:?}");

	let registry = Arc::new(
		AeRegistry::new(&config.sources, &config.aets)
			.context("Invalid AE policy configuration")?,
	);
	let staging = StagingStore::new(&config.storage)?;
	let store = RequestStore::open(&config.storage.database_path)?;
	store.recover_inflight()?;

	let notifier = InstanceNotifier::new(NOTIFIER_CAPACITY);
	let router = RetrieveRouter::default();
	let shutdown = CancellationToken::new();

	let platform = Arc::new(HttpPlatformClient::new(&config.services.platform)?);
	let submitter: Arc<dyn JobSink> = Arc::new(JobSubmitter::new(
		platform,
		config.services.platform.timeout(),
		config.services.platform.name_max_length,
	));

	// Grouping consumes stored-instance events and emits jobs.
	let grouping_events = notifier.subscribe("grouping-engine");
	let engine = GroupingEngine::new(Arc::clone(&submitter), GroupingOptions::default());
	engine.run(grouping_events, shutdown.clone());

	// Staging retention reaper.
	tokio::spawn(
		Arc::clone(&staging).reap(config.storage.clone(), shutdown.clone()),
	);

	// Inference request workers.
	let retriever: Arc<dyn Retriever> = Arc::new(CompositeRetriever::new(
		DimseRetriever::new(
			router.clone(),
			config.dicom.scu.clone(),
			config.services.retrieve_timeout(),
		),
		DicomWebRetriever::new(config.services.retrieve_timeout())?,
	));
	let worker_options = WorkerOptions {
		max_retries: config.services.max_retries,
		retrieve_timeout: config.services.retrieve_timeout(),
		poll_interval: Duration::from_millis(500),
		retry_backoff: Backoff {
			base: Duration::from_secs(1),
			factor: 2,
			cap: Duration::from_secs(60),
			max_attempts: u32::MAX,
		},
	};
	let worker = RequestWorker::new(
		Arc::clone(&store),
		Arc::clone(&staging),
		retriever,
		submitter,
		worker_options,
	);
	for _ in 0..config.services.workers.max(1) {
		tokio::spawn(Arc::clone(&worker).run(shutdown.clone()));
	}

	// The ingest SCP runs on the main task until shutdown.
	let scp = StoreServiceClassProvider::new(
		registry,
		staging,
		notifier,
		router,
		config.dicom.scp.clone(),
	);

	tokio::select! {
		result = scp.spawn(shutdown.clone()) => result?,
		signal = tokio::signal::ctrl_c() => {
			signal?;
			info!("Shutting down");
			shutdown.cancel();
		}
	}

	Ok(())
}
