#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use muster_queue::JobQueue;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::notify::LogNotifier;
use crate::server::registry::{RegistryConfig, RoomRegistry};
use crate::server::scheduler::{Scheduler, SchedulerConfig};
use crate::server::store::{MemoryStore, SqlStore, Store};
use crate::server::worker::{WorkerConfig, WorkerCtx, spawn_workers};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: muster_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Websocket listener bind address (default: 127.0.0.1:8803)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<SocketAddr> {
	let mut bind: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.map(|v| {
		v.parse::<SocketAddr>().unwrap_or_else(|e| {
			eprintln!("invalid --bind {v}: {e}");
			usage_and_exit();
		})
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,muster_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("muster_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let arg_bind = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let bind_addr: SocketAddr = match arg_bind {
		Some(addr) => addr,
		None => server_cfg
			.server
			.bind
			.as_deref()
			.unwrap_or("127.0.0.1:8803")
			.parse()
			.map_err(|e| anyhow::anyhow!("invalid server.bind: {e}"))?,
	};

	let store: Arc<dyn Store> = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		info!("persistence enabled");
		Arc::new(SqlStore::connect(database_url).await?)
	} else {
		warn!("persistence disabled; signals and messages live in memory only");
		Arc::new(MemoryStore::new())
	};

	let queue_store: Arc<dyn muster_queue::OrderedStore> = match server_cfg.queue.redis_url.as_deref() {
		Some(url) => {
			info!("connecting job queue to redis");
			Arc::new(muster_queue::RedisStore::connect(url).await?)
		}
		None => {
			warn!("no redis_url configured; job queue is in-process only");
			Arc::new(muster_queue::MemoryStore::new())
		}
	};
	let queue = JobQueue::new(queue_store);

	let cancel = CancellationToken::new();

	let registry = RoomRegistry::new(
		Arc::clone(&store),
		queue.clone(),
		RegistryConfig {
			room_grace: server_cfg.chat.room_grace,
			room_queue_capacity: server_cfg.chat.room_queue_capacity,
			client_queue_capacity: server_cfg.chat.client_queue_capacity,
		},
		cancel.clone(),
	);

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone(), registry.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	Scheduler::new(
		Arc::clone(&store),
		queue.clone(),
		SchedulerConfig {
			expired_signals_interval: server_cfg.scheduler.expired_signals_interval,
			rooms_interval: server_cfg.scheduler.rooms_interval,
			manner_scores_interval: server_cfg.scheduler.manner_scores_interval,
			promote_interval: server_cfg.scheduler.promote_interval,
			room_grace: server_cfg.chat.room_grace,
		},
	)
	.spawn(cancel.clone());

	spawn_workers(
		WorkerCtx {
			store: Arc::clone(&store),
			queue: queue.clone(),
			registry: registry.clone(),
			notifier: Arc::new(LogNotifier),
		},
		WorkerConfig {
			pop_timeout: server_cfg.worker.pop_timeout,
			push_backoff: server_cfg.worker.push_backoff,
			email_backoff: server_cfg.worker.email_backoff,
			room_backoff: server_cfg.worker.room_backoff,
			..WorkerConfig::default()
		},
		cancel.clone(),
	);

	let conn_settings = ConnectionSettings {
		keepalive_interval: server_cfg.chat.keepalive_interval,
		write_timeout: server_cfg.chat.write_timeout,
		read_timeout: server_cfg.chat.read_timeout,
		outbound_queue_capacity: server_cfg.chat.client_queue_capacity,
		..ConnectionSettings::default()
	};

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "websocket listener ready");
	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown signal received");
				break;
			}
			accepted = listener.accept() => {
				let (stream, remote) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "accept failed");
						continue;
					}
				};

				let conn_id = next_conn_id;
				next_conn_id += 1;
				metrics::counter!("muster_server_connections_total").increment(1);
				info!(conn_id, remote = %remote, "accepted connection");

				let registry = registry.clone();
				let store = Arc::clone(&store);
				let conn_settings = conn_settings.clone();
				let cancel = cancel.clone();
				tokio::spawn(async move {
					if let Err(e) = handle_connection(conn_id, stream, registry, store, conn_settings, cancel).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				});
			}
		}
	}

	cancel.cancel();
	registry.destroy_all().await;
	// Give in-flight workers a moment to finish their current job.
	tokio::time::sleep(Duration::from_millis(200)).await;
	info!("shutdown complete");

	Ok(())
}
