use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use greyd::{
	binconfig::BinConfig,
	logging,
	net::{self, SharedPolicy},
};

use grey::GreylistPolicy;

use tokio::io::{stdin, stdout, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
	let binconf = match BinConfig::get() {
		Ok(Some(conf)) => conf,
		Ok(None) => return ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("{}", err);
			return ExitCode::FAILURE;
		}
	};

	logging::init(binconf.verbosity);

	let policy = match GreylistPolicy::open(&binconf.config) {
		Ok(policy) => Arc::new(Mutex::new(policy)),
		Err(err) => {
			tracing::error!(
				"could not open {}: {}",
				binconf.config.db_file.display(),
				err
			);
			return ExitCode::FAILURE;
		}
	};

	let (tx, rx) = watch::channel(false);
	let shared: SharedPolicy = policy.clone();

	let mut serve_task = match binconf.listen {
		Some(addr) => {
			let listener = match TcpListener::bind(addr).await {
				Ok(listener) => listener,
				Err(err) => {
					tracing::error!("could not listen on {}: {}", addr, err);
					return ExitCode::FAILURE;
				}
			};

			tracing::info!("listening on {}", addr);
			tokio::spawn(net::listen(listener, shared, rx))
		}
		None => tokio::spawn(async move {
			if let Err(err) = net::serve(BufReader::new(stdin()), stdout(), shared, rx).await {
				tracing::error!("{}", err);
			}
		}),
	};

	let finished = tokio::select! {
		_ = shutdown_signal() => false,
		_ = &mut serve_task => true,
	};

	if !finished {
		tracing::info!("received shutdown signal, beginning graceful shutdown...");
		let _ = tx.send(true);
		let _ = serve_task.await;
	}

	let closed = match policy.lock() {
		Ok(mut policy) => policy.close(),
		Err(_) => {
			tracing::error!("policy lock poisoned, the store was not closed cleanly");
			return ExitCode::FAILURE;
		}
	};

	match closed {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			tracing::error!("could not close the store: {}", err);
			ExitCode::FAILURE
		}
	}
}

async fn shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let (mut terminate, mut hangup) = match (
		signal(SignalKind::terminate()),
		signal(SignalKind::hangup()),
	) {
		(Ok(terminate), Ok(hangup)) => (terminate, hangup),
		(Err(err), _) | (_, Err(err)) => {
			tracing::error!("could not install signal handlers: {}", err);
			return std::future::pending().await;
		}
	};

	tokio::select! {
		_ = tokio::signal::ctrl_c() => (),
		_ = terminate.recv() => (),
		_ = hangup.recv() => ()
	};
}
