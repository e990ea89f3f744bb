use std::process::ExitCode;

use greyd::{ctl::CtlConfig, logging};

fn main() -> ExitCode {
	let ctl = match CtlConfig::get() {
		Ok(Some(ctl)) => ctl,
		Ok(None) => return ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("{}", err);
			return ExitCode::FAILURE;
		}
	};

	logging::init(ctl.verbosity);

	match ctl.run() {
		Ok(out) => {
			print!("{}", out);
			ExitCode::SUCCESS
		}
		Err(err) => {
			eprintln!("{}", err);
			ExitCode::FAILURE
		}
	}
}
