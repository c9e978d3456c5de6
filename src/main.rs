use std::{path::PathBuf, process, sync::Arc, time::Duration};

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use log4rs::{
  append::{console::ConsoleAppender, file::FileAppender},
  config::{Appender, Config, Root},
  encode::pattern::PatternEncoder,
};

use railwatch::{
  config::GatewayConfig,
  gateway::Gateway,
  link::{
    sim::{SimProfile, SimulatedRadio},
    RadioStack,
  },
  recovery::{CommandRecovery, RecordingRecovery, RecoveryExecutor},
  telemetry::HttpTransport,
};

#[derive(Parser)]
#[command(
  name = "railwatch",
  version,
  about = "Multi-sensor vibration-triggered train event recorder gateway"
)]
struct Cli {
  /// Configuration file (JSON). Missing file is fatal.
  #[arg(long, default_value = "railwatch_config.json")]
  config: PathBuf,

  /// Run against the built-in software radio stack instead of real
  /// hardware. Simulated sensors emit a vibration burst periodically.
  #[arg(long)]
  simulate: bool,

  /// With --simulate: seconds between demo vibration bursts.
  #[arg(long, default_value_t = 45.0)]
  burst_interval: f64,

  /// Exit after this many seconds instead of waiting for Ctrl-C.
  #[arg(long)]
  run_seconds: Option<f64>,
}

fn main() {
  let cli = Cli::parse();

  let config = match GatewayConfig::load(&cli.config) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("configuration error: {e}");
      process::exit(2);
    }
  };

  if let Err(e) = init_logging(&config) {
    eprintln!("logging setup failed: {e}");
    process::exit(2);
  }

  let recovery: Arc<dyn RecoveryExecutor> = if cli.simulate {
    Arc::new(RecordingRecovery::new())
  } else {
    Arc::new(CommandRecovery::default())
  };

  let radio: Arc<dyn RadioStack> = if cli.simulate {
    Arc::new(build_simulator(&config, cli.burst_interval))
  } else {
    // The host radio backend is injected by the integration that links
    // this crate against its platform's stack; this build ships only
    // the simulator.
    eprintln!("no hardware radio backend in this build; run with --simulate");
    process::exit(2);
  };

  let mut gateway =
    match Gateway::start(config, radio, recovery, Arc::new(HttpTransport::new())) {
      Ok(gateway) => gateway,
      Err(e) => {
        eprintln!("startup failed: {e}");
        process::exit(2);
      }
    };

  let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
  if let Err(e) = ctrlc::set_handler(move || {
    let _ = stop_tx.send(());
  }) {
    eprintln!("signal handler setup failed: {e}");
    process::exit(2);
  }

  println!("Press Ctrl-C to stop\n");
  match cli.run_seconds {
    Some(seconds) => {
      let _ = stop_rx.recv_timeout(Duration::from_secs_f64(seconds));
    }
    None => {
      let _ = stop_rx.recv();
    }
  }

  println!("\nStopping...");
  gateway.shutdown();
}

fn build_simulator(config: &GatewayConfig, burst_interval: f64) -> SimulatedRadio {
  let sim = SimulatedRadio::new();
  let mut controls = Vec::new();
  for device in config.enabled_devices() {
    controls.push(sim.add_device(
      &device.address,
      SimProfile {
        sample_rate_hz: config.buffer.sample_rate_hz,
        ..SimProfile::default()
      },
    ));
  }

  // Periodic demo train: a few seconds of super-threshold vibration on
  // the whole fleet.
  let amplitude = config.detection.threshold_g + 1.0;
  std::thread::Builder::new()
    .name("railwatch-sim-train".to_string())
    .spawn(move || loop {
      std::thread::sleep(Duration::from_secs_f64(burst_interval.max(5.0)));
      info!("simulated train passing");
      for control in &controls {
        control.start_burst(amplitude, 3.0);
      }
    })
    .expect("simulator thread spawn");

  sim
}

fn init_logging(config: &GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
  let log_path = PathBuf::from(&config.output.directory).join(&config.output.log_filename);
  std::fs::create_dir_all(&config.output.directory)?;

  let console = ConsoleAppender::builder()
    .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S%.3f)} {h({l})} {t} - {m}{n}")))
    .build();
  let file = FileAppender::builder()
    .encoder(Box::new(PatternEncoder::new(
      "{d(%Y-%m-%d %H:%M:%S%.3f)} {l} {t} - {m}{n}",
    )))
    .build(log_path)?;

  let log_config = Config::builder()
    .appender(Appender::builder().build("console", Box::new(console)))
    .appender(Appender::builder().build("file", Box::new(file)))
    .build(
      Root::builder()
        .appender("console")
        .appender("file")
        .build(log::LevelFilter::Info),
    )?;
  log4rs::init_config(log_config)?;
  Ok(())
}
