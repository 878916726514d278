use std::path::Path;
use std::process;
use std::time::Duration;

use clap::{App, Arg};

use clouproto::logging;
use clouproto::time::Timezone;

use cloucon::config::Config;
use cloucon::engine::Engine;
use cloucon::ntp;

fn main() {
    let matches = App::new("cloucon")
        .version("0.1.0")
        .about("Connector daemon for Clou Hopeland UHF RFID readers")
        .arg(
            Arg::with_name("READER_ID")
                .help("Reader id; must appear in the config readers-list")
                .required(true),
        )
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the JSON config file")
                .required(true),
        )
        .arg(
            Arg::with_name("TIMEZONE")
                .help("Timezone for all timestamps, in the form +HHMM or -HHMM")
                .required(true),
        )
        .get_matches();

    let rid = matches.value_of("READER_ID").unwrap();
    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let tz_spec = matches.value_of("TIMEZONE").unwrap();

    let tz = match Timezone::parse(tz_spec) {
        Ok(tz) => tz,
        Err(err) => {
            eprintln!("Wrong timezone setting '{}': {}", tz_spec, err);
            process::exit(1);
        }
    };

    let config = match Config::from_file(Path::new(config_path)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    if let Err(err) = config.reader_settings(rid) {
        eprintln!("{}", err);
        process::exit(1);
    }

    let log_path = Path::new(&config.log_dir).join(format!("cloucon-{}.log", rid));
    let log = match logging::file_logger(&log_path) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("Can not open log file {}: {}", log_path.display(), err);
            process::exit(1);
        }
    };

    logging::info!(log, "launched app";
                   "rid" => rid,
                   "config" => config_path,
                   "timezone" => tz_spec);

    // The process refuses to start on a clock too far from NTP time;
    // later drift only warns.
    let initial_offset = match ntp::query(&config.ntp_service_url, Duration::from_secs(5)) {
        Ok(offset) => offset,
        Err(err) => {
            logging::crit!(log, "clock check failed"; "error" => %err);
            eprintln!("Error checking clock via NTP service {}: {}", config.ntp_service_url, err);
            process::exit(1);
        }
    };
    if initial_offset.abs() > config.max_server_time_offset {
        logging::crit!(log, "server time too far from NTP time";
                       "offset" => initial_offset,
                       "limit" => config.max_server_time_offset);
        eprintln!(
            "Server time too far from NTP time at {}, offset = {}",
            config.ntp_service_url, initial_offset
        );
        process::exit(1);
    }

    let mut engine = match Engine::new(rid, config, tz, log.clone(), initial_offset) {
        Ok(engine) => engine,
        Err(err) => {
            logging::crit!(log, "engine init failed"; "error" => %err);
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    if let Err(err) = engine.run() {
        logging::crit!(log, "engine failed"; "error" => %err);
        eprintln!("{}", err);
        process::exit(1);
    }
}
