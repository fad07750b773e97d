//! Command line and environment configuration of the `epics_fe` binary
//!
//! Settings for the CA client itself come from the usual `EPICS_CA_*` environment
//! variables; everything about the channels lives in the ODB.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::{frontend::FrontendConfig, utils::parse_address_list};

#[derive(Parser, Debug)]
#[command(version, about = "Periodically read EPICS channels into a MIDAS experiment")]
pub struct Settings {
    /// Base URL of the experiment's mhttpd
    #[arg(long, env = "MIDAS_MHTTPD_URL", default_value = "http://localhost:8080")]
    pub mhttpd: String,
    /// Run against an in-memory ODB instead of mhttpd, optionally loaded from an
    /// ODB JSON save
    #[arg(long, id = "ODB_JSON", num_args = 0..=1)]
    pub offline: Option<Option<PathBuf>>,
    /// Equipment name, under /Equipment
    #[arg(long, default_value = "EPICS")]
    pub equipment: String,
    /// Write events to a MIDAS data file. Without this, events are logged.
    #[arg(long, short, value_name = "FILE")]
    pub output: Option<PathBuf>,
    /// Readout period in milliseconds
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub period: Option<u64>,
    /// Send CA searches only to these addresses, instead of following
    /// `EPICS_CA_ADDR_LIST` and `EPICS_CA_AUTO_ADDR_LIST`
    #[arg(long, value_name = "ADDRESSES")]
    pub ca_addr: Option<String>,
    /// Show debug output
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Write the log to a file instead of the terminal
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Settings {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        }
    }

    /// Log filter from `EPICS_FE_LOG` directives, defaulting to the `-v` level
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.log_level().into())
            .with_env_var("EPICS_FE_LOG")
            .from_env_lossy()
    }

    pub fn frontend_config(&self) -> FrontendConfig {
        let defaults = FrontendConfig::default();
        FrontendConfig {
            equipment: self.equipment.clone(),
            period: self.period.map(Duration::from_millis),
            ca_addresses: self
                .ca_addr
                .as_deref()
                .map(|list| parse_address_list(list, defaults.ca_search_port)),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::try_parse_from(["epics_fe"]).unwrap();
        assert_eq!(settings.equipment, "EPICS");
        assert!(settings.offline.is_none());
        assert_eq!(settings.log_level(), LevelFilter::INFO);
        let config = settings.frontend_config();
        assert_eq!(config.period, None);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn offline_with_and_without_file() {
        let settings = Settings::try_parse_from(["epics_fe", "--offline"]).unwrap();
        assert_eq!(settings.offline, Some(None));
        let settings =
            Settings::try_parse_from(["epics_fe", "--offline", "odb.json", "-vv"]).unwrap();
        assert_eq!(settings.offline, Some(Some(PathBuf::from("odb.json"))));
        assert_eq!(settings.log_level(), LevelFilter::TRACE);
        if std::env::var_os("EPICS_FE_LOG").is_none() {
            assert_eq!(settings.log_filter().max_level_hint(), Some(LevelFilter::TRACE));
        }
    }

    #[test]
    fn period_override() {
        let settings =
            Settings::try_parse_from(["epics_fe", "--period", "500", "--equipment", "Beam"])
                .unwrap();
        let config = settings.frontend_config();
        assert_eq!(config.period, Some(Duration::from_millis(500)));
        assert_eq!(config.equipment, "Beam");
        assert!(Settings::try_parse_from(["epics_fe", "--period", "0"]).is_err());
    }

    #[test]
    fn explicit_search_addresses() {
        let settings =
            Settings::try_parse_from(["epics_fe", "--ca-addr", "127.0.0.1:5070 127.0.0.2"])
                .unwrap();
        let config = settings.frontend_config();
        let addresses = config.ca_addresses.unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0], "127.0.0.1:5070".parse().unwrap());
        assert_eq!(addresses[1].port(), config.ca_search_port);
        assert!(Settings::try_parse_from(["epics_fe"]).unwrap().frontend_config().ca_addresses.is_none());
    }
}
