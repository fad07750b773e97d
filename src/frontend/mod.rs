//! The EPICS frontend: polls Channel Access and publishes to MIDAS
//!
//! A [`Frontend`] owns one periodic equipment. On [`Frontend::init`] it makes sure
//! the equipment's ODB records exist, then connects a CA channel for every enabled
//! slot of `Settings/CA Name`. While [`Frontend::run`]ning it:
//!
//! - every `poll_interval`, re-reads all channels once `Update interval` ms have
//!   passed since the previous pass, writing each value to `Variables/Measured`;
//! - every equipment `Period`, sends an event holding an `E000` bank of those
//!   values to the [`EventSink`];
//! - every `statistics_interval`, refreshes `Statistics`.
//!
//! All of this happens on one task, in order, so a slow channel read delays the
//! next readout.

mod equipment;

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use serde_json::json;
use tokio::{
    select,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, trace, warn};

pub use equipment::{EquipmentInfo, FRONTEND_NAME, Statistics, set_status};

use crate::{
    client::{Client, PvChannel},
    error::FrontendError,
    midas::{
        BankBuilder, Event, EventSink, MessageType, Odb, OdbError, Tid,
        odb::{float_to_value, value_as_bool, value_as_f64},
        sink::unix_time,
    },
    utils::get_default_server_port,
};

/// Number of channel slots created by default
const DEFAULT_CHANNELS: usize = 5;
/// Default `Settings/Update interval`, in milliseconds
const DEFAULT_UPDATE_INTERVAL_MS: i64 = 10;
/// Name of the single bank in each event
const BANK_NAME: &str = "E000";

/// Timing and addressing of the frontend
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Equipment name, under `/Equipment`
    pub equipment: String,
    /// Readout period, overriding the equipment default when set
    pub period: Option<Duration>,
    pub poll_interval: Duration,
    pub statistics_interval: Duration,
    /// Limit on searching for and connecting each channel at init
    pub connect_timeout: Duration,
    /// Limit on each channel read
    pub read_timeout: Duration,
    pub ca_search_port: u16,
    /// Where to send CA searches, instead of the EPICS environment
    pub ca_addresses: Option<Vec<SocketAddr>>,
    pub host_name: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfig {
            equipment: "EPICS".to_owned(),
            period: None,
            poll_interval: Duration::from_millis(500),
            statistics_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            ca_search_port: get_default_server_port(),
            ca_addresses: None,
            host_name: whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned()),
        }
    }
}

/// Channel table and the most recent values read from it
#[derive(Debug, Default)]
pub struct Beamline {
    length: usize,
    /// `None` for disabled, unnamed, or unconnected slots
    channels: Vec<Option<PvChannel>>,
    update_interval: Duration,
    cache: Vec<f32>,
    last_measured: Option<Instant>,
}

impl Beamline {
    pub fn length(&self) -> usize {
        self.length
    }
    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }
    pub fn is_connected(&self, channel: usize) -> bool {
        matches!(self.channels.get(channel), Some(Some(_)))
    }
    /// Last value successfully read from each channel
    pub fn cached(&self) -> &[f32] {
        &self.cache
    }
}

pub struct Frontend<O: Odb, S: EventSink> {
    odb: O,
    sink: S,
    config: FrontendConfig,
    info: EquipmentInfo,
    client: Option<Client>,
    beamline: Beamline,
    serial: u32,
    statistics: Statistics,
}

impl<O: Odb, S: EventSink> Frontend<O, S> {
    pub fn new(odb: O, sink: S, config: FrontendConfig) -> Self {
        let mut info = EquipmentInfo::default();
        if let Some(period) = config.period {
            info.period = period.as_millis().min(i32::MAX as u128) as i32;
        }
        Frontend {
            odb,
            sink,
            config,
            info,
            client: None,
            beamline: Beamline::default(),
            serial: 0,
            statistics: Statistics::default(),
        }
    }

    pub fn odb(&self) -> &O {
        &self.odb
    }
    pub fn sink(&self) -> &S {
        &self.sink
    }
    pub fn beamline(&self) -> &Beamline {
        &self.beamline
    }
    pub fn equipment(&self) -> &EquipmentInfo {
        &self.info
    }
    /// Serial number the next event will carry
    pub fn serial(&self) -> u32 {
        self.serial
    }

    fn root(&self) -> String {
        format!("/Equipment/{}", self.config.equipment)
    }
    fn settings_path(&self) -> String {
        format!("{}/Settings", self.root())
    }
    fn measured_path(&self) -> String {
        format!("{}/Variables/Measured", self.root())
    }
    fn frontend_status(&self) -> String {
        format!("{FRONTEND_NAME}@{}", self.config.host_name)
    }

    /// Error dispatcher: log, and forward to the MIDAS message log
    pub async fn report(&self, routine: &str, message: &str) {
        error!(routine, "{message}");
        if let Err(e) = self.odb.msg(MessageType::Error, routine, message).await {
            warn!("Could not send message to MIDAS: {e}");
        }
    }

    /// Show a fatal condition on the MIDAS status page
    pub async fn mark_failed(&self, reason: &str) {
        let status = format!("{}: {reason}", self.frontend_status());
        if let Err(e) = set_status(&self.odb, &self.root(), &status, "redLight").await {
            warn!("Could not set equipment status: {e}");
        }
    }

    /// Prepare the ODB, then connect to EPICS
    pub async fn init(&mut self) -> Result<(), FrontendError> {
        let settings = self.settings_path();
        let interval = self
            .odb
            .get_or_init(
                &format!("{settings}/Update interval"),
                Tid::Int,
                json!(DEFAULT_UPDATE_INTERVAL_MS),
                0,
            )
            .await?;
        let names = self
            .odb
            .get_or_init(
                &format!("{settings}/Names"),
                Tid::String,
                json!(vec![""; DEFAULT_CHANNELS]),
                32,
            )
            .await?;
        for (key, tid, default, string_length) in [
            ("CA Name", Tid::String, json!(vec![""; DEFAULT_CHANNELS]), 32),
            ("Enabled", Tid::Bool, json!(vec![false; DEFAULT_CHANNELS]), 0),
        ] {
            self.odb
                .get_or_init(&format!("{settings}/{key}"), tid, default, string_length)
                .await?;
        }

        let length = names.as_array().map_or(1, Vec::len);
        let update_ms = value_as_f64(&interval).unwrap_or(DEFAULT_UPDATE_INTERVAL_MS as f64);
        self.beamline = Beamline {
            length,
            channels: vec![None; length],
            update_interval: Duration::from_millis(update_ms.max(0.0) as u64),
            cache: vec![0.0; length],
            last_measured: None,
        };
        info!(
            "Equipment {} has {length} channels, update interval {update_ms} ms",
            self.config.equipment
        );

        let measured = self.measured_path();
        if !self.odb.exists(&measured).await? {
            self.odb.create(&measured, Tid::Float, length, 0).await?;
            self.odb.set(&measured, json!(vec![0.0; length])).await?;
        } else {
            self.odb.resize(&measured, length).await?;
        }

        self.register_start_command().await?;
        self.info
            .write_common(&self.odb, &self.root(), &self.config.host_name, file!())
            .await?;

        self.epics_init().await?;
        set_status(&self.odb, &self.root(), &self.frontend_status(), "greenLight").await?;
        Ok(())
    }

    /// Set the program start command, unless someone already has
    async fn register_start_command(&self) -> Result<(), OdbError> {
        let path = format!("/Programs/{FRONTEND_NAME}/Start command");
        let current = match self.odb.get_string(&path).await {
            Ok(command) => command,
            Err(OdbError::NoKey(_)) => String::new(),
            Err(e) => return Err(e),
        };
        if !current.is_empty() {
            return Ok(());
        }
        let command = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "epics_fe".to_owned());
        debug!("Registering start command {command}");
        self.odb
            .set_or_create(&path, Tid::String, json!(command), 256)
            .await
    }

    /// Start the CA client and connect each enabled, named channel
    async fn epics_init(&mut self) -> Result<(), FrontendError> {
        let settings = self.settings_path();
        let mut client =
            match Client::new_with(self.config.ca_search_port, self.config.ca_addresses.clone())
                .await
            {
                Ok(client) => client,
                Err(e) => {
                    debug!("CA client failed to start: {e}");
                    self.report("epics_init", "Unable to initialize EPICS").await;
                    return Err(FrontendError::HardwareError(format!(
                        "Unable to initialize EPICS: {e}"
                    )));
                }
            };
        info!("Initialized EPICS driver");

        let enabled = self
            .odb
            .get_bool_array(&format!("{settings}/Enabled"))
            .await?;
        let ca_names = self
            .odb
            .get_string_array(&format!("{settings}/CA Name"))
            .await?;

        let mut status = Ok(());
        for i in 0..self.beamline.length {
            if !enabled.get(i).copied().unwrap_or(false) {
                info!("Channel {i} disabled");
                continue;
            }
            debug!("Channel {i}");
            let Some(name) = ca_names.get(i).filter(|n| !n.is_empty()) else {
                continue;
            };
            match client
                .connect_channel(name, self.config.connect_timeout)
                .await
            {
                Ok(channel) => {
                    debug!("Channel {i} connected to {name} on {}", channel.server());
                    self.beamline.channels[i] = Some(channel);
                }
                Err(e) => {
                    debug!("Connecting {name} failed: {e}");
                    let message = format!("Cannot connect to EPICS channel {name}");
                    self.report("epics_init", &message).await;
                    status = Err(FrontendError::HardwareError(message));
                    break;
                }
            }
        }
        info!("Finished EPICS initialize");
        self.client = Some(client);
        status
    }

    /// Read one channel into `Variables/Measured` and the cache
    pub async fn get_measured(&mut self, channel: usize) -> Result<(), FrontendError> {
        let settings = self.settings_path();
        let measured = self.measured_path();
        let (Some(client), Some(Some(pv))) = (
            self.client.as_mut(),
            self.beamline.channels.get_mut(channel),
        ) else {
            return Ok(());
        };

        let enabled = match self
            .odb
            .get(&format!("{settings}/Enabled[{channel}]"))
            .await
        {
            Ok(value) => value_as_bool(&value).unwrap_or(false),
            Err(OdbError::NoKey(_)) => false,
            Err(e) => return Err(e.into()),
        };
        if !enabled {
            return Ok(());
        }

        match client.read::<f32>(pv, self.config.read_timeout).await {
            Ok(value) => {
                self.odb
                    .set(&format!("{measured}[{channel}]"), float_to_value(value as f64))
                    .await?;
                if let Some(cached) = self.beamline.cache.get_mut(channel) {
                    *cached = value;
                }
                if channel == 0 {
                    debug!("Measured value (0): {value}");
                }
                Ok(())
            }
            Err(e) => {
                debug!("Read of channel {channel} failed: {e}");
                let name = self
                    .odb
                    .get(&format!("{settings}/Names[{channel}]"))
                    .await
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                let message = format!("Timeout on EPICS channel {name}");
                self.report("epics_get_measured", &message).await;
                Err(FrontendError::HardwareError(message))
            }
        }
    }

    /// Frontend loop body: read every channel once the update interval has passed
    pub async fn poll(&mut self) {
        let due = self
            .beamline
            .last_measured
            .is_none_or(|last| last.elapsed() > self.beamline.update_interval);
        if !due {
            return;
        }
        for channel in 0..self.beamline.length {
            if let Err(e) = self.get_measured(channel).await
                && !e.is_hardware()
            {
                warn!("Channel {channel} not updated: {e}");
            }
        }
        self.beamline.last_measured = Some(Instant::now());
        trace!("Read epics measured");
    }

    /// `Variables/Measured` as stored in the ODB, falling back to the cache
    async fn measured_values(&self) -> Vec<f32> {
        let mut values = self.beamline.cache.clone();
        match self.odb.get_f32_array(&self.measured_path()).await {
            Ok(stored) => {
                if stored.len() < values.len() {
                    warn!(
                        "Measured holds {} of {} values, using cached values for the rest",
                        stored.len(),
                        values.len()
                    );
                }
                for (value, stored) in values.iter_mut().zip(stored) {
                    *value = stored;
                }
            }
            Err(e) => warn!("Could not read back Measured, using cached values: {e}"),
        }
        values
    }

    /// Build and send one event, returning the size of its data
    pub async fn readout(&mut self) -> Result<usize, FrontendError> {
        let values = self.measured_values().await;
        let mut bank = BankBuilder::new();
        bank.create(BANK_NAME, Tid::Float)?;
        bank.write(&values)?;
        bank.close()?;
        let size = bank.size();

        let event = Event::new(
            self.info.event_id,
            self.info.trigger_mask,
            self.serial,
            unix_time(),
            bank.finish()?,
        );
        self.sink.send_event(&event).map_err(FrontendError::Sink)?;
        self.serial = self.serial.wrapping_add(1);
        self.statistics.record(event.total_size());
        Ok(size)
    }

    pub async fn write_statistics(&mut self) -> Result<(), OdbError> {
        let root = self.root();
        self.statistics.write(&self.odb, &root).await
    }

    /// Run the poll, readout and statistics schedule until `shutdown` completes
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<(), FrontendError> {
        let root = self.root();
        let run_number = match self.odb.get_i64("/Runinfo/Run number").await {
            Ok(number) => number.max(0) as u32,
            Err(OdbError::NoKey(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        let dump = self.odb.get(&root).await?;
        self.sink
            .begin(run_number, &dump)
            .map_err(FrontendError::Sink)?;

        let period = Duration::from_millis(self.info.period.max(1) as u64);
        let mut poll_tick = interval(self.config.poll_interval);
        let mut readout_tick = interval(period);
        let mut stats_tick = interval(self.config.statistics_interval);
        for tick in [&mut poll_tick, &mut readout_tick, &mut stats_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        tokio::pin!(shutdown);
        info!("{} running, readout every {period:?}", self.frontend_status());

        let result = loop {
            select! {
                _ = &mut shutdown => break Ok(()),
                _ = poll_tick.tick() => self.poll().await,
                _ = readout_tick.tick() => match self.readout().await {
                    Ok(size) => trace!("Sent event of {size} bytes"),
                    Err(e @ FrontendError::Sink(_)) => break Err(e),
                    Err(e) => self.report("epics_read", &e.to_string()).await,
                },
                _ = stats_tick.tick() => if let Err(e) = self.write_statistics().await {
                    warn!("Could not update statistics: {e}");
                },
            }
        };

        info!("Stopping after {} events", self.statistics.events_sent);
        if let Err(e) = self.write_statistics().await {
            warn!("Could not update statistics: {e}");
        }
        let dump = self.odb.get(&root).await.unwrap_or(dump);
        self.sink.close(&dump).map_err(FrontendError::Sink)?;
        if let Some(client) = &self.client {
            client.stop();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midas::{MemoryOdb, MemorySink};

    fn offline_config() -> FrontendConfig {
        FrontendConfig {
            // Nothing listens here, so no channel will ever connect
            ca_addresses: Some(vec!["127.0.0.1:9".parse().unwrap()]),
            connect_timeout: Duration::from_millis(100),
            host_name: "testhost".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn init_creates_defaults() {
        let odb = MemoryOdb::new();
        let mut frontend = Frontend::new(odb.clone(), MemorySink::new(), offline_config());
        frontend.init().await.unwrap();

        assert_eq!(frontend.beamline().length(), 5);
        assert_eq!(
            frontend.beamline().update_interval(),
            Duration::from_millis(10)
        );
        assert_eq!(
            odb.get_bool_array("/Equipment/EPICS/Settings/Enabled")
                .await
                .unwrap(),
            vec![false; 5]
        );
        assert_eq!(
            odb.get_f32_array("/Equipment/EPICS/Variables/Measured")
                .await
                .unwrap(),
            vec![0.0; 5]
        );
        assert!(
            !odb.get_string("/Programs/EPICS Frontend/Start command")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            odb.get_string("/Equipment/EPICS/Common/Status")
                .await
                .unwrap(),
            "EPICS Frontend@testhost"
        );
        assert_eq!(
            odb.get_string("/Equipment/EPICS/Common/Status color")
                .await
                .unwrap(),
            "greenLight"
        );
    }

    #[tokio::test]
    async fn init_keeps_existing_settings() {
        let odb = MemoryOdb::from_json(json!({
            "Equipment": {"EPICS": {
                "Settings": {
                    "Update interval": 1000,
                    "Names": ["Pressure", "Temperature", "Current"],
                    "CA Name": ["", "", ""],
                    "Enabled": [false, false, false],
                },
                "Variables": {"Measured": [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]},
            }},
            "Programs": {"EPICS Frontend": {"Start command": "/opt/custom/epics_fe"}},
        }))
        .unwrap();
        let mut frontend = Frontend::new(odb.clone(), MemorySink::new(), offline_config());
        frontend.init().await.unwrap();

        assert_eq!(frontend.beamline().length(), 3);
        assert_eq!(
            frontend.beamline().update_interval(),
            Duration::from_secs(1)
        );
        assert_eq!(
            odb.get_f32_array("/Equipment/EPICS/Variables/Measured")
                .await
                .unwrap(),
            vec![1.0, 2.0, 3.0]
        );
        assert_eq!(
            odb.get_string("/Programs/EPICS Frontend/Start command")
                .await
                .unwrap(),
            "/opt/custom/epics_fe"
        );
    }

    #[tokio::test]
    async fn unreachable_channel_is_a_hardware_error() {
        let odb = MemoryOdb::from_json(json!({
            "Equipment": {"EPICS": {"Settings": {
                "Names": ["A", "B", "C"],
                "CA Name": ["", "NO:SUCH:PV", "NEVER:TRIED"],
                "Enabled": [true, true, true],
            }}},
        }))
        .unwrap();
        let mut frontend = Frontend::new(odb.clone(), MemorySink::new(), offline_config());
        let err = frontend.init().await.unwrap_err();
        assert!(err.is_hardware());
        assert!(!frontend.beamline().is_connected(1));
        assert!(!frontend.beamline().is_connected(2));
        let messages = odb.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].routine, "epics_init");
        assert_eq!(
            messages[0].message,
            "Cannot connect to EPICS channel NO:SUCH:PV"
        );
    }

    #[tokio::test]
    async fn readout_uses_measured_values() {
        let odb = MemoryOdb::new();
        let sink = MemorySink::new();
        let mut frontend = Frontend::new(odb.clone(), sink.clone(), offline_config());
        frontend.init().await.unwrap();
        odb.set("/Equipment/EPICS/Variables/Measured[2]", json!(2.5))
            .await
            .unwrap();

        assert_eq!(frontend.readout().await.unwrap(), 8 + 8 + 24);
        frontend.readout().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].header.event_id, 21);
        assert_eq!(events[0].header.serial_number, 0);
        assert_eq!(events[1].header.serial_number, 1);
        let banks = events[0].banks().unwrap();
        assert_eq!(banks[0].name, "E000");
        assert_eq!(
            banks[0].as_f32().unwrap(),
            vec![0.0, 0.0, 2.5, 0.0, 0.0]
        );
    }

    #[tokio::test]
    async fn readout_falls_back_to_cache() {
        let odb = MemoryOdb::new();
        let sink = MemorySink::new();
        let mut frontend = Frontend::new(odb.clone(), sink.clone(), offline_config());
        frontend.init().await.unwrap();
        frontend.beamline.cache = vec![9.0; 5];
        odb.resize("/Equipment/EPICS/Variables/Measured", 2)
            .await
            .unwrap();

        frontend.readout().await.unwrap();
        let events = sink.events();
        assert_eq!(
            events[0].banks().unwrap()[0].as_f32().unwrap(),
            vec![0.0, 0.0, 9.0, 9.0, 9.0]
        );
    }

    #[tokio::test]
    async fn statistics_are_published() {
        let odb = MemoryOdb::new();
        let mut frontend = Frontend::new(odb.clone(), MemorySink::new(), offline_config());
        frontend.init().await.unwrap();
        frontend.readout().await.unwrap();
        frontend.write_statistics().await.unwrap();
        assert_eq!(
            odb.get_i64("/Equipment/EPICS/Statistics/Events sent")
                .await
                .unwrap(),
            1
        );
    }
}
