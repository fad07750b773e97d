//! The fixed equipment definition, and the ODB records kept alongside it

use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::midas::{Odb, OdbError, Tid};

/// Client name this frontend shows to other MIDAS programs
pub const FRONTEND_NAME: &str = "EPICS Frontend";

/// `EQ_PERIODIC`
pub const EQ_PERIODIC: i32 = 1;
/// `RO_ALWAYS`: read out in every run state
pub const RO_ALWAYS: i32 = 0x1FF;

/// Contents of `/Equipment/<name>/Common`
#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentInfo {
    pub event_id: u16,
    pub trigger_mask: u16,
    pub buffer: String,
    pub eq_type: i32,
    pub source: i32,
    pub format: String,
    pub enabled: bool,
    pub read_on: i32,
    /// Readout period in milliseconds
    pub period: i32,
    pub event_limit: f64,
    pub num_subevents: u32,
    /// History logging interval in seconds
    pub log_history: i32,
}

impl Default for EquipmentInfo {
    fn default() -> Self {
        EquipmentInfo {
            event_id: 21,
            trigger_mask: 0,
            buffer: "SYSTEM".to_owned(),
            eq_type: EQ_PERIODIC,
            source: 0,
            format: "MIDAS".to_owned(),
            enabled: true,
            read_on: RO_ALWAYS,
            period: 2000,
            event_limit: 0.0,
            num_subevents: 0,
            log_history: 10,
        }
    }
}

impl EquipmentInfo {
    /// Key name, type, string length and value of each Common entry
    fn records(&self) -> Vec<(&'static str, Tid, usize, Value)> {
        vec![
            ("Event ID", Tid::Word, 0, json!(self.event_id)),
            ("Trigger mask", Tid::Word, 0, json!(self.trigger_mask)),
            ("Buffer", Tid::String, 32, json!(self.buffer)),
            ("Type", Tid::Int, 0, json!(self.eq_type)),
            ("Source", Tid::Int, 0, json!(self.source)),
            ("Format", Tid::String, 8, json!(self.format)),
            ("Enabled", Tid::Bool, 0, json!(self.enabled)),
            ("Read on", Tid::Int, 0, json!(self.read_on)),
            ("Period", Tid::Int, 0, json!(self.period)),
            ("Event limit", Tid::Double, 0, json!(self.event_limit)),
            ("Num subevents", Tid::DWord, 0, json!(self.num_subevents)),
            ("Log history", Tid::Int, 0, json!(self.log_history)),
        ]
    }

    /// Overwrite the Common record with this definition and the frontend identity
    pub async fn write_common<O: Odb>(
        &self,
        odb: &O,
        root: &str,
        host: &str,
        file_name: &str,
    ) -> Result<(), OdbError> {
        let common = format!("{root}/Common");
        let identity = [
            ("Frontend host", 32, host.to_owned()),
            ("Frontend name", 32, FRONTEND_NAME.to_owned()),
            ("Frontend file name", 256, file_name.to_owned()),
        ];
        for (key, tid, string_length, value) in self.records() {
            odb.set_or_create(&format!("{common}/{key}"), tid, value, string_length)
                .await?;
        }
        for (key, string_length, value) in identity {
            odb.set_or_create(
                &format!("{common}/{key}"),
                Tid::String,
                json!(value),
                string_length,
            )
            .await?;
        }
        Ok(())
    }
}

/// Write the equipment status line shown on the MIDAS status page
pub async fn set_status<O: Odb>(
    odb: &O,
    root: &str,
    status: &str,
    color: &str,
) -> Result<(), OdbError> {
    odb.set_or_create(
        &format!("{root}/Common/Status"),
        Tid::String,
        json!(status),
        256,
    )
    .await?;
    odb.set_or_create(
        &format!("{root}/Common/Status color"),
        Tid::String,
        json!(color),
        32,
    )
    .await
}

/// Event rate bookkeeping, for `/Equipment/<name>/Statistics`
#[derive(Debug, Clone)]
pub struct Statistics {
    pub events_sent: u64,
    pub bytes_sent: u64,
    last_update: Instant,
    last_events: u64,
    last_bytes: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Statistics {
            events_sent: 0,
            bytes_sent: 0,
            last_update: Instant::now(),
            last_events: 0,
            last_bytes: 0,
        }
    }
}

impl Statistics {
    pub fn record(&mut self, bytes: usize) {
        self.events_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Rates since the previous call: (events per second, kB per second)
    pub fn rates(&mut self) -> (f64, f64) {
        let now = Instant::now();
        let elapsed = now
            .duration_since(self.last_update)
            .max(Duration::from_millis(1))
            .as_secs_f64();
        let events = (self.events_sent - self.last_events) as f64 / elapsed;
        let kbytes = (self.bytes_sent - self.last_bytes) as f64 / 1024.0 / elapsed;
        self.last_update = now;
        self.last_events = self.events_sent;
        self.last_bytes = self.bytes_sent;
        (events, kbytes)
    }

    pub async fn write<O: Odb>(&mut self, odb: &O, root: &str) -> Result<(), OdbError> {
        let (events_per_sec, kbytes_per_sec) = self.rates();
        let stats = format!("{root}/Statistics");
        for (key, value) in [
            ("Events sent", self.events_sent as f64),
            ("Events per sec.", events_per_sec),
            ("kBytes per sec.", kbytes_per_sec),
        ] {
            odb.set_or_create(&format!("{stats}/{key}"), Tid::Double, json!(value), 0)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midas::MemoryOdb;

    #[tokio::test]
    async fn common_is_overwritten() {
        let odb = MemoryOdb::new();
        odb.create("/Equipment/EPICS/Common/Period", Tid::Int, 1, 0)
            .await
            .unwrap();
        odb.set("/Equipment/EPICS/Common/Period", json!(500))
            .await
            .unwrap();
        EquipmentInfo::default()
            .write_common(&odb, "/Equipment/EPICS", "daq01", "src/frontend/mod.rs")
            .await
            .unwrap();
        assert_eq!(
            odb.get_i64("/Equipment/EPICS/Common/Period").await.unwrap(),
            2000
        );
        assert_eq!(
            odb.get_i64("/Equipment/EPICS/Common/Event ID").await.unwrap(),
            21
        );
        assert_eq!(
            odb.get_i64("/Equipment/EPICS/Common/Read on").await.unwrap(),
            0x1FF
        );
        assert_eq!(
            odb.get_string("/Equipment/EPICS/Common/Frontend name")
                .await
                .unwrap(),
            FRONTEND_NAME
        );
    }

    #[test]
    fn rates_reset_between_updates() {
        let mut stats = Statistics::default();
        stats.record(100);
        stats.record(100);
        let (events, kbytes) = stats.rates();
        assert!(events > 0.0 && kbytes > 0.0);
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.rates(), (0.0, 0.0));
    }
}
