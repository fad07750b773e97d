//! Destinations for assembled events

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::bank::{EVENTID_BOR, EVENTID_EOR, Event, MIDAS_MAGIC};

/// Receives every event the frontend produces
pub trait EventSink {
    /// Called once before the first event, with the run number and an ODB dump
    fn begin(&mut self, _run_number: u32, _odb: &Value) -> io::Result<()> {
        Ok(())
    }
    fn send_event(&mut self, event: &Event) -> io::Result<()>;
    /// Called once on shutdown
    fn close(&mut self, _odb: &Value) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Writes a MIDAS `.mid` data file
pub struct MidFileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    run_number: u32,
    events: u64,
}

impl MidFileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        let writer = BufWriter::new(File::create(path)?);
        info!("Writing events to {}", path.display());
        Ok(MidFileSink {
            path: path.to_owned(),
            writer: Some(writer),
            run_number: 0,
            events: 0,
        })
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other(format!("{} is closed", self.path.display())))
    }

    fn write_run_record(&mut self, event_id: u16, odb: &Value) -> io::Result<()> {
        let dump = serde_json::to_vec_pretty(odb)?;
        let record = Event::new(event_id, MIDAS_MAGIC, self.run_number, unix_time(), dump);
        let writer = self.writer()?;
        writer.write_all(&record.to_bytes())?;
        writer.flush()
    }
}

impl EventSink for MidFileSink {
    fn begin(&mut self, run_number: u32, odb: &Value) -> io::Result<()> {
        self.run_number = run_number;
        self.write_run_record(EVENTID_BOR, odb)
    }

    fn send_event(&mut self, event: &Event) -> io::Result<()> {
        let writer = self.writer()?;
        writer.write_all(&event.to_bytes())?;
        writer.flush()?;
        self.events += 1;
        Ok(())
    }

    fn close(&mut self, odb: &Value) -> io::Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        self.write_run_record(EVENTID_EOR, odb)?;
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        info!(
            "Closed {} after {} events",
            self.path.display(),
            self.events
        );
        Ok(())
    }
}

impl Drop for MidFileSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.flush()
        {
            warn!("Failed to flush {}: {e}", self.path.display());
        }
    }
}

/// Logs a summary of each event instead of storing it
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn send_event(&mut self, event: &Event) -> io::Result<()> {
        let banks = event
            .banks()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for bank in banks {
            match bank.as_f32() {
                Some(values) => info!(
                    "Event {} bank {}: {values:?}",
                    event.header.serial_number, bank.name
                ),
                None => debug!(
                    "Event {} bank {}: {} bytes of {}",
                    event.header.serial_number,
                    bank.name,
                    bank.data.len(),
                    bank.tid
                ),
            }
        }
        Ok(())
    }
}

/// Keeps events in memory. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn send_event(&mut self, event: &Event) -> io::Result<()> {
        self.events
            .lock()
            .map_err(|_| io::Error::other("event store poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midas::{bank::BankBuilder, odb::Tid};
    use serde_json::json;

    fn float_event(serial: u32, values: &[f32]) -> Event {
        let mut bank = BankBuilder::new();
        bank.create("E000", Tid::Float).unwrap();
        bank.write(values).unwrap();
        bank.close().unwrap();
        Event::new(21, 0, serial, unix_time(), bank.finish().unwrap())
    }

    #[test]
    fn mid_file_has_run_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run00042.mid");
        let odb = json!({"Settings": {"Update interval": 10}});
        {
            let mut sink = MidFileSink::create(&path).unwrap();
            sink.begin(42, &odb).unwrap();
            sink.send_event(&float_event(0, &[1.0])).unwrap();
            sink.send_event(&float_event(1, &[2.0])).unwrap();
            sink.close(&odb).unwrap();
            assert!(sink.send_event(&float_event(2, &[3.0])).is_err());
        }

        let bytes = std::fs::read(&path).unwrap();
        let mut rest = bytes.as_slice();
        let mut events = Vec::new();
        while !rest.is_empty() {
            let (r, event) = Event::parse(rest).unwrap();
            events.push(event);
            rest = r;
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].header.event_id, EVENTID_BOR);
        assert_eq!(events[0].header.trigger_mask, MIDAS_MAGIC);
        assert_eq!(events[0].header.serial_number, 42);
        let dump: Value = serde_json::from_slice(&events[0].data).unwrap();
        assert_eq!(dump, odb);
        assert_eq!(events[1].header.serial_number, 0);
        assert_eq!(
            events[2].banks().unwrap()[0].as_f32().unwrap(),
            vec![2.0]
        );
        assert_eq!(events[3].header.event_id, EVENTID_EOR);
        assert!(events[3].is_run_record());
    }

    #[test]
    fn memory_sink_shares_store() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.send_event(&float_event(0, &[1.0])).unwrap();
        assert_eq!(sink.events().len(), 1);
        assert!(LogSink.send_event(&sink.events()[0]).is_ok());
    }
}
