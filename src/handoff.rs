//! Latest-value store between the stream thread and its readers.

use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;

/// A complete voltage vector as written by one producer update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoltageSnapshot {
    /// Increments on every publish; readers use it to spot stale values.
    pub generation: u64,
    pub captured_at: SystemTime,
    pub voltages: Vec<f64>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    captured_at: Option<SystemTime>,
    voltages: Vec<f64>,
}

/// Single-slot, last-writer-wins voltage store.
///
/// The producer never waits on readers beyond the copy itself and intermediate
/// values are overwritten. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SampleHandoff {
    slot: Arc<Mutex<Slot>>,
}

impl SampleHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the slot with `voltages`, reusing its allocation.
    pub fn publish(&self, voltages: &[f64]) {
        let now = SystemTime::now();
        let mut slot = self.slot.lock();
        slot.voltages.clear();
        slot.voltages.extend_from_slice(voltages);
        slot.generation += 1;
        slot.captured_at = Some(now);
    }

    /// Copy of the latest vector, or `None` before the first publish.
    pub fn latest(&self) -> Option<VoltageSnapshot> {
        let slot = self.slot.lock();
        let captured_at = slot.captured_at?;
        Some(VoltageSnapshot {
            generation: slot.generation,
            captured_at,
            voltages: slot.voltages.clone(),
        })
    }

    /// Copies the latest vector into `out` and returns its generation (0 before the first publish).
    pub fn latest_into(&self, out: &mut Vec<f64>) -> u64 {
        let slot = self.slot.lock();
        out.clear();
        out.extend_from_slice(&slot.voltages);
        slot.generation
    }

    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }
}

/// Destination for periodically published snapshots.
pub trait TelemetrySink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish(&mut self, snapshot: &VoltageSnapshot) -> Result<(), Self::Error>;
}

/// Writes one JSON object per snapshot, newline separated.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TelemetrySink for JsonLinesSink<W> {
    type Error = serde_json::Error;

    fn publish(&mut self, snapshot: &VoltageSnapshot) -> Result<(), Self::Error> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n").map_err(serde_json::Error::io)?;
        self.writer.flush().map_err(serde_json::Error::io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_until_first_publish() {
        let handoff = SampleHandoff::new();
        assert!(handoff.latest().is_none());
        assert_eq!(handoff.generation(), 0);

        handoff.publish(&[1.0, 2.0]);
        let snapshot = handoff.latest().unwrap();
        assert_eq!(snapshot.voltages, vec![1.0, 2.0]);
        assert_eq!(snapshot.generation, 1);
    }

    #[test]
    fn test_last_writer_wins() {
        let handoff = SampleHandoff::new();
        handoff.publish(&[1.0; 4]);
        handoff.publish(&[2.0; 4]);
        let mut out = Vec::new();
        assert_eq!(handoff.latest_into(&mut out), 2);
        assert_eq!(out, vec![2.0; 4]);
    }

    #[test]
    fn test_readers_never_see_torn_vector() {
        const CHANNELS: usize = 6;
        const UPDATES: usize = 20_000;

        let handoff = SampleHandoff::new();
        let producer = {
            let handoff = handoff.clone();
            thread::spawn(move || {
                for i in 0..UPDATES {
                    handoff.publish(&[i as f64; CHANNELS]);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let handoff = handoff.clone();
                thread::spawn(move || {
                    let mut out = Vec::new();
                    let mut last_generation = 0;
                    for _ in 0..UPDATES {
                        let generation = handoff.latest_into(&mut out);
                        assert!(generation >= last_generation);
                        last_generation = generation;
                        if generation == 0 {
                            continue;
                        }
                        assert_eq!(out.len(), CHANNELS);
                        assert!(out.iter().all(|v| *v == out[0]), "torn read: {out:?}");
                    }
                })
            })
            .collect();

        producer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(handoff.generation(), UPDATES as u64);
    }

    #[test]
    fn test_json_lines_sink() {
        let handoff = SampleHandoff::new();
        handoff.publish(&[0.5, -0.25]);
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.publish(&handoff.latest().unwrap()).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["generation"], 1);
        assert_eq!(value["voltages"][1], -0.25);
    }
}
