//! JSON-lines export of drained trace records
//!
//! One JSON object per record:
//!
//! ```text
//! {"seq":0,"ts_ns":5123,"msg_id":1,"kind":"loader_base","pid":812,"base":3077...}
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

use super::{Event, Record, RecordReader};

#[derive(Serialize)]
struct Line<'a> {
    seq: u32,
    ts_ns: u64,
    msg_id: u32,
    #[serde(flatten)]
    event: &'a Event,
}

/// Writes decoded records as JSON lines to any writer
pub struct JsonLinesExporter<W: Write> {
    writer: W,
    written: usize,
    malformed: usize,
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0, malformed: 0 }
    }

    /// Write one record; a payload that does not decode is counted and skipped
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        let event = match Event::decode(record.header.msg_id, &record.payload) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Skipping record {}: {e}", record.header.seq);
                self.malformed += 1;
                return Ok(());
            }
        };
        let line = Line {
            seq: record.header.seq,
            ts_ns: record.header.timestamp_ns,
            msg_id: record.header.msg_id,
            event: &event,
        };
        serde_json::to_writer(&mut self.writer, &line).context("Failed to write record JSON")?;
        self.writer.write_all(b"\n").context("Failed to write record JSON")?;
        self.written += 1;
        Ok(())
    }

    /// Export every record of a drained byte stream
    ///
    /// Framing errors end the stream; they are returned after the records
    /// before them have been written.
    pub fn export_stream(&mut self, stream: &[u8]) -> Result<usize> {
        let before = self.written;
        for record in RecordReader::new(stream) {
            let record = record.context("Corrupt trace stream")?;
            self.write_record(&record)?;
        }
        Ok(self.written - before)
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush().context("Failed to flush export")?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use crate::record::{loader_base_payload, RecordHeader, MSG_LOADER_BASE, MSG_WSP};

    fn frame(msg_id: u32, seq: u32, payload: &[u8]) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        let header = RecordHeader { msg_id, seq, timestamp_ns: 42, len: payload.len() as u32 };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_export_writes_one_line_per_record() {
        let mut stream = frame(MSG_LOADER_BASE, 0, &loader_base_payload(Pid(812), 0xb770_0000));
        stream.extend(frame(MSG_WSP, 1, &[0; 3])); // malformed, skipped
        stream.extend(frame(0x77, 2, b"opaque"));

        let mut exporter = JsonLinesExporter::new(Vec::new());
        assert_eq!(exporter.export_stream(&stream).unwrap(), 2);
        assert_eq!(exporter.malformed(), 1);
        let out = String::from_utf8(exporter.finish().unwrap()).unwrap();

        let lines: Vec<serde_json::Value> =
            out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "loader_base");
        assert_eq!(lines[0]["pid"], 812);
        assert_eq!(lines[0]["ts_ns"], 42);
        assert_eq!(lines[1]["kind"], "unknown");
        assert_eq!(lines[1]["len"], 6);
    }

    #[test]
    fn test_export_reports_corrupt_stream() {
        let mut stream = frame(MSG_LOADER_BASE, 0, &loader_base_payload(Pid(1), 0x1000));
        stream.extend_from_slice(&[1, 2, 3]);

        let mut exporter = JsonLinesExporter::new(Vec::new());
        assert!(exporter.export_stream(&stream).is_err());
        assert_eq!(exporter.written(), 1);
    }
}
