use std::io::Write;

use serde::Serialize;
use tracing::{info, warn};

use crate::frame::Sample;

/// Receives every sample a consumer decodes.
pub trait SampleSink {
    fn accept(&mut self, topic: &str, sample: &Sample);
}

/// Logs one line per sample.
#[derive(Debug, Default)]
pub struct LogSink;

impl SampleSink for LogSink {
    fn accept(&mut self, topic: &str, sample: &Sample) {
        info!("{}", describe(topic, sample));
    }
}

pub fn describe(topic: &str, s: &Sample) -> String {
    let [x, y, z] = s.position;
    let [qw, qx, qy, qz] = s.orientation;
    format!(
        "Received on '{topic}': ID={}, Time={}, Pos=({x:.2}, {y:.2}, {z:.2}), Quat=({qw:.2}, {qx:.2}, {qy:.2}, {qz:.2})",
        s.sensor_id, s.timestamp
    )
}

#[derive(Serialize)]
struct JsonLine<'a> {
    topic: &'a str,
    #[serde(flatten)]
    sample: &'a Sample,
}

/// Writes one JSON object per sample.
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out }
    }
}

impl<W: Write> SampleSink for JsonLinesSink<W> {
    fn accept(&mut self, topic: &str, sample: &Sample) {
        let line = JsonLine { topic, sample };
        let written = serde_json::to_writer(&mut self.out, &line)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(self.out))
            .and_then(|()| self.out.flush());
        if let Err(e) = written {
            warn!("failed to write sample: {}", e);
        }
    }
}

impl SampleSink for Box<dyn SampleSink + Send> {
    fn accept(&mut self, topic: &str, sample: &Sample) {
        (**self).accept(topic, sample)
    }
}

impl SampleSink for Vec<(String, Sample)> {
    fn accept(&mut self, topic: &str, sample: &Sample) {
        self.push((topic.to_string(), *sample));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        Sample {
            sensor_id: 2,
            timestamp: 220,
            position: [0.4, 0.5, 0.6],
            orientation: [0.9, 0.1, 0.0, 0.0],
        }
    }

    #[test]
    fn test_describe_formats_two_decimals() {
        assert_eq!(
            describe("sensor/em/2", &sample()),
            "Received on 'sensor/em/2': ID=2, Time=220, Pos=(0.40, 0.50, 0.60), Quat=(0.90, 0.10, 0.00, 0.00)"
        );
    }

    #[test]
    fn test_json_lines_sink_writes_one_object_per_sample() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.accept("sensor/em/2", &sample());
        sink.accept("sensor/em/2", &sample());

        let text = String::from_utf8(sink.out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["topic"], "sensor/em/2");
        assert_eq!(v["sensor_id"], 2);
        assert_eq!(v["timestamp"], 220);
        assert_eq!(v["position"].as_array().unwrap().len(), 3);
        assert_eq!(v["orientation"].as_array().unwrap().len(), 4);
    }
}
