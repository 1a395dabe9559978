//! Writes sample logs in the raw device layout.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;

const HEADER: [&str; 15] = [
    "SEU", "FrErr", "Frame", "Sensor1", "btn0_1", "btn1_1", "d1", "aux(hex)_1", "X1 (M)", "Y1",
    "Z1", "Qw1", "Qx1", "Qy1", "Qz1",
];

/// (sensor, frame, x, y, z, qw, qx, qy, qz)
const BASE_ROWS: [(u32, i64, [f32; 7]); 4] = [
    (1, 100, [0.1, 0.2, 0.3, 1.0, 0.0, 0.0, 0.0]),
    (2, 220, [0.4, 0.5, 0.6, 0.9, 0.1, 0.0, 0.0]),
    (1, 350, [0.1, 0.3, 0.4, 0.8, 0.2, 0.1, 0.0]),
    (3, 500, [0.7, 0.8, 0.9, 0.7, 0.3, 0.2, 0.1]),
];

/// Write a log with the four reference rows followed by `extra_rows` random
/// walk rows over sensors 1..=3. Returns the number of rows written.
pub fn write_sample_log(path: &Path, extra_rows: usize) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{}", HEADER.join(","))?;

    for (sensor, frame, values) in BASE_ROWS {
        write_row(&mut out, sensor, frame, &values)?;
    }

    let mut rng = rand::thread_rng();
    let (_, mut frame, mut values) = BASE_ROWS[BASE_ROWS.len() - 1];
    for _ in 0..extra_rows {
        let sensor = rng.gen_range(1..=3u32);
        frame += rng.gen_range(5..=150i64);
        for v in values.iter_mut().take(3) {
            *v += rng.gen_range(-0.05f32..0.05);
        }
        write_row(&mut out, sensor, frame, &values)?;
    }

    out.flush()?;
    let rows = BASE_ROWS.len() + extra_rows;
    tracing::info!("wrote {} rows to {}", rows, path.display());
    Ok(rows)
}

fn write_row(out: &mut impl Write, sensor: u32, frame: i64, v: &[f32; 7]) -> std::io::Result<()> {
    // sensor ids are logged as floats by the device
    writeln!(
        out,
        "{:.1},0,{},{},0,0,0,0x0,{},{},{},{},{},{},{}",
        sensor as f32, frame, sensor, v[0], v[1], v[2], v[3], v[4], v[5], v[6]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnMapping;
    use crate::frame::Sample;
    use crate::source::{CsvSource, RecordSource};
    use tempfile::TempDir;

    #[test]
    fn test_reference_log_reads_back() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let path = tmpdir.path().join("replay_data.csv");
        assert_eq!(write_sample_log(&path, 0)?, 4);

        let source = CsvSource::open(&path, &ColumnMapping::default())?;
        let samples: Vec<Sample> = source.records()?.collect::<Result<_, _>>()?;
        let ids: Vec<i64> = samples.iter().map(|s| s.sensor_id).collect();
        let times: Vec<i64> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(ids, vec![1, 2, 1, 3]);
        assert_eq!(times, vec![100, 220, 350, 500]);
        assert_eq!(samples[3].orientation, [0.7, 0.3, 0.2, 0.1]);
        Ok(())
    }

    #[test]
    fn test_extra_rows_keep_time_increasing() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let path = tmpdir.path().join("long.csv");
        assert_eq!(write_sample_log(&path, 50)?, 54);

        let source = CsvSource::open(&path, &ColumnMapping::default())?;
        let samples: Vec<Sample> = source.records()?.collect::<Result<_, _>>()?;
        assert_eq!(samples.len(), 54);
        assert!(samples.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
        assert!(samples.iter().all(|s| (1..=3).contains(&s.sensor_id)));
        Ok(())
    }
}
