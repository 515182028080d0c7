use std::error::Error;
use std::sync::Once;

use csv::Writer;
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use crate::simulator::recorder::InMemoryRecorder;

static LOGGER_INIT: Once = Once::new();

/// Installs a terminal logger. Safe to call repeatedly (tests).
pub fn init_console_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        let _ = TermLogger::init(
            level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        );
    });
}

/// Writes the recorded outlet chromatograms to a CSV file: one time column
/// followed by one column per component.
pub fn save_chromatogram_csv(
    recorder: &InMemoryRecorder,
    n_comp: usize,
    n_col: usize,
    filename: &str,
) -> Result<(), Box<dyn Error>> {
    let mut writer = Writer::from_path(filename)?;

    let mut headers = vec!["time".to_string()];
    for comp in 0..n_comp {
        headers.push(format!("c_{}", comp));
    }
    writer.write_record(&headers)?;

    let chromatograms: Vec<Vec<f64>> = (0..n_comp)
        .map(|comp| recorder.chromatogram(comp, n_col))
        .collect();
    for (i, t) in recorder.times.iter().enumerate() {
        let mut row = vec![t.to_string()];
        for chrom in chromatograms.iter() {
            row.push(chrom[i].to_string());
        }
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}
