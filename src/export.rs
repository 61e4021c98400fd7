//! JSON export of a finished sampling cycle.

use std::{fs::File, io::BufWriter, path::Path};

use log::{debug, info};
use serde::Serialize;

use crate::{error::Result, query::LocationEntry};

/// Summary of one cycle, heaviest locations first.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerReport {
    pub interval: u64,
    pub allocation_count: u64,
    pub sample_count: u64,
    pub dropped_samples: u64,
    pub locations: Vec<LocationEntry>,
}

impl SamplerReport {
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as pretty-printed JSON, creating parent directories
    /// as needed.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("Writing allocation report to: {}", path.display());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            debug!("Creating parent directories: {}", parent.display());
            std::fs::create_dir_all(parent)?;
        }

        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;

        debug!("Report written with {} locations", self.locations.len());
        Ok(())
    }
}
