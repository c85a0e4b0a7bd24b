//! Local per-device journal of produced measurements, one JSON line each.
//! The active file is rotated whenever the simulated day changes. A journal
//! reopened after a restart picks up the day of the active file it finds, and
//! rotating onto an existing day file appends to it.

use crate::errors::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use wattflow_common::model::Measurement;

#[derive(Serialize)]
struct JournalEntry<'a> {
    timestamp: DateTime<Utc>,
    device_id: &'a str,
    value: f64,
}

#[derive(Deserialize)]
struct Stamp {
    timestamp: DateTime<Utc>,
}

pub struct Journal {
    dir: PathBuf,
    device_id: String,
    file: Option<File>,
    day: Option<NaiveDate>,
}

impl Journal {
    pub fn open(dir: &Path, device_id: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut journal = Self {
            dir: dir.to_path_buf(),
            device_id: device_id.to_string(),
            file: None,
            day: None,
        };
        journal.day = journal.active_day()?;
        if let Some(day) = journal.day {
            info!("Resuming journal {} for {}", journal.active_path().display(), day);
        }
        Ok(journal)
    }

    /// Day of the entries already in the active file: taken from the last
    /// readable line, or from the file's modification time.
    fn active_day(&self) -> Result<Option<NaiveDate>> {
        let path = self.active_path();
        if !path.exists() {
            return Ok(None);
        }

        let mut last = None;
        for line in BufReader::new(File::open(&path)?).lines() {
            if let Ok(stamp) = serde_json::from_str::<Stamp>(&line?) {
                last = Some(stamp.timestamp.date_naive());
            }
        }
        if last.is_some() {
            return Ok(last);
        }

        let modified: DateTime<Utc> = fs::metadata(&path)?.modified()?.into();
        Ok(Some(modified.date_naive()))
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.device_id))
    }

    pub fn append(&mut self, measurement: &Measurement) -> Result<()> {
        let day = measurement.timestamp.date_naive();
        match self.day {
            Some(previous) if previous != day => {
                self.rotate(previous)?;
                self.day = Some(day);
            }
            None => self.day = Some(day),
            _ => {}
        }

        let mut line = serde_json::to_vec(&JournalEntry {
            timestamp: measurement.timestamp,
            device_id: &measurement.device_id,
            value: measurement.value,
        })?;
        line.push(b'\n');

        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.active_path())?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&line)?;
        }
        Ok(())
    }

    fn rotate(&mut self, previous: NaiveDate) -> Result<()> {
        self.file = None;
        let active = self.active_path();
        if active.exists() {
            let rotated = self
                .dir
                .join(format!("{}-{}.log", self.device_id, previous.format("%Y-%m-%d")));
            if rotated.exists() {
                let mut target = OpenOptions::new().append(true).open(&rotated)?;
                io::copy(&mut File::open(&active)?, &mut target)?;
                fs::remove_file(&active)?;
            } else {
                fs::rename(&active, &rotated)?;
            }
            info!("Rotated journal to {}", rotated.display());
        }
        Ok(())
    }
}
