use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::config::PostProcessSettings;
use crate::error::{TrackerError, TrackerResult};
use crate::journey::Journey;
use crate::postprocess::PostProcessor;
use crate::segmenter::JourneySink;

/// Journeys as closed by the segmenter
pub const RAW_FILE: &str = "raw_journeys.dat";
/// Journeys after post-processing, awaiting upload
pub const PROCESSED_FILE: &str = "processed_journeys.dat";
/// Journeys kept on the device after upload
pub const HISTORY_FILE: &str = "history.dat";
/// Identifier handed out by the collection server
pub const CLIENT_ID_FILE: &str = "client.id";

/// Append-only journey files under one data directory
#[derive(Debug, Clone)]
pub struct JourneyStore {
    dir: PathBuf,
}

impl JourneyStore {
    pub fn open(dir: impl Into<PathBuf>) -> TrackerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(JourneyStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Append one finished journey; empty journeys are skipped
    pub fn append_raw(&self, journey: &Journey) -> TrackerResult<bool> {
        if journey.is_empty() {
            log::warn!("[STORE] not storing empty journey {}", journey.id);
            return Ok(false);
        }
        append_file(&self.path(RAW_FILE), std::slice::from_ref(journey))?;
        Ok(true)
    }

    pub fn load_raw(&self) -> TrackerResult<Vec<Journey>> {
        load_file(&self.path(RAW_FILE))
    }

    pub fn load_processed(&self) -> TrackerResult<Vec<Journey>> {
        load_file(&self.path(PROCESSED_FILE))
    }

    pub fn load_history(&self) -> TrackerResult<Vec<Journey>> {
        load_file(&self.path(HISTORY_FILE))
    }

    /// Append to the processed file, then discard the raw file
    pub fn save_processed(&self, journeys: &[Journey]) -> TrackerResult<()> {
        append_file(&self.path(PROCESSED_FILE), journeys)?;
        let raw = self.path(RAW_FILE);
        if raw.exists() {
            fs::remove_file(&raw)?;
        }
        Ok(())
    }

    /// Run the post-processing pass over the raw file; returns journeys kept
    pub fn post_process(&self, params: &PostProcessSettings) -> TrackerResult<usize> {
        let raw = self.load_raw()?;
        if raw.is_empty() {
            return Ok(0);
        }
        let mut pp = PostProcessor::new(raw);
        pp.apply(params);
        let kept = pp.into_journeys();
        self.save_processed(&kept)?;
        log::info!("[STORE] {} processed journeys saved", kept.len());
        Ok(kept.len())
    }

    /// Drop uploaded journeys from the processed file
    pub fn remove_processed(&self, ids: &[i64]) -> TrackerResult<usize> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .load_processed()?
            .into_iter()
            .partition(|j| ids.contains(&j.id));
        rewrite_file(&self.path(PROCESSED_FILE), &kept)?;
        Ok(removed.len())
    }

    /// Move selected processed journeys into the personal history
    pub fn merge_into_history(&self, ids: &[i64]) -> TrackerResult<usize> {
        let (moved, kept): (Vec<_>, Vec<_>) = self
            .load_processed()?
            .into_iter()
            .partition(|j| ids.contains(&j.id));
        append_file(&self.path(HISTORY_FILE), &moved)?;
        rewrite_file(&self.path(PROCESSED_FILE), &kept)?;
        Ok(moved.len())
    }

    pub fn load_client_id(&self) -> TrackerResult<Option<String>> {
        let path = self.path(CLIENT_ID_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let id = fs::read_to_string(path)?.trim().to_string();
        Ok((!id.is_empty()).then_some(id))
    }

    pub fn save_client_id(&self, id: &str) -> TrackerResult<()> {
        fs::write(self.path(CLIENT_ID_FILE), id.trim())?;
        Ok(())
    }
}

fn append_file(path: &Path, journeys: &[Journey]) -> TrackerResult<()> {
    if journeys.is_empty() {
        return Ok(());
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = BufWriter::new(file);
    for j in journeys.iter().filter(|j| !j.is_empty()) {
        j.write_to(&mut out)?;
    }
    out.flush()?;
    Ok(())
}

fn rewrite_file(path: &Path, journeys: &[Journey]) -> TrackerResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for j in journeys {
            j.write_to(&mut out)?;
        }
        out.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read every record; a malformed tail ends the read but keeps what came before
pub fn load_file(path: &Path) -> TrackerResult<Vec<Journey>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut journeys = Vec::new();
    loop {
        match Journey::read_from(&mut reader) {
            Ok(Some(j)) => journeys.push(j),
            Ok(None) => break,
            Err(TrackerError::MalformedRecord(msg)) => {
                log::warn!(
                    "[STORE] {}: {} (keeping {} journeys)",
                    path.display(),
                    msg,
                    journeys.len()
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(journeys)
}

/// Background appender for finished journeys
pub struct JourneyWriter {
    tx: Option<Sender<Journey>>,
    handle: Option<JoinHandle<usize>>,
}

pub fn spawn_writer(store: JourneyStore) -> JourneyWriter {
    let (tx, rx) = channel::unbounded::<Journey>();
    let handle = thread::spawn(move || {
        let mut written = 0usize;
        for journey in rx.iter() {
            match store.append_raw(&journey) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => log::error!("[STORE] failed to write journey {}: {}", journey.id, e),
            }
        }
        written
    });
    JourneyWriter {
        tx: Some(tx),
        handle: Some(handle),
    }
}

impl JourneyWriter {
    /// Close the queue and wait for pending writes; returns journeys written
    pub fn finish(mut self) -> TrackerResult<usize> {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| TrackerError::Storage("journey writer panicked".to_string())),
            None => Ok(0),
        }
    }
}

impl JourneySink for JourneyWriter {
    fn persist(&mut self, journey: Journey) -> TrackerResult<()> {
        match self.tx.as_mut() {
            Some(tx) => tx.persist(journey),
            None => Err(TrackerError::Storage("journey writer closed".to_string())),
        }
    }
}
