//! Archive Extractor
//!
//! Expands the zip payload embedded in an image. The archive is first read
//! in place through a window over the image that starts at the payload
//! offset. Some archives are rejected when read that way, so on a malformed
//! stream the payload bytes are copied into a standalone file inside the
//! target directory and extracted from there instead.

use crate::error::{InstallError, Result};
use crate::paths::payload::TRAILER_LEN;
use crate::payload::PayloadInfo;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use zip::result::{ZipError, ZipResult};
use zip::ZipArchive;

/// How the archive was eventually read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Read in place at the payload offset
    Direct,
    /// Copied out of the image, then read as a standalone archive
    CopyFallback,
}

/// Outcome of a full extraction
#[derive(Debug, Clone)]
pub struct ExtractReport {
    /// Number of archive entries written (directories included)
    pub entries: usize,
    pub strategy: Strategy,
}

/// A bounded, re-based view over part of a stream.
///
/// Position 0 of the window is `start` in the inner stream, and reads stop
/// at `end`, so the archive never sees the image before it or the trailer
/// after it.
pub struct PayloadWindow<R> {
    inner: R,
    start: u64,
    end: u64,
    pos: u64,
}

impl<R: Read + Seek> PayloadWindow<R> {
    pub fn new(mut inner: R, start: u64, end: u64) -> io::Result<Self> {
        if end < start {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("window end {} is before start {}", end, start),
            ));
        }
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self { inner, start, end, pos: 0 })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Read + Seek> Read for PayloadWindow<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len().saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = std::cmp::min(buf.len() as u64, remaining) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for PayloadWindow<R> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let new_pos = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of payload")
        })?;

        self.inner.seek(SeekFrom::Start(self.start + new_pos))?;
        self.pos = new_pos;
        Ok(new_pos)
    }
}

type PayloadArchive = ZipArchive<PayloadWindow<File>>;

/// Extract every entry of the payload into `target`
pub fn extract_all(payload: &PayloadInfo, target: &Path) -> Result<ExtractReport> {
    let (entries, strategy) = with_fallback(payload, target, |archive| {
        archive.extract(target)?;
        Ok(archive.len())
    })?;

    tracing::info!("Extracted {} entries to {:?} ({:?})", entries, target, strategy);
    Ok(ExtractReport { entries, strategy })
}

/// Extract a single named entry into `target`.
///
/// Returns `Ok(None)` when the archive has no such entry; optional files
/// must not fail the flow.
pub fn extract_entry(payload: &PayloadInfo, name: &str, target: &Path) -> Result<Option<PathBuf>> {
    let (path, _) = with_fallback(payload, target, |archive| {
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(err),
        };

        let relative = entry
            .enclosed_name()
            .ok_or(ZipError::InvalidArchive("entry has an unsafe path".into()))?;
        let dest = target.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        Ok(Some(dest))
    })?;

    match &path {
        Some(dest) => tracing::debug!("Extracted {} to {:?}", name, dest),
        None => tracing::info!("{} not present in payload", name),
    }
    Ok(path)
}

/// Run `job` against the direct archive view, retrying through a standalone
/// copy when the direct view is rejected as malformed.
fn with_fallback<T>(
    payload: &PayloadInfo,
    target: &Path,
    mut job: impl FnMut(&mut PayloadArchive) -> ZipResult<T>,
) -> Result<(T, Strategy)> {
    fs::create_dir_all(target)?;

    match run_direct(payload, &mut job) {
        Ok(value) => Ok((value, Strategy::Direct)),
        Err(err) if is_malformed(&err) => {
            tracing::warn!("Stream extraction failed ({}). Retrying with a standalone copy...", err);
            run_via_copy(payload, target, &mut job)
                .map(|value| (value, Strategy::CopyFallback))
                .map_err(|err| InstallError::ExtractionFailed(err.to_string()))
        }
        Err(err) => Err(InstallError::ExtractionFailed(err.to_string())),
    }
}

fn is_malformed(err: &ZipError) -> bool {
    matches!(err, ZipError::InvalidArchive(_))
}

/// Window over the payload region, trailer excluded
fn open_payload_window(payload: &PayloadInfo) -> io::Result<PayloadWindow<File>> {
    let file = File::open(&payload.image_path)?;
    let len = file.metadata()?.len();
    let end = len.saturating_sub(TRAILER_LEN).max(payload.offset);
    PayloadWindow::new(file, payload.offset, end)
}

fn run_direct<T>(
    payload: &PayloadInfo,
    job: &mut impl FnMut(&mut PayloadArchive) -> ZipResult<T>,
) -> ZipResult<T> {
    let window = open_payload_window(payload)?;
    let mut archive = ZipArchive::new(window)?;
    job(&mut archive)
}

/// Copy the payload bytes into a scratch file inside `target` and run `job`
/// against that file. The copy is removed once the job finishes.
pub(crate) fn run_via_copy<T>(
    payload: &PayloadInfo,
    target: &Path,
    job: &mut impl FnMut(&mut PayloadArchive) -> ZipResult<T>,
) -> ZipResult<T> {
    let mut window = open_payload_window(payload)?;
    let mut scratch = tempfile::Builder::new()
        .prefix(".payload-")
        .suffix(".zip")
        .tempfile_in(target)?;

    let copied = io::copy(&mut window, scratch.as_file_mut())?;
    drop(window);
    tracing::debug!("Copied {} payload bytes to {:?}", copied, scratch.path());

    let standalone = PayloadWindow::new(scratch.reopen()?, 0, copied)?;
    let result = {
        let mut archive = ZipArchive::new(standalone)?;
        job(&mut archive)
    };

    scratch.close()?;
    result
}
