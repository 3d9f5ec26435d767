//! Payload Locator - Self-extraction trailer
//!
//! Finds the archive appended to the running binary. The image layout is:
//! [executable][zip payload][payload_offset: i64 LE]
//!
//! The trailer is written by the packaging step and is the only contract
//! between the packer and this installer.

use crate::error::{InstallError, Result};
use crate::paths::payload::TRAILER_LEN;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Location of the embedded archive inside an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    /// Path to the image (reopened for every extraction)
    pub image_path: PathBuf,

    /// Offset where the zip payload starts
    pub offset: u64,

    /// Total image length, trailer included
    pub image_len: u64,
}

/// Read the payload offset from the trailer of an image.
///
/// Purely a read: the stream position is moved but nothing is written.
pub fn locate_payload<R: Read + Seek>(image: &mut R) -> Result<u64> {
    let len = image.seek(SeekFrom::End(0))?;
    if len < TRAILER_LEN {
        return Err(InstallError::CorruptedImage { len });
    }

    image.seek(SeekFrom::Start(len - TRAILER_LEN))?;
    let mut trailer = [0u8; TRAILER_LEN as usize];
    image.read_exact(&mut trailer)?;
    let raw = i64::from_le_bytes(trailer);

    if raw <= 0 {
        return Err(InstallError::NoPayload { raw });
    }
    if raw as u64 >= len {
        return Err(InstallError::InvalidOffset { offset: raw, len });
    }

    tracing::debug!("Payload trailer points at offset {} ({} byte image)", raw, len);
    Ok(raw as u64)
}

/// Open an image read-only, locate its payload and close it again.
///
/// The handle never outlives this call.
pub fn locate_payload_in_file(image_path: &Path) -> Result<PayloadInfo> {
    let mut file = File::open(image_path)?;
    let offset = locate_payload(&mut file)?;
    let image_len = file.metadata()?.len();

    tracing::info!("Payload detected at offset: {}", offset);
    Ok(PayloadInfo {
        image_path: image_path.to_path_buf(),
        offset,
        image_len,
    })
}

/// Append a trailer pointing at `offset`.
///
/// Mirrors what the packaging step does after appending the archive.
pub fn append_trailer<W: Write>(image: &mut W, offset: i64) -> std::io::Result<()> {
    image.write_all(&offset.to_le_bytes())
}
