// SPDX-License-Identifier: Apache-2.0

//! Platform-stable file identity.
//!
//! A file's identity survives renames: on POSIX systems it is the device and
//! inode pair, on Windows the volume serial number and file index. The same
//! path can map to different identities over time (delete + recreate), and
//! inode reuse after deletion is an accepted edge case, not something this
//! module tries to defend against.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;

/// Identity of a file independent of its path.
///
/// Modeled as a tagged variant per platform so that equality is uniform and
/// no code conditionally reaches into OS-specific fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileIdentity {
    Posix { device: u64, inode: u64 },
    Windows { volume: u64, idx_hi: u64, idx_lo: u64 },
}

impl FileIdentity {
    /// Identity of the file currently at `path`.
    ///
    /// Two successive calls on the same underlying file return equal
    /// identities, even across a rename in between.
    #[cfg(unix)]
    pub fn of_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::of_metadata(&metadata))
    }

    /// Identity of the file currently at `path`.
    #[cfg(windows)]
    pub fn of_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::of_file(&file)
    }

    /// Identity from already-fetched metadata. Avoids a second stat when the
    /// caller just listed the file.
    #[cfg(unix)]
    pub fn of_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        FileIdentity::Posix {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }

    /// Identity of an open file handle.
    ///
    /// Keeps working after the file was renamed or unlinked, which is what
    /// rename/remove detection relies on.
    #[cfg(unix)]
    pub fn of_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        Ok(Self::of_metadata(&metadata))
    }

    /// Identity of an open file handle.
    #[cfg(windows)]
    pub fn of_file(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(FileIdentity::Windows {
            volume: info.dwVolumeSerialNumber as u64,
            idx_hi: info.nFileIndexHigh as u64,
            idx_lo: info.nFileIndexLow as u64,
        })
    }

    /// Stable string key for this identity, used to key the registry map.
    pub fn key(&self) -> String {
        match self {
            FileIdentity::Posix { device, inode } => format!("{}-{}", device, inode),
            FileIdentity::Windows {
                volume,
                idx_hi,
                idx_lo,
            } => format!("{}-{}-{}", volume, idx_hi, idx_lo),
        }
    }
}

/// Current path of an open file handle.
///
/// Used to discover where a still-open file went after a rename. Fails when
/// the file was unlinked.
#[cfg(target_os = "linux")]
pub fn path_of_file(file: &File) -> io::Result<std::path::PathBuf> {
    use std::os::unix::io::AsRawFd;

    let link = format!("/proc/self/fd/{}", file.as_raw_fd());
    let path = std::fs::read_link(link)?;
    // An unlinked file reads as "<path> (deleted)".
    if path.to_string_lossy().ends_with(" (deleted)") {
        return Err(io::Error::from(io::ErrorKind::NotFound));
    }
    Ok(path)
}

/// Current path of an open file handle.
#[cfg(not(target_os = "linux"))]
pub fn path_of_file(_file: &File) -> io::Result<std::path::PathBuf> {
    // No portable fd-to-path lookup; rename detection then keeps the last
    // known path until the scanner reports the new one.
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
