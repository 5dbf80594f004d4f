//! Rollback journal: a sidecar file of page pre-images.
//!
//! Entry 0 is always a copy of the pre-transaction root page, so rollback can
//! restore page 0 even though its on-disk slot is fixed. Every later entry is
//! one page-sized pre-image whose first four bytes are the target page index,
//! which lets rollback replay the file without a separate entry directory.

use crate::{PAGE_SIZE, write_page_at};
use common::{DbResult, PageId};
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

/// Derive the journal path for a data file: `<data>-journal`.
pub(crate) fn journal_path(data_path: &Path) -> PathBuf {
    let mut os: OsString = data_path.as_os_str().to_os_string();
    os.push("-journal");
    PathBuf::from(os)
}

pub(crate) struct Journal {
    path: PathBuf,
    file: Option<File>,
}

impl Journal {
    pub(crate) fn new(data_path: &Path) -> Self {
        Self {
            path: journal_path(data_path),
            file: None,
        }
    }

    pub(crate) fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Start a transaction journal, truncating any stale one, and record the
    /// root pre-image as entry 0. The entry is fsynced before this returns.
    pub(crate) fn begin(&mut self, root_image: &[u8; PAGE_SIZE]) -> DbResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(root_image)?;
        file.sync_data()?;
        self.file = Some(file);
        Ok(())
    }

    /// Append one page pre-image and fsync it. The caller guarantees the
    /// image carries its page index in the first four bytes.
    pub(crate) fn append(&mut self, image: &[u8; PAGE_SIZE]) -> DbResult<()> {
        let file = self
            .file
            .as_mut()
            .expect("journal append without an open transaction");
        file.write_all(image)?;
        file.sync_data()?;
        Ok(())
    }

    /// Close and delete the journal file. Removing the journal is what makes
    /// a commit final.
    pub(crate) fn remove(&mut self) -> DbResult<()> {
        self.file = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.file = None;
    }

    /// Replay this journal against the data file: restore the root, then each
    /// recorded pre-image, truncate the file back to the restored page count,
    /// and delete the journal. A short trailing entry from a mid-append crash
    /// is ignored. Returns the restored root image, or `None` if the journal
    /// held no complete root entry.
    pub(crate) fn replay(&mut self, data: &mut File) -> DbResult<Option<[u8; PAGE_SIZE]>> {
        self.file = None;
        let mut journal = File::open(&self.path)?;

        let mut root_image = [0u8; PAGE_SIZE];
        if !read_full_entry(&mut journal, &mut root_image)? {
            // Crash before the root entry landed; nothing was modified.
            self.remove()?;
            return Ok(None);
        }
        write_page_at(data, PageId::ROOT, &root_image)?;

        let mut image = [0u8; PAGE_SIZE];
        let mut restored = 0usize;
        while read_full_entry(&mut journal, &mut image)? {
            let index = PageId(u32::from_le_bytes(image[..4].try_into().unwrap()));
            write_page_at(data, index, &image)?;
            restored += 1;
        }

        let page_counter = u32::from_le_bytes(root_image[4..8].try_into().unwrap());
        data.set_len(page_counter as u64 * PAGE_SIZE as u64)?;
        data.sync_data()?;

        log::debug!("journal replay restored {restored} pages, counter {page_counter}");
        self.remove()?;
        Ok(Some(root_image))
    }
}

/// Read exactly one page-sized entry. Returns false on clean EOF or on a
/// short (torn) entry.
fn read_full_entry(file: &mut File, buf: &mut [u8; PAGE_SIZE]) -> DbResult<bool> {
    let mut filled = 0;
    while filled < PAGE_SIZE {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}
