use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{BlockId, Result};

/// FileManager reads, writes and appends fixed-size blocks across the files
/// of one database directory. Files are opened lazily and kept open.
pub struct FileManager {
    /// Directory holding every database file
    db_dir: PathBuf,
    /// Size of every block in bytes
    block_size: usize,
    /// Open file handles keyed by file name
    open_files: Mutex<HashMap<String, File>>,
    /// Number of block reads performed
    num_reads: AtomicU64,
    /// Number of block writes performed (appends included)
    num_writes: AtomicU64,
}

impl FileManager {
    /// Creates a FileManager rooted at `db_dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(db_dir: P, block_size: usize) -> Result<Self> {
        let db_dir = db_dir.as_ref().to_path_buf();
        fs::create_dir_all(&db_dir)?;

        Ok(Self {
            db_dir,
            block_size,
            open_files: Mutex::new(HashMap::new()),
            num_reads: AtomicU64::new(0),
            num_writes: AtomicU64::new(0),
        })
    }

    /// Reads a block into the provided buffer.
    /// Reading past the end of the file yields zeros.
    pub fn read(&self, block: &BlockId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), self.block_size, "Buffer must be block_size bytes");

        let offset = block.number() * self.block_size as u64;

        let mut files = self.open_files.lock();
        let file = self.file_handle(&mut files, block.file())?;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data[filled..].fill(0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a block from the provided buffer.
    pub fn write(&self, block: &BlockId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), self.block_size, "Buffer must be block_size bytes");

        let offset = block.number() * self.block_size as u64;

        let mut files = self.open_files.lock();
        let file = self.file_handle(&mut files, block.file())?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Appends a zero-filled block to the end of `file_name` and returns its id.
    pub fn append(&self, file_name: &str) -> Result<BlockId> {
        let mut files = self.open_files.lock();
        let file = self.file_handle(&mut files, file_name)?;

        let number = file.metadata()?.len() / self.block_size as u64;
        let block = BlockId::new(file_name, number);

        file.seek(SeekFrom::Start(number * self.block_size as u64))?;
        file.write_all(&vec![0u8; self.block_size])?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    /// Returns the number of blocks in `file_name`.
    pub fn length(&self, file_name: &str) -> Result<u64> {
        let mut files = self.open_files.lock();
        let file = self.file_handle(&mut files, file_name)?;
        Ok(file.metadata()?.len() / self.block_size as u64)
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of block reads performed.
    pub fn num_reads(&self) -> u64 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of block writes performed.
    pub fn num_writes(&self) -> u64 {
        self.num_writes.load(Ordering::Relaxed)
    }

    /// Returns the database directory.
    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Flushes every open file to stable storage.
    pub fn sync(&self) -> Result<()> {
        let files = self.open_files.lock();
        for file in files.values() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn file_handle<'a>(
        &self,
        files: &'a mut HashMap<String, File>,
        file_name: &str,
    ) -> Result<&'a mut File> {
        match files.entry(file_name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(self.db_dir.join(file_name))?;
                Ok(entry.insert(file))
            }
        }
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        for file in self.open_files.get_mut().values() {
            let _ = file.sync_all();
        }
    }
}
