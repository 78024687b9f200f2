use mime::Mime;
use std::{
    fmt::Debug,
    fs::File,
    io::{Read, Result as IoResult, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

/// Source of the bytes being uploaded.
///
/// Implementations must be cheap to share across the engine's worker
/// threads; each part transfer slices its own byte range.
pub trait DataSource: Debug + Send + Sync {
    /// Total size of the source in bytes.
    fn total_size(&self) -> u64;

    /// File name reported to the signing server.
    fn file_name(&self) -> &str;

    /// Optional directory path reported to the signing server.
    #[inline]
    fn dir_path(&self) -> Option<&str> {
        None
    }

    /// Content type of the source, if known.
    #[inline]
    fn mime_type(&self) -> Option<&Mime> {
        None
    }

    /// Read the given byte range. The range is guaranteed to lie within
    /// `0..total_size()`.
    fn slice(&self, range: Range<u64>) -> IoResult<Vec<u8>>;
}

/// Data source reading byte ranges from a file on disk.
///
/// The file is re-opened per slice so concurrent part transfers never
/// contend on a shared file cursor.
#[derive(Debug)]
pub struct FileDataSource {
    path: PathBuf,
    file_name: String,
    dir_path: Option<String>,
    size: u64,
    mime_type: Option<Mime>,
}

impl FileDataSource {
    pub fn new(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let size = path.metadata()?.len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path,
            file_name,
            dir_path: None,
            size,
            mime_type: None,
        })
    }

    /// Set the directory path reported to the signing server.
    #[inline]
    pub fn dir_path(mut self, dir_path: impl Into<String>) -> Self {
        self.dir_path = Some(dir_path.into());
        self
    }

    /// Set the content type of the file.
    #[inline]
    pub fn mime_type(mut self, mime_type: Mime) -> Self {
        self.mime_type = Some(mime_type);
        self
    }
}

impl DataSource for FileDataSource {
    #[inline]
    fn total_size(&self) -> u64 {
        self.size
    }

    #[inline]
    fn file_name(&self) -> &str {
        &self.file_name
    }

    #[inline]
    fn dir_path(&self) -> Option<&str> {
        self.dir_path.as_deref()
    }

    #[inline]
    fn mime_type(&self) -> Option<&Mime> {
        self.mime_type.as_ref()
    }

    fn slice(&self, range: Range<u64>) -> IoResult<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(range.start))?;
        let mut data = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }
}

/// In-memory data source, mostly useful for small payloads and tests.
#[derive(Debug, Clone)]
pub struct MemoryDataSource {
    file_name: String,
    data: Vec<u8>,
    mime_type: Option<Mime>,
}

impl MemoryDataSource {
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            data,
            mime_type: None,
        }
    }

    /// Set the content type of the payload.
    #[inline]
    pub fn mime_type(mut self, mime_type: Mime) -> Self {
        self.mime_type = Some(mime_type);
        self
    }
}

impl DataSource for MemoryDataSource {
    #[inline]
    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    fn file_name(&self) -> &str {
        &self.file_name
    }

    #[inline]
    fn mime_type(&self) -> Option<&Mime> {
        self.mime_type.as_ref()
    }

    #[inline]
    fn slice(&self, range: Range<u64>) -> IoResult<Vec<u8>> {
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{thread_rng, RngCore};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_data_source_slices() -> IoResult<()> {
        let mut data = vec![0u8; 1 << 16];
        thread_rng().fill_bytes(&mut data);
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(&data)?;
        temp_file.flush()?;

        let source = FileDataSource::new(temp_file.path())?;
        assert_eq!(source.total_size(), data.len() as u64);
        assert_eq!(source.slice(0..512)?, &data[..512]);
        assert_eq!(source.slice(1024..4096)?, &data[1024..4096]);
        let len = data.len() as u64;
        assert_eq!(source.slice(len - 7..len)?, &data[data.len() - 7..]);
        Ok(())
    }

    #[test]
    fn test_memory_data_source() {
        let source = MemoryDataSource::new("hello.bin", b"hello world".to_vec());
        assert_eq!(source.total_size(), 11);
        assert_eq!(source.file_name(), "hello.bin");
        assert_eq!(source.slice(6..11).unwrap(), b"world");
    }
}
