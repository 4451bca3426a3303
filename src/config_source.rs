use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fault_injection::{annotate, fallible, maybe};
use parking_lot::Mutex;

use crate::{Error, Result, ViewConfig, ViewId};

const TMP_SUFFIX: &str = ".tmp";
const LOCK_SUFFIX: &str = ".lock";

/// Durable, shared storage for the published view.
///
/// Every process replicating the same table reads its view from the
/// same source, and reconfiguration publishes through it with a
/// conditional update so that concurrent reconfigurations cannot both
/// win.
pub trait ConfigSource: Send + Sync {
    /// Reads the currently published view, `None` if nothing has been
    /// published yet.
    fn load(&self) -> Result<Option<ViewConfig>>;

    /// Publishes `config` if the currently published view id equals
    /// `expected` (`None` meaning nothing is published), failing with
    /// `Error::ConfigConflict` otherwise.
    fn publish(&self, config: &ViewConfig, expected: Option<ViewId>) -> Result<()>;
}

fn check_expected(
    current: Option<&ViewConfig>,
    expected: Option<ViewId>,
) -> Result<()> {
    let actual = current.map(|c| c.view_id);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::ConfigConflict { expected, actual })
    }
}

/// A `ConfigSource` held in memory and shared by handle.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    published: Mutex<Option<ViewConfig>>,
    unavailable: AtomicBool,
}

impl MemoryConfigSource {
    /// Creates an empty source.
    pub fn new() -> MemoryConfigSource {
        MemoryConfigSource::default()
    }

    /// Makes every call fail with `Error::ConfigUnavailable` until
    /// called again with `true`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::ConfigUnavailable(
                "memory config source is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl ConfigSource for MemoryConfigSource {
    fn load(&self) -> Result<Option<ViewConfig>> {
        self.check_available()?;
        Ok(self.published.lock().clone())
    }

    fn publish(&self, config: &ViewConfig, expected: Option<ViewId>) -> Result<()> {
        self.check_available()?;
        let mut published = self.published.lock();
        check_expected(published.as_ref(), expected)?;
        *published = Some(config.clone());
        Ok(())
    }
}

/// A `ConfigSource` backed by a single checksummed file.
///
/// Updates are serialized across processes with an exclusive lock on a
/// sibling `.lock` file, written to a temporary file, synced, and
/// renamed into place, so readers see either the old or the new view.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Uses the file at `path`, which need not exist yet.
    pub fn new<P: AsRef<Path>>(path: P) -> FileConfigSource {
        FileConfigSource { path: path.as_ref().to_path_buf() }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn publish_locked(
        &self,
        config: &ViewConfig,
        expected: Option<ViewId>,
    ) -> Result<()> {
        use fs2::FileExt;

        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.sibling(LOCK_SUFFIX))
            .map_err(unavailable)?;
        lock_file.lock_exclusive().map_err(unavailable)?;

        let res = read_config(&self.path)
            .map_err(unavailable)
            .and_then(|current| check_expected(current.as_ref(), expected))
            .and_then(|()| {
                write_config(&self.path, &self.sibling(TMP_SUFFIX), config)
                    .map_err(unavailable)
            });

        if let Err(e) = lock_file.unlock() {
            log::warn!("failed to unlock {:?}: {:?}", self.sibling(LOCK_SUFFIX), e);
        }

        res
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<Option<ViewConfig>> {
        read_config(&self.path).map_err(unavailable)
    }

    fn publish(&self, config: &ViewConfig, expected: Option<ViewId>) -> Result<()> {
        self.publish_locked(config, expected)?;
        log::info!("published {} to {:?}", config.view_id, self.path);
        Ok(())
    }
}

fn unavailable(e: io::Error) -> Error {
    Error::ConfigUnavailable(e.to_string())
}

fn read_config(path: &Path) -> io::Result<Option<ViewConfig>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(annotate!(e)),
    };

    let mut buf = vec![];
    fallible!(file.read_to_end(&mut buf));

    read_frame(&buf).map(Some)
}

fn write_config(
    path: &Path,
    tmp_path: &Path,
    config: &ViewConfig,
) -> io::Result<()> {
    let frame = write_frame(config)?;

    let mut tmp = fallible!(fs::File::create(tmp_path));
    fallible!(tmp.write_all(&frame));
    fallible!(tmp.sync_all());
    drop(tmp);

    fallible!(fs::rename(tmp_path, path));

    // make the rename itself durable
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = fallible!(fs::File::open(parent));
        maybe!(dir.sync_all())?;
    }

    Ok(())
}

// A frame is the payload length as a little-endian u64, the bincode
// payload, then a crc32 of everything before it.
fn write_frame(config: &ViewConfig) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(config).map_err(|e| {
        annotate!(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    })?;

    let mut frame = Vec::with_capacity(payload.len() + 12);
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(&payload);

    let crc: u32 = crc32fast::hash(&frame) ^ 0xAF;
    frame.extend_from_slice(&crc.to_le_bytes());

    Ok(frame)
}

fn read_frame(buf: &[u8]) -> io::Result<ViewConfig> {
    let invalid = |what: &str| {
        annotate!(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
    };

    if buf.len() < 12 {
        return Err(invalid("view config file is truncated"));
    }

    let mut len_buf = [0_u8; 8];
    len_buf.copy_from_slice(&buf[..8]);
    let len = usize::try_from(u64::from_le_bytes(len_buf))
        .map_err(|_| invalid("view config length overflows"))?;

    if buf.len() != len + 12 {
        return Err(invalid("view config length does not match file size"));
    }

    let mut crc_buf = [0_u8; 4];
    crc_buf.copy_from_slice(&buf[len + 8..]);
    let crc_recorded = u32::from_le_bytes(crc_buf);
    let crc_actual = crc32fast::hash(&buf[..len + 8]) ^ 0xAF;

    if crc_actual != crc_recorded {
        log::warn!("encountered incorrect crc for view config");
        return Err(invalid("crc mismatch for view config"));
    }

    bincode::deserialize(&buf[8..len + 8])
        .map_err(|e| invalid(&e.to_string()))
}
