//! Filesystem backend.
//!
//! Objects live at `<root>/ab/cd/<oid>`; uploads stream into a per-upload
//! subdirectory of `<root>/tmp` and are moved into place with a rename at
//! commit, so a crash or abort never leaves a partial object visible.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::oid::Oid;
use crate::store::{Backend, ByteRange, Error, Upload};

const TMP_DIR: &str = "tmp";

/// Backend rooted at a directory.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, oid: &Oid) -> PathBuf {
        self.root.join(oid.shard_path())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }
}

impl Backend for FsBackend {
    fn stream(
        &self,
        oid: &Oid,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>, Error> {
        let mut file = match File::open(self.object_path(oid)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(oid.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        match range {
            None => Ok(Box::new(file)),
            Some(range) => {
                file.seek(SeekFrom::Start(range.start))?;
                match range.len() {
                    Some(len) => Ok(Box::new(file.take(len))),
                    None => Ok(Box::new(file)),
                }
            }
        }
    }

    fn exists(&self, oid: &Oid) -> Result<bool, Error> {
        Ok(self.object_path(oid).exists())
    }

    fn remove(&self, oid: &Oid) -> Result<(), Error> {
        match fs::remove_file(self.object_path(oid)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(oid.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn upload(&self, oid: &Oid, declared_size: u64) -> Result<Box<dyn Upload>, Error> {
        let dir = self.tmp_dir().join(format!("{:016x}", fastrand::u64(..)));
        fs::create_dir_all(&dir)?;
        let path = dir.join("object");
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        Ok(Box::new(FsUpload {
            file: Some(file),
            path,
            dir,
            destination: self.object_path(oid),
            declared_size,
            written: 0,
        }))
    }

    fn scavenge(&self, max_age_secs: u64) -> Result<usize, Error> {
        let cutoff = SystemTime::now() - Duration::from_secs(max_age_secs);
        let mut removed = 0;
        for entry in fs::read_dir(self.tmp_dir())? {
            let entry = entry?;
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if modified < cutoff {
                if fs::remove_dir_all(entry.path()).is_ok() {
                    removed += 1;
                    log::debug!(
                        target: "lfs",
                        "Scavenged stale upload dir {:?}",
                        entry.file_name()
                    );
                }
            }
        }
        Ok(removed)
    }
}

struct FsUpload {
    file: Option<File>,
    path: PathBuf,
    dir: PathBuf,
    destination: PathBuf,
    declared_size: u64,
    written: u64,
}

impl FsUpload {
    fn cleanup(&mut self) {
        self.file.take();
        fs::remove_dir_all(&self.dir).ok();
    }
}

impl Write for FsUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.declared_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upload exceeds its declared size",
            ));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "upload already closed"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Upload for FsUpload {
    fn finalize(mut self: Box<Self>) -> Result<(), Error> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::BackendUnavailable("upload already closed".to_owned()))?;
        file.sync_all()?;
        drop(file);
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let result = fs::rename(&self.path, &self.destination);
        fs::remove_dir_all(&self.dir).ok();
        result.map_err(Error::from)
    }

    fn abort(mut self: Box<Self>) -> Result<(), Error> {
        self.cleanup();
        Ok(())
    }
}

impl Drop for FsUpload {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.cleanup();
        }
    }
}
