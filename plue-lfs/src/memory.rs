//! In-memory backend, for tests and as a hot tier.
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use crate::oid::Oid;
use crate::store::{Backend, ByteRange, Error, Upload};

#[derive(Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<Mutex<HashMap<Oid, Arc<Vec<u8>>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Oid, Arc<Vec<u8>>>> {
        self.objects.lock().expect("lfs: memory store poisoned")
    }
}

impl Backend for MemoryBackend {
    fn stream(
        &self,
        oid: &Oid,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>, Error> {
        let bytes = self
            .lock()
            .get(oid)
            .cloned()
            .ok_or_else(|| Error::NotFound(oid.clone()))?;
        let mut cursor = Cursor::new(BytesReader(bytes));
        cursor.set_position(range.map_or(0, |r| r.start));
        match range.and_then(|r| r.len()) {
            Some(len) => Ok(Box::new(cursor.take(len))),
            None => Ok(Box::new(cursor)),
        }
    }

    fn exists(&self, oid: &Oid) -> Result<bool, Error> {
        Ok(self.lock().contains_key(oid))
    }

    fn remove(&self, oid: &Oid) -> Result<(), Error> {
        self.lock()
            .remove(oid)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(oid.clone()))
    }

    fn upload(&self, oid: &Oid, declared_size: u64) -> Result<Box<dyn Upload>, Error> {
        Ok(Box::new(MemoryUpload {
            oid: oid.clone(),
            declared_size,
            buf: Vec::new(),
            objects: self.objects.clone(),
        }))
    }
}

/// `AsRef<[u8]>` shim so a shared buffer can back a `Cursor`.
struct BytesReader(Arc<Vec<u8>>);

impl AsRef<[u8]> for BytesReader {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

struct MemoryUpload {
    oid: Oid,
    declared_size: u64,
    buf: Vec<u8>,
    objects: Arc<Mutex<HashMap<Oid, Arc<Vec<u8>>>>>,
}

impl Write for MemoryUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if (self.buf.len() + buf.len()) as u64 > self.declared_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upload exceeds its declared size",
            ));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Upload for MemoryUpload {
    fn finalize(self: Box<Self>) -> Result<(), Error> {
        self.objects
            .lock()
            .expect("lfs: memory store poisoned")
            .insert(self.oid.clone(), Arc::new(self.buf));
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip_and_ranges() {
        let backend = MemoryBackend::new();
        let content = b"abcdefgh";
        let oid = Oid::of(content);
        backend.put(&oid, content).unwrap();

        assert_eq!(backend.get(&oid).unwrap(), content);

        let mut buf = Vec::new();
        backend
            .stream(&oid, Some(ByteRange { start: 2, end: Some(5) }))
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, b"cde");
    }

    #[test]
    fn test_unfinalized_upload_is_invisible() {
        let backend = MemoryBackend::new();
        let oid = Oid::of(b"pending");
        let mut upload = backend.upload(&oid, 16).unwrap();
        upload.write_all(b"pending").unwrap();
        assert!(!backend.exists(&oid).unwrap());
        upload.finalize().unwrap();
        assert!(backend.exists(&oid).unwrap());
    }
}
