//! The pepoch file: the persisted durable epoch plus each logger's
//! last-log hash, sealed as one blob.

use std::{
    fs,
    io::Write,
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::Context;
use byteorder::{
    ByteOrder,
    LittleEndian,
};
use errors::ErrorMetadata;

use crate::seal::{
    seal,
    unseal,
};

const HASH_HEX_LEN: usize = 64;

pub struct PepochFile {
    path: PathBuf,
}

impl PepochFile {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join("pepoch.seal"),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist `durable_epoch` plus one 64-hex-char hash per logger, in
    /// logger order. The file is rewritten whole; it is small.
    pub fn write(&self, durable_epoch: u64, logger_hashes: &[String]) -> anyhow::Result<()> {
        let mut payload = vec![0u8; 8];
        LittleEndian::write_u64(&mut payload, durable_epoch);
        for hash in logger_hashes {
            anyhow::ensure!(
                hash.len() == HASH_HEX_LEN,
                "malformed logger hash {hash:?}"
            );
            payload.extend_from_slice(hash.as_bytes());
        }
        let sealed = seal(&payload);
        let mut file = fs::File::create(&self.path)
            .with_context(|| format!("creating {}", self.path.display()))?;
        file.write_all(&sealed)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read back `(durable_epoch, per-logger hashes)`.
    pub fn read(&self) -> anyhow::Result<(u64, Vec<String>)> {
        let sealed = fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let payload = unseal(&sealed).context("unsealing pepoch file")?;
        if payload.len() < 8 || (payload.len() - 8) % HASH_HEX_LEN != 0 {
            anyhow::bail!(ErrorMetadata::integrity(
                "MalformedPepoch",
                "Pepoch file has an invalid layout"
            ));
        }
        let durable_epoch = LittleEndian::read_u64(&payload[..8]);
        let hashes = payload[8..]
            .chunks(HASH_HEX_LEN)
            .map(|chunk| {
                String::from_utf8(chunk.to_vec()).map_err(|_| {
                    anyhow::Error::from(ErrorMetadata::integrity(
                        "MalformedPepoch",
                        "Pepoch hash is not valid hex text",
                    ))
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((durable_epoch, hashes))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::PepochFile;
    use crate::wire::PASSPHRASE_HASH;

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let pepoch = PepochFile::new(dir.path());
        assert!(!pepoch.exists());
        let hashes = vec![PASSPHRASE_HASH.clone(), "ab".repeat(32)];
        pepoch.write(42, &hashes).unwrap();
        assert!(pepoch.exists());
        let (epoch, read_hashes) = pepoch.read().unwrap();
        assert_eq!(epoch, 42);
        assert_eq!(read_hashes, hashes);
    }

    #[test]
    fn test_tampered_file_fails() {
        let dir = TempDir::new().unwrap();
        let pepoch = PepochFile::new(dir.path());
        pepoch.write(7, &[PASSPHRASE_HASH.clone()]).unwrap();
        let path = dir.path().join("pepoch.seal");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        assert!(pepoch.read().is_err());
    }
}
