// Persisted settings: network info and parent info surviving restarts.
// Numan Thabit 2025

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ExtAddress, Rloc16, Role};

/// Margin added to persisted frame counters on restore so a restart never
/// reuses a counter value already sent.
pub const FRAME_COUNTER_AHEAD: u32 = 1_000;

/// Snapshot of the device's network membership, written at role transitions
/// and key-epoch changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub role: u8,
    pub device_mode: u8,
    pub rloc16: u16,
    pub key_epoch: u32,
    pub mle_frame_counter: u32,
    pub link_frame_counter: u32,
    pub previous_partition_id: u32,
    pub ext_addr: [u8; 8],
}

impl NetworkInfo {
    pub fn role(&self) -> Option<Role> {
        Role::from_u8(self.role)
    }

    pub fn rloc16(&self) -> Rloc16 {
        Rloc16(self.rloc16)
    }

    pub fn ext_addr(&self) -> ExtAddress {
        ExtAddress(self.ext_addr)
    }

    /// Persisted state is usable only for a previously attached role with a
    /// topologically valid short address.
    pub fn is_restorable(&self) -> bool {
        matches!(self.role(), Some(role) if role.is_attached()) && self.rloc16().is_valid()
    }
}

/// The parent the device was attached to, stored alongside [`NetworkInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub ext_addr: [u8; 8],
    pub version: u16,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("settings encode error: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Storage for the persisted records.
pub trait SettingsStore {
    fn network_info(&self) -> Option<NetworkInfo>;
    fn save_network_info(&mut self, info: &NetworkInfo) -> Result<(), SettingsError>;
    fn parent_info(&self) -> Option<ParentInfo>;
    fn save_parent_info(&mut self, info: &ParentInfo) -> Result<(), SettingsError>;
    fn clear(&mut self) -> Result<(), SettingsError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SettingsFileContents {
    network_info: Option<NetworkInfo>,
    parent_info: Option<ParentInfo>,
}

/// TOML file-backed store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cached: SettingsFileContents,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let cached = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => SettingsFileContents::default(),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };
        Ok(Self { path, cached })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        let contents = toml::to_string_pretty(&self.cached)?;
        fs::write(&self.path, contents).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl SettingsStore for FileStore {
    fn network_info(&self) -> Option<NetworkInfo> {
        self.cached.network_info.clone()
    }

    fn save_network_info(&mut self, info: &NetworkInfo) -> Result<(), SettingsError> {
        self.cached.network_info = Some(info.clone());
        self.flush()
    }

    fn parent_info(&self) -> Option<ParentInfo> {
        self.cached.parent_info.clone()
    }

    fn save_parent_info(&mut self, info: &ParentInfo) -> Result<(), SettingsError> {
        self.cached.parent_info = Some(info.clone());
        self.flush()
    }

    fn clear(&mut self) -> Result<(), SettingsError> {
        self.cached = SettingsFileContents::default();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SettingsError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// In-memory store for tests and diskless deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: SettingsFileContents,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network_info(info: NetworkInfo) -> Self {
        Self {
            contents: SettingsFileContents {
                network_info: Some(info),
                parent_info: None,
            },
        }
    }
}

impl SettingsStore for MemoryStore {
    fn network_info(&self) -> Option<NetworkInfo> {
        self.contents.network_info.clone()
    }

    fn save_network_info(&mut self, info: &NetworkInfo) -> Result<(), SettingsError> {
        self.contents.network_info = Some(info.clone());
        Ok(())
    }

    fn parent_info(&self) -> Option<ParentInfo> {
        self.contents.parent_info.clone()
    }

    fn save_parent_info(&mut self, info: &ParentInfo) -> Result<(), SettingsError> {
        self.contents.parent_info = Some(info.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), SettingsError> {
        self.contents = SettingsFileContents::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn sample_info() -> NetworkInfo {
        NetworkInfo {
            role: Role::Child.as_u8(),
            device_mode: 0x0B,
            rloc16: 0x4401,
            key_epoch: 12,
            mle_frame_counter: 500,
            link_frame_counter: 700,
            previous_partition_id: 9,
            ext_addr: [1, 2, 3, 4, 5, 6, 7, 8],
        }
    }

    fn temp_path() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("numimesh-settings-{nanos}.toml"))
    }

    #[test]
    fn file_store_round_trip() {
        let path = temp_path();
        let mut store = FileStore::open(&path).unwrap();
        assert!(store.network_info().is_none());

        let info = sample_info();
        store.save_network_info(&info).unwrap();
        store
            .save_parent_info(&ParentInfo {
                ext_addr: [9; 8],
                version: 4,
            })
            .unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.network_info(), Some(info));
        assert_eq!(reopened.parent_info().unwrap().version, 4);

        let mut store = reopened;
        store.clear().unwrap();
        assert!(FileStore::open(&path).unwrap().network_info().is_none());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn restorable_requires_attached_role_and_valid_rloc() {
        let mut info = sample_info();
        assert!(info.is_restorable());

        info.role = Role::Detached.as_u8();
        assert!(!info.is_restorable());

        info.role = Role::Router.as_u8();
        info.rloc16 = 0xFFFE;
        assert!(!info.is_restorable());
    }
}
