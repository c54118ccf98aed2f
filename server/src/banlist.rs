//! Persistent moderation state: the ban list and saved per-player
//! permissions, stored as JSON next to the server binary.

use crate::permissions::ClientPermissions;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub ip: IpAddr,
    pub name: String,
    pub reason: String,
}

/// The ban list. Bans are by IP; the name and reason are kept for the
/// server log only.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BanList {
    entries: Vec<BanEntry>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl BanList {
    /// Loads the list from disk. A missing file is an empty list; a
    /// corrupt one is replaced after a warning rather than aborting
    /// startup.
    pub fn load(path: &Path) -> Self {
        let mut list = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<BanList>(&data) {
                Ok(list) => list,
                Err(e) => {
                    warn!("Ignoring unreadable ban list {}: {}", path.display(), e);
                    BanList::default()
                }
            },
            Err(_) => BanList::default(),
        };
        list.path = Some(path.to_path_buf());
        list
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        match serde_json::to_string_pretty(self) {
            Ok(data) => {
                if let Err(e) = std::fs::write(path, data) {
                    warn!("Failed to save ban list to {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Failed to serialize ban list: {}", e),
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.entries.iter().any(|entry| entry.ip == ip)
    }

    pub fn add(&mut self, ip: IpAddr, name: &str, reason: &str) {
        if self.is_banned(ip) {
            return;
        }
        info!("Banning {} ({}): {}", name, ip, reason);
        self.entries.push(BanEntry {
            ip,
            name: name.to_string(),
            reason: reason.to_string(),
        });
        self.save();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Permissions granted to known players, keyed by lowercased name and
/// restored on connect.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedPermissions {
    granted: HashMap<String, u16>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl SavedPermissions {
    pub fn load(path: &Path) -> Self {
        let mut saved = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<SavedPermissions>(&data) {
                Ok(saved) => saved,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable permissions file {}: {}",
                        path.display(),
                        e
                    );
                    SavedPermissions::default()
                }
            },
            Err(_) => SavedPermissions::default(),
        };
        saved.path = Some(path.to_path_buf());
        saved
    }

    pub fn get(&self, name: &str) -> ClientPermissions {
        self.granted
            .get(&name.to_lowercase())
            .map(|&bits| ClientPermissions::from_bits(bits))
            .unwrap_or(ClientPermissions::NONE)
    }

    pub fn set(&mut self, name: &str, permissions: ClientPermissions) {
        self.granted
            .insert(name.to_lowercase(), permissions.bits());
        if let Some(path) = &self.path {
            match serde_json::to_string_pretty(self) {
                Ok(data) => {
                    if let Err(e) = std::fs::write(path, data) {
                        warn!("Failed to save permissions to {}: {}", path.display(), e);
                    }
                }
                Err(e) => warn!("Failed to serialize permissions: {}", e),
            }
        }
    }
}
