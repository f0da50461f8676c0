use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use super::ids::RenderNodeId;

/// A counted, named resource (e.g. a floating software license).
#[derive(Debug, Clone)]
pub struct License {
    pub name: String,
    pub maximum: u32,
    pub used: u32,
    pub current_using_render_nodes: Vec<RenderNodeId>,
}

impl License {
    pub fn new(name: impl Into<String>, maximum: u32) -> Self {
        Self {
            name: name.into(),
            maximum,
            used: 0,
            current_using_render_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("unknown license: {0}")]
    NotFound(String),
}

/// Counted named reservations, one per license name.
///
/// All operations run inside the single-threaded dispatch loop; there is no
/// cross-thread locking here, matching the concurrency model in which the
/// license manager is touched only by the tick that owns the tree.
#[derive(Debug, Default)]
pub struct LicenseManager {
    licenses: HashMap<String, License>,
}

impl LicenseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `<name> <maximum>` pairs from a line-oriented file. Lines
    /// starting with `#` and blank lines are skipped.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut manager = Self::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(name), Some(max_str)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Ok(maximum) = max_str.parse::<u32>() {
                manager.licenses.insert(name.to_owned(), License::new(name, maximum));
            }
        }
        Ok(manager)
    }

    pub fn get(&self, name: &str) -> Option<&License> {
        self.licenses.get(name)
    }

    /// Update (or create) the maximum for a named license. Existing holders
    /// are not evicted -- `used` can temporarily exceed `maximum` until
    /// enough holders release.
    pub fn set_max(&mut self, name: &str, maximum: u32) {
        self.licenses
            .entry(name.to_owned())
            .and_modify(|l| l.maximum = maximum)
            .or_insert_with(|| License::new(name, maximum));
    }

    /// Reserve one unit of `name` for `rn`. Returns `false` if the license
    /// is unknown or already at capacity.
    pub fn reserve(&mut self, name: &str, rn: RenderNodeId) -> bool {
        let Some(license) = self.licenses.get_mut(name) else {
            return false;
        };
        if license.used < license.maximum {
            license.used += 1;
            license.current_using_render_nodes.push(rn);
            true
        } else {
            false
        }
    }

    /// Release one unit of `name` held by `rn`. No-op if `rn` is not
    /// currently recorded as a holder, or the license is unknown.
    pub fn release(&mut self, name: &str, rn: RenderNodeId) -> Result<(), LicenseError> {
        let license = self
            .licenses
            .get_mut(name)
            .ok_or_else(|| LicenseError::NotFound(name.to_owned()))?;
        if let Some(pos) = license.current_using_render_nodes.iter().position(|&r| r == rn) {
            license.current_using_render_nodes.remove(pos);
            license.used = license.used.saturating_sub(1);
        }
        Ok(())
    }
}
