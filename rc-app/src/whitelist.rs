//! File-backed admission list with mtime-driven reload.

use anyhow::Context;
use rc_context::{RootId, RootKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistData {
    #[serde(default)]
    pub user_ids: Vec<i64>,
    #[serde(default)]
    pub group_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<i64>,
}

struct Cached {
    data: WhitelistData,
    modified: Option<SystemTime>,
}

pub struct Whitelist {
    path: PathBuf,
    inner: Mutex<Cached>,
}

impl Whitelist {
    /// Load `path`, creating an empty list there when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let whitelist = Self {
            path,
            inner: Mutex::new(Cached {
                data: WhitelistData::default(),
                modified: None,
            }),
        };
        {
            let mut cached = whitelist.lock()?;
            if whitelist.path.exists() {
                whitelist.load_into(&mut cached)?;
            } else {
                if let Some(parent) = whitelist
                    .path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                whitelist.dump_from(&mut cached)?;
            }
        }
        Ok(whitelist)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_user(&self, user_id: i64) -> bool {
        self.check(|data| data.user_ids.contains(&user_id))
    }

    pub fn has_group(&self, group_id: i64) -> bool {
        self.check(|data| data.group_ids.contains(&group_id))
    }

    /// Whether conversations under `root` may be answered.
    pub fn admits(&self, root: RootId) -> bool {
        match root.kind {
            RootKind::User => self.has_user(root.id),
            RootKind::Group => self.has_group(root.id),
        }
    }

    /// Checks the cached admin without touching the file.
    pub fn is_admin(&self, user_id: i64) -> bool {
        match self.lock() {
            Ok(cached) => cached.data.admin == Some(user_id),
            Err(e) => {
                tracing::warn!(error = %e, "whitelist unavailable");
                false
            }
        }
    }

    pub fn add_user(&self, user_id: i64) -> anyhow::Result<()> {
        self.update(|data| data.user_ids.push(user_id))
    }

    pub fn add_group(&self, group_id: i64) -> anyhow::Result<()> {
        self.update(|data| data.group_ids.push(group_id))
    }

    /// Current list as compact JSON.
    pub fn show(&self) -> anyhow::Result<String> {
        let mut cached = self.lock()?;
        self.refresh(&mut cached)?;
        Ok(serde_json::to_string(&cached.data)?)
    }

    fn check(&self, predicate: impl FnOnce(&WhitelistData) -> bool) -> bool {
        let mut cached = match self.lock() {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(error = %e, "whitelist unavailable");
                return false;
            }
        };
        if let Err(e) = self.refresh(&mut cached) {
            tracing::warn!(path = %self.path.display(), error = %e, "whitelist reload failed");
            return false;
        }
        predicate(&cached.data)
    }

    fn update(&self, change: impl FnOnce(&mut WhitelistData)) -> anyhow::Result<()> {
        let mut cached = self.lock()?;
        self.refresh(&mut cached)?;
        change(&mut cached.data);
        self.dump_from(&mut cached)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Cached>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("whitelist lock poisoned"))
    }

    fn modified_on_disk(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn refresh(&self, cached: &mut Cached) -> anyhow::Result<()> {
        let on_disk = self.modified_on_disk();
        let changed = match (on_disk, cached.modified) {
            (Some(disk), Some(seen)) => disk > seen,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if changed {
            tracing::info!(path = %self.path.display(), "whitelist modified on disk, reloading");
            self.load_into(cached)?;
        }
        Ok(())
    }

    fn load_into(&self, cached: &mut Cached) -> anyhow::Result<()> {
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        cached.data = serde_json::from_slice(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        cached.modified = self.modified_on_disk();
        Ok(())
    }

    fn dump_from(&self, cached: &mut Cached) -> anyhow::Result<()> {
        let raw = serde_json::to_vec(&cached.data)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("write {}", self.path.display()))?;
        cached.modified = self.modified_on_disk();
        Ok(())
    }
}
