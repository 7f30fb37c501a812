use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};

use crate::model::AlarmDefinition;

/// Persistence collaborator owning [`AlarmDefinition`] records.
///
/// The engine reads definitions through this trait and only writes back the
/// bookkeeping fields a reconciliation reports.
pub trait AlarmRepository: Send + Sync {
    fn list(&self) -> Result<Vec<AlarmDefinition>>;
    fn load(&self, alarm_id: &str) -> Result<Option<AlarmDefinition>>;
    /// Inserts or replaces by id.
    fn save(&self, definition: &AlarmDefinition) -> Result<()>;
    /// Removing an unknown id is a no-op.
    fn remove(&self, alarm_id: &str) -> Result<()>;
    /// Read-modify-write of one record, serialized with `save` and `remove`
    /// so fields edited concurrently are not lost. `apply` returns whether it
    /// changed anything; unchanged or unknown records are not rewritten.
    fn update(
        &self,
        alarm_id: &str,
        apply: &mut dyn FnMut(&mut AlarmDefinition) -> bool,
    ) -> Result<bool>;
}

/// Stores all alarms as one JSON array on disk.
pub struct JsonAlarmRepository {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonAlarmRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<AlarmDefinition>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    fn write_all(&self, alarms: &[AlarmDefinition]) -> Result<()> {
        let payload = serde_json::to_string_pretty(alarms)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl AlarmRepository for JsonAlarmRepository {
    fn list(&self) -> Result<Vec<AlarmDefinition>> {
        self.read_all()
    }

    fn load(&self, alarm_id: &str) -> Result<Option<AlarmDefinition>> {
        Ok(self
            .read_all()?
            .into_iter()
            .find(|alarm| alarm.id == alarm_id))
    }

    fn save(&self, definition: &AlarmDefinition) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut alarms = self.read_all()?;
        match alarms.iter_mut().find(|alarm| alarm.id == definition.id) {
            Some(existing) => *existing = definition.clone(),
            None => alarms.push(definition.clone()),
        }
        self.write_all(&alarms)
    }

    fn remove(&self, alarm_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut alarms = self.read_all()?;
        let before = alarms.len();
        alarms.retain(|alarm| alarm.id != alarm_id);
        if alarms.len() == before {
            return Ok(());
        }
        self.write_all(&alarms)
    }

    fn update(
        &self,
        alarm_id: &str,
        apply: &mut dyn FnMut(&mut AlarmDefinition) -> bool,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut alarms = self.read_all()?;
        let Some(stored) = alarms.iter_mut().find(|alarm| alarm.id == alarm_id) else {
            return Ok(false);
        };
        if !apply(stored) {
            return Ok(false);
        }
        self.write_all(&alarms)?;
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryAlarmRepository {
    alarms: RwLock<Vec<AlarmDefinition>>,
}

impl InMemoryAlarmRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alarms(alarms: Vec<AlarmDefinition>) -> Self {
        Self {
            alarms: RwLock::new(alarms),
        }
    }
}

impl AlarmRepository for InMemoryAlarmRepository {
    fn list(&self) -> Result<Vec<AlarmDefinition>> {
        Ok(self.alarms.read().clone())
    }

    fn load(&self, alarm_id: &str) -> Result<Option<AlarmDefinition>> {
        Ok(self
            .alarms
            .read()
            .iter()
            .find(|alarm| alarm.id == alarm_id)
            .cloned())
    }

    fn save(&self, definition: &AlarmDefinition) -> Result<()> {
        let mut alarms = self.alarms.write();
        match alarms.iter_mut().find(|alarm| alarm.id == definition.id) {
            Some(existing) => *existing = definition.clone(),
            None => alarms.push(definition.clone()),
        }
        Ok(())
    }

    fn remove(&self, alarm_id: &str) -> Result<()> {
        self.alarms.write().retain(|alarm| alarm.id != alarm_id);
        Ok(())
    }

    fn update(
        &self,
        alarm_id: &str,
        apply: &mut dyn FnMut(&mut AlarmDefinition) -> bool,
    ) -> Result<bool> {
        let mut alarms = self.alarms.write();
        Ok(alarms
            .iter_mut()
            .find(|alarm| alarm.id == alarm_id)
            .map(|stored| apply(stored))
            .unwrap_or(false))
    }
}
