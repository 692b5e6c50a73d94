//! Forward migration of older device record layouts.

use log::{debug, info, warn};

use super::{
    CURRENT_CONFIG_VERSION, ConfigError, Configuration, DIR_TOGGLES, DIR_TOGGLES_LEGACY,
    DeviceConfig, DeviceImage,
    records::{DEVICE_CONFIG_V1_LEN, SENSOR_TOGGLE_RECORD_LEN},
};
use crate::fs::{
    Filesystem, OpenMode, ensure_directory, for_each_file, join_path, read_fully, write_fully,
};

impl<F: Filesystem> Configuration<F> {
    /// Rewrites `image` step by step until it carries the current layout.
    ///
    /// The image is validated before any step touches the filesystem, so an
    /// unknown or damaged source version leaves the disk as it was.
    pub fn run_migration(
        &mut self,
        from_version: i32,
        image: &mut DeviceImage,
    ) -> Result<(), ConfigError> {
        let mut version = from_version;
        while version < CURRENT_CONFIG_VERSION {
            match version {
                1 => self.migrate_v1_to_v2(image)?,
                _ => return Err(ConfigError::Migration { from: version }),
            }
            version += 1;
            info!("config: migrated configuration to v{}", version);
        }
        Ok(())
    }

    fn migrate_v1_to_v2(&mut self, image: &mut DeviceImage) -> Result<(), ConfigError> {
        if image.len() != DEVICE_CONFIG_V1_LEN || DeviceConfig::peek_version(image) != Ok(1) {
            return Err(ConfigError::Migration { from: 1 });
        }

        let upgraded = DeviceConfig {
            version: 2,
            ..DeviceConfig::new()
        }
        .encode()
        .map_err(|_| ConfigError::Migration { from: 1 })?;

        self.relocate_legacy_toggles();
        *image = upgraded;
        Ok(())
    }

    /// Moves `/toggles/<id>` into `/sensortoggles/<id>`. A file already in the
    /// new directory wins and the legacy copy is dropped.
    fn relocate_legacy_toggles(&mut self) {
        if !self.fs.is_directory(DIR_TOGGLES_LEGACY) {
            return;
        }
        if let Err(err) = ensure_directory(&mut self.fs, DIR_TOGGLES) {
            warn!("config: cannot create {}: {:?}", DIR_TOGGLES, err);
            return;
        }

        let moved = for_each_file(&mut self.fs, DIR_TOGGLES_LEGACY, |fs, entry| {
            let from = join_path(DIR_TOGGLES_LEGACY, &entry.name);
            let to = join_path(DIR_TOGGLES, &entry.name);

            if fs.exists(&to) {
                debug!("config: {} already present, dropping {}", to, from);
            } else if let Err(err) = copy_record(fs, &from, &to) {
                warn!("config: could not relocate {}: {:?}", from, err);
                return;
            }

            if let Err(err) = fs.remove(&from) {
                warn!("config: could not remove {}: {:?}", from, err);
            }
        });
        if let Err(err) = moved {
            warn!("config: legacy toggle scan failed: {:?}", err);
            return;
        }

        if let Err(err) = self.fs.remove(DIR_TOGGLES_LEGACY) {
            debug!("config: kept {}: {:?}", DIR_TOGGLES_LEGACY, err);
        }
    }
}

fn copy_record<F: Filesystem>(fs: &mut F, from: &str, to: &str) -> Result<(), ConfigError> {
    let mut buf = [0u8; SENSOR_TOGGLE_RECORD_LEN];
    let read = {
        let mut file = fs.open(from, OpenMode::Read).map_err(|_| ConfigError::Io)?;
        read_fully(&mut file, &mut buf).map_err(|_| ConfigError::Io)?
    };
    if read != SENSOR_TOGGLE_RECORD_LEN {
        return Err(ConfigError::Corrupted);
    }

    let mut file = fs.open(to, OpenMode::Write).map_err(|_| ConfigError::Io)?;
    let written = write_fully(&mut file, &buf).map_err(|_| ConfigError::Io)?;
    if written != buf.len() {
        return Err(ConfigError::Io);
    }
    Ok(())
}
