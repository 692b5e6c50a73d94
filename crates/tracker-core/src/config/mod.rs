//! Persistent device configuration and per-sensor calibration store.
//!
//! Layout on the block filesystem:
//!
//! - `/config.bin`: the [`DeviceConfig`] record, version field first.
//! - `/calibrations/<id>`: one [`SensorConfig`] per non-empty slot.
//! - `/sensortoggles/<id>`: one [`SensorToggleState`] per non-empty slot.
//! - `/tempcalibrations/<id>`: [`GyroTemperatureCalibrationConfig`], managed
//!   independently of the other tables.

use heapless::Vec;
use log::{debug, error, info, trace, warn};

use crate::{
    fs::{
        FileHandle, Filesystem, OpenMode, ensure_directory, for_each_file, join_path, read_fully,
        slot_path, write_fully,
    },
    network::PowerSavingMode,
    status::{Status, StatusFlags},
};

mod migration;
pub mod records;

pub use records::{
    Bno0xxCalibration, CURRENT_CONFIG_VERSION, DeviceConfig, DeviceImage,
    GyroTemperatureCalibrationConfig, Icm20948Calibration, Matrix3, Mpu6050Calibration,
    Mpu9250Calibration, OLDEST_CONFIG_VERSION, OffsetCalibration, RecordError, SensorConfig,
    SensorConfigType, SensorToggle, SensorToggleState, Vector3,
};

pub const MAX_SENSORS: usize = 16;

pub const CONFIG_FILE: &str = "/config.bin";
pub const DIR_CALIBRATIONS: &str = "/calibrations";
pub const DIR_TEMPERATURE_CALIBRATIONS: &str = "/tempcalibrations";
pub const DIR_TOGGLES_LEGACY: &str = "/toggles";
pub const DIR_TOGGLES: &str = "/sensortoggles";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfigError {
    Mount,
    Format,
    Io,
    Corrupted,
    Migration { from: i32 },
    UnsupportedVersion(i32),
    SlotOutOfRange(usize),
    NoneTagged,
    NotLoaded,
    PartialWrite { failed: u8 },
}

/// In-memory mirror of everything persisted under the filesystem root.
pub struct Configuration<F> {
    fs: F,
    mounted: bool,
    loaded: bool,
    device: DeviceConfig,
    sensors: Vec<SensorConfig, MAX_SENSORS>,
    toggles: Vec<SensorToggleState, MAX_SENSORS>,
}

impl<F: Filesystem> Configuration<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            mounted: false,
            loaded: false,
            device: DeviceConfig::new(),
            sensors: Vec::new(),
            toggles: Vec::new(),
        }
    }

    /// Mounts the filesystem and populates the mirror. No-op once loaded.
    ///
    /// On error the store stays un-loaded and serves defaults.
    pub fn load(&mut self, status: &StatusFlags) -> Result<(), ConfigError> {
        if self.loaded {
            return Ok(());
        }

        status.set_status(Status::Loading, true);
        let result = self.load_from_disk();
        status.set_status(Status::Loading, false);
        status.set_status(Status::StorageError, result.is_err());

        if let Err(err) = result {
            error!("config: load failed: {:?}", err);
        }
        result
    }

    fn load_from_disk(&mut self) -> Result<(), ConfigError> {
        self.mount()?;

        if self.fs.exists(CONFIG_FILE) {
            trace!("config: found configuration file");
            let mut image = self.read_device_image()?;
            let version = DeviceConfig::peek_version(&image).map_err(|_| ConfigError::Corrupted)?;

            if version > CURRENT_CONFIG_VERSION {
                error!(
                    "config: v{} is newer than supported v{}",
                    version, CURRENT_CONFIG_VERSION
                );
                return Err(ConfigError::UnsupportedVersion(version));
            }

            if version < CURRENT_CONFIG_VERSION {
                debug!(
                    "config: outdated v{} < v{}",
                    version, CURRENT_CONFIG_VERSION
                );
                if let Err(err) = self.run_migration(version, &mut image) {
                    error!(
                        "config: failed to migrate from v{} to v{}",
                        version, CURRENT_CONFIG_VERSION
                    );
                    return Err(err);
                }
                if let Err(err) = write_record(&mut self.fs, CONFIG_FILE, &image) {
                    warn!("config: migrated record not persisted: {:?}", err);
                }
            } else {
                info!("config: found up-to-date configuration v{}", version);
            }

            self.device = DeviceConfig::decode(&image).map_err(|err| {
                error!("config: device record unreadable: {:?}", err);
                ConfigError::Corrupted
            })?;
        } else {
            info!("config: no configuration file found, creating new one");
            self.device = DeviceConfig::new();
            if let Err(err) = self.write_all() {
                warn!("config: initial save incomplete: {:?}", err);
            }
        }

        self.load_sensors();
        self.loaded = true;
        info!("config: loaded configuration");
        Ok(())
    }

    fn mount(&mut self) -> Result<(), ConfigError> {
        if self.mounted {
            return Ok(());
        }

        if let Err(err) = self.fs.mount() {
            warn!("config: could not mount filesystem ({:?}), formatting", err);
            if let Err(err) = self.fs.format() {
                error!("config: could not format filesystem ({:?}), aborting", err);
                return Err(ConfigError::Format);
            }
            if let Err(err) = self.fs.mount() {
                error!("config: mount after format failed ({:?})", err);
                return Err(ConfigError::Mount);
            }
        }

        self.mounted = true;
        Ok(())
    }

    fn read_device_image(&mut self) -> Result<DeviceImage, ConfigError> {
        let mut buf = [0u8; records::DEVICE_CONFIG_MAX_LEN + 1];
        let read = {
            let mut file = self
                .fs
                .open(CONFIG_FILE, OpenMode::Read)
                .map_err(|_| ConfigError::Io)?;
            if file.is_directory() {
                return Err(ConfigError::Corrupted);
            }
            read_fully(&mut file, &mut buf).map_err(|_| ConfigError::Io)?
        };

        // Larger than any layout we know: only tolerated far enough to read
        // the version and report it as unsupported.
        if read > records::DEVICE_CONFIG_MAX_LEN {
            return match DeviceConfig::peek_version(&buf) {
                Ok(version) if version > CURRENT_CONFIG_VERSION => {
                    Err(ConfigError::UnsupportedVersion(version))
                }
                _ => Err(ConfigError::Corrupted),
            };
        }

        let mut image = DeviceImage::new();
        image
            .extend_from_slice(&buf[..read])
            .map_err(|_| ConfigError::Corrupted)?;
        Ok(image)
    }

    fn load_sensors(&mut self) {
        let mut found_sensors: Vec<(usize, SensorConfig), MAX_SENSORS> = Vec::new();
        let scan = for_each_file(&mut self.fs, DIR_CALIBRATIONS, |fs, entry| {
            let Some(id) = parse_slot(&entry.name) else {
                debug!("config: skipping calibration file {}", entry.name);
                return;
            };
            let mut buf = [0u8; records::SENSOR_CONFIG_RECORD_LEN];
            let decoded = read_record(fs, &slot_path(DIR_CALIBRATIONS, id), &mut buf)
                .and_then(|len| SensorConfig::decode(&buf[..len]).map_err(|_| ConfigError::Corrupted));
            match decoded {
                Ok(config) => {
                    debug!(
                        "config: found sensor calibration for {} at index {}",
                        config.kind().as_str(),
                        id
                    );
                    let _ = found_sensors.push((id, config));
                }
                Err(err) => warn!("config: calibration {} unreadable: {:?}", id, err),
            }
        });
        if let Err(err) = scan {
            warn!("config: calibration scan failed: {:?}", err);
        }

        let mut found_toggles: Vec<(usize, SensorToggleState), MAX_SENSORS> = Vec::new();
        let scan = for_each_file(&mut self.fs, DIR_TOGGLES, |fs, entry| {
            let Some(id) = parse_slot(&entry.name) else {
                debug!("config: skipping toggle file {}", entry.name);
                return;
            };
            let mut buf = [0u8; records::SENSOR_TOGGLE_RECORD_LEN];
            let decoded = read_record(fs, &slot_path(DIR_TOGGLES, id), &mut buf).and_then(|len| {
                SensorToggleState::decode(&buf[..len]).map_err(|_| ConfigError::Corrupted)
            });
            match decoded {
                Ok(state) => {
                    debug!("config: found sensor toggle state at index {}", id);
                    let _ = found_toggles.push((id, state));
                }
                Err(err) => warn!("config: toggles {} unreadable: {:?}", id, err),
            }
        });
        if let Err(err) = scan {
            warn!("config: toggle scan failed: {:?}", err);
        }

        for (id, config) in found_sensors {
            if let SensorConfig::Bno0xx(bno) = config {
                let synthesized =
                    SensorToggleState::new().with(SensorToggle::MagEnabled, bno.mag_enabled);
                let _ = self.set_sensor_toggles(id, synthesized);
            }
            let _ = self.set_sensor(id, config);
        }
        for (id, state) in found_toggles {
            let _ = self.set_sensor_toggles(id, state);
        }
    }

    /// Writes every non-empty slot and the device record, and drops
    /// calibration files of slots that are empty now.
    ///
    /// Individual file failures are logged and counted without stopping the
    /// rest of the save. Refused until a load succeeded, so a record that
    /// failed to load stays on disk as it was.
    pub fn save(&mut self) -> Result<(), ConfigError> {
        if !self.mounted {
            return Err(ConfigError::Mount);
        }
        if !self.loaded {
            return Err(ConfigError::NotLoaded);
        }
        self.write_all()
    }

    fn write_all(&mut self) -> Result<(), ConfigError> {
        for dir in [DIR_CALIBRATIONS, DIR_TOGGLES] {
            if let Err(err) = ensure_directory(&mut self.fs, dir) {
                error!("config: could not create {}: {:?}", dir, err);
            }
        }

        let mut failed = 0u8;
        let sensors = &self.sensors;
        let pruned = for_each_file(&mut self.fs, DIR_CALIBRATIONS, |fs, entry| {
            let Some(id) = parse_slot(&entry.name) else {
                return;
            };
            if !sensors.get(id).is_none_or(SensorConfig::is_none) {
                return;
            }
            let path = join_path(DIR_CALIBRATIONS, &entry.name);
            trace!("config: removing cleared calibration {}", path);
            if let Err(err) = fs.remove(&path) {
                error!("config: failed to remove {}: {:?}", path, err);
                failed = failed.saturating_add(1);
            }
        });
        if let Err(err) = pruned {
            warn!("config: calibration scan failed: {:?}", err);
        }

        for (id, config) in self.sensors.iter().enumerate() {
            if config.is_none() {
                continue;
            }

            trace!("config: saving sensor config data for {}", id);
            let path = slot_path(DIR_CALIBRATIONS, id);
            if let Err(err) = write_record(&mut self.fs, &path, &config.encode()) {
                error!("config: failed to write {}: {:?}", path, err);
                failed = failed.saturating_add(1);
            }

            trace!("config: saving sensor toggle state for {}", id);
            let toggles = self.toggles.get(id).copied().unwrap_or_default();
            let path = slot_path(DIR_TOGGLES, id);
            if let Err(err) = write_record(&mut self.fs, &path, &toggles.encode()) {
                error!("config: failed to write {}: {:?}", path, err);
                failed = failed.saturating_add(1);
            }
        }

        let written = match self.device.encode() {
            Ok(image) => write_record(&mut self.fs, CONFIG_FILE, &image),
            Err(_) => Err(ConfigError::UnsupportedVersion(self.device.version)),
        };
        if let Err(err) = written {
            error!("config: failed to write {}: {:?}", CONFIG_FILE, err);
            failed = failed.saturating_add(1);
        }

        if failed > 0 {
            return Err(ConfigError::PartialWrite { failed });
        }
        debug!("config: saved configuration");
        Ok(())
    }

    /// Wipes the filesystem and writes back a minimal oldest-version record.
    ///
    /// Also the way out of a failed load: the store counts as loaded after.
    pub fn reset(&mut self) -> Result<(), ConfigError> {
        self.mount()?;
        self.fs.format().map_err(|err| {
            error!("config: format failed: {:?}", err);
            ConfigError::Format
        })?;

        self.sensors.clear();
        self.toggles.clear();
        self.device = DeviceConfig::oldest();
        self.loaded = true;
        self.write_all()?;

        debug!("config: reset configuration");
        Ok(())
    }

    /// Drops every sensor calibration. Toggles and temperature calibrations stay.
    pub fn erase_sensors(&mut self) -> Result<(), ConfigError> {
        if !self.mounted {
            return Err(ConfigError::Mount);
        }
        if !self.loaded {
            return Err(ConfigError::NotLoaded);
        }

        self.sensors.clear();
        for_each_file(&mut self.fs, DIR_CALIBRATIONS, |fs, entry| {
            let path = join_path(DIR_CALIBRATIONS, &entry.name);
            if let Err(err) = fs.remove(&path) {
                warn!("config: could not remove {}: {:?}", path, err);
            }
        })
        .map_err(|_| ConfigError::Io)?;

        self.save()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn version(&self) -> i32 {
        self.device.version
    }

    pub fn power_saving(&self) -> PowerSavingMode {
        PowerSavingMode::from_raw(self.device.power_saving)
    }

    pub fn set_power_saving(&mut self, mode: PowerSavingMode) {
        self.device.power_saving = mode as u8;
    }

    pub fn status_led_enabled(&self) -> bool {
        self.device.status_led
    }

    pub fn set_status_led_enabled(&mut self, enabled: bool) {
        self.device.status_led = enabled;
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn sensor(&self, id: usize) -> SensorConfig {
        self.sensors.get(id).copied().unwrap_or_default()
    }

    pub fn set_sensor(&mut self, id: usize, config: SensorConfig) -> Result<(), ConfigError> {
        set_slot(&mut self.sensors, id, config)
    }

    pub fn sensor_toggles(&self, id: usize) -> SensorToggleState {
        self.toggles.get(id).copied().unwrap_or_default()
    }

    pub fn set_sensor_toggles(
        &mut self,
        id: usize,
        state: SensorToggleState,
    ) -> Result<(), ConfigError> {
        set_slot(&mut self.toggles, id, state)
    }

    /// Stored record for `id`, only if it was written for `expected`.
    pub fn load_temperature_calibration(
        &mut self,
        id: usize,
        expected: SensorConfigType,
    ) -> Option<GyroTemperatureCalibrationConfig> {
        if !self.mounted {
            return None;
        }
        if let Err(err) = ensure_directory(&mut self.fs, DIR_TEMPERATURE_CALIBRATIONS) {
            warn!("config: temperature calibration directory unavailable: {:?}", err);
            return None;
        }

        let path = slot_path(DIR_TEMPERATURE_CALIBRATIONS, id);
        if !self.fs.exists(&path) {
            return None;
        }

        let mut buf = [0u8; records::TEMPERATURE_CALIBRATION_RECORD_LEN];
        let stored = match read_record(&mut self.fs, &path, &mut buf) {
            Ok(len) => GyroTemperatureCalibrationConfig::decode(&buf[..len]),
            Err(err) => {
                debug!("config: temperature calibration {} unreadable: {:?}", id, err);
                return None;
            }
        };

        match stored {
            Ok(config) if config.kind == expected => {
                debug!(
                    "config: found temperature calibration for {} sensorId:{}",
                    config.kind.as_str(),
                    id
                );
                Some(config)
            }
            Ok(config) => {
                debug!(
                    "config: incompatible temperature calibration (expected {}, found {}) sensorId:{}, skipping",
                    expected.as_str(),
                    config.kind.as_str(),
                    id
                );
                None
            }
            Err(err) => {
                debug!(
                    "config: incompatible temperature calibration ({:?}) sensorId:{}, skipping",
                    err, id
                );
                None
            }
        }
    }

    pub fn save_temperature_calibration(
        &mut self,
        id: usize,
        config: &GyroTemperatureCalibrationConfig,
    ) -> Result<(), ConfigError> {
        if config.kind == SensorConfigType::None {
            return Err(ConfigError::NoneTagged);
        }
        if !self.mounted {
            return Err(ConfigError::Mount);
        }

        ensure_directory(&mut self.fs, DIR_TEMPERATURE_CALIBRATIONS).map_err(|_| ConfigError::Io)?;
        trace!("config: saving temperature calibration data for sensorId:{}", id);
        write_record(
            &mut self.fs,
            &slot_path(DIR_TEMPERATURE_CALIBRATIONS, id),
            &config.encode(),
        )?;
        debug!("config: saved temperature calibration data for sensorId:{}", id);
        Ok(())
    }

    /// Dumps the device record and every sensor slot to the log.
    pub fn print(&self) {
        info!("Configuration:");
        info!("  Version: {}", self.device.version);
        info!("  Power saving: {:?}", self.power_saving());
        info!("  Status LED: {}", self.device.status_led);
        info!("  {} Sensors:", self.sensors.len());

        for (id, config) in self.sensors.iter().enumerate() {
            info!("    - [{:3}] {}", id, config.kind().as_str());
            match config {
                SensorConfig::None | SensorConfig::RuntimeCalibration => {}
                SensorConfig::Bmi160(cal) | SensorConfig::SoftFusion(cal) => {
                    print_vector("A_B        ", &cal.a_b);
                    print_matrix("A_Ainv     ", &cal.a_ainv);
                    print_vector("G_off      ", &cal.g_off);
                    info!("            Temperature: {}", cal.temperature);
                }
                SensorConfig::Mpu6050(cal) => {
                    print_vector("A_B  ", &cal.a_b);
                    print_vector("G_off", &cal.g_off);
                }
                SensorConfig::Mpu9250(cal) => {
                    print_vector("A_B   ", &cal.a_b);
                    print_matrix("A_Ainv", &cal.a_ainv);
                    print_vector("M_B   ", &cal.m_b);
                    print_matrix("M_Ainv", &cal.m_ainv);
                    print_vector("G_off ", &cal.g_off);
                }
                SensorConfig::Icm20948(cal) => {
                    info!("            G: {}, {}, {}", cal.g[0], cal.g[1], cal.g[2]);
                    info!("            A: {}, {}, {}", cal.a[0], cal.a[1], cal.a[2]);
                    info!("            C: {}, {}, {}", cal.c[0], cal.c[1], cal.c[2]);
                }
                SensorConfig::Bno0xx(cal) => {
                    info!("            magEnabled: {}", cal.mag_enabled);
                }
            }

            let toggles = self.sensor_toggles(id);
            for toggle in SensorToggle::ALL {
                trace!("            {}: {}", toggle.as_str(), toggles.get(toggle));
            }
        }
    }

    pub fn filesystem_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    pub fn into_filesystem(self) -> F {
        self.fs
    }
}

fn print_vector(label: &str, value: &Vector3) {
    info!("            {}: {}, {}, {}", label, value[0], value[1], value[2]);
}

fn print_matrix(label: &str, value: &Matrix3) {
    info!("            {}:", label);
    for row in value {
        info!("                         {}, {}, {}", row[0], row[1], row[2]);
    }
}

fn parse_slot(name: &str) -> Option<usize> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id = name.parse::<usize>().ok()?;
    if id >= MAX_SENSORS {
        warn!("config: slot {} beyond table capacity, skipping", id);
        return None;
    }
    Some(id)
}

fn set_slot<T: Copy + Default>(
    table: &mut Vec<T, MAX_SENSORS>,
    id: usize,
    value: T,
) -> Result<(), ConfigError> {
    if id >= MAX_SENSORS {
        return Err(ConfigError::SlotOutOfRange(id));
    }
    if id >= table.len() {
        table
            .resize_default(id + 1)
            .map_err(|_| ConfigError::SlotOutOfRange(id))?;
    }
    table[id] = value;
    Ok(())
}

/// Reads a whole fixed-size record, rejecting files of any other size.
fn read_record<F: Filesystem>(fs: &mut F, path: &str, buf: &mut [u8]) -> Result<usize, ConfigError> {
    let mut file = fs.open(path, OpenMode::Read).map_err(|_| ConfigError::Io)?;
    if file.is_directory() || file.size() as usize != buf.len() {
        return Err(ConfigError::Corrupted);
    }
    let read = read_fully(&mut file, buf).map_err(|_| ConfigError::Io)?;
    if read != buf.len() {
        return Err(ConfigError::Corrupted);
    }
    Ok(read)
}

fn write_record<F: Filesystem>(fs: &mut F, path: &str, bytes: &[u8]) -> Result<(), ConfigError> {
    let mut file = fs.open(path, OpenMode::Write).map_err(|err| {
        debug!("config: open {} for writing failed: {:?}", path, err);
        ConfigError::Io
    })?;
    let written = write_fully(&mut file, bytes).map_err(|_| ConfigError::Io)?;
    if written != bytes.len() {
        return Err(ConfigError::Io);
    }
    Ok(())
}
