//! Fixed-size on-disk records.
//!
//! Every record is little-endian with explicit offsets so files written by one
//! firmware build stay readable by the next.

use heapless::Vec;

pub type Vector3 = [f32; 3];
pub type Matrix3 = [[f32; 3]; 3];

pub const IDENTITY: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

pub const SENSOR_CONFIG_PAYLOAD_LEN: usize = 108;
pub const SENSOR_CONFIG_RECORD_LEN: usize = 4 + SENSOR_CONFIG_PAYLOAD_LEN;
pub const SENSOR_TOGGLE_RECORD_LEN: usize = 4;
pub const TEMPERATURE_CALIBRATION_RECORD_LEN: usize = 76;

pub const CURRENT_CONFIG_VERSION: i32 = 2;
pub const OLDEST_CONFIG_VERSION: i32 = 1;
pub const DEVICE_CONFIG_V1_LEN: usize = 4;
pub const DEVICE_CONFIG_V2_LEN: usize = 8;
pub const DEVICE_CONFIG_MAX_LEN: usize = DEVICE_CONFIG_V2_LEN;

/// Raw device record bytes in whatever layout its version field names.
pub type DeviceImage = Vec<u8, DEVICE_CONFIG_MAX_LEN>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordError {
    Length { expected: usize, found: usize },
    UnknownTag(u8),
    InvalidField,
    UnsupportedVersion(i32),
}

struct RecordWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> RecordWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn skip(&mut self, count: usize) {
        self.pos += count;
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    fn put_f32(&mut self, value: f32) {
        self.put_bytes(&value.to_le_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.put_bytes(&value.to_le_bytes());
    }

    fn put_vector(&mut self, value: &Vector3) {
        for component in value {
            self.put_f32(*component);
        }
    }

    fn put_matrix(&mut self, value: &Matrix3) {
        for row in value {
            self.put_vector(row);
        }
    }

    fn put_int_vector(&mut self, value: &[i32; 3]) {
        for component in value {
            self.put_i32(*component);
        }
    }
}

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn skip(&mut self, count: usize) {
        self.pos += count;
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn vector(&mut self) -> Vector3 {
        [self.f32(), self.f32(), self.f32()]
    }

    fn matrix(&mut self) -> Matrix3 {
        [self.vector(), self.vector(), self.vector()]
    }

    fn int_vector(&mut self) -> [i32; 3] {
        [self.i32(), self.i32(), self.i32()]
    }
}

fn expect_len(bytes: &[u8], expected: usize) -> Result<(), RecordError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(RecordError::Length {
            expected,
            found: bytes.len(),
        })
    }
}

/// Stored discriminant of a [`SensorConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SensorConfigType {
    None = 0,
    Bmi160 = 1,
    Mpu6050 = 2,
    Mpu9250 = 3,
    Icm20948 = 4,
    SoftFusion = 5,
    Bno0xx = 6,
    RuntimeCalibration = 7,
}

impl SensorConfigType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Bmi160,
            2 => Self::Mpu6050,
            3 => Self::Mpu9250,
            4 => Self::Icm20948,
            5 => Self::SoftFusion,
            6 => Self::Bno0xx,
            7 => Self::RuntimeCalibration,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Bmi160 => "BMI160",
            Self::Mpu6050 => "MPU6050",
            Self::Mpu9250 => "MPU9250",
            Self::Icm20948 => "ICM20948",
            Self::SoftFusion => "SoftFusion (common)",
            Self::Bno0xx => "BNO0XX",
            Self::RuntimeCalibration => "Runtime calibration",
        }
    }
}

/// Accelerometer bias/correction plus gyro offset, captured at `temperature`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OffsetCalibration {
    pub a_b: Vector3,
    pub a_ainv: Matrix3,
    pub g_off: Vector3,
    pub temperature: f32,
}

impl Default for OffsetCalibration {
    fn default() -> Self {
        Self {
            a_b: [0.0; 3],
            a_ainv: IDENTITY,
            g_off: [0.0; 3],
            temperature: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Mpu6050Calibration {
    pub a_b: Vector3,
    pub g_off: Vector3,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mpu9250Calibration {
    pub a_b: Vector3,
    pub a_ainv: Matrix3,
    pub m_b: Vector3,
    pub m_ainv: Matrix3,
    pub g_off: Vector3,
}

impl Default for Mpu9250Calibration {
    fn default() -> Self {
        Self {
            a_b: [0.0; 3],
            a_ainv: IDENTITY,
            m_b: [0.0; 3],
            m_ainv: IDENTITY,
            g_off: [0.0; 3],
        }
    }
}

/// Raw bias registers as read back from the chip.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Icm20948Calibration {
    pub g: [i32; 3],
    pub a: [i32; 3],
    pub c: [i32; 3],
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Bno0xxCalibration {
    pub mag_enabled: bool,
}

/// Persisted calibration of one sensor slot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum SensorConfig {
    #[default]
    None,
    Bmi160(OffsetCalibration),
    Mpu6050(Mpu6050Calibration),
    Mpu9250(Mpu9250Calibration),
    Icm20948(Icm20948Calibration),
    SoftFusion(OffsetCalibration),
    Bno0xx(Bno0xxCalibration),
    RuntimeCalibration,
}

impl SensorConfig {
    pub const fn kind(&self) -> SensorConfigType {
        match self {
            Self::None => SensorConfigType::None,
            Self::Bmi160(_) => SensorConfigType::Bmi160,
            Self::Mpu6050(_) => SensorConfigType::Mpu6050,
            Self::Mpu9250(_) => SensorConfigType::Mpu9250,
            Self::Icm20948(_) => SensorConfigType::Icm20948,
            Self::SoftFusion(_) => SensorConfigType::SoftFusion,
            Self::Bno0xx(_) => SensorConfigType::Bno0xx,
            Self::RuntimeCalibration => SensorConfigType::RuntimeCalibration,
        }
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn encode(&self) -> [u8; SENSOR_CONFIG_RECORD_LEN] {
        let mut buf = [0u8; SENSOR_CONFIG_RECORD_LEN];
        let mut writer = RecordWriter::new(&mut buf);
        writer.put_u8(self.kind() as u8);
        writer.skip(3);

        match self {
            Self::None | Self::RuntimeCalibration => {}
            Self::Bmi160(cal) | Self::SoftFusion(cal) => {
                writer.put_vector(&cal.a_b);
                writer.put_matrix(&cal.a_ainv);
                writer.put_vector(&cal.g_off);
                writer.put_f32(cal.temperature);
            }
            Self::Mpu6050(cal) => {
                writer.put_vector(&cal.a_b);
                writer.put_vector(&cal.g_off);
            }
            Self::Mpu9250(cal) => {
                writer.put_vector(&cal.a_b);
                writer.put_matrix(&cal.a_ainv);
                writer.put_vector(&cal.m_b);
                writer.put_matrix(&cal.m_ainv);
                writer.put_vector(&cal.g_off);
            }
            Self::Icm20948(cal) => {
                writer.put_int_vector(&cal.g);
                writer.put_int_vector(&cal.a);
                writer.put_int_vector(&cal.c);
            }
            Self::Bno0xx(cal) => writer.put_u8(cal.mag_enabled as u8),
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        expect_len(bytes, SENSOR_CONFIG_RECORD_LEN)?;
        let mut reader = RecordReader::new(bytes);
        let raw_tag = reader.u8();
        let kind = SensorConfigType::from_raw(raw_tag).ok_or(RecordError::UnknownTag(raw_tag))?;
        reader.skip(3);

        let config = match kind {
            SensorConfigType::None => Self::None,
            SensorConfigType::RuntimeCalibration => Self::RuntimeCalibration,
            SensorConfigType::Bmi160 | SensorConfigType::SoftFusion => {
                let cal = OffsetCalibration {
                    a_b: reader.vector(),
                    a_ainv: reader.matrix(),
                    g_off: reader.vector(),
                    temperature: reader.f32(),
                };
                if kind == SensorConfigType::Bmi160 {
                    Self::Bmi160(cal)
                } else {
                    Self::SoftFusion(cal)
                }
            }
            SensorConfigType::Mpu6050 => Self::Mpu6050(Mpu6050Calibration {
                a_b: reader.vector(),
                g_off: reader.vector(),
            }),
            SensorConfigType::Mpu9250 => Self::Mpu9250(Mpu9250Calibration {
                a_b: reader.vector(),
                a_ainv: reader.matrix(),
                m_b: reader.vector(),
                m_ainv: reader.matrix(),
                g_off: reader.vector(),
            }),
            SensorConfigType::Icm20948 => Self::Icm20948(Icm20948Calibration {
                g: reader.int_vector(),
                a: reader.int_vector(),
                c: reader.int_vector(),
            }),
            SensorConfigType::Bno0xx => {
                let mag_enabled = match reader.u8() {
                    0 => false,
                    1 => true,
                    _ => return Err(RecordError::InvalidField),
                };
                Self::Bno0xx(Bno0xxCalibration { mag_enabled })
            }
        };
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SensorToggle {
    MagEnabled = 0,
    CalibrationEnabled = 1,
    TempGradientCalibrationEnabled = 2,
}

impl SensorToggle {
    pub const ALL: [SensorToggle; 3] = [
        SensorToggle::MagEnabled,
        SensorToggle::CalibrationEnabled,
        SensorToggle::TempGradientCalibrationEnabled,
    ];

    const fn mask(self) -> u16 {
        1 << (self as u8)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MagEnabled => "MagEnabled",
            Self::CalibrationEnabled => "CalibrationEnabled",
            Self::TempGradientCalibrationEnabled => "TempGradientCalibrationEnabled",
        }
    }
}

const KNOWN_TOGGLE_BITS: u16 = 0b111;

/// Per-slot feature switches. Every toggle starts enabled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SensorToggleState {
    bits: u16,
}

impl SensorToggleState {
    pub const fn new() -> Self {
        Self {
            bits: KNOWN_TOGGLE_BITS,
        }
    }

    pub const fn get(self, toggle: SensorToggle) -> bool {
        self.bits & toggle.mask() != 0
    }

    pub fn set(&mut self, toggle: SensorToggle, enabled: bool) {
        if enabled {
            self.bits |= toggle.mask();
        } else {
            self.bits &= !toggle.mask();
        }
    }

    pub const fn with(mut self, toggle: SensorToggle, enabled: bool) -> Self {
        if enabled {
            self.bits |= toggle.mask();
        } else {
            self.bits &= !toggle.mask();
        }
        self
    }

    pub fn encode(&self) -> [u8; SENSOR_TOGGLE_RECORD_LEN] {
        let mut buf = [0u8; SENSOR_TOGGLE_RECORD_LEN];
        buf[0..2].copy_from_slice(&self.bits.to_le_bytes());
        buf
    }

    /// Unknown bits from newer firmware are dropped.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        expect_len(bytes, SENSOR_TOGGLE_RECORD_LEN)?;
        let bits = u16::from_le_bytes([bytes[0], bytes[1]]);
        Ok(Self {
            bits: bits & KNOWN_TOGGLE_BITS,
        })
    }
}

impl Default for SensorToggleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cubic gyro drift model fitted over a temperature range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GyroTemperatureCalibrationConfig {
    pub kind: SensorConfigType,
    pub sensitivity_lsb: f32,
    pub min_temperature_range: f32,
    pub max_temperature_range: f32,
    pub min_calibrated_temperature: f32,
    pub max_calibrated_temperature: f32,
    pub coefficients: [[f32; 4]; 3],
    pub samples_total: u32,
}

impl GyroTemperatureCalibrationConfig {
    pub const fn new(kind: SensorConfigType, sensitivity_lsb: f32) -> Self {
        Self {
            kind,
            sensitivity_lsb,
            min_temperature_range: 1000.0,
            max_temperature_range: -1000.0,
            min_calibrated_temperature: 0.0,
            max_calibrated_temperature: 0.0,
            coefficients: [[0.0; 4]; 3],
            samples_total: 0,
        }
    }

    pub fn encode(&self) -> [u8; TEMPERATURE_CALIBRATION_RECORD_LEN] {
        let mut buf = [0u8; TEMPERATURE_CALIBRATION_RECORD_LEN];
        let mut writer = RecordWriter::new(&mut buf);
        writer.put_u8(self.kind as u8);
        writer.skip(3);
        writer.put_f32(self.sensitivity_lsb);
        writer.put_f32(self.min_temperature_range);
        writer.put_f32(self.max_temperature_range);
        writer.put_f32(self.min_calibrated_temperature);
        writer.put_f32(self.max_calibrated_temperature);
        for axis in &self.coefficients {
            for coefficient in axis {
                writer.put_f32(*coefficient);
            }
        }
        writer.put_bytes(&self.samples_total.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        expect_len(bytes, TEMPERATURE_CALIBRATION_RECORD_LEN)?;
        let mut reader = RecordReader::new(bytes);
        let raw_tag = reader.u8();
        let kind = SensorConfigType::from_raw(raw_tag).ok_or(RecordError::UnknownTag(raw_tag))?;
        reader.skip(3);

        let sensitivity_lsb = reader.f32();
        let min_temperature_range = reader.f32();
        let max_temperature_range = reader.f32();
        let min_calibrated_temperature = reader.f32();
        let max_calibrated_temperature = reader.f32();
        let mut coefficients = [[0.0f32; 4]; 3];
        for axis in coefficients.iter_mut() {
            for coefficient in axis.iter_mut() {
                *coefficient = reader.f32();
            }
        }
        let samples_total = u32::from_le_bytes(reader.take());

        Ok(Self {
            kind,
            sensitivity_lsb,
            min_temperature_range,
            max_temperature_range,
            min_calibrated_temperature,
            max_calibrated_temperature,
            coefficients,
            samples_total,
        })
    }
}

/// Device-wide persisted settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceConfig {
    pub version: i32,
    /// Raw [`PowerSavingMode`](crate::network::PowerSavingMode) value.
    pub power_saving: u8,
    pub status_led: bool,
}

impl DeviceConfig {
    pub const fn new() -> Self {
        Self {
            version: CURRENT_CONFIG_VERSION,
            power_saving: crate::network::PowerSavingMode::DEFAULT as u8,
            status_led: true,
        }
    }

    pub const fn oldest() -> Self {
        Self {
            version: OLDEST_CONFIG_VERSION,
            ..Self::new()
        }
    }

    pub const fn layout_len(version: i32) -> Option<usize> {
        match version {
            1 => Some(DEVICE_CONFIG_V1_LEN),
            2 => Some(DEVICE_CONFIG_V2_LEN),
            _ => None,
        }
    }

    /// Serializes with the layout of `self.version`.
    pub fn encode(&self) -> Result<DeviceImage, RecordError> {
        let len =
            Self::layout_len(self.version).ok_or(RecordError::UnsupportedVersion(self.version))?;
        let mut buf = [0u8; DEVICE_CONFIG_MAX_LEN];
        let mut writer = RecordWriter::new(&mut buf);
        writer.put_i32(self.version);
        if self.version >= 2 {
            writer.put_u8(self.power_saving);
            writer.put_u8(self.status_led as u8);
        }

        let mut image = DeviceImage::new();
        image
            .extend_from_slice(&buf[..len])
            .map_err(|_| RecordError::InvalidField)?;
        Ok(image)
    }

    /// Version field only; readable from every layout.
    pub fn peek_version(bytes: &[u8]) -> Result<i32, RecordError> {
        if bytes.len() < 4 {
            return Err(RecordError::Length {
                expected: 4,
                found: bytes.len(),
            });
        }
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Parses a current-layout image.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let version = Self::peek_version(bytes)?;
        if version != CURRENT_CONFIG_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        expect_len(bytes, DEVICE_CONFIG_V2_LEN)?;

        let status_led = match bytes[5] {
            0 => false,
            1 => true,
            _ => return Err(RecordError::InvalidField),
        };
        Ok(Self {
            version,
            power_saving: bytes[4],
            status_led,
        })
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_record_layout_is_fixed() {
        let config = SensorConfig::Mpu6050(Mpu6050Calibration {
            a_b: [1.0, 2.0, 3.0],
            g_off: [-1.0, 0.5, 0.25],
        });
        let bytes = config.encode();

        assert_eq!(bytes.len(), 112);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[16..20], &(-1.0f32).to_le_bytes());
        assert!(bytes[28..].iter().all(|b| *b == 0));
        assert_eq!(SensorConfig::decode(&bytes), Ok(config));
    }

    #[test]
    fn mpu9250_fills_the_whole_payload() {
        let config = SensorConfig::Mpu9250(Mpu9250Calibration {
            g_off: [7.0, 8.0, 9.0],
            ..Mpu9250Calibration::default()
        });
        let bytes = config.encode();
        assert_eq!(&bytes[100..112], &{
            let mut tail = [0u8; 12];
            tail[0..4].copy_from_slice(&7.0f32.to_le_bytes());
            tail[4..8].copy_from_slice(&8.0f32.to_le_bytes());
            tail[8..12].copy_from_slice(&9.0f32.to_le_bytes());
            tail
        });
        assert_eq!(SensorConfig::decode(&bytes), Ok(config));
    }

    #[test]
    fn sensor_record_rejects_bad_input() {
        let mut bytes = SensorConfig::RuntimeCalibration.encode();
        assert_eq!(
            SensorConfig::decode(&bytes[..100]),
            Err(RecordError::Length {
                expected: 112,
                found: 100
            })
        );

        bytes[0] = 42;
        assert_eq!(
            SensorConfig::decode(&bytes),
            Err(RecordError::UnknownTag(42))
        );

        let mut bno = SensorConfig::Bno0xx(Bno0xxCalibration { mag_enabled: true }).encode();
        bno[4] = 9;
        assert_eq!(SensorConfig::decode(&bno), Err(RecordError::InvalidField));
    }

    #[test]
    fn toggles_default_enabled_and_drop_unknown_bits() {
        let state = SensorToggleState::default();
        for toggle in SensorToggle::ALL {
            assert!(state.get(toggle), "{} should default on", toggle.as_str());
        }

        let decoded = SensorToggleState::decode(&[0b1111_0010, 0xFF, 0, 0]).unwrap();
        assert!(!decoded.get(SensorToggle::MagEnabled));
        assert!(decoded.get(SensorToggle::CalibrationEnabled));
        assert!(!decoded.get(SensorToggle::TempGradientCalibrationEnabled));
        assert_eq!(decoded.encode(), [0b0000_0010, 0, 0, 0]);
    }

    #[test]
    fn temperature_record_is_76_bytes() {
        let mut config = GyroTemperatureCalibrationConfig::new(SensorConfigType::SoftFusion, 16.4);
        config.coefficients[2][3] = 0.125;
        config.samples_total = 900;
        let bytes = config.encode();

        assert_eq!(bytes.len(), 76);
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[68..72], &0.125f32.to_le_bytes());
        assert_eq!(&bytes[72..76], &900u32.to_le_bytes());
        assert_eq!(GyroTemperatureCalibrationConfig::decode(&bytes), Ok(config));
    }

    #[test]
    fn device_record_layout_follows_version() {
        let current = DeviceConfig::new().encode().unwrap();
        assert_eq!(current.len(), 8);
        assert_eq!(DeviceConfig::peek_version(&current), Ok(2));
        assert_eq!(DeviceConfig::decode(&current), Ok(DeviceConfig::new()));

        let oldest = DeviceConfig::oldest().encode().unwrap();
        assert_eq!(oldest.as_slice(), &1i32.to_le_bytes());
        assert_eq!(
            DeviceConfig::decode(&oldest),
            Err(RecordError::UnsupportedVersion(1))
        );
    }
}
