//! Persistence & factory defaults: a file-backed key-value store
//! standing in for the embedded non-volatile storage namespace of
//! §4.5, with record-level atomic writes and CRC-16 integrity.
//!
//! Grounded on `config.rs`'s `load_or_create`/`save` pattern (read,
//! parse-or-default, write-with-parent-dir-creation) but record-scoped
//! rather than whole-file, and with a temp-then-rename swap since a
//! half-written record here must never leave `calibration_valid`
//! readable-but-stale.

use std::fs;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_16_IBM_SDLC};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::engine::{CalibrationMatrix, DualCalibration, MatrixFlavor, MatrixSource};
use crate::error::{CoreError, CoreResult};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

const REC_LOW_MATRIX: &str = "low_ir_matrix";
const REC_HIGH_MATRIX: &str = "high_ir_matrix";
const REC_LOW_SCALE: &str = "low_ir_scale";
const REC_HIGH_SCALE: &str = "high_ir_scale";
const REC_DUAL_MODE: &str = "dual_mode";
const REC_VALID: &str = "calibration_valid";
const REC_TIMESTAMP: &str = "calibration_timestamp";
const REC_THRESHOLDS: &str = "ir_thresholds";

/// Factory-embedded matrices producing a neutral-white sRGB output for
/// a nominal sensor reading, with a small negative IR coefficient for
/// baseline IR rejection (§4.5). Row sums approximate the D65 white
/// point's X:Y:Z ratio (≈0.95:1:1.09) so an equal x=y=z reading lands
/// near neutral; `neutral_scale` is tuned so the nominal
/// x=y=z=8000, ir=800 reading normalizes into a near-white band with
/// every sRGB channel above 200 (§8 scenario 1).
pub fn factory_default_dual_calibration() -> DualCalibration {
    let neutral_scale = 1.0 / 9_500.0;
    let low = CalibrationMatrix::from_rows(
        [
            [0.40, 0.35, 0.18, -0.02],
            [0.21, 0.72, 0.07, -0.01],
            [0.02, 0.12, 0.95, -0.03],
        ],
        (neutral_scale, neutral_scale, neutral_scale),
        MatrixSource::FactoryLow,
        0,
        MatrixFlavor::XyzAffine4x4,
    );
    let high = CalibrationMatrix::from_rows(
        [
            [0.42, 0.33, 0.16, -0.05],
            [0.22, 0.70, 0.06, -0.03],
            [0.03, 0.11, 0.90, -0.06],
        ],
        (neutral_scale, neutral_scale, neutral_scale),
        MatrixSource::FactoryHigh,
        0,
        MatrixFlavor::XyzAffine4x4,
    );
    DualCalibration {
        low_ir: low,
        high_ir: high,
        dual_enabled: true,
        ir_threshold_low: 0.15,
        ir_threshold_high: 0.35,
    }
}

fn encode_matrix(m: &CalibrationMatrix) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 * 8);
    for v in &m.entries {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

fn decode_matrix(
    bytes: &[u8],
    scale: (f64, f64, f64),
    flavor: MatrixFlavor,
    source: MatrixSource,
    timestamp_ms: u64,
) -> CoreResult<CalibrationMatrix> {
    if bytes.len() != 16 * 8 {
        return Err(CoreError::StorageFailed(format!(
            "matrix record length mismatch: expected {}, got {}",
            16 * 8,
            bytes.len()
        )));
    }
    let mut entries = [0.0f64; 16];
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        entries[i] = f64::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(CalibrationMatrix {
        entries,
        k_x: scale.0,
        k_y: scale.1,
        k_z: scale.2,
        valid: true,
        timestamp_ms,
        source,
        quality_score: 0.0,
        flavor,
    })
}

/// Encode a matrix's per-axis scale plus its flavor, extending §4.5's
/// named 12-byte `*_ir_scale` record with a trailing flavor byte since
/// `MatrixFlavor` has no record of its own in that schema (it predates
/// it — §9 Open Question #1). Scale factors are stored as f32 per the
/// spec's 12-byte (3 x f32) sizing.
fn encode_scale(m: &CalibrationMatrix) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13);
    buf.extend_from_slice(&(m.k_x as f32).to_le_bytes());
    buf.extend_from_slice(&(m.k_y as f32).to_le_bytes());
    buf.extend_from_slice(&(m.k_z as f32).to_le_bytes());
    buf.push(match m.flavor {
        MatrixFlavor::XyzAffine4x4 => 0,
        MatrixFlavor::RgbAffine3x4 => 1,
    });
    buf
}

fn decode_scale(bytes: &[u8]) -> CoreResult<(f64, f64, f64, MatrixFlavor)> {
    if bytes.len() != 13 {
        return Err(CoreError::StorageFailed(format!(
            "scale record length mismatch: expected 13, got {}",
            bytes.len()
        )));
    }
    let k_x = f32::from_le_bytes(bytes[0..4].try_into().unwrap()) as f64;
    let k_y = f32::from_le_bytes(bytes[4..8].try_into().unwrap()) as f64;
    let k_z = f32::from_le_bytes(bytes[8..12].try_into().unwrap()) as f64;
    let flavor = match bytes[12] {
        0 => MatrixFlavor::XyzAffine4x4,
        1 => MatrixFlavor::RgbAffine3x4,
        other => {
            return Err(CoreError::StorageFailed(format!(
                "unknown matrix flavor tag {}",
                other
            )))
        }
    };
    Ok((k_x, k_y, k_z, flavor))
}

/// Directory-backed key-value store: one file per record, each a
/// 2-byte little-endian length prefix, the payload, and a trailing
/// CRC-16 (§6 persistence layout). Writes go through a temp file and
/// an atomic rename so a crash mid-write never leaves a record whose
/// length/CRC disagree with its bytes.
pub struct CalibrationStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl CalibrationStore {
    pub fn open(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| CoreError::StorageFailed(format!("cannot create store dir: {}", e)))?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.bin"))
    }

    fn write_record(&self, name: &str, payload: &[u8]) -> CoreResult<()> {
        let _guard = self.lock.write();
        let mut framed = Vec::with_capacity(2 + payload.len() + 2);
        framed.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        framed.extend_from_slice(payload);
        let crc = CRC16.checksum(&framed);
        framed.extend_from_slice(&crc.to_le_bytes());

        let tmp = self.record_path(&format!("{name}.tmp"));
        fs::write(&tmp, &framed)
            .map_err(|e| CoreError::StorageFailed(format!("write {name} failed: {e}")))?;
        fs::rename(&tmp, self.record_path(name))
            .map_err(|e| CoreError::StorageFailed(format!("rename {name} failed: {e}")))?;
        Ok(())
    }

    fn read_record(&self, name: &str) -> CoreResult<Option<Vec<u8>>> {
        let _guard = self.lock.read();
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let framed = fs::read(&path)
            .map_err(|e| CoreError::StorageFailed(format!("read {name} failed: {e}")))?;
        if framed.len() < 4 {
            warn!("record {} truncated, discarding", name);
            return Ok(None);
        }
        let (header, rest) = framed.split_at(2);
        let declared_len = u16::from_le_bytes([header[0], header[1]]) as usize;
        if rest.len() != declared_len + 2 {
            warn!("record {} length mismatch, discarding", name);
            return Ok(None);
        }
        let (payload, crc_bytes) = rest.split_at(declared_len);
        let expected_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let actual_crc = CRC16.checksum(&framed[..2 + declared_len]);
        if actual_crc != expected_crc {
            warn!("record {} failed CRC check, discarding", name);
            return Ok(None);
        }
        Ok(Some(payload.to_vec()))
    }

    /// Persist the active calibration. The `calibration_valid` record
    /// is written last so an interrupted save cannot produce a
    /// readable-but-partial active calibration on the next load
    /// (§4.5).
    pub fn save(&self, cal: &DualCalibration) -> CoreResult<()> {
        self.write_record(REC_LOW_MATRIX, &encode_matrix(&cal.low_ir))?;
        self.write_record(REC_LOW_SCALE, &encode_scale(&cal.low_ir))?;
        self.write_record(REC_HIGH_MATRIX, &encode_matrix(&cal.high_ir))?;
        self.write_record(REC_HIGH_SCALE, &encode_scale(&cal.high_ir))?;
        self.write_record(REC_DUAL_MODE, &[cal.dual_enabled as u8])?;
        let mut thresholds = Vec::with_capacity(8);
        thresholds.extend_from_slice(&cal.ir_threshold_low.to_le_bytes());
        thresholds.extend_from_slice(&cal.ir_threshold_high.to_le_bytes());
        self.write_record(REC_THRESHOLDS, &thresholds)?;
        self.write_record(REC_TIMESTAMP, &0u32.to_le_bytes())?;
        self.write_record(REC_VALID, &[1u8])?;
        info!("saved active calibration to non-volatile store");
        Ok(())
    }

    /// Load one matrix slot's matrix + scale/flavor record pair. `None`
    /// means "fall back to factory for this slot" — either record
    /// absent, or either failing its length/CRC/schema check. A matrix
    /// is never paired with another slot's scale: each slot's own
    /// `*_ir_scale` record is its sole source of `k_x`/`k_y`/`k_z` and
    /// `flavor` (§8 "Persistence round-trip").
    fn load_matrix_slot(
        &self,
        matrix_rec: &str,
        scale_rec: &str,
        source: MatrixSource,
    ) -> CoreResult<Option<CalibrationMatrix>> {
        let matrix_bytes = match self.read_record(matrix_rec)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let scale_bytes = match self.read_record(scale_rec)? {
            Some(b) => b,
            None => {
                warn!("{} has no matching {} record, discarding", matrix_rec, scale_rec);
                return Ok(None);
            }
        };
        match decode_scale(&scale_bytes)
            .and_then(|(k_x, k_y, k_z, flavor)| decode_matrix(&matrix_bytes, (k_x, k_y, k_z), flavor, source, 0))
        {
            Ok(m) => Ok(Some(m)),
            Err(e) => {
                warn!("{} discarded: {}", matrix_rec, e);
                Ok(None)
            }
        }
    }

    /// Load policy (§4.5): if `calibration_valid` is false or absent,
    /// fall back to factory defaults entirely. Otherwise load each
    /// matrix independently; a record that fails its length/CRC check
    /// falls back to factory for that slot alone. If both slots fall
    /// back, dual mode is forced on (factory ships both halves).
    pub fn load_or_factory(&self) -> CoreResult<DualCalibration> {
        let valid = self
            .read_record(REC_VALID)?
            .map(|b| b.first().copied().unwrap_or(0) != 0)
            .unwrap_or(false);

        if !valid {
            info!("no valid persisted calibration, loading factory defaults");
            return Ok(factory_default_dual_calibration());
        }

        let factory = factory_default_dual_calibration();

        let low = self
            .load_matrix_slot(REC_LOW_MATRIX, REC_LOW_SCALE, MatrixSource::NvsLow)?
            .unwrap_or(factory.low_ir);
        let low_fell_back = low.source == MatrixSource::FactoryLow;

        let high = self
            .load_matrix_slot(REC_HIGH_MATRIX, REC_HIGH_SCALE, MatrixSource::NvsHigh)?
            .unwrap_or(factory.high_ir);
        let high_fell_back = high.source == MatrixSource::FactoryHigh;

        let mut dual_enabled = self
            .read_record(REC_DUAL_MODE)?
            .map(|b| b.first().copied().unwrap_or(1) != 0)
            .unwrap_or(true);
        if low_fell_back && high_fell_back {
            dual_enabled = true;
        }

        let (ir_threshold_low, ir_threshold_high) = self
            .read_record(REC_THRESHOLDS)?
            .filter(|b| b.len() == 8)
            .map(|b| {
                let lo = f32::from_le_bytes(b[0..4].try_into().unwrap());
                let hi = f32::from_le_bytes(b[4..8].try_into().unwrap());
                (lo, hi)
            })
            .unwrap_or((factory.ir_threshold_low, factory.ir_threshold_high));

        info!("loaded calibration from non-volatile store");
        Ok(DualCalibration {
            low_ir: low,
            high_ir: high,
            dual_enabled,
            ir_threshold_low,
            ir_threshold_high,
        })
    }
}

/// Non-volatile location a `CalibrationStore` should live at, derived
/// from the application data directory (§ AMBIENT STACK configuration).
pub fn default_store_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("calibration_store")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_store_falls_back_to_factory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(tmp.path()).unwrap();
        let cal = store.load_or_factory().unwrap();
        assert_eq!(cal.low_ir.source, MatrixSource::FactoryLow);
        assert!(cal.dual_enabled);
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(tmp.path()).unwrap();
        let mut cal = factory_default_dual_calibration();
        cal.ir_threshold_low = 0.2;
        cal.ir_threshold_high = 0.4;
        store.save(&cal).unwrap();

        let loaded = store.load_or_factory().unwrap();
        assert_eq!(loaded.low_ir.source, MatrixSource::NvsLow);
        assert_eq!(loaded.high_ir.source, MatrixSource::NvsHigh);
        assert!((loaded.ir_threshold_low - 0.2).abs() < 1e-6);
        assert!((loaded.ir_threshold_high - 0.4).abs() < 1e-6);
        assert_eq!(loaded.low_ir.entries, cal.low_ir.entries);
        assert_eq!(loaded.high_ir.entries, cal.high_ir.entries);
        assert!((loaded.low_ir.k_x - cal.low_ir.k_x).abs() < 1e-6);
        assert!((loaded.low_ir.k_y - cal.low_ir.k_y).abs() < 1e-6);
        assert!((loaded.low_ir.k_z - cal.low_ir.k_z).abs() < 1e-6);
        assert_eq!(loaded.low_ir.flavor, cal.low_ir.flavor);
        assert_eq!(loaded.high_ir.flavor, cal.high_ir.flavor);
    }

    /// A wizard-trained `RgbAffine3x4` matrix with a non-factory scale
    /// must survive save/load with its own scale and flavor intact,
    /// not the factory's (§8 "Persistence round-trip").
    #[test]
    fn user_trained_matrix_scale_and_flavor_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(tmp.path()).unwrap();
        let mut cal = factory_default_dual_calibration();
        cal.low_ir = CalibrationMatrix::from_rows(
            [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
            (1.0, 1.0, 1.0),
            MatrixSource::UserLow,
            0,
            MatrixFlavor::RgbAffine3x4,
        );
        store.save(&cal).unwrap();

        let loaded = store.load_or_factory().unwrap();
        assert_eq!(loaded.low_ir.flavor, MatrixFlavor::RgbAffine3x4);
        assert!((loaded.low_ir.k_x - 1.0).abs() < 1e-6);
        assert!((loaded.low_ir.k_y - 1.0).abs() < 1e-6);
        assert!((loaded.low_ir.k_z - 1.0).abs() < 1e-6);
        assert_eq!(loaded.low_ir.entries, cal.low_ir.entries);
        // the untouched high slot keeps the factory scale/flavor, not the low slot's.
        assert_eq!(loaded.high_ir.flavor, MatrixFlavor::XyzAffine4x4);
        assert!((loaded.high_ir.k_x - cal.high_ir.k_x).abs() < 1e-6);
    }

    #[test]
    fn corrupted_matrix_record_falls_back_to_factory_for_that_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(tmp.path()).unwrap();
        let cal = factory_default_dual_calibration();
        store.save(&cal).unwrap();

        // Corrupt the low matrix record's payload in place, invalidating its CRC.
        let path = tmp.path().join("low_ir_matrix.bin");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let loaded = store.load_or_factory().unwrap();
        assert_eq!(loaded.low_ir.source, MatrixSource::FactoryLow);
        assert_eq!(loaded.high_ir.source, MatrixSource::NvsHigh);
        // both didn't fall back, so dual mode is whatever was persisted.
    }

    #[test]
    fn missing_valid_flag_ignores_any_partial_records() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(tmp.path()).unwrap();
        store
            .write_record(REC_LOW_MATRIX, &encode_matrix(&factory_default_dual_calibration().low_ir))
            .unwrap();
        // calibration_valid was never written.
        let loaded = store.load_or_factory().unwrap();
        assert_eq!(loaded.low_ir.source, MatrixSource::FactoryLow);
    }
}
