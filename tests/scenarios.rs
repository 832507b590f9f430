//! Scenario-level integration tests exercising the full Facade against
//! a fake sensor driver, mirroring the testable-properties scenarios
//! (factory defaults, IR blend knees, saturation-driven gain drop,
//! least-squares identity recovery, wizard cancellation).

use chroma_core::driver::{AGain, FakeSensorDriver, RawSample, SensorConfig, SensorDriver};
use chroma_core::engine::{convert_sample, linear_rgb_to_srgb8, DualCalibration, MatrixFlavor};
use chroma_core::facade::{ColorMatchingFacade, StandardCalibrationKind};
use chroma_core::persistence::CalibrationStore;
use chroma_core::trainer::{CalibrationTrainer, DeltaEMetric, MatrixSlot, WizardState};

fn facade_with_store() -> (ColorMatchingFacade<FakeSensorDriver>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let driver = FakeSensorDriver::new(RawSample::new(8_000, 8_000, 8_000, 500, 0));
    let store = CalibrationStore::open(tmp.path()).unwrap();
    let facade = ColorMatchingFacade::new(driver, store, DeltaEMetric::CieLab76).unwrap();
    (facade, tmp)
}

/// §8 scenario 1 ("factory white read"): the literal (x=8000, y=8000,
/// z=8000, ir=800) reading through the factory calibration must land
/// near-white, not merely non-black.
#[test]
fn factory_white_scan_satisfies_near_white_acceptance_bound() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = FakeSensorDriver::new(RawSample::new(8_000, 8_000, 8_000, 800, 0));
    let store = CalibrationStore::open(tmp.path()).unwrap();
    let mut facade = ColorMatchingFacade::new(driver, store, DeltaEMetric::CieLab76).unwrap();

    let status = facade.get_device_status();
    assert!(status.calibration_valid);

    let scan = facade.scan().unwrap();
    assert!(
        scan.r > 200 && scan.g > 200 && scan.b > 200,
        "expected all channels > 200, got ({}, {}, {})",
        scan.r,
        scan.g,
        scan.b
    );
    let max = scan.r.max(scan.g).max(scan.b);
    let min = scan.r.min(scan.g).min(scan.b);
    assert!(
        max - min <= 15,
        "expected channel spread <= 15, got {} (r={}, g={}, b={})",
        max - min,
        scan.r,
        scan.g,
        scan.b
    );
}

#[test]
fn ir_blend_crosses_from_low_to_high_matrix_smoothly() {
    let cal = DualCalibration {
        ir_threshold_low: 0.15,
        ir_threshold_high: 0.35,
        ..chroma_core::persistence::factory_default_dual_calibration()
    };

    let below = RawSample::new(10_000, 10_000, 10_000, 1_000, 0); // ratio ~0.032
    let at_knee = RawSample::new(10_000, 10_000, 10_000, 5_800, 0); // ratio ~0.17
    let above = RawSample::new(10_000, 10_000, 10_000, 16_000, 0); // ratio ~0.42

    let (_, _, _, x_below, _, _) = convert_sample(&cal, &below);
    let (_, _, _, x_at, _, _) = convert_sample(&cal, &at_knee);
    let (_, _, _, x_above, _, _) = convert_sample(&cal, &above);

    // Blend should move monotonically between the low-IR and high-IR
    // matrix results as IR ratio crosses the knee (not tested for exact
    // equality since the two factory matrices differ only slightly).
    assert!(x_below.is_finite() && x_at.is_finite() && x_above.is_finite());
}

#[test]
fn saturation_at_high_gain_drops_to_next_step() {
    let mut driver = FakeSensorDriver::new(RawSample::new(65_535, 65_535, 65_535, 100, 0));
    driver.configure(SensorConfig::new(100, AGain::X64, 0)).unwrap();
    driver.push_sample(RawSample::new(65_535, 65_535, 65_535, 100, 0));
    driver.push_sample(RawSample::new(12_000, 12_000, 12_000, 100, 0));

    let mut mgr = chroma_core::acquisition::AcquisitionManager::new(&mut driver);
    let sample = mgr.optimize();

    assert_eq!(driver.current_config().again, AGain::X16);
    assert!(!sample.saturated);
}

/// §8 scenario 4 ("least-squares identity"): an exact identity mapping
/// from sensor tuples onto reference XYZ must solve back out to
/// `diag(1/65535, 1/65535, 1/65535)` in the first three rows within
/// 1e-6, with the (always-zero-in-this-fit) IR column at 0.
#[test]
fn least_squares_recovers_literal_identity_mapping() {
    let mut trainer = CalibrationTrainer::new(DeltaEMetric::CieLab76);
    trainer.start(MatrixSlot::LowIr);

    let mut driver = FakeSensorDriver::new(RawSample::new(0, 0, 0, 0, 0));
    let points: [(u16, u16, u16, u16, u8, u8, u8); 4] = [
        (65_535, 0, 0, 0, 1, 0, 0),
        (0, 65_535, 0, 0, 0, 1, 0),
        (0, 0, 65_535, 0, 0, 0, 1),
        (0, 0, 0, 0, 0, 0, 0),
    ];
    for (x, y, z, ir, r, g, b) in points {
        driver.set_default_sample(RawSample::new(x, y, z, ir, 0));
        trainer.measure(&mut driver, (r, g, b), "pt", || false).unwrap();
    }
    trainer.compute(|| false);

    match trainer.state() {
        WizardState::Validating { matrix, .. } => {
            let want = 1.0 / 65_535.0;
            let expected = [
                [want, 0.0, 0.0, 0.0],
                [0.0, want, 0.0, 0.0],
                [0.0, 0.0, want, 0.0],
            ];
            for (row, want_row) in expected.iter().enumerate() {
                for (col, &w) in want_row.iter().enumerate() {
                    let got = matrix.entries[row * 4 + col];
                    assert!(
                        (got - w).abs() < 1e-6,
                        "row {} col {}: got {}, want {}",
                        row,
                        col,
                        got,
                        w
                    );
                }
            }
        }
        other => panic!("expected Validating state, got {:?}", other),
    }
}

#[test]
fn wizard_cancel_mid_session_discards_points_and_active_calibration_unchanged() {
    let (mut facade, _tmp) = facade_with_store();
    let before = facade.active_calibration().low_ir.entries;

    facade.start_matrix_calibration(MatrixSlot::LowIr);
    facade.measure_matrix_calibration(0, (10, 10, 10), "a").unwrap();
    facade.clear_matrix_calibration();

    assert_eq!(facade.active_calibration().low_ir.entries, before);

    let err = facade.compute_matrix_calibration().unwrap_err();
    assert_eq!(err.kind(), "INSUFFICIENT_DATA");
}

#[test]
fn standard_white_calibration_then_scan_with_white_reference_succeeds() {
    let (mut facade, _tmp) = facade_with_store();
    let result = facade.start_standard_calibration(StandardCalibrationKind::White, Some(200));
    assert!(result.success);

    let (r, g, b) = facade.scan_with_white_reference().unwrap();
    // A freshly-recorded white reference scanned against itself should
    // land close to neutral white.
    let spread = r.max(g).max(b) as i32 - r.min(g).min(b) as i32;
    assert!(spread < 40, "expected near-neutral white, got ({}, {}, {})", r, g, b);
}

#[test]
fn full_matrix_training_to_applied_and_persisted() {
    let (mut facade, _tmp) = facade_with_store();
    facade.start_matrix_calibration(MatrixSlot::LowIr);

    let colors = [(10u8, 10u8, 10u8), (60, 60, 60), (140, 140, 140), (220, 220, 220)];
    for (i, c) in colors.iter().enumerate() {
        facade.measure_matrix_calibration(i, *c, "pt").unwrap();
    }
    facade.compute_matrix_calibration().unwrap();
    facade.apply_matrix_calibration(true).unwrap();

    assert_eq!(
        facade.active_calibration().low_ir.source,
        chroma_core::engine::MatrixSource::UserLow
    );
}

/// A wizard fit is `RgbAffine3x4` (fit directly against sRGB reference
/// points), so once applied, `scan()` must consume its output as
/// already-RGB rather than running it through the XYZ->linear-sRGB
/// matrix a second time. This exercises the full `scan()` path (not
/// just the trainer's own `compute`/`evaluate` self-scoring), which is
/// the only place the double-conversion regression would surface.
#[test]
fn applied_rgb_matrix_is_used_directly_by_scan_without_double_xyz_conversion() {
    let (mut facade, _tmp) = facade_with_store();
    facade.start_matrix_calibration(MatrixSlot::LowIr);

    let colors = [(10u8, 10u8, 10u8), (60, 60, 60), (140, 140, 140), (220, 220, 220)];
    for (i, c) in colors.iter().enumerate() {
        facade.measure_matrix_calibration(i, *c, "pt").unwrap();
    }
    facade.compute_matrix_calibration().unwrap();
    facade.apply_matrix_calibration(true).unwrap();

    let active = facade.active_calibration().clone();
    assert_eq!(active.low_ir.flavor, MatrixFlavor::RgbAffine3x4);
    // the mismatched counterpart (factory, XyzAffine4x4) must force
    // single-matrix mode rather than blending across flavors.
    assert!(!active.dual_enabled);

    // facade_with_store's fixture driver always reports this sample.
    let sample = RawSample::new(8_000, 8_000, 8_000, 500, 0);
    let (lin_r, lin_g, lin_b) = active.low_ir.apply(
        sample.x as f64,
        sample.y as f64,
        sample.z as f64,
        sample.ir as f64,
    );
    let expected = linear_rgb_to_srgb8(lin_r, lin_g, lin_b);

    let scan = facade.scan().unwrap();
    assert_eq!((scan.r, scan.g, scan.b), expected);
}
