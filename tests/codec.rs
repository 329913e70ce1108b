use striae::prelude::*;
use striae::sim::simulate;

fn single_direction(width: usize, height: usize, sets: Vec<SetSpec>, dtype: Dtype) -> Coding {
    let params = Params {
        width,
        height,
        sets: vec![sets],
        axis: 0,
        dtype,
        lmin: 3.0,
        ..Params::default()
    };
    Coding::new(params).unwrap()
}

/// Worst-case registration error against the encoded coordinates.
///
/// Absolute maps are circular over the unambiguous range: a pixel at
/// coordinate 0 may legitimately decode to a value epsilon below the range.
/// Relative maps compare directly.
fn max_registration_error(coding: &Coding, decoded: &Decoded) -> f64 {
    let coordinates = coding.coordinates();
    let mut worst: f64 = 0.0;
    for (d, (reg, truth)) in decoded
        .registration
        .iter()
        .zip(coordinates.iter())
        .enumerate()
    {
        let umr = coding.derived().umr[d];
        let circular = !coding.derived().ambiguous[d];
        for (&a, &b) in reg.as_slice().iter().zip(truth.as_slice()) {
            let direct = (a - b).abs();
            let error = if circular {
                direct.min(umr - direct)
            } else {
                direct
            };
            worst = worst.max(error);
        }
    }
    worst
}

#[test]
fn single_set_ramp_roundtrip() {
    // One direction, one 20 px set, four shifts over a 100x100 ramp: the
    // round trip has to stay within 1e-3 of the period.
    let coding = single_direction(100, 100, vec![SetSpec::new(4, 20.0)], Dtype::F64);
    let stack = coding.encode();
    let decoded = coding.decode(&stack, DecodeOptions::default()).unwrap();

    let worst = max_registration_error(&coding, &decoded);
    assert!(worst < 20.0 * 1e-3, "worst registration error {worst}");

    // A single 20 px set cannot span the 100 px extent on its own, so the
    // map is relative and flagged as such.
    assert_eq!(
        decoded.flags[0].count(flag::RELATIVE),
        100 * 100,
        "single-set decoding is relative"
    );
}

#[test]
fn coprime_pair_is_exact_over_its_full_range() {
    // Periods 7 and 13 resolve every position of their 91 px range.
    let coding = single_direction(
        91,
        1,
        vec![SetSpec::new(4, 7.0), SetSpec::new(4, 13.0)],
        Dtype::F64,
    );
    assert_eq!(coding.derived().umr, vec![91.0]);

    let stack = coding.encode();
    let decoded = coding.decode(&stack, DecodeOptions::default()).unwrap();

    let worst = max_registration_error(&coding, &decoded);
    assert!(worst < 1e-6, "worst registration error {worst}");
    assert_eq!(decoded.flags[0].count(flag::AMBIGUOUS), 0);
}

#[test]
fn noncoprime_pair_has_reduced_range() {
    // lcm(4, 6) = 12: the shared factor 2 costs range compared to the
    // period product of 24.
    assert_eq!(striae::params::umr_of(&[4.0, 6.0], 24.0).unwrap(), 12.0);

    // Over a screen matching that reduced range, decoding stays exact.
    let coding = single_direction(
        12,
        1,
        vec![SetSpec::new(4, 4.0), SetSpec::new(4, 6.0)],
        Dtype::F64,
    );
    let stack = coding.encode();
    let decoded = coding.decode(&stack, DecodeOptions::default()).unwrap();
    let worst = max_registration_error(&coding, &decoded);
    assert!(worst < 1e-6, "worst registration error {worst}");
}

#[test]
fn two_direction_default_style_roundtrip() {
    let sets = vec![SetSpec::new(4, 16.0), SetSpec::new(4, 9.0)];
    let params = Params {
        width: 128,
        height: 64,
        sets: vec![sets.clone(), sets],
        dtype: Dtype::U8,
        lmin: 3.0,
        ..Params::default()
    };
    let coding = Coding::new(params).unwrap();
    assert_eq!(coding.derived().frame_count, 16);
    assert_eq!(coding.derived().umr, vec![144.0, 144.0]);

    let stack = coding.encode();
    let decoded = coding.decode(&stack, DecodeOptions::default()).unwrap();

    let worst = max_registration_error(&coding, &decoded);
    assert!(worst < 0.1, "worst registration error {worst}");
}

#[test]
fn verbose_decode_returns_order_and_visibility_maps() {
    let coding = single_direction(
        91,
        2,
        vec![SetSpec::new(4, 7.0), SetSpec::new(4, 13.0)],
        Dtype::F64,
    );
    let stack = coding.encode();
    let decoded = coding
        .decode(
            &stack,
            DecodeOptions {
                verbose: true,
                ..DecodeOptions::default()
            },
        )
        .unwrap();

    let verbose = decoded.verbose.expect("verbose maps are present");
    assert_eq!(verbose.phase.len(), 2);
    assert_eq!(verbose.orders.len(), 2);
    assert_eq!(verbose.visibility.len(), 2);
    assert_eq!(verbose.exposure.len(), 1);

    // Fringe order of the 7 px set at x = 30 is 4.
    assert_eq!(verbose.orders[0].get(0, 30), 4.0);
    // Full contrast coding: visibility close to 1.
    assert!((verbose.visibility[0].get(1, 45) - 1.0).abs() < 1e-6);
}

#[test]
fn wavelength_multiplex_roundtrip() {
    let params = Params {
        width: 32,
        height: 8,
        sets: vec![vec![SetSpec::new(3, 5.0), SetSpec::new(3, 7.0)]],
        axis: 0,
        multiplex: Multiplex::Wavelength,
        dtype: Dtype::F64,
        lmin: 3.0,
        ..Params::default()
    };
    let coding = Coding::new(params).unwrap();
    assert_eq!(coding.derived().frame_count, 3);
    assert_eq!(coding.derived().channels, 3);

    let stack = coding.encode();
    assert_eq!(stack.channels(), 3);
    let decoded = coding.decode(&stack, DecodeOptions::default()).unwrap();

    let worst = max_registration_error(&coding, &decoded);
    assert!(worst < 1e-6, "worst registration error {worst}");
}

#[test]
fn frequency_multiplex_roundtrip() {
    let params = Params {
        width: 32,
        height: 4,
        sets: vec![vec![SetSpec::new(8, 5.0), SetSpec::new(8, 7.0)]],
        axis: 0,
        multiplex: Multiplex::Frequency,
        dtype: Dtype::F64,
        lmin: 3.0,
        ..Params::default()
    };
    let coding = Coding::new(params).unwrap();
    assert_eq!(coding.derived().frame_count, 8);

    let stack = coding.encode();
    let decoded = coding.decode(&stack, DecodeOptions::default()).unwrap();

    let worst = max_registration_error(&coding, &decoded);
    assert!(worst < 1e-6, "worst registration error {worst}");
}

#[test]
fn spatial_multiplex_recovers_both_axis_ramps() {
    let params = Params {
        width: 32,
        height: 32,
        sets: vec![vec![SetSpec::new(4, 8.0)], vec![SetSpec::new(4, 8.0)]],
        multiplex: Multiplex::Spatial,
        dtype: Dtype::F64,
        lmin: 3.0,
        ..Params::default()
    };
    let coding = Coding::new(params).unwrap();
    assert_eq!(coding.derived().frame_count, 4);

    let stack = coding.encode();
    let decoded = coding.decode(&stack, DecodeOptions::default()).unwrap();

    // A crossed 8 px pattern cannot cover 32 px absolutely; check the
    // relative ramps instead: unit gradient along each coded axis.
    for (d, reg) in decoded.registration.iter().enumerate() {
        for row in 1..31 {
            for col in 1..31 {
                let gradient = match d {
                    0 => reg.get(row, col + 1) - reg.get(row, col),
                    _ => reg.get(row + 1, col) - reg.get(row, col),
                };
                assert!(
                    (gradient - 1.0).abs() < 1e-6,
                    "direction {d} gradient {gradient} at {row},{col}"
                );
            }
        }
    }
}

#[test]
fn flat_capture_is_flagged_not_trusted() {
    let coding = single_direction(
        91,
        2,
        vec![SetSpec::new(4, 7.0), SetSpec::new(4, 13.0)],
        Dtype::U8,
    );
    let flat = FrameStack::from_f64(8, 2, 91, 1, Dtype::U8, vec![128.0; 8 * 2 * 91]).unwrap();
    let decoded = coding.decode(&flat, DecodeOptions::default()).unwrap();

    for field in &decoded.modulation {
        for &m in field.as_slice() {
            assert!(m.abs() < 1e-9, "modulation {m} on a flat capture");
        }
    }
    assert_eq!(decoded.flags[0].count(flag::LOW_MODULATION), 2 * 91);
    for &u in decoded.uncertainty[0].as_slice() {
        assert!(u.is_infinite());
    }
}

#[test]
fn residual_tracks_injected_noise() {
    let coding = single_direction(
        91,
        8,
        vec![SetSpec::new(4, 7.0), SetSpec::new(4, 13.0)],
        Dtype::U8,
    );
    let clean = coding.encode();
    let sensor = SensorModel {
        gain: 0.1,
        dark_noise: 10.0,
        dark_current: 5.0,
        ..SensorModel::default()
    };
    let noisy = simulate(&clean, &sensor, 42);

    let mean = |decoded: &Decoded| {
        let values = decoded.residuals[0].as_slice();
        values.iter().sum::<f64>() / values.len() as f64
    };

    let clean_res = mean(&coding.decode(&clean, DecodeOptions::default()).unwrap());
    let noisy_res = mean(&coding.decode(&noisy, DecodeOptions::default()).unwrap());

    // A noiseless round trip only carries quantization in its residual.
    assert!(clean_res < 0.5, "clean residual {clean_res}");
    assert!(
        noisy_res > 2.0 * clean_res,
        "noisy residual {noisy_res} vs clean {clean_res}"
    );
}

#[test]
fn despike_repairs_a_corrupted_pixel() {
    let coding = single_direction(
        91,
        16,
        vec![SetSpec::new(4, 7.0), SetSpec::new(4, 13.0)],
        Dtype::F64,
    );
    let clean = coding.encode();

    // Flatten every shot of one interior pixel: no modulation survives
    // there, so its coordinate is meaningless until repaired.
    let mut values = clean.to_f64();
    let px = 16 * 91;
    for t in 0..clean.frames() {
        values[t * px + 5 * 91 + 40] = 0.5;
    }
    let corrupted = FrameStack::from_f64(8, 16, 91, 1, Dtype::F64, values).unwrap();

    let decoded = coding
        .decode(
            &corrupted,
            DecodeOptions {
                despike: true,
                ..DecodeOptions::default()
            },
        )
        .unwrap();

    let truth = coding.coordinates();
    let err = (decoded.registration[0].get(5, 40) - truth[0].get(5, 40)).abs();
    assert!(err < 1.0, "despiked pixel off by {err}");
}

#[test]
fn deinterlaced_capture_decodes_like_the_original() {
    let coding = single_direction(
        91,
        8,
        vec![SetSpec::new(4, 7.0), SetSpec::new(4, 13.0)],
        Dtype::F64,
    );
    let stack = coding.encode();

    let restored = stack.interlace().deinterlace(stack.frames()).unwrap();
    assert_eq!(restored, stack);

    let decoded = coding.decode(&restored, DecodeOptions::default()).unwrap();
    let worst = max_registration_error(&coding, &decoded);
    assert!(worst < 1e-6, "worst registration error {worst}");
}

#[test]
fn frame_count_mismatch_is_rejected() {
    let coding = single_direction(
        91,
        2,
        vec![SetSpec::new(4, 7.0), SetSpec::new(4, 13.0)],
        Dtype::U8,
    );
    let short = FrameStack::from_f64(7, 2, 91, 1, Dtype::U8, vec![0.0; 7 * 2 * 91]).unwrap();
    assert!(matches!(
        coding.decode(&short, DecodeOptions::default()),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn lazy_frames_match_the_eager_stack() {
    let coding = single_direction(32, 4, vec![SetSpec::new(4, 8.0)], Dtype::U8);
    let eager = coding.encode().to_f64();
    let px = 32 * 4;

    let mut collected = Vec::new();
    for frame in coding.frames() {
        collected.extend(frame.to_f64());
    }
    assert_eq!(collected, eager);
    assert_eq!(collected.len(), 4 * px);
}
