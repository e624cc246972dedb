//! Boundary behavior of the preserve-K-only GCR intent against a real CMYK
//! press profile.
//!
//! lcms ships no builtin CMYK profile, so these tests run against whatever
//! `.icc` files the operator drops into `tests/fixtures/` (CoatedFOGRA39
//! and an uncoated condition are the usual picks) and skip silently when
//! none is present.

use std::path::PathBuf;

use pressform::{
    BuiltinProfile, ColorEngine, EngineFlags, EnginePixelFormat, PixelColor, PixelDepth,
    ProfileHandle, RenderingIntent,
};

fn cmyk_fixtures() -> Vec<Vec<u8>> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut fixtures = Vec::new();
    for entry in entries.flatten() {
        if entry.path().extension().map(|e| e == "icc").unwrap_or(false) {
            if let Ok(bytes) = std::fs::read(entry.path()) {
                let mut engine = ColorEngine::new();
                if let Ok(handle) = engine.open_profile(&bytes) {
                    if matches!(engine.profile_color_family(handle), Ok(PixelColor::Cmyk)) {
                        fixtures.push(bytes);
                    }
                }
            }
        }
    }
    fixtures
}

fn rgb8() -> EnginePixelFormat {
    EnginePixelFormat::new(PixelColor::Rgb, PixelDepth::Eight)
}

fn cmyk8() -> EnginePixelFormat {
    EnginePixelFormat::new(PixelColor::Cmyk, PixelDepth::Eight)
}

fn convert_rgb(
    engine: &mut ColorEngine,
    srgb: ProfileHandle,
    dest: ProfileHandle,
    intent: RenderingIntent,
    pixels: &[u8],
) -> Vec<u8> {
    let transform = engine
        .create_transform(srgb, rgb8(), dest, cmyk8(), intent, EngineFlags::default())
        .unwrap();
    let count = pixels.len() / 3;
    let mut out = vec![0u8; count * 4];
    engine.apply_transform(transform, pixels, &mut out, count).unwrap();
    engine.close_transform(transform);
    out
}

const NEUTRALS: [u8; 7] = [32, 64, 96, 128, 160, 192, 224];

#[test]
fn pure_white_rgb_maps_to_bare_paper() {
    for fixture in cmyk_fixtures() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let dest = engine.open_profile(&fixture).unwrap();
        let out = convert_rgb(
            &mut engine,
            srgb,
            dest,
            RenderingIntent::RelativeColorimetric,
            &[255, 255, 255],
        );
        for (i, channel) in out.iter().enumerate() {
            assert!(*channel <= 2, "white picked up ink in channel {i}: {channel}");
        }
    }
}

#[test]
fn pure_black_rgb_under_k_only_gcr_is_k_only() {
    for fixture in cmyk_fixtures() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let dest = engine.open_profile(&fixture).unwrap();
        let out = convert_rgb(
            &mut engine,
            srgb,
            dest,
            RenderingIntent::PreserveKOnlyRelativeGcr,
            &[0, 0, 0],
        );
        assert!(out[0] <= 2 && out[1] <= 2 && out[2] <= 2, "chroma in black: {out:?}");
        assert!(out[3] >= 253, "black lost density: {out:?}");
    }
}

#[test]
fn neutral_grays_under_k_only_gcr_carry_no_chroma() {
    for fixture in cmyk_fixtures() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let dest = engine.open_profile(&fixture).unwrap();
        let input: Vec<u8> = NEUTRALS.iter().flat_map(|&n| [n, n, n]).collect();
        let out = convert_rgb(
            &mut engine,
            srgb,
            dest,
            RenderingIntent::PreserveKOnlyRelativeGcr,
            &input,
        );
        for (level, pixel) in NEUTRALS.iter().zip(out.chunks_exact(4)) {
            assert!(
                pixel[0] <= 2 && pixel[1] <= 2 && pixel[2] <= 2,
                "gray {level} got chroma: {pixel:?}"
            );
        }
    }
}

#[test]
fn k_only_gcr_on_max_gcr_destination_equals_relative() {
    for fixture in cmyk_fixtures() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let dest = engine.open_profile(&fixture).unwrap();
        let input: Vec<u8> = NEUTRALS.iter().flat_map(|&n| [n, n, n]).collect();

        let relative = convert_rgb(
            &mut engine,
            srgb,
            dest,
            RenderingIntent::RelativeColorimetric,
            &input,
        );
        // Only a maximum-GCR destination triggers the byte-exact fallback.
        let already_k_only = relative
            .chunks_exact(4)
            .all(|p| p[0] <= 2 && p[1] <= 2 && p[2] <= 2);
        if !already_k_only {
            continue;
        }
        let gcr = convert_rgb(
            &mut engine,
            srgb,
            dest,
            RenderingIntent::PreserveKOnlyRelativeGcr,
            &input,
        );
        assert_eq!(gcr, relative, "fallback must be byte-exact");
    }
}

#[test]
fn gray_neutral_ramp_stays_neutral_through_working_rgb() {
    for fixture in cmyk_fixtures() {
        let mut engine = ColorEngine::new();
        let gray = engine.builtin_profile(BuiltinProfile::SGray).unwrap();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let dest = engine.open_profile(&fixture).unwrap();

        let transform = engine
            .create_multiprofile_transform(
                &[gray, srgb, dest],
                EnginePixelFormat::new(PixelColor::Gray, PixelDepth::Eight),
                cmyk8(),
                RenderingIntent::PreserveKOnlyRelativeGcr,
                EngineFlags::default(),
            )
            .unwrap();
        let mut out = vec![0u8; NEUTRALS.len() * 4];
        engine
            .apply_transform(transform, &NEUTRALS, &mut out, NEUTRALS.len())
            .unwrap();
        for (level, pixel) in NEUTRALS.iter().zip(out.chunks_exact(4)) {
            assert!(
                pixel[0] <= 2 && pixel[1] <= 2 && pixel[2] <= 2,
                "gray {level} got chroma: {pixel:?}"
            );
        }
    }
}
