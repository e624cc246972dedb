//! Handle-based façade over the ICC color engine (Little CMS).
//!
//! The rest of the crate never touches `lcms2` directly; it opens profiles,
//! compiles transforms and pushes pixel buffers through this adapter. Handles
//! are opaque integers, reference-counted externally so several logical
//! owners (page converters, the transform cache, the scheduler) can share one
//! opened profile.
//!
//! One adapter instance is bound to one thread: it owns an
//! `lcms2::ThreadContext` and every profile/transform created through it.
//! Workers build their own instance.

use std::collections::HashMap;

use lcms2::{
    AllowCache, CIExyY, ColorSpaceSignature, Flags, InfoType, Intent, Locale, PixelFormat,
    Profile, ThreadContext, ToneCurve, Transform,
};

use crate::errors::{ConvertError, ConvertResult};

/// Color family of a pixel buffer or profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelColor {
    Gray,
    Rgb,
    Cmyk,
    Lab,
}

impl PixelColor {
    pub fn channels(self) -> usize {
        match self {
            PixelColor::Gray => 1,
            PixelColor::Rgb | PixelColor::Lab => 3,
            PixelColor::Cmyk => 4,
        }
    }

    /// PDF device color space name for this family. Lab has no device
    /// space; transparency groups and blending spaces never use it.
    pub fn device_name(self) -> &'static str {
        match self {
            PixelColor::Gray => "DeviceGray",
            PixelColor::Rgb => "DeviceRGB",
            PixelColor::Cmyk => "DeviceCMYK",
            PixelColor::Lab => "Lab",
        }
    }
}

/// Bits per component as the engine understands them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelDepth {
    Eight,
    Sixteen,
    Float,
}

impl PixelDepth {
    pub fn bits(self) -> u8 {
        match self {
            PixelDepth::Eight => 8,
            PixelDepth::Sixteen => 16,
            PixelDepth::Float => 32,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            PixelDepth::Eight => 1,
            PixelDepth::Sixteen => 2,
            PixelDepth::Float => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

/// Engine-side pixel format. The adapter only accepts native-endian data;
/// the buffer converter swaps 16-bit buffers to native before calling in and
/// back to the caller's endianness afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnginePixelFormat {
    pub color: PixelColor,
    pub depth: PixelDepth,
}

impl EnginePixelFormat {
    pub fn new(color: PixelColor, depth: PixelDepth) -> Self {
        EnginePixelFormat { color, depth }
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.color.channels() * self.depth.bytes()
    }

    fn to_lcms(self) -> ConvertResult<PixelFormat> {
        use PixelColor::*;
        use PixelDepth::*;
        Ok(match (self.color, self.depth) {
            (Gray, Eight) => PixelFormat::GRAY_8,
            (Gray, Sixteen) => PixelFormat::GRAY_16,
            (Gray, Float) => PixelFormat::GRAY_FLT,
            (Rgb, Eight) => PixelFormat::RGB_8,
            (Rgb, Sixteen) => PixelFormat::RGB_16,
            (Rgb, Float) => PixelFormat::RGB_FLT,
            (Cmyk, Eight) => PixelFormat::CMYK_8,
            (Cmyk, Sixteen) => PixelFormat::CMYK_16,
            (Cmyk, Float) => PixelFormat::CMYK_FLT,
            (Lab, Eight) => PixelFormat::Lab_8,
            (Lab, Sixteen) => PixelFormat::Lab_16,
            (Lab, Float) => {
                return Err(ConvertError::TransformUnsupported(
                    "float Lab buffers are not supported".to_string(),
                ))
            }
        })
    }
}

/// Rendering intents. The four ICC intents plus the custom
/// preserve-K-only relative colorimetric GCR intent used for press output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderingIntent {
    Perceptual,
    #[default]
    RelativeColorimetric,
    Saturation,
    AbsoluteColorimetric,
    PreserveKOnlyRelativeGcr,
}

impl RenderingIntent {
    fn to_lcms(self) -> Intent {
        match self {
            RenderingIntent::Perceptual => Intent::Perceptual,
            RenderingIntent::RelativeColorimetric => Intent::RelativeColorimetric,
            RenderingIntent::Saturation => Intent::Saturation,
            RenderingIntent::AbsoluteColorimetric => Intent::AbsoluteColorimetric,
            RenderingIntent::PreserveKOnlyRelativeGcr => {
                Intent::PreserveKOnlyRelativeColorimetric
            }
        }
    }

    /// Parses the manifest spelling of an intent.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "perceptual" => RenderingIntent::Perceptual,
            "relative-colorimetric" => RenderingIntent::RelativeColorimetric,
            "saturation" => RenderingIntent::Saturation,
            "absolute-colorimetric" => RenderingIntent::AbsoluteColorimetric,
            "k-only-gcr" => RenderingIntent::PreserveKOnlyRelativeGcr,
            _ => return None,
        })
    }
}

/// Transform flags. `no_transform_cache` is honored by the buffer
/// converter's cache, not by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EngineFlags {
    pub black_point_compensation: bool,
    pub multiprofile_bpc_scaling: bool,
    pub no_transform_cache: bool,
    pub adaptive_bpc_clamping: bool,
}

impl EngineFlags {
    pub fn bits(self) -> u8 {
        (self.black_point_compensation as u8)
            | (self.multiprofile_bpc_scaling as u8) << 1
            | (self.no_transform_cache as u8) << 2
            | (self.adaptive_bpc_clamping as u8) << 3
    }

    fn to_lcms(self) -> Flags {
        let mut flags = Flags::default();
        if self.black_point_compensation || self.multiprofile_bpc_scaling {
            flags = flags | Flags::BLACKPOINT_COMPENSATION;
        }
        flags
    }
}

/// Builtin profiles the engine can synthesize without ICC bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinProfile {
    SGray,
    SRgb,
    LabD50,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformHandle(u32);

struct ProfileEntry {
    profile: Profile<ThreadContext>,
    refs: u32,
    /// Lazily probed: does this (CMYK) profile already render neutrals
    /// K-only under relative colorimetric?
    k_only_neutrals: Option<bool>,
}

type EngineTransform = Transform<u8, u8, ThreadContext, AllowCache>;

/// Neutral-preserving GCR wrapper for gray/RGB sources: chromatic pixels
/// take the base (relative colorimetric) result, neutral pixels are replaced
/// by a K-only value of matching lightness looked up in a precomputed ramp.
struct KOnlyNeutral {
    base: EngineTransform,
    k_for_level: [u8; 256],
}

enum Compiled {
    Engine(EngineTransform),
    KOnlyNeutral(KOnlyNeutral),
}

struct TransformEntry {
    compiled: Compiled,
    in_format: EnginePixelFormat,
    out_format: EnginePixelFormat,
}

/// The adapter. See module docs.
pub struct ColorEngine {
    ctx: ThreadContext,
    profiles: HashMap<u32, ProfileEntry>,
    transforms: HashMap<u32, TransformEntry>,
    next_profile: u32,
    next_transform: u32,
}

fn white_d50() -> CIExyY {
    CIExyY {
        x: 0.3457,
        y: 0.3585,
        Y: 1.0,
    }
}

impl ColorEngine {
    pub fn new() -> Self {
        ColorEngine {
            ctx: ThreadContext::new(),
            profiles: HashMap::new(),
            transforms: HashMap::new(),
            next_profile: 1,
            next_transform: 1,
        }
    }

    fn insert_profile(&mut self, profile: Profile<ThreadContext>) -> ProfileHandle {
        let id = self.next_profile;
        self.next_profile += 1;
        self.profiles.insert(
            id,
            ProfileEntry {
                profile,
                refs: 1,
                k_only_neutrals: None,
            },
        );
        ProfileHandle(id)
    }

    fn profile(&self, handle: ProfileHandle) -> ConvertResult<&ProfileEntry> {
        self.profiles.get(&handle.0).ok_or_else(|| {
            ConvertError::InvalidArgument(format!("unknown profile handle {:?}", handle))
        })
    }

    /// Opens ICC bytes. Fails with `ProfileMalformed` when the header or
    /// required tags are invalid.
    pub fn open_profile(&mut self, bytes: &[u8]) -> ConvertResult<ProfileHandle> {
        let profile = Profile::new_icc_context(&self.ctx, bytes)
            .map_err(|e| ConvertError::ProfileMalformed(e.to_string()))?;
        Ok(self.insert_profile(profile))
    }

    pub fn builtin_profile(&mut self, kind: BuiltinProfile) -> ConvertResult<ProfileHandle> {
        let profile = match kind {
            BuiltinProfile::SRgb => Profile::new_srgb_context(&self.ctx),
            BuiltinProfile::SGray => {
                let curve = ToneCurve::new(2.2);
                Profile::new_gray_context(&self.ctx, &white_d50(), &curve)
                    .map_err(|e| ConvertError::ProfileMalformed(e.to_string()))?
            }
            BuiltinProfile::LabD50 => Profile::new_lab4_context(&self.ctx, &white_d50())
                .map_err(|e| ConvertError::ProfileMalformed(e.to_string()))?,
        };
        Ok(self.insert_profile(profile))
    }

    /// Registers an additional logical owner of the handle.
    pub fn retain_profile(&mut self, handle: ProfileHandle) -> ConvertResult<()> {
        let entry = self.profiles.get_mut(&handle.0).ok_or_else(|| {
            ConvertError::InvalidArgument(format!("unknown profile handle {:?}", handle))
        })?;
        entry.refs += 1;
        Ok(())
    }

    /// Drops one logical owner; releases the engine resources when the last
    /// owner closes.
    pub fn close_profile(&mut self, handle: ProfileHandle) {
        let drop_it = match self.profiles.get_mut(&handle.0) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => false,
        };
        if drop_it {
            self.profiles.remove(&handle.0);
        }
    }

    /// Color family of an opened profile.
    pub fn profile_color_family(&self, handle: ProfileHandle) -> ConvertResult<PixelColor> {
        let entry = self.profile(handle)?;
        match entry.profile.color_space() {
            ColorSpaceSignature::GrayData => Ok(PixelColor::Gray),
            ColorSpaceSignature::RgbData => Ok(PixelColor::Rgb),
            ColorSpaceSignature::CmykData => Ok(PixelColor::Cmyk),
            ColorSpaceSignature::LabData => Ok(PixelColor::Lab),
            other => Err(ConvertError::ProfileMalformed(format!(
                "unsupported profile color space {:?}",
                other
            ))),
        }
    }

    /// Profile description tag text, used for the output intent identifier.
    pub fn profile_description(&self, handle: ProfileHandle) -> Option<String> {
        let entry = self.profiles.get(&handle.0)?;
        entry.profile.info(InfoType::Description, Locale::none())
    }

    /// Serializes the profile back to ICC bytes.
    pub fn profile_bytes(&self, handle: ProfileHandle) -> ConvertResult<Vec<u8>> {
        let entry = self.profile(handle)?;
        entry
            .profile
            .icc()
            .map_err(|e| ConvertError::ProfileMalformed(e.to_string()))
    }

    /// Probes whether a CMYK destination already forces K-only neutrals
    /// under plain relative colorimetric (a "maximum GCR" profile). The
    /// result is cached on the profile entry.
    fn destination_is_k_only(&mut self, dst: ProfileHandle) -> ConvertResult<bool> {
        if let Some(cached) = self.profile(dst)?.k_only_neutrals {
            return Ok(cached);
        }
        let probe = {
            let srgb = Profile::new_srgb_context(&self.ctx);
            let entry = self.profile(dst)?;
            let tr: Transform<u8, u8, ThreadContext, AllowCache> = Transform::new_flags_context(
                &self.ctx,
                &srgb,
                PixelFormat::RGB_8,
                &entry.profile,
                PixelFormat::CMYK_8,
                Intent::RelativeColorimetric,
                Flags::default(),
            )
            .map_err(|e| ConvertError::TransformUnsupported(e.to_string()))?;
            let levels: [u8; 7] = [32, 64, 96, 128, 160, 192, 224];
            let input: Vec<u8> = levels.iter().flat_map(|&n| [n, n, n]).collect();
            let mut output = vec![0u8; levels.len() * 4];
            tr.transform_pixels(&input, &mut output);
            output.chunks_exact(4).all(|p| p[0] <= 2 && p[1] <= 2 && p[2] <= 2)
        };
        if let Some(entry) = self.profiles.get_mut(&dst.0) {
            entry.k_only_neutrals = Some(probe);
        }
        Ok(probe)
    }

    /// Builds the 256-entry K ramp for the neutral-preserving GCR wrapper:
    /// for each source neutral level, the K tint whose lightness in the
    /// destination comes closest.
    fn build_k_ramp(
        &self,
        src: ProfileHandle,
        src_color: PixelColor,
        dst: ProfileHandle,
    ) -> ConvertResult<[u8; 256]> {
        let lab = Profile::new_lab4_context(&self.ctx, &white_d50())
            .map_err(|e| ConvertError::ProfileMalformed(e.to_string()))?;

        // Lightness of every neutral source level.
        let src_entry = self.profile(src)?;
        let src_fmt = match src_color {
            PixelColor::Gray => PixelFormat::GRAY_8,
            PixelColor::Rgb => PixelFormat::RGB_8,
            other => {
                return Err(ConvertError::TransformUnsupported(format!(
                    "neutral GCR ramp does not apply to {:?} sources",
                    other
                )))
            }
        };
        let to_lab: Transform<u8, [f64; 3], ThreadContext, AllowCache> =
            Transform::new_flags_context(
                &self.ctx,
                &src_entry.profile,
                src_fmt,
                &lab,
                PixelFormat::Lab_DBL,
                Intent::RelativeColorimetric,
                Flags::default(),
            )
            .map_err(|e| ConvertError::TransformUnsupported(e.to_string()))?;
        let channels = src_color.channels();
        let ramp: Vec<u8> = (0..=255u16)
            .flat_map(|n| std::iter::repeat(n as u8).take(channels))
            .collect();
        let mut src_lab = vec![[0f64; 3]; 256];
        to_lab.transform_pixels(&ramp, &mut src_lab);

        // Lightness of every K-only destination tint.
        let dst_entry = self.profile(dst)?;
        let k_to_lab: Transform<u8, [f64; 3], ThreadContext, AllowCache> =
            Transform::new_flags_context(
                &self.ctx,
                &dst_entry.profile,
                PixelFormat::CMYK_8,
                &lab,
                PixelFormat::Lab_DBL,
                Intent::RelativeColorimetric,
                Flags::default(),
            )
            .map_err(|e| ConvertError::TransformUnsupported(e.to_string()))?;
        let k_ramp: Vec<u8> = (0..=255u16).flat_map(|k| [0, 0, 0, k as u8]).collect();
        let mut k_lab = vec![[0f64; 3]; 256];
        k_to_lab.transform_pixels(&k_ramp, &mut k_lab);

        let mut k_for_level = [0u8; 256];
        for level in 0..256 {
            let want = src_lab[level][0];
            let mut best = 0usize;
            let mut best_delta = f64::INFINITY;
            for (k, lab) in k_lab.iter().enumerate() {
                let delta = (lab[0] - want).abs();
                if delta < best_delta {
                    best_delta = delta;
                    best = k;
                }
            }
            k_for_level[level] = best as u8;
        }
        Ok(k_for_level)
    }

    fn compile(
        &mut self,
        chain: &[ProfileHandle],
        in_format: EnginePixelFormat,
        out_format: EnginePixelFormat,
        intent: RenderingIntent,
        flags: EngineFlags,
    ) -> ConvertResult<Compiled> {
        let mut effective = intent;
        let mut k_ramp = None;

        if intent == RenderingIntent::PreserveKOnlyRelativeGcr {
            let dst = *chain.last().expect("chain length checked by caller");
            if self.profile_color_family(dst)? != PixelColor::Cmyk {
                return Err(ConvertError::TransformUnsupported(
                    "K-only GCR requires a CMYK destination profile".to_string(),
                ));
            }
            if self.destination_is_k_only(dst)? {
                // Destination already enforces K-only neutrals; byte-exact
                // fallback to relative colorimetric.
                effective = RenderingIntent::RelativeColorimetric;
            } else {
                match in_format.color {
                    PixelColor::Cmyk => {
                        // lcms implements K preservation natively for
                        // CMYK-to-CMYK links.
                    }
                    PixelColor::Gray | PixelColor::Rgb => {
                        if in_format.depth == PixelDepth::Float {
                            return Err(ConvertError::TransformUnsupported(
                                "K-only GCR is not available for float buffers".to_string(),
                            ));
                        }
                        k_ramp =
                            Some(self.build_k_ramp(chain[0], in_format.color, dst)?);
                        effective = RenderingIntent::RelativeColorimetric;
                    }
                    PixelColor::Lab => {
                        return Err(ConvertError::TransformUnsupported(
                            "K-only GCR is not available for Lab sources".to_string(),
                        ))
                    }
                }
            }
        }

        let in_fmt = in_format.to_lcms()?;
        let out_fmt = out_format.to_lcms()?;
        let lcms_intent = effective.to_lcms();
        let lcms_flags = flags.to_lcms();

        let base: EngineTransform = if chain.len() == 2 {
            let src = self.profile(chain[0])?;
            let dst = self.profile(chain[1])?;
            Transform::new_flags_context(
                &self.ctx,
                &src.profile,
                in_fmt,
                &dst.profile,
                out_fmt,
                lcms_intent,
                lcms_flags,
            )
            .map_err(|e| ConvertError::TransformUnsupported(e.to_string()))?
        } else {
            let mut profiles = Vec::with_capacity(chain.len());
            for handle in chain {
                profiles.push(&self.profile(*handle)?.profile);
            }
            Transform::new_multiprofile_context(
                &self.ctx,
                &profiles,
                in_fmt,
                out_fmt,
                // A single intent value applies uniformly to the whole
                // chain; the engine API takes the enum, never an array.
                lcms_intent,
                lcms_flags,
            )
            .map_err(|e| ConvertError::TransformUnsupported(e.to_string()))?
        };

        Ok(match k_ramp {
            Some(k_for_level) => Compiled::KOnlyNeutral(KOnlyNeutral { base, k_for_level }),
            None => Compiled::Engine(base),
        })
    }

    /// Compiles a two-profile transform.
    pub fn create_transform(
        &mut self,
        src: ProfileHandle,
        in_format: EnginePixelFormat,
        dst: ProfileHandle,
        out_format: EnginePixelFormat,
        intent: RenderingIntent,
        flags: EngineFlags,
    ) -> ConvertResult<TransformHandle> {
        self.create_multiprofile_transform(&[src, dst], in_format, out_format, intent, flags)
    }

    /// Compiles a transform over a profile chain of length >= 2. The intent
    /// applies uniformly to every link.
    pub fn create_multiprofile_transform(
        &mut self,
        chain: &[ProfileHandle],
        in_format: EnginePixelFormat,
        out_format: EnginePixelFormat,
        intent: RenderingIntent,
        flags: EngineFlags,
    ) -> ConvertResult<TransformHandle> {
        if chain.len() < 2 {
            return Err(ConvertError::InvalidArgument(format!(
                "profile chain must contain at least 2 profiles, got {}",
                chain.len()
            )));
        }
        let compiled = self.compile(chain, in_format, out_format, intent, flags)?;
        let id = self.next_transform;
        self.next_transform += 1;
        self.transforms.insert(
            id,
            TransformEntry {
                compiled,
                in_format,
                out_format,
            },
        );
        Ok(TransformHandle(id))
    }

    /// Runs pixel math synchronously. Both buffers must hold exactly
    /// `pixel_count` pixels in the transform's formats, native endianness.
    pub fn apply_transform(
        &self,
        handle: TransformHandle,
        input: &[u8],
        output: &mut [u8],
        pixel_count: usize,
    ) -> ConvertResult<()> {
        let entry = self.transforms.get(&handle.0).ok_or_else(|| {
            ConvertError::InvalidArgument(format!("unknown transform handle {:?}", handle))
        })?;
        let in_stride = entry.in_format.bytes_per_pixel();
        let out_stride = entry.out_format.bytes_per_pixel();
        if input.len() != pixel_count * in_stride {
            return Err(ConvertError::BufferMisaligned {
                len: input.len(),
                stride: in_stride,
            });
        }
        if output.len() != pixel_count * out_stride {
            return Err(ConvertError::BufferMisaligned {
                len: output.len(),
                stride: out_stride,
            });
        }

        match &entry.compiled {
            Compiled::Engine(t) => t.transform_pixels(input, output),
            Compiled::KOnlyNeutral(wrapper) => {
                wrapper.base.transform_pixels(input, output);
                overwrite_neutrals(
                    input,
                    output,
                    entry.in_format,
                    entry.out_format,
                    &wrapper.k_for_level,
                );
            }
        }
        Ok(())
    }

    pub fn close_transform(&mut self, handle: TransformHandle) {
        self.transforms.remove(&handle.0);
    }

    /// Number of live transforms, used by disposal assertions in tests.
    pub fn transform_count(&self) -> usize {
        self.transforms.len()
    }
}

impl Default for ColorEngine {
    fn default() -> Self {
        ColorEngine::new()
    }
}

/// Replaces the output of neutral input pixels with K-only tints of
/// matching lightness. Neutrality means all source components equal.
fn overwrite_neutrals(
    input: &[u8],
    output: &mut [u8],
    in_format: EnginePixelFormat,
    out_format: EnginePixelFormat,
    k_for_level: &[u8; 256],
) {
    let channels = in_format.color.channels();
    let in_stride = in_format.bytes_per_pixel();
    let out_stride = out_format.bytes_per_pixel();
    let pixels = input.len() / in_stride;

    for i in 0..pixels {
        let px = &input[i * in_stride..(i + 1) * in_stride];
        let level = match in_format.depth {
            PixelDepth::Eight => {
                if !px.iter().all(|&b| b == px[0]) {
                    continue;
                }
                px[0]
            }
            PixelDepth::Sixteen => {
                let mut first = [0u8; 2];
                first.copy_from_slice(&px[0..2]);
                let v = u16::from_ne_bytes(first);
                let neutral = px.chunks_exact(2).all(|c| {
                    let mut b = [0u8; 2];
                    b.copy_from_slice(c);
                    u16::from_ne_bytes(b) == v
                });
                if !neutral {
                    continue;
                }
                (v >> 8) as u8
            }
            PixelDepth::Float => continue,
        };
        debug_assert_eq!(channels, px.len() / in_format.depth.bytes());
        let k = k_for_level[level as usize];
        let out = &mut output[i * out_stride..(i + 1) * out_stride];
        match out_format.depth {
            PixelDepth::Eight => {
                out[0] = 0;
                out[1] = 0;
                out[2] = 0;
                out[3] = k;
            }
            PixelDepth::Sixteen => {
                let k16 = (k as u16) * 257;
                out[0..2].copy_from_slice(&0u16.to_ne_bytes());
                out[2..4].copy_from_slice(&0u16.to_ne_bytes());
                out[4..6].copy_from_slice(&0u16.to_ne_bytes());
                out[6..8].copy_from_slice(&k16.to_ne_bytes());
            }
            PixelDepth::Float => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb8() -> EnginePixelFormat {
        EnginePixelFormat::new(PixelColor::Rgb, PixelDepth::Eight)
    }

    #[test]
    fn open_rejects_garbage() {
        let mut engine = ColorEngine::new();
        let err = engine.open_profile(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, ConvertError::ProfileMalformed(_)));
    }

    #[test]
    fn builtin_families() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let gray = engine.builtin_profile(BuiltinProfile::SGray).unwrap();
        let lab = engine.builtin_profile(BuiltinProfile::LabD50).unwrap();
        assert_eq!(engine.profile_color_family(srgb).unwrap(), PixelColor::Rgb);
        assert_eq!(engine.profile_color_family(gray).unwrap(), PixelColor::Gray);
        assert_eq!(engine.profile_color_family(lab).unwrap(), PixelColor::Lab);
    }

    #[test]
    fn identity_transform_round_trips() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let t = engine
            .create_transform(
                srgb,
                rgb8(),
                srgb,
                rgb8(),
                RenderingIntent::RelativeColorimetric,
                EngineFlags::default(),
            )
            .unwrap();
        let input = [10u8, 20, 30, 200, 100, 50];
        let mut output = [0u8; 6];
        engine.apply_transform(t, &input, &mut output, 2).unwrap();
        for (a, b) in input.iter().zip(output.iter()) {
            assert!((*a as i16 - *b as i16).abs() <= 1, "{a} vs {b}");
        }
    }

    #[test]
    fn misaligned_buffer_is_rejected() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let t = engine
            .create_transform(
                srgb,
                rgb8(),
                srgb,
                rgb8(),
                RenderingIntent::RelativeColorimetric,
                EngineFlags::default(),
            )
            .unwrap();
        let input = [0u8; 5];
        let mut output = [0u8; 6];
        let err = engine.apply_transform(t, &input, &mut output, 2).unwrap_err();
        assert!(matches!(err, ConvertError::BufferMisaligned { .. }));
    }

    #[test]
    fn multiprofile_needs_two_profiles() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let err = engine
            .create_multiprofile_transform(
                &[srgb],
                rgb8(),
                rgb8(),
                RenderingIntent::RelativeColorimetric,
                EngineFlags::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidArgument(_)));
    }

    #[test]
    fn multiprofile_through_lab_stays_close() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let lab = engine.builtin_profile(BuiltinProfile::LabD50).unwrap();
        let t = engine
            .create_multiprofile_transform(
                &[srgb, lab, srgb],
                rgb8(),
                rgb8(),
                RenderingIntent::RelativeColorimetric,
                EngineFlags::default(),
            )
            .unwrap();
        let input = [128u8, 128, 128];
        let mut output = [0u8; 3];
        engine.apply_transform(t, &input, &mut output, 1).unwrap();
        for (a, b) in input.iter().zip(output.iter()) {
            assert!((*a as i16 - *b as i16).abs() <= 3, "{a} vs {b}");
        }
    }

    #[test]
    fn gcr_requires_cmyk_destination() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let err = engine
            .create_transform(
                srgb,
                rgb8(),
                srgb,
                rgb8(),
                RenderingIntent::PreserveKOnlyRelativeGcr,
                EngineFlags::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ConvertError::TransformUnsupported(_)));
    }

    #[test]
    fn refcounting_keeps_profile_alive() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        engine.retain_profile(srgb).unwrap();
        engine.close_profile(srgb);
        assert!(engine.profile_color_family(srgb).is_ok());
        engine.close_profile(srgb);
        assert!(engine.profile_color_family(srgb).is_err());
    }

    #[test]
    fn transform_disposal() {
        let mut engine = ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        let t = engine
            .create_transform(
                srgb,
                rgb8(),
                srgb,
                rgb8(),
                RenderingIntent::Perceptual,
                EngineFlags::default(),
            )
            .unwrap();
        assert_eq!(engine.transform_count(), 1);
        engine.close_transform(t);
        assert_eq!(engine.transform_count(), 0);
    }
}
