//! Conversion policy: a pure rule engine that turns a conversion descriptor
//! into an executable plan.
//!
//! The policy owns no state and performs no I/O; every plan is reproducible
//! from its descriptor. Rules are declared in priority order and the first
//! matching rule of each category wins (flag rules compose instead, since
//! flags are orthogonal).

use crate::engine::{
    BuiltinProfile, Endianness, EngineFlags, EnginePixelFormat, PixelColor, PixelDepth,
    RenderingIntent,
};
use crate::errors::{ConvertError, ConvertResult};

/// What kind of object the buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionCategory {
    Image,
    ContentStream,
    IndexedPalette,
}

/// Everything the policy needs to know about one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionDescriptor {
    pub input_space: PixelColor,
    /// 1, 2, 4, 8, 16 or 32 (32 means float).
    pub input_bits: u8,
    pub input_endianness: Option<Endianness>,
    pub output_space: PixelColor,
    pub output_bits: u8,
    pub output_endianness: Option<Endianness>,
    pub intent: RenderingIntent,
    pub bpc_enabled: bool,
    pub adaptive_bpc_clamping: bool,
    /// Number of intermediate profiles supplied by the caller. Explicit
    /// intermediates override policy injection.
    pub explicit_intermediates: usize,
    pub category: ConversionCategory,
}

/// The executable plan derived from a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPlan {
    pub engine_input: EnginePixelFormat,
    pub engine_output: EnginePixelFormat,
    /// 1/2/4-bit input must be upsampled to 8-bit before the engine call.
    pub upsample_input: bool,
    /// 16-bit input arrives in non-native byte order and must be swapped.
    pub swap_input: bool,
    /// 16-bit output must be swapped to the caller's byte order.
    pub swap_output: bool,
    pub intent: RenderingIntent,
    pub flags: EngineFlags,
    /// Working-space profile the buffer converter must splice into the
    /// chain between source and destination.
    pub inject_working_space: Option<BuiltinProfile>,
    pub needs_multiprofile: bool,
    /// Names of the rules that fired, for diagnostics.
    pub matched_rules: Vec<&'static str>,
}

struct Rule {
    name: &'static str,
    applies: fn(&ConversionDescriptor) -> bool,
    apply: fn(&ConversionDescriptor, &mut ConversionPlan),
}

/// Intent fallbacks, first match wins.
const INTENT_RULES: &[Rule] = &[Rule {
    name: "lab-gcr-relative-fallback",
    applies: |d| {
        d.input_space == PixelColor::Lab
            && d.intent == RenderingIntent::PreserveKOnlyRelativeGcr
    },
    apply: |_, plan| plan.intent = RenderingIntent::RelativeColorimetric,
}];

/// Intermediate injection, first match wins.
const INTERMEDIATE_RULES: &[Rule] = &[
    Rule {
        name: "explicit-intermediates-override",
        applies: |d| d.explicit_intermediates > 0,
        apply: |_, plan| plan.needs_multiprofile = true,
    },
    Rule {
        // Palettes are converted through the plain buffer path only; the
        // policy never grows their chain on its own.
        name: "indexed-palette-direct",
        applies: |d| d.category == ConversionCategory::IndexedPalette,
        apply: |_, _| {},
    },
    Rule {
        name: "gray-to-cmyk-working-rgb",
        applies: |d| {
            d.input_space == PixelColor::Gray
                && d.output_space == PixelColor::Cmyk
                && d.intent == RenderingIntent::PreserveKOnlyRelativeGcr
        },
        apply: |_, plan| {
            plan.inject_working_space = Some(BuiltinProfile::SRgb);
            plan.needs_multiprofile = true;
        },
    },
    Rule {
        name: "rgb-to-cmyk-bpc-scaling",
        applies: |d| {
            d.input_space == PixelColor::Rgb
                && d.output_space == PixelColor::Cmyk
                && d.bpc_enabled
                && d.adaptive_bpc_clamping
        },
        apply: |_, plan| {
            plan.inject_working_space = Some(BuiltinProfile::LabD50);
            plan.needs_multiprofile = true;
        },
    },
];

/// Flag composition; every matching rule applies.
const FLAG_RULES: &[Rule] = &[
    Rule {
        name: "bpc",
        applies: |d| d.bpc_enabled,
        apply: |_, plan| plan.flags.black_point_compensation = true,
    },
    Rule {
        // Gray-to-gray reflows must not have their blacks lifted.
        name: "adaptive-bpc-clamp-gray",
        applies: |d| {
            d.adaptive_bpc_clamping
                && d.input_space == PixelColor::Gray
                && d.output_space == PixelColor::Gray
        },
        apply: |_, plan| {
            plan.flags.black_point_compensation = false;
            plan.flags.adaptive_bpc_clamping = true;
        },
    },
    Rule {
        name: "multiprofile-bpc-scaling",
        applies: |d| d.bpc_enabled,
        apply: |_, plan| {
            if plan.needs_multiprofile {
                plan.flags.multiprofile_bpc_scaling = true;
            }
        },
    },
    Rule {
        name: "palette-transform-no-cache",
        applies: |d| d.category == ConversionCategory::IndexedPalette,
        apply: |_, plan| plan.flags.no_transform_cache = true,
    },
];

fn depth_for_bits(bits: u8) -> ConvertResult<PixelDepth> {
    match bits {
        1 | 2 | 4 | 8 => Ok(PixelDepth::Eight),
        16 => Ok(PixelDepth::Sixteen),
        32 => Ok(PixelDepth::Float),
        other => Err(ConvertError::InvalidArgument(format!(
            "unsupported bits per component: {other}"
        ))),
    }
}

fn validate(desc: &ConversionDescriptor) -> ConvertResult<()> {
    if !matches!(desc.input_bits, 1 | 2 | 4 | 8 | 16 | 32) {
        return Err(ConvertError::InvalidArgument(format!(
            "input bits per component must be 1, 2, 4, 8, 16 or 32, got {}",
            desc.input_bits
        )));
    }
    if !matches!(desc.output_bits, 8 | 16 | 32) {
        return Err(ConvertError::InvalidArgument(format!(
            "output bits per component must be 8, 16 or 32, got {}",
            desc.output_bits
        )));
    }
    if desc.input_bits == 16 && desc.input_endianness.is_none() {
        return Err(ConvertError::InvalidArgument(
            "16-bit input requires an explicit endianness".to_string(),
        ));
    }
    if desc.output_bits == 16 && desc.output_endianness.is_none() {
        return Err(ConvertError::InvalidArgument(
            "16-bit output requires an explicit endianness".to_string(),
        ));
    }
    if desc.input_bits == 32 && desc.input_endianness.is_some() {
        return Err(ConvertError::InvalidArgument(
            "float buffers are always native; endianness is not allowed".to_string(),
        ));
    }
    if desc.output_bits == 32 && desc.output_endianness.is_some() {
        return Err(ConvertError::InvalidArgument(
            "float buffers are always native; endianness is not allowed".to_string(),
        ));
    }
    if desc.category == ConversionCategory::IndexedPalette && desc.input_bits != 8 {
        return Err(ConvertError::InvalidArgument(format!(
            "indexed palette lookups are 8-bit, got {}-bit",
            desc.input_bits
        )));
    }
    Ok(())
}

/// Evaluates the rules against a descriptor and returns the plan.
pub fn plan_conversion(desc: &ConversionDescriptor) -> ConvertResult<ConversionPlan> {
    validate(desc)?;

    let native = Endianness::native();
    let mut plan = ConversionPlan {
        engine_input: EnginePixelFormat::new(desc.input_space, depth_for_bits(desc.input_bits)?),
        engine_output: EnginePixelFormat::new(
            desc.output_space,
            depth_for_bits(desc.output_bits)?,
        ),
        upsample_input: desc.input_bits < 8,
        swap_input: desc.input_bits == 16 && desc.input_endianness != Some(native),
        swap_output: desc.output_bits == 16 && desc.output_endianness != Some(native),
        intent: desc.intent,
        flags: EngineFlags::default(),
        inject_working_space: None,
        needs_multiprofile: desc.explicit_intermediates > 0,
        matched_rules: Vec::new(),
    };

    for rule in INTENT_RULES {
        if (rule.applies)(desc) {
            (rule.apply)(desc, &mut plan);
            plan.matched_rules.push(rule.name);
            break;
        }
    }
    for rule in INTERMEDIATE_RULES {
        if (rule.applies)(desc) {
            (rule.apply)(desc, &mut plan);
            plan.matched_rules.push(rule.name);
            break;
        }
    }
    for rule in FLAG_RULES {
        if (rule.applies)(desc) {
            (rule.apply)(desc, &mut plan);
            plan.matched_rules.push(rule.name);
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ConversionDescriptor {
        ConversionDescriptor {
            input_space: PixelColor::Rgb,
            input_bits: 8,
            input_endianness: None,
            output_space: PixelColor::Cmyk,
            output_bits: 8,
            output_endianness: None,
            intent: RenderingIntent::RelativeColorimetric,
            bpc_enabled: false,
            adaptive_bpc_clamping: false,
            explicit_intermediates: 0,
            category: ConversionCategory::Image,
        }
    }

    #[test]
    fn plans_are_reproducible() {
        let desc = descriptor();
        assert_eq!(plan_conversion(&desc).unwrap(), plan_conversion(&desc).unwrap());
    }

    #[test]
    fn sixteen_bit_needs_endianness() {
        let mut desc = descriptor();
        desc.input_bits = 16;
        let err = plan_conversion(&desc).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidArgument(_)));

        desc.input_endianness = Some(Endianness::Big);
        let plan = plan_conversion(&desc).unwrap();
        assert_eq!(plan.engine_input.depth, PixelDepth::Sixteen);
        assert_eq!(plan.swap_input, Endianness::native() != Endianness::Big);
    }

    #[test]
    fn float_forbids_endianness() {
        let mut desc = descriptor();
        desc.input_bits = 32;
        desc.input_endianness = Some(Endianness::Little);
        assert!(matches!(
            plan_conversion(&desc).unwrap_err(),
            ConvertError::InvalidArgument(_)
        ));
    }

    #[test]
    fn sub_byte_input_upsamples() {
        let mut desc = descriptor();
        desc.input_space = PixelColor::Gray;
        desc.input_bits = 4;
        let plan = plan_conversion(&desc).unwrap();
        assert!(plan.upsample_input);
        assert_eq!(plan.engine_input.depth, PixelDepth::Eight);
    }

    #[test]
    fn lab_gcr_falls_back_to_relative() {
        let mut desc = descriptor();
        desc.input_space = PixelColor::Lab;
        desc.intent = RenderingIntent::PreserveKOnlyRelativeGcr;
        let plan = plan_conversion(&desc).unwrap();
        assert_eq!(plan.intent, RenderingIntent::RelativeColorimetric);
        assert!(plan.matched_rules.contains(&"lab-gcr-relative-fallback"));
    }

    #[test]
    fn gray_gcr_injects_working_rgb() {
        let mut desc = descriptor();
        desc.input_space = PixelColor::Gray;
        desc.intent = RenderingIntent::PreserveKOnlyRelativeGcr;
        let plan = plan_conversion(&desc).unwrap();
        assert_eq!(plan.inject_working_space, Some(BuiltinProfile::SRgb));
        assert!(plan.needs_multiprofile);
    }

    #[test]
    fn explicit_intermediates_override_injection() {
        let mut desc = descriptor();
        desc.input_space = PixelColor::Gray;
        desc.intent = RenderingIntent::PreserveKOnlyRelativeGcr;
        desc.explicit_intermediates = 1;
        let plan = plan_conversion(&desc).unwrap();
        assert_eq!(plan.inject_working_space, None);
        assert!(plan.needs_multiprofile);
    }

    #[test]
    fn palettes_never_gain_intermediates_and_skip_cache() {
        let mut desc = descriptor();
        desc.category = ConversionCategory::IndexedPalette;
        desc.input_space = PixelColor::Gray;
        desc.intent = RenderingIntent::PreserveKOnlyRelativeGcr;
        let plan = plan_conversion(&desc).unwrap();
        assert_eq!(plan.inject_working_space, None);
        assert!(plan.flags.no_transform_cache);
    }

    #[test]
    fn bpc_composes_with_multiprofile_scaling() {
        let mut desc = descriptor();
        desc.bpc_enabled = true;
        desc.explicit_intermediates = 1;
        let plan = plan_conversion(&desc).unwrap();
        assert!(plan.flags.black_point_compensation);
        assert!(plan.flags.multiprofile_bpc_scaling);
    }

    #[test]
    fn adaptive_clamp_drops_bpc_for_gray_reflow() {
        let mut desc = descriptor();
        desc.input_space = PixelColor::Gray;
        desc.output_space = PixelColor::Gray;
        desc.bpc_enabled = true;
        desc.adaptive_bpc_clamping = true;
        let plan = plan_conversion(&desc).unwrap();
        assert!(!plan.flags.black_point_compensation);
        assert!(plan.flags.adaptive_bpc_clamping);
    }
}
