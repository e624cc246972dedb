//! Buffer-level color conversion: the one place where pixel bytes meet the
//! color engine.
//!
//! `convert` validates its options, asks the policy for a plan, compiles or
//! reuses a transform, massages the bytes into engine-native shape, runs the
//! transform and undoes the massaging on the way out. Compiled transforms
//! are owned here and released when the converter is disposed; pages and
//! images only borrow them for the duration of a call.

use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::diag::LogContext;
use crate::engine::{
    BuiltinProfile, ColorEngine, Endianness, EnginePixelFormat, ProfileHandle, RenderingIntent,
    TransformHandle,
};
use crate::errors::{ConvertError, ConvertResult};
use crate::policy::{plan_conversion, ConversionCategory, ConversionDescriptor};

/// Options for one buffer conversion.
#[derive(Debug, Clone)]
pub struct BufferConvertOptions {
    pub source: ProfileHandle,
    pub destination: ProfileHandle,
    /// Intermediate profiles between source and destination, in order.
    pub intermediates: Vec<ProfileHandle>,
    /// Fallback bit depth for both sides. Mutually exclusive with the
    /// explicit per-side fields.
    pub bits_per_component: Option<u8>,
    pub input_bits_per_component: Option<u8>,
    pub output_bits_per_component: Option<u8>,
    pub input_endianness: Option<Endianness>,
    pub output_endianness: Option<Endianness>,
    pub intent: RenderingIntent,
    pub black_point_compensation: bool,
    pub adaptive_bpc_clamping: bool,
    pub category: ConversionCategory,
}

impl BufferConvertOptions {
    pub fn new(source: ProfileHandle, destination: ProfileHandle) -> Self {
        BufferConvertOptions {
            source,
            destination,
            intermediates: Vec::new(),
            bits_per_component: None,
            input_bits_per_component: None,
            output_bits_per_component: None,
            input_endianness: None,
            output_endianness: None,
            intent: RenderingIntent::default(),
            black_point_compensation: false,
            adaptive_bpc_clamping: false,
            category: ConversionCategory::Image,
        }
    }
}

/// Converted bytes plus the channel/pixel metadata callers need to rewrite
/// stream dictionaries.
#[derive(Debug, Clone)]
pub struct BufferConvertOutput {
    pub bytes: Vec<u8>,
    pub input_channels: usize,
    pub output_channels: usize,
    pub pixel_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransformKey {
    chain: Vec<ProfileHandle>,
    intent: RenderingIntent,
    flag_bits: u8,
    in_format: EnginePixelFormat,
    out_format: EnginePixelFormat,
}

/// LRU map from transform key to compiled transform. Process-local; each
/// worker keeps its own.
struct TransformCache {
    capacity: usize,
    map: HashMap<TransformKey, TransformHandle>,
    order: VecDeque<TransformKey>,
}

impl TransformCache {
    fn new(capacity: usize) -> Self {
        TransformCache {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &TransformKey) -> Option<TransformHandle> {
        let handle = *self.map.get(key)?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos).unwrap();
            self.order.push_back(k);
        }
        Some(handle)
    }

    fn insert(&mut self, key: TransformKey, handle: TransformHandle, engine: &mut ColorEngine) {
        while self.map.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.map.remove(&oldest) {
                engine.close_transform(evicted);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, handle);
    }

    fn clear(&mut self, engine: &mut ColorEngine) {
        for (_, handle) in self.map.drain() {
            engine.close_transform(handle);
        }
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

pub const DEFAULT_TRANSFORM_CACHE_CAPACITY: usize = 64;

/// See module docs.
pub struct BufferConverter {
    engine: ColorEngine,
    cache: TransformCache,
    builtins: HashMap<BuiltinProfile, ProfileHandle>,
    ctx: LogContext,
}

impl BufferConverter {
    pub fn new(ctx: LogContext) -> Self {
        Self::with_capacity(ctx, DEFAULT_TRANSFORM_CACHE_CAPACITY)
    }

    pub fn with_capacity(ctx: LogContext, cache_capacity: usize) -> Self {
        BufferConverter {
            engine: ColorEngine::new(),
            cache: TransformCache::new(cache_capacity),
            builtins: HashMap::new(),
            ctx,
        }
    }

    pub fn engine(&self) -> &ColorEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ColorEngine {
        &mut self.engine
    }

    /// Opens (once) and returns the handle for a builtin profile, so cache
    /// keys stay stable across conversions.
    pub fn builtin(&mut self, kind: BuiltinProfile) -> ConvertResult<ProfileHandle> {
        if let Some(&handle) = self.builtins.get(&kind) {
            return Ok(handle);
        }
        let handle = self.engine.builtin_profile(kind)?;
        self.builtins.insert(kind, handle);
        Ok(handle)
    }

    pub fn cached_transforms(&self) -> usize {
        self.cache.len()
    }

    /// Releases every compiled transform.
    pub fn dispose(&mut self) {
        self.cache.clear(&mut self.engine);
    }

    fn resolve_bits(opts: &BufferConvertOptions) -> ConvertResult<(u8, u8)> {
        if opts.bits_per_component.is_some()
            && (opts.input_bits_per_component.is_some()
                || opts.output_bits_per_component.is_some())
        {
            return Err(ConvertError::InvalidArgument(
                "bits_per_component is a fallback and cannot be combined with the explicit \
                 per-side bit depths"
                    .to_string(),
            ));
        }
        let in_bits = opts
            .input_bits_per_component
            .or(opts.bits_per_component)
            .unwrap_or(8);
        let out_bits = opts
            .output_bits_per_component
            .or(opts.bits_per_component)
            .unwrap_or(if in_bits < 8 { 8 } else { in_bits });
        Ok((in_bits, out_bits))
    }

    /// Converts `input` between the option's source and destination
    /// profiles. See the module docs for the processing order.
    pub fn convert(
        &mut self,
        input: &[u8],
        opts: &BufferConvertOptions,
    ) -> ConvertResult<BufferConvertOutput> {
        let (in_bits, out_bits) = Self::resolve_bits(opts)?;
        let input_space = self.engine.profile_color_family(opts.source)?;
        let output_space = self.engine.profile_color_family(opts.destination)?;

        let descriptor = ConversionDescriptor {
            input_space,
            input_bits: in_bits,
            input_endianness: opts.input_endianness,
            output_space,
            output_bits: out_bits,
            output_endianness: opts.output_endianness,
            intent: opts.intent,
            bpc_enabled: opts.black_point_compensation,
            adaptive_bpc_clamping: opts.adaptive_bpc_clamping,
            explicit_intermediates: opts.intermediates.len(),
            category: opts.category,
        };
        let plan = plan_conversion(&descriptor)?;

        let mut chain = Vec::with_capacity(2 + opts.intermediates.len() + 1);
        chain.push(opts.source);
        if let Some(working) = plan.inject_working_space {
            chain.push(self.builtin(working)?);
        }
        chain.extend_from_slice(&opts.intermediates);
        chain.push(opts.destination);

        let key = TransformKey {
            chain: chain.clone(),
            intent: plan.intent,
            flag_bits: plan.flags.bits(),
            in_format: plan.engine_input,
            out_format: plan.engine_output,
        };

        let (transform, cached) = match self.cache.get(&key) {
            Some(handle) => (handle, true),
            None => {
                trace!(
                    "[{}] compiling transform: chain of {} profiles, rules {:?}",
                    self.ctx.prefix(),
                    chain.len(),
                    plan.matched_rules
                );
                let handle = self.engine.create_multiprofile_transform(
                    &chain,
                    plan.engine_input,
                    plan.engine_output,
                    plan.intent,
                    plan.flags,
                )?;
                if !plan.flags.no_transform_cache {
                    self.cache.insert(key, handle, &mut self.engine);
                }
                (handle, !plan.flags.no_transform_cache)
            }
        };

        // Pre-process: coerce the input into engine-native shape.
        let mut work: Vec<u8>;
        let engine_input: &[u8] = if plan.upsample_input {
            work = upsample_to_eight(input, in_bits);
            &work
        } else if plan.swap_input {
            work = input.to_vec();
            swap16_in_place(&mut work);
            &work
        } else {
            input
        };

        let in_stride = plan.engine_input.bytes_per_pixel();
        let out_stride = plan.engine_output.bytes_per_pixel();
        if engine_input.len() % in_stride != 0 {
            return Err(ConvertError::BufferMisaligned {
                len: engine_input.len(),
                stride: in_stride,
            });
        }
        let pixel_count = engine_input.len() / in_stride;

        let mut output = vec![0u8; pixel_count * out_stride];
        let applied = self
            .engine
            .apply_transform(transform, engine_input, &mut output, pixel_count);
        if !cached {
            self.engine.close_transform(transform);
        }
        applied?;

        if plan.swap_output {
            swap16_in_place(&mut output);
        }

        Ok(BufferConvertOutput {
            bytes: output,
            input_channels: plan.engine_input.color.channels(),
            output_channels: plan.engine_output.color.channels(),
            pixel_count,
        })
    }
}

impl Drop for BufferConverter {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Expands packed 1/2/4-bit samples to one byte per sample, scaled to the
/// full 8-bit range.
fn upsample_to_eight(input: &[u8], bits: u8) -> Vec<u8> {
    debug_assert!(matches!(bits, 1 | 2 | 4));
    let per_byte = 8 / bits as usize;
    let max = (1u16 << bits) - 1;
    let mut out = Vec::with_capacity(input.len() * per_byte);
    for &byte in input {
        for i in 0..per_byte {
            let shift = 8 - bits as usize * (i + 1);
            let sample = (byte >> shift) & max as u8;
            out.push(((sample as u16 * 255) / max) as u8);
        }
    }
    out
}

fn swap16_in_place(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}
