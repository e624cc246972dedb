//! Cross-asset pre-conversion: chain planning, page cloning and execution.
//!
//! The scheduler reads the manifest, groups `(asset, layout color space)`
//! tuples into conversion chains, decides which tuple may mutate the
//! original asset page and which gets an independent copy, clones pages
//! (one clone call per chain, so no stream leaf is ever shared between
//! chains), and then runs one document converter per page subset against
//! the shared worker pool. Chains run strictly in sequence; subsets of one
//! chain feed the pool concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use lopdf::{Document, Object, ObjectId};

use crate::diag::{LogContext, SpanTree};
use crate::document::{
    embed_destination_profile, post_process, DocumentConvertOptions, DocumentConverter,
    DocumentOutcome, ReplyDisposition,
};
use crate::engine::{BuiltinProfile, ColorEngine, RenderingIntent};
use crate::errors::{ConvertError, ConvertResult, ResultExt};
use crate::fetch::{AssetFetcher, ProfileResolver, ResolvedProfile};
use crate::manifest::{ColorSpaceKind, Manifest};
use crate::utils::CancelToken;
use crate::worker::{ProfileSpec, WorkerPool};

/// One use of an asset page inside one layout color space. The
/// deduplication key is `(asset_index, layout_color_space)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetTuple {
    pub asset_index: usize,
    pub asset_color_space: String,
    pub layout_color_space: String,
}

/// Chain grouping key: direct conversion or via one intermediate profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainKey {
    Direct,
    Intermediate(String),
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKey::Direct => f.write_str("direct"),
            ChainKey::Intermediate(cs) => write!(f, "intermediate:{cs}"),
        }
    }
}

/// One tuple inside a chain, with its ownership decision.
#[derive(Debug, Clone)]
pub struct TupleAssignment {
    pub tuple: AssetTuple,
    /// May mutate the original asset page in place.
    pub uses_original: bool,
    /// Target page index, filled during cloning.
    pub page_index: Option<usize>,
}

#[derive(Debug)]
pub struct ConversionChain {
    pub key: ChainKey,
    pub intermediate: Option<ResolvedProfile>,
    pub tuples: Vec<TupleAssignment>,
}

/// `(asset_index, layout_color_space) -> page index in the target`.
#[derive(Debug, Clone, Default)]
pub struct PageMapping {
    entries: HashMap<(usize, String), usize>,
}

impl PageMapping {
    pub fn insert(&mut self, asset_index: usize, layout_cs: &str, page: usize) {
        self.entries.insert((asset_index, layout_cs.to_string()), page);
    }

    pub fn get(&self, asset_index: usize, layout_cs: &str) -> Option<usize> {
        self.entries
            .get(&(asset_index, layout_cs.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(usize, String), &usize)> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone)]
pub struct PreConvertOptions {
    pub destination_profile: Arc<Vec<u8>>,
    pub rendering_intent: RenderingIntent,
    pub bpc_enabled: bool,
    pub use_adaptive_bpc_clamping: bool,
    pub output_bits_per_component: Option<u8>,
    pub use_workers: bool,
    /// Maximum concurrent page subsets per chain.
    pub subset_count: usize,
    pub inter_conversion_delay: Option<Duration>,
    /// 0-based target page indices to convert; `None` converts every
    /// chain page.
    pub page_filter: Option<Vec<usize>>,
}

impl PreConvertOptions {
    pub fn new(destination_profile: Arc<Vec<u8>>) -> Self {
        PreConvertOptions {
            destination_profile,
            rendering_intent: RenderingIntent::default(),
            bpc_enabled: false,
            use_adaptive_bpc_clamping: false,
            output_bits_per_component: None,
            use_workers: false,
            subset_count: 2,
            inter_conversion_delay: None,
            page_filter: None,
        }
    }
}

/// Per-chain summary returned to the caller.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub key: ChainKey,
    pub tuple_count: usize,
    pub cloned_pages: usize,
}

#[derive(Debug)]
pub struct PreConvertOutcome {
    pub mapping: PageMapping,
    pub chains: Vec<ChainReport>,
    pub passthrough_tuples: usize,
    pub stats: DocumentOutcome,
    /// Object id of the embedded destination profile stream.
    pub dest_ref: ObjectId,
}

enum TupleKind {
    Passthrough,
    Chain(ChainKey),
}

/// Plans and executes the complete cross-asset conversion. The document is
/// the asset library (one page per manifest asset, in order) and is mutated
/// into the conversion target.
#[allow(clippy::too_many_arguments)]
pub fn pre_convert<F: AssetFetcher>(
    doc: &mut Document,
    manifest: &Manifest,
    resolver: &ProfileResolver<'_, F>,
    options: &PreConvertOptions,
    pool: Option<&WorkerPool>,
    cancel: &CancelToken,
    diag: &mut SpanTree,
    on_page_converted: &mut dyn FnMut(usize),
) -> ConvertResult<PreConvertOutcome> {
    let root_span = diag.open("pre-convert", None);

    // 1. Enumerate unique tuples.
    let mut tuples: Vec<AssetTuple> = Vec::new();
    let mut seen: HashSet<(usize, String)> = HashSet::new();
    for layout in &manifest.layouts {
        for asset_ref in &layout.assets {
            let asset_index = manifest.asset_index(&asset_ref.asset).ok_or_else(|| {
                ConvertError::InvalidArgument(format!(
                    "layout {} references unknown asset {}",
                    layout.layout, asset_ref.asset
                ))
            })?;
            if seen.insert((asset_index, layout.color_space.clone())) {
                tuples.push(AssetTuple {
                    asset_index,
                    asset_color_space: asset_ref.color_space.clone(),
                    layout_color_space: layout.color_space.clone(),
                });
            }
        }
    }
    diag.add_metric(root_span, "tuples", tuples.len() as f64);

    // 2. Classify per tuple and group into chains.
    let mut chains: Vec<ConversionChain> = Vec::new();
    let mut passthrough: Vec<AssetTuple> = Vec::new();
    let mut passthrough_assets: HashSet<usize> = HashSet::new();
    for tuple in tuples {
        match classify(&tuple, resolver)? {
            TupleKind::Passthrough => {
                passthrough_assets.insert(tuple.asset_index);
                passthrough.push(tuple);
            }
            TupleKind::Chain(key) => {
                let chain = match chains.iter_mut().find(|c| c.key == key) {
                    Some(chain) => chain,
                    None => {
                        let intermediate = match &key {
                            ChainKey::Direct => None,
                            ChainKey::Intermediate(cs) => Some(resolver.resolve(cs)?),
                        };
                        chains.push(ConversionChain {
                            key: key.clone(),
                            intermediate,
                            tuples: Vec::new(),
                        });
                        chains.last_mut().unwrap()
                    }
                };
                chain.tuples.push(TupleAssignment {
                    tuple,
                    uses_original: false,
                    page_index: None,
                });
            }
        }
    }
    chains.sort_by(|a, b| a.key.cmp(&b.key));

    // 3. Assign originals and copies: an original may be claimed by exactly
    // one chain, and never when a passthrough consumer uses it.
    let mut claimed: HashSet<usize> = HashSet::new();
    for chain in &mut chains {
        for assignment in &mut chain.tuples {
            let asset = assignment.tuple.asset_index;
            if !passthrough_assets.contains(&asset) && claimed.insert(asset) {
                assignment.uses_original = true;
                assignment.page_index = Some(asset);
            }
        }
    }

    // 4. Clone multi-chain pages: one clone call per chain, each with a
    // fresh copier cache, so chains never share a mutable stream leaf.
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let mut next_page_index = page_ids.len();
    let mut reports = Vec::new();
    for chain in &mut chains {
        let copy_sources: Vec<ObjectId> = chain
            .tuples
            .iter()
            .filter(|a| !a.uses_original)
            .map(|a| {
                page_ids.get(a.tuple.asset_index).copied().ok_or_else(|| {
                    ConvertError::InvalidArgument(format!(
                        "asset {} has no page in the library document",
                        a.tuple.asset_index
                    ))
                })
            })
            .collect::<ConvertResult<_>>()?;

        if !copy_sources.is_empty() {
            // A repeated source inside one clone call would collapse into a
            // single copy; spill repeats into follow-up calls so every
            // tuple receives its own page.
            let mut batches: Vec<Vec<ObjectId>> = Vec::new();
            let mut occurrence: HashMap<ObjectId, usize> = HashMap::new();
            for &src in &copy_sources {
                let n = occurrence.entry(src).or_insert(0);
                if batches.len() <= *n {
                    batches.push(Vec::new());
                }
                batches[*n].push(src);
                *n += 1;
            }

            let mut available: HashMap<ObjectId, Vec<usize>> = HashMap::new();
            for batch in &batches {
                clone_pages(doc, batch).in_chain(&chain.key.to_string())?;
                for &src in batch {
                    available.entry(src).or_default().push(next_page_index);
                    next_page_index += 1;
                }
            }
            for assignment in chain.tuples.iter_mut().filter(|a| !a.uses_original) {
                let src = page_ids[assignment.tuple.asset_index];
                let indices = available.get_mut(&src).expect("clone batch covers tuple");
                assignment.page_index = Some(indices.remove(0));
            }
        }
        reports.push(ChainReport {
            key: chain.key.clone(),
            tuple_count: chain.tuples.len(),
            cloned_pages: copy_sources.len(),
        });
        debug!(
            "chain {}: {} tuples, {} cloned pages",
            chain.key,
            chain.tuples.len(),
            copy_sources.len()
        );
    }

    // Destination bookkeeping shared by every chain.
    let (dest_ref, dest_family, identifier) = {
        let mut engine = ColorEngine::new();
        let handle = engine.open_profile(&options.destination_profile)?;
        let family = engine.profile_color_family(handle)?;
        let identifier = engine
            .profile_description(handle)
            .unwrap_or_else(|| "Custom output condition".to_string());
        (
            embed_destination_profile(doc, &options.destination_profile, family),
            family,
            identifier,
        )
    };

    let defaults = default_sources(manifest, resolver)?;
    let lab_bytes = builtin_lab_bytes()?;

    // 5. Execute chains sequentially; subsets of one chain run against the
    // pool concurrently.
    let mut stats = DocumentOutcome::default();
    for chain in &chains {
        cancel.check().in_chain(&chain.key.to_string())?;
        let chain_span = diag.open(&format!("chain:{}", chain.key), Some(root_span));

        let intermediate_bytes: Vec<Arc<Vec<u8>>> = match &chain.intermediate {
            None | Some(ResolvedProfile::Passthrough) => Vec::new(),
            Some(ResolvedProfile::Bytes(bytes)) => vec![bytes.clone()],
            Some(ResolvedProfile::BuiltinLab) => vec![lab_bytes.clone()],
        };

        // Pages sharing one asset color space run under one converter
        // configuration (the asset profile is the source for device
        // spaces on those pages).
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for assignment in &chain.tuples {
            if let Some(page) = assignment.page_index {
                if let Some(filter) = &options.page_filter {
                    if !filter.contains(&page) {
                        continue;
                    }
                }
                groups
                    .entry(assignment.tuple.asset_color_space.clone())
                    .or_default()
                    .push(page);
            }
        }

        let mut broadcast_pending = options.use_workers && pool.is_some();
        for (asset_cs, pages) in groups {
            cancel.check().in_chain(&chain.key.to_string())?;
            let sources =
                sources_for_group(&asset_cs, manifest, resolver, &defaults)?;
            let subsets = partition_round_robin(&pages, options.subset_count.max(1));

            let mut converters: Vec<DocumentConverter> = Vec::with_capacity(subsets.len());
            for subset in subsets {
                let mut doc_options =
                    DocumentConvertOptions::new(options.destination_profile.clone());
                doc_options.destination_color_space = Some(dest_family);
                doc_options.intermediate_profiles = intermediate_bytes.clone();
                doc_options.source_gray = sources.gray.clone();
                doc_options.source_rgb = sources.rgb.clone();
                doc_options.source_cmyk = sources.cmyk.clone();
                doc_options.rendering_intent = options.rendering_intent;
                doc_options.bpc_enabled = options.bpc_enabled;
                doc_options.use_adaptive_bpc_clamping = options.use_adaptive_bpc_clamping;
                doc_options.output_bits_per_component = options.output_bits_per_component;
                doc_options.use_workers = options.use_workers;
                doc_options.pages = Some(subset);
                doc_options.inter_conversion_delay = options.inter_conversion_delay;
                doc_options.existing_dest_ref = Some(dest_ref);
                doc_options.broadcast_shared = broadcast_pending;
                broadcast_pending = false;
                converters.push(DocumentConverter::new(
                    doc_options,
                    pool,
                    cancel.clone(),
                    LogContext::default(),
                ));
            }

            // Dispatch all subsets before draining any: their image tasks
            // share the pool concurrently while this thread stays the only
            // writer of the document.
            for converter in &mut converters {
                converter
                    .begin(doc, on_page_converted)
                    .in_chain(&chain.key.to_string())?;
            }
            // Route replies to whichever subset converter owns the task.
            if let Some(pool) = pool {
                let mut in_flight: usize =
                    converters.iter().map(DocumentConverter::pending_count).sum();
                while in_flight > 0 {
                    let received = pool.recv_reply().in_chain(&chain.key.to_string())?;
                    let (pixels, worker_ms) = (received.pixels, received.duration_ms);
                    let mut reply = Some(received);
                    for converter in &mut converters {
                        let Some(r) = reply.take() else { break };
                        match converter
                            .apply_reply(doc, r, on_page_converted)
                            .in_chain(&chain.key.to_string())?
                        {
                            ReplyDisposition::Applied => {
                                in_flight -= 1;
                                diag.add_metric(chain_span, "worker_pixels", pixels as f64);
                                diag.add_metric(chain_span, "worker_ms", worker_ms);
                            }
                            ReplyDisposition::Requeued => {}
                            ReplyDisposition::NotMine(r) => reply = Some(r),
                        }
                    }
                    if let Some(stale) = reply {
                        debug!("dropping stale worker reply for task {}", stale.task_id);
                    }
                }
            }
            for converter in &mut converters {
                let outcome = converter.outcome().clone();
                stats.pages_converted += outcome.pages_converted;
                stats.images_converted += outcome.images_converted;
                stats.images_skipped += outcome.images_skipped;
                stats.rewritten_ops += outcome.rewritten_ops;
                diag.add_metric(chain_span, "images", outcome.images_converted as f64);
                converter.dispose();
            }
        }
        diag.close(chain_span);
    }

    post_process(doc, dest_ref, dest_family, identifier)?;

    // 6. Page mapping: converted tuples plus untouched passthrough pages.
    let mut mapping = PageMapping::default();
    for chain in &chains {
        for assignment in &chain.tuples {
            if let Some(page) = assignment.page_index {
                mapping.insert(
                    assignment.tuple.asset_index,
                    &assignment.tuple.layout_color_space,
                    page,
                );
            }
        }
    }
    for tuple in &passthrough {
        mapping.insert(tuple.asset_index, &tuple.layout_color_space, tuple.asset_index);
    }

    diag.close(root_span);
    info!(
        "pre-conversion done: {} chains, {} mapped tuples, {} passthrough",
        chains.len(),
        mapping.len(),
        passthrough.len()
    );

    Ok(PreConvertOutcome {
        mapping,
        chains: reports,
        passthrough_tuples: passthrough.len(),
        stats,
        dest_ref,
    })
}

fn classify<F: AssetFetcher>(
    tuple: &AssetTuple,
    resolver: &ProfileResolver<'_, F>,
) -> ConvertResult<TupleKind> {
    let asset_profile = resolver.resolve(&tuple.asset_color_space)?;
    if asset_profile.is_passthrough() {
        return Ok(TupleKind::Passthrough);
    }
    if tuple.asset_color_space == tuple.layout_color_space {
        return Ok(TupleKind::Chain(ChainKey::Direct));
    }
    let layout_profile = resolver.resolve(&tuple.layout_color_space)?;
    if layout_profile.is_passthrough() {
        return Ok(TupleKind::Chain(ChainKey::Direct));
    }
    Ok(TupleKind::Chain(ChainKey::Intermediate(
        tuple.layout_color_space.clone(),
    )))
}

#[derive(Debug, Clone, Default)]
struct GroupSources {
    gray: Option<ProfileSpec>,
    rgb: Option<ProfileSpec>,
    cmyk: Option<ProfileSpec>,
}

fn spec_for(resolved: &ResolvedProfile) -> Option<ProfileSpec> {
    match resolved {
        ResolvedProfile::Bytes(bytes) => Some(ProfileSpec::Bytes(bytes.clone())),
        ResolvedProfile::BuiltinLab => Some(ProfileSpec::Builtin(BuiltinProfile::LabD50)),
        ResolvedProfile::Passthrough => None,
    }
}

/// Manifest-level default source profiles for device spaces.
fn default_sources<F: AssetFetcher>(
    manifest: &Manifest,
    resolver: &ProfileResolver<'_, F>,
) -> ConvertResult<GroupSources> {
    let cm = &manifest.settings.color_management;
    let mut sources = GroupSources::default();
    if let Some(name) = &cm.default_source_profile_for_device_gray {
        sources.gray = spec_for(&resolver.resolve(name)?);
    }
    if let Some(name) = &cm.default_source_profile_for_device_rgb {
        sources.rgb = spec_for(&resolver.resolve(name)?);
    }
    if let Some(name) = &cm.default_source_profile_for_device_cmyk {
        sources.cmyk = spec_for(&resolver.resolve(name)?);
    }
    Ok(sources)
}

/// The asset's declared color space interprets device data on its pages;
/// it overrides the manifest default for its own family.
fn sources_for_group<F: AssetFetcher>(
    asset_cs: &str,
    manifest: &Manifest,
    resolver: &ProfileResolver<'_, F>,
    defaults: &GroupSources,
) -> ConvertResult<GroupSources> {
    let mut sources = defaults.clone();
    let Some(def) = manifest.color_spaces.get(asset_cs) else {
        return Ok(sources);
    };
    let spec = spec_for(&resolver.resolve(asset_cs)?);
    match def.kind {
        ColorSpaceKind::Gray => sources.gray = spec.or(sources.gray),
        ColorSpaceKind::Rgb => sources.rgb = spec.or(sources.rgb),
        ColorSpaceKind::Cmyk => sources.cmyk = spec.or(sources.cmyk),
        ColorSpaceKind::Lab | ColorSpaceKind::DeviceN => {}
    }
    Ok(sources)
}

fn builtin_lab_bytes() -> ConvertResult<Arc<Vec<u8>>> {
    let mut engine = ColorEngine::new();
    let lab = engine.builtin_profile(BuiltinProfile::LabD50)?;
    Ok(Arc::new(engine.profile_bytes(lab)?))
}

fn partition_round_robin(pages: &[usize], subsets: usize) -> Vec<Vec<usize>> {
    let count = subsets.min(pages.len()).max(1);
    let mut out = vec![Vec::new(); count];
    for (i, page) in pages.iter().enumerate() {
        out[i % count].push(*page);
    }
    out.retain(|s| !s.is_empty());
    out
}

/// Deep-copies the given pages into the document and appends them to the
/// page tree, in order. The copier's deduplication cache is local to this
/// call: within one call shared objects are copied once, across calls
/// nothing is ever shared.
pub fn clone_pages(doc: &mut Document, sources: &[ObjectId]) -> ConvertResult<Vec<ObjectId>> {
    let pages_root = pages_root(doc)?;
    let mut memo: HashMap<ObjectId, ObjectId> = HashMap::new();
    let mut new_ids = Vec::with_capacity(sources.len());
    for &source in sources {
        let new_id = copy_object_graph(doc, source, &mut memo)?;
        let page = doc.get_object_mut(new_id)?.as_dict_mut()?;
        page.set("Parent", Object::Reference(pages_root));
        new_ids.push(new_id);
    }

    let pages = doc.get_object_mut(pages_root)?.as_dict_mut()?;
    let kids = match pages.get_mut(b"Kids") {
        Ok(Object::Array(kids)) => kids,
        _ => {
            return Err(ConvertError::InvalidArgument(
                "page tree root has no Kids array".to_string(),
            ))
        }
    };
    for id in &new_ids {
        kids.push(Object::Reference(*id));
    }
    let count = kids.len() as i64;
    pages.set("Count", Object::Integer(count));
    Ok(new_ids)
}

fn pages_root(doc: &Document) -> ConvertResult<ObjectId> {
    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(ConvertError::Pdf)?;
    let catalog = doc.get_object(catalog_id)?.as_dict()?;
    Ok(catalog.get(b"Pages")?.as_reference()?)
}

fn copy_object_graph(
    doc: &mut Document,
    source: ObjectId,
    memo: &mut HashMap<ObjectId, ObjectId>,
) -> ConvertResult<ObjectId> {
    if let Some(&existing) = memo.get(&source) {
        return Ok(existing);
    }
    let new_id = doc.new_object_id();
    // Registered before recursing so reference cycles terminate.
    memo.insert(source, new_id);
    let value = doc.get_object(source)?.clone();
    let copied = copy_object_value(doc, value, memo)?;
    doc.objects.insert(new_id, copied);
    Ok(new_id)
}

fn copy_object_value(
    doc: &mut Document,
    value: Object,
    memo: &mut HashMap<ObjectId, ObjectId>,
) -> ConvertResult<Object> {
    Ok(match value {
        Object::Reference(id) => Object::Reference(copy_object_graph(doc, id, memo)?),
        Object::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(copy_object_value(doc, item, memo)?);
            }
            Object::Array(out)
        }
        Object::Dictionary(dict) => Object::Dictionary(copy_dictionary(doc, dict, memo)?),
        Object::Stream(mut stream) => {
            stream.dict = copy_dictionary(doc, stream.dict, memo)?;
            Object::Stream(stream)
        }
        other => other,
    })
}

fn copy_dictionary(
    doc: &mut Document,
    dict: lopdf::Dictionary,
    memo: &mut HashMap<ObjectId, ObjectId>,
) -> ConvertResult<lopdf::Dictionary> {
    let mut out = lopdf::Dictionary::new();
    for (key, value) in dict.iter() {
        // Parent links would drag the whole page tree into the copy; the
        // caller re-points them at the tree root.
        if key == b"Parent" {
            out.set(key.clone(), value.clone());
            continue;
        }
        out.set(key.clone(), copy_object_value(doc, value.clone(), memo)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::CachingFetcher;
    use crate::manifest::{AssetEntry, ColorSpaceDef, LayoutEntry};
    use lopdf::dictionary;
    use std::time::Duration;

    struct MapFetcher(HashMap<String, Vec<u8>>);

    impl AssetFetcher for MapFetcher {
        fn fetch(&self, url: &str, _t: Duration) -> ConvertResult<Vec<u8>> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| ConvertError::AssetFetchFailed {
                    url: url.to_string(),
                    reason: "missing".to_string(),
                })
        }
        fn content_length(&self, url: &str, _t: Duration) -> ConvertResult<Option<u64>> {
            Ok(self.0.get(url).map(|b| b.len() as u64))
        }
    }

    fn builtin_bytes(kind: BuiltinProfile) -> Vec<u8> {
        let mut engine = ColorEngine::new();
        let handle = engine.builtin_profile(kind).unwrap();
        engine.profile_bytes(handle).unwrap()
    }

    /// Library with one RGB image page per asset.
    fn library(assets: usize) -> (Document, Vec<ObjectId>) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids = Vec::new();
        let mut image_ids = Vec::new();
        for n in 0..assets {
            let image_id = doc.add_object(Object::Stream(lopdf::Stream::new(
                dictionary! {
                    "Type" => Object::Name(b"XObject".to_vec()),
                    "Subtype" => Object::Name(b"Image".to_vec()),
                    "Width" => 1,
                    "Height" => 1,
                    "BitsPerComponent" => 8,
                    "ColorSpace" => Object::Name(b"DeviceRGB".to_vec()),
                },
                vec![10 * (n as u8 + 1), 20, 30],
            )));
            image_ids.push(image_id);
            let content_id = doc.add_object(Object::Stream(lopdf::Stream::new(
                lopdf::Dictionary::new(),
                b"0.3 g 0 0 4 4 re f".to_vec(),
            )));
            let page_id = doc.add_object(Object::Dictionary(dictionary! {
                "Type" => Object::Name(b"Page".to_vec()),
                "Parent" => Object::Reference(pages_id),
                "Resources" => Object::Dictionary(dictionary! {
                    "XObject" => Object::Dictionary(dictionary! {
                        "Im0" => Object::Reference(image_id),
                    }),
                }),
                "Contents" => Object::Reference(content_id),
                "MediaBox" => Object::Array(vec![
                    Object::Integer(0), Object::Integer(0),
                    Object::Integer(50), Object::Integer(50),
                ]),
            }));
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => Object::Name(b"Pages".to_vec()),
                "Count" => Object::Integer(assets as i64),
                "Kids" => Object::Array(kids),
            }),
        );
        let catalog_id = doc.add_object(Object::Dictionary(dictionary! {
            "Type" => Object::Name(b"Catalog".to_vec()),
            "Pages" => Object::Reference(pages_id),
        }));
        doc.trailer.set("Root", Object::Reference(catalog_id));
        (doc, image_ids)
    }

    fn manifest_two_layouts() -> Manifest {
        let mut manifest = Manifest::default();
        manifest.color_spaces.insert(
            "sRGB".to_string(),
            ColorSpaceDef {
                kind: ColorSpaceKind::Rgb,
                profile: Some("srgb.icc".to_string()),
            },
        );
        manifest.color_spaces.insert(
            "CIELAB".to_string(),
            ColorSpaceDef {
                kind: ColorSpaceKind::Lab,
                profile: Some("Lab".to_string()),
            },
        );
        manifest.assets.push(AssetEntry {
            asset: "A0".to_string(),
            color_space: "sRGB".to_string(),
        });
        manifest.layouts.push(LayoutEntry {
            layout: "L0".to_string(),
            color_space: "sRGB".to_string(),
            assets: vec![AssetEntry {
                asset: "A0".to_string(),
                color_space: "sRGB".to_string(),
            }],
        });
        manifest.layouts.push(LayoutEntry {
            layout: "L1".to_string(),
            color_space: "CIELAB".to_string(),
            assets: vec![AssetEntry {
                asset: "A0".to_string(),
                color_space: "sRGB".to_string(),
            }],
        });
        manifest
    }

    fn run(
        doc: &mut Document,
        manifest: &Manifest,
        fetcher: &CachingFetcher<MapFetcher>,
    ) -> PreConvertOutcome {
        let resolver =
            ProfileResolver::new(manifest, fetcher, "", Duration::from_millis(10));
        let options =
            PreConvertOptions::new(Arc::new(builtin_bytes(BuiltinProfile::SRgb)));
        let cancel = CancelToken::new();
        let mut diag = SpanTree::new();
        pre_convert(
            doc,
            manifest,
            &resolver,
            &options,
            None,
            &cancel,
            &mut diag,
            &mut |_| {},
        )
        .unwrap()
    }

    #[test]
    fn two_layouts_fork_the_asset_into_independent_pages() {
        let (mut doc, _) = library(1);
        let manifest = manifest_two_layouts();
        let fetcher = CachingFetcher::new(MapFetcher(
            vec![("srgb.icc".to_string(), builtin_bytes(BuiltinProfile::SRgb))]
                .into_iter()
                .collect(),
        ));

        let outcome = run(&mut doc, &manifest, &fetcher);

        // Direct chain claimed the original, the Lab chain got a clone.
        assert_eq!(doc.get_pages().len(), 2);
        let direct_page = outcome.mapping.get(0, "sRGB").unwrap();
        let lab_page = outcome.mapping.get(0, "CIELAB").unwrap();
        assert_ne!(direct_page, lab_page);

        // The two pages reference distinct image stream objects.
        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        let image_of = |doc: &Document, page: ObjectId| -> ObjectId {
            let page = doc.get_object(page).unwrap().as_dict().unwrap();
            let res = page.get(b"Resources").unwrap().as_dict().unwrap();
            let xo = res.get(b"XObject").unwrap().as_dict().unwrap();
            xo.get(b"Im0").unwrap().as_reference().unwrap()
        };
        let im_a = image_of(&doc, pages[direct_page]);
        let im_b = image_of(&doc, pages[lab_page]);
        assert_ne!(im_a, im_b, "chains share no stream leaf");

        let report_keys: Vec<String> =
            outcome.chains.iter().map(|c| c.key.to_string()).collect();
        assert_eq!(report_keys, vec!["direct", "intermediate:CIELAB"]);
    }

    #[test]
    fn passthrough_assets_stay_byte_identical() {
        let (mut doc, image_ids) = library(1);
        let before = {
            let stream = doc.get_object(image_ids[0]).unwrap().as_stream().unwrap();
            (stream.dict.clone(), stream.content.clone())
        };

        let mut manifest = Manifest::default();
        manifest.color_spaces.insert(
            "SpotGold".to_string(),
            ColorSpaceDef {
                kind: ColorSpaceKind::DeviceN,
                profile: None,
            },
        );
        manifest.assets.push(AssetEntry {
            asset: "A0".to_string(),
            color_space: "SpotGold".to_string(),
        });
        manifest.layouts.push(LayoutEntry {
            layout: "L0".to_string(),
            color_space: "SpotGold".to_string(),
            assets: vec![AssetEntry {
                asset: "A0".to_string(),
                color_space: "SpotGold".to_string(),
            }],
        });

        let fetcher = CachingFetcher::new(MapFetcher(HashMap::new()));
        let outcome = run(&mut doc, &manifest, &fetcher);

        assert_eq!(outcome.passthrough_tuples, 1);
        assert_eq!(outcome.mapping.get(0, "SpotGold"), Some(0));

        let stream = doc.get_object(image_ids[0]).unwrap().as_stream().unwrap();
        assert_eq!(stream.dict, before.0);
        assert_eq!(stream.content, before.1);

        // The output intent is still installed.
        let catalog_id = doc.trailer.get(b"Root").unwrap().as_reference().unwrap();
        let catalog = doc.get_object(catalog_id).unwrap().as_dict().unwrap();
        assert!(catalog.has(b"OutputIntents"));
    }

    #[test]
    fn separate_clone_calls_share_nothing() {
        let (mut doc, image_ids) = library(1);
        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        let first = clone_pages(&mut doc, &[pages[0]]).unwrap();
        let second = clone_pages(&mut doc, &[pages[0]]).unwrap();
        assert_eq!(doc.get_pages().len(), 3);

        let image_of = |doc: &Document, page: ObjectId| -> ObjectId {
            let page = doc.get_object(page).unwrap().as_dict().unwrap();
            let res = page.get(b"Resources").unwrap().as_dict().unwrap();
            let xo = res.get(b"XObject").unwrap().as_dict().unwrap();
            xo.get(b"Im0").unwrap().as_reference().unwrap()
        };
        let a = image_of(&doc, first[0]);
        let b = image_of(&doc, second[0]);
        assert_ne!(a, b);
        assert_ne!(a, image_ids[0]);
        assert_ne!(b, image_ids[0]);
    }

    #[test]
    fn one_clone_call_deduplicates_within_itself() {
        let (mut doc, _) = library(1);
        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        let cloned = clone_pages(&mut doc, &[pages[0], pages[0]]).unwrap();
        assert_eq!(cloned.len(), 2);
        // Same source in one call resolves to the same copy.
        assert_eq!(cloned[0], cloned[1]);
    }

    #[test]
    fn round_robin_partition_covers_all_pages() {
        let pages = vec![0, 1, 2, 3, 4];
        let subsets = partition_round_robin(&pages, 2);
        assert_eq!(subsets.len(), 2);
        let mut all: Vec<usize> = subsets.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, pages);

        assert_eq!(partition_round_robin(&[7], 4), vec![vec![7]]);
    }
}
