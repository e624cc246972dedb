//! # pressform
//!
//! pressform recolors a library of PDF test-form pages to an
//! operator-supplied destination ICC profile and assembles them into a
//! single press-ready (PDF/X style) document: conforming output intent,
//! destination-family transparency blending spaces, and the generation
//! manifest embedded alongside the pages.
//!
//! The crate is a layered pipeline. At the bottom, [`engine`] wraps the
//! ICC engine behind a handle-based adapter and [`policy`] turns conversion
//! descriptors into executable plans. [`buffer`] runs pixel bytes through
//! compiled (and cached) transforms; [`image`] and [`content`] apply that
//! to image streams and content-stream operators; [`page`] and [`document`]
//! walk the PDF structure; [`scheduler`] plans conversion chains across the
//! whole asset library and [`worker`] hosts the parallel pixel workers.
//! [`generate`] is the top-level entry point.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pressform::{
//!     generate, CachingFetcher, CancelToken, GenerateCallbacks, GenerateOptions,
//! };
//! # struct MyFetcher;
//! # impl pressform::AssetFetcher for MyFetcher {
//! #     fn fetch(&self, _: &str, _: std::time::Duration) -> pressform::ConvertResult<Vec<u8>> { unimplemented!() }
//! #     fn content_length(&self, _: &str, _: std::time::Duration) -> pressform::ConvertResult<Option<u64>> { unimplemented!() }
//! # }
//! # let (manifest_json, library_pdf, icc) = (vec![], vec![], vec![]);
//!
//! let fetcher = CachingFetcher::new(MyFetcher);
//! let output = generate(
//!     "1.0.0",
//!     &manifest_json,
//!     &library_pdf,
//!     Arc::new(icc),
//!     None,
//!     &GenerateOptions::default(),
//!     &fetcher,
//!     &CancelToken::new(),
//!     &mut GenerateCallbacks::default(),
//! )?;
//! std::fs::write("testforms.pdf", output.pdf_bytes)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod color_space;
pub mod content;
pub mod diag;
pub mod document;
pub mod engine;
pub mod errors;
pub mod fetch;
pub mod generate;
pub mod image;
pub mod manifest;
pub mod page;
pub mod policy;
pub mod scheduler;
pub mod utils;
pub mod worker;

pub use crate::buffer::{BufferConvertOptions, BufferConvertOutput, BufferConverter};
pub use crate::diag::{ContextKind, LogContext, Span, SpanStatus, SpanTree};
pub use crate::document::{
    DocumentConvertOptions, DocumentConverter, DocumentOutcome, ReplyDisposition,
};
pub use crate::engine::{
    BuiltinProfile, ColorEngine, Endianness, EngineFlags, EnginePixelFormat, PixelColor,
    PixelDepth, ProfileHandle, RenderingIntent, TransformHandle,
};
pub use crate::errors::{ConvertError, ConvertResult};
pub use crate::fetch::{AssetFetcher, CachingFetcher, ProfileResolver, ResolvedProfile};
pub use crate::generate::{
    generate, GenerateCallbacks, GenerateOptions, GenerateOutput, OutputBits,
    ProcessingStrategy, SlugRenderer, Stage,
};
pub use crate::manifest::Manifest;
pub use crate::scheduler::{
    pre_convert, AssetTuple, ChainKey, PageMapping, PreConvertOptions, PreConvertOutcome,
};
pub use crate::utils::CancelToken;
pub use crate::worker::{ChainSpec, ProfileSpec, SharedProfiles, WorkerPool};
