//! Error types shared by every conversion layer.
//!
//! Leaf layers return the typed kinds below; intermediate layers annotate
//! with their location (page index, chain key) via [`ResultExt`] and rethrow.
//! The scheduler is the only layer that turns a kind into a retry-or-abort
//! decision, so [`ConvertError::kind`] sees through the annotation wrappers.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ConvertResult<T> = Result<T, ConvertError>;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// ICC bytes failed parsing; fatal for the containing conversion.
    #[error("malformed ICC profile: {0}")]
    ProfileMalformed(String),

    /// The engine rejected the requested format/intent combination.
    #[error("transform unsupported by color engine: {0}")]
    TransformUnsupported(String),

    /// Buffer length is not a multiple of the pixel stride.
    #[error("buffer of {len} bytes is not a multiple of the {stride}-byte pixel stride")]
    BufferMisaligned { len: usize, stride: usize },

    /// Caller passed contradictory or out-of-range options.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An image uses a stream filter the converter cannot reverse.
    /// The image is skipped with a warning; the document completes.
    #[error("unsupported stream filter {0}")]
    StreamFilterUnsupported(String),

    /// Asset fetch failed after retries.
    #[error("failed to fetch {url}: {reason}")]
    AssetFetchFailed { url: String, reason: String },

    /// A worker thread panicked while processing a task.
    #[error("worker {worker} crashed: {reason}")]
    WorkerCrashed { worker: usize, reason: String },

    /// Conversion canceled through the cancellation token.
    #[error("conversion canceled")]
    Canceled,

    /// Object-graph access failure reported by the PDF library.
    #[error("pdf structure error: {0}")]
    Pdf(#[from] lopdf::Error),

    /// Annotation wrapper: error occurred while converting a page.
    #[error("{source} (page {page})")]
    OnPage {
        page: usize,
        #[source]
        source: Box<ConvertError>,
    },

    /// Annotation wrapper: error occurred while executing a chain.
    #[error("{source} (chain {chain})")]
    InChain {
        chain: String,
        #[source]
        source: Box<ConvertError>,
    },
}

impl ConvertError {
    /// Strips the location annotations and returns the underlying kind.
    pub fn kind(&self) -> &ConvertError {
        match self {
            ConvertError::OnPage { source, .. } => source.kind(),
            ConvertError::InChain { source, .. } => source.kind(),
            other => other,
        }
    }

    /// True for errors the page converter treats as "skip this object,
    /// keep going".
    pub fn is_skippable(&self) -> bool {
        matches!(self.kind(), ConvertError::StreamFilterUnsupported(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.kind(), ConvertError::Canceled)
    }
}

/// Location-annotation helpers for `ConvertResult`.
pub trait ResultExt<T> {
    fn on_page(self, page: usize) -> ConvertResult<T>;
    fn in_chain(self, chain: &str) -> ConvertResult<T>;
}

impl<T> ResultExt<T> for ConvertResult<T> {
    fn on_page(self, page: usize) -> ConvertResult<T> {
        self.map_err(|e| ConvertError::OnPage {
            page,
            source: Box::new(e),
        })
    }

    fn in_chain(self, chain: &str) -> ConvertResult<T> {
        self.map_err(|e| ConvertError::InChain {
            chain: chain.to_string(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sees_through_annotations() {
        let e: ConvertResult<()> = Err(ConvertError::Canceled);
        let e = e.on_page(4).in_chain("intermediate:sRGB").unwrap_err();
        assert!(e.is_canceled());
        assert!(e.to_string().contains("page 4"));
        assert!(e.to_string().contains("chain intermediate:sRGB"));
    }

    #[test]
    fn skippable_only_for_filter_errors() {
        let e = ConvertError::StreamFilterUnsupported("JPXDecode".into());
        assert!(e.is_skippable());
        let e = ConvertError::InvalidArgument("x".into());
        assert!(!e.is_skippable());
    }
}
