pub mod cancel;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod error;
pub mod extraction;
pub mod pipeline;
pub mod scanner;
pub mod signatures;
pub mod source;
pub mod task;

pub use cancel::CancelToken;
pub use classifier::{Eye, StereoAssignment, classify};
pub use config::ScanConfig;
pub use decoder::{
    BoundedDecoder, DecodeBudget, DecodedImage, ImageCodec, JpegCodec, downscale_factor,
};
pub use error::{
    ClassifyError, CodecError, ConfigError, DecodeError, ExtractError, PipelineError, Result,
    ScanError, SourceError,
};
pub use extraction::extract_sub_images;
pub use pipeline::{ContainerPipeline, PipelineStage, StageTracker, StereoPair, scan_and_load};
pub use scanner::{DEFAULT_CHUNK_SIZE, OffsetScanner, scan_offsets};
pub use signatures::{EXIF_SOI, JFIF_SOI, Signature, SignatureSet};
pub use source::{ByteSource, FileSource, MemorySource, MmapSource, StreamSource, open_source};
pub use task::{LoadHandle, StereoSlot, spawn_load};
