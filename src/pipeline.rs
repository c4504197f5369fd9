//! Scan → classify → decode, once per container.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::classifier::{Eye, StereoAssignment, classify};
use crate::config::ScanConfig;
use crate::decoder::{BoundedDecoder, DecodeBudget, DecodedImage, ImageCodec, JpegCodec};
use crate::error::{ConfigError, PipelineError, Result};
use crate::scanner::{DEFAULT_CHUNK_SIZE, OffsetScanner};
use crate::signatures::SignatureSet;
use crate::source::ByteSource;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Scanning = 0,
    Classifying = 1,
    Decoding = 2,
    Done = 3,
    Failed = 4,
}

impl PipelineStage {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Classifying => "classifying",
            Self::Decoding => "decoding",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Scanning,
            1 => Self::Classifying,
            2 => Self::Decoding,
            3 => Self::Done,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Shared view of the stage a running pipeline is in.
#[derive(Debug, Clone)]
pub struct StageTracker {
    stage: Arc<AtomicU8>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            stage: Arc::new(AtomicU8::new(PipelineStage::Scanning as u8)),
        }
    }

    #[inline]
    pub fn get(&self) -> PipelineStage {
        PipelineStage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    fn set(&self, stage: PipelineStage) {
        self.stage.store(stage as u8, Ordering::SeqCst);
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Both eyes of one container, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoPair {
    pub display_name: String,
    pub assignment: StereoAssignment,
    pub left: DecodedImage,
    pub right: DecodedImage,
}

impl StereoPair {
    pub fn eye(&self, eye: Eye) -> &DecodedImage {
        match eye {
            Eye::Left => &self.left,
            Eye::Right => &self.right,
        }
    }
}

/// One-shot loader for a single MPO container.
///
/// # Example
///
/// ```ignore
/// let source = FileSource::open("DSCF0005.MPO")?;
/// let budget = DecodeBudget::new(1920, 1080)?;
/// let pair = ContainerPipeline::new().run(&source, budget)?;
/// println!("{}: {}x{}", pair.display_name, pair.left.width(), pair.left.height());
/// ```
pub struct ContainerPipeline<C = JpegCodec> {
    signatures: SignatureSet,
    chunk_size: usize,
    decoder: BoundedDecoder<C>,
    cancel: CancelToken,
    tracker: StageTracker,
}

impl ContainerPipeline<JpegCodec> {
    pub fn new() -> Self {
        Self {
            signatures: SignatureSet::jpeg(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            decoder: BoundedDecoder::new(),
            cancel: CancelToken::new(),
            tracker: StageTracker::new(),
        }
    }

    pub fn from_config(config: &ScanConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            signatures: config.signature_set()?,
            chunk_size: config.chunk_size,
            ..Self::new()
        })
    }
}

impl Default for ContainerPipeline<JpegCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ImageCodec> ContainerPipeline<C> {
    pub fn with_decoder<D: ImageCodec>(self, decoder: BoundedDecoder<D>) -> ContainerPipeline<D> {
        ContainerPipeline {
            signatures: self.signatures,
            chunk_size: self.chunk_size,
            decoder,
            cancel: self.cancel,
            tracker: self.tracker,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_tracker(mut self, tracker: StageTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn tracker(&self) -> &StageTracker {
        &self.tracker
    }

    /// Runs the pipeline to completion on the calling thread.
    ///
    /// Either both eyes are returned or nothing is: a failure decoding the
    /// right eye drops the already decoded left one.
    pub fn run<S: ByteSource + ?Sized>(
        self,
        source: &S,
        budget: DecodeBudget,
    ) -> Result<StereoPair> {
        let result = self.run_stages(source, budget);
        match &result {
            Ok(_) => self.enter(PipelineStage::Done),
            Err(e) => {
                debug!("Loading {} failed while {}: {e}", source.name(), e.stage());
                self.enter(PipelineStage::Failed);
            }
        }
        result
    }

    fn run_stages<S: ByteSource + ?Sized>(
        &self,
        source: &S,
        budget: DecodeBudget,
    ) -> Result<StereoPair> {
        let display_name = source.name().to_string();

        self.enter(PipelineStage::Scanning);
        info!("Scanning {display_name}");
        let offsets = OffsetScanner::new(source, &self.signatures, self.chunk_size)
            .map_err(PipelineError::from_scan)?
            .with_cancel(self.cancel.clone())
            .collect::<std::result::Result<Vec<u64>, _>>()
            .map_err(PipelineError::from_scan)?;
        if offsets.is_empty() {
            return Err(PipelineError::NoSignaturesFound {
                source_name: display_name,
            });
        }

        self.enter(PipelineStage::Classifying);
        let assignment = classify(&offsets)?;
        info!(
            "{display_name}: {} sub-images, left at {}, right at {}",
            offsets.len(),
            assignment.left,
            assignment.right
        );

        self.enter(PipelineStage::Decoding);
        let left = self.decode_eye(source, &assignment, Eye::Left, budget)?;
        let right = self.decode_eye(source, &assignment, Eye::Right, budget)?;
        self.check_cancelled(PipelineStage::Decoding)?;

        Ok(StereoPair {
            display_name,
            assignment,
            left,
            right,
        })
    }

    fn decode_eye<S: ByteSource + ?Sized>(
        &self,
        source: &S,
        assignment: &StereoAssignment,
        eye: Eye,
        budget: DecodeBudget,
    ) -> Result<DecodedImage> {
        self.check_cancelled(PipelineStage::Decoding)?;

        let offset = assignment.offset(eye);
        let image = self
            .decoder
            .decode(source, offset, budget)
            .map_err(|e| PipelineError::from_decode(eye, e))?;

        info!(
            "Decoded {eye} eye of {}: {}x{} (1/{})",
            source.name(),
            image.width(),
            image.height(),
            image.downscale()
        );
        Ok(image)
    }

    fn check_cancelled(&self, stage: PipelineStage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }
        Ok(())
    }

    fn enter(&self, stage: PipelineStage) {
        debug!("Pipeline stage: {stage}");
        self.tracker.set(stage);
    }
}

/// Scans `source`, picks its stereo pair and decodes both eyes within
/// `budget`, using the default JPEG signatures and codec.
pub fn scan_and_load<S: ByteSource + ?Sized>(
    source: &S,
    budget: DecodeBudget,
) -> Result<StereoPair> {
    ContainerPipeline::new().run(source, budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use crate::signatures::{EXIF_SOI, JFIF_SOI};
    use crate::source::MemorySource;
    use image::RgbImage;
    use std::io::Read;
    use std::sync::Mutex;

    /// Reads the 4-byte marker plus a width/height byte pair from the
    /// stream and records every decode. A width of [`UNDECODABLE`]
    /// probes fine but fails to decode.
    const UNDECODABLE: u8 = 0xEE;

    #[derive(Default, Clone)]
    struct TinyCodec {
        decoded: Arc<Mutex<Vec<(u8, u8)>>>,
    }

    impl ImageCodec for TinyCodec {
        fn probe_dimensions(
            &self,
            stream: &mut dyn Read,
        ) -> std::result::Result<(u32, u32), CodecError> {
            let mut header = [0u8; 6];
            stream
                .read_exact(&mut header)
                .map_err(|_| CodecError::InvalidDimensions { width: 0, height: 0 })?;
            Ok((u32::from(header[4]), u32::from(header[5])))
        }

        fn decode_scaled(
            &self,
            stream: &mut dyn Read,
            factor: u32,
        ) -> std::result::Result<RgbImage, CodecError> {
            let (w, h) = self.probe_dimensions(stream)?;
            if w == u32::from(UNDECODABLE) {
                return Err(CodecError::UnsupportedFormat("corrupt scan".into()));
            }
            self.decoded.lock().unwrap().push((w as u8, h as u8));
            Ok(RgbImage::new(w.div_ceil(factor), h.div_ceil(factor)))
        }
    }

    fn blob(sig: [u8; 4], w: u8, h: u8, len: usize) -> Vec<u8> {
        let mut data = sig.to_vec();
        data.extend([w, h]);
        data.resize(len, 0);
        data
    }

    fn budget() -> DecodeBudget {
        DecodeBudget::new(64, 64).unwrap()
    }

    #[test]
    fn two_images_load_left_then_right() {
        let data = [blob(JFIF_SOI, 10, 20, 50), blob(EXIF_SOI, 30, 40, 50)].concat();
        let source = MemorySource::new("pair.mpo", data);
        let pipeline = ContainerPipeline::new()
            .with_decoder(BoundedDecoder::with_codec(TinyCodec::default()));
        let tracker = pipeline.tracker().clone();

        let pair = pipeline.run(&source, budget()).unwrap();
        assert_eq!(pair.display_name, "pair.mpo");
        assert_eq!(pair.assignment, StereoAssignment { left: 0, right: 50 });
        assert_eq!((pair.left.width(), pair.left.height()), (10, 20));
        assert_eq!((pair.eye(Eye::Right).width(), pair.right.height()), (30, 40));
        assert_eq!(tracker.get(), PipelineStage::Done);
    }

    #[test]
    fn four_images_never_decode_thumbnails() {
        let data = [
            blob(JFIF_SOI, 40, 30, 30),
            blob(EXIF_SOI, 4, 3, 30),
            blob(EXIF_SOI, 41, 31, 30),
            blob(EXIF_SOI, 5, 4, 30),
        ]
        .concat();
        let source = MemorySource::new("quad.mpo", data);
        let codec = TinyCodec::default();
        let log = codec.decoded.clone();
        let pipeline = ContainerPipeline::new().with_decoder(BoundedDecoder::with_codec(codec));

        let pair = pipeline.run(&source, budget()).unwrap();
        assert_eq!(pair.assignment, StereoAssignment { left: 0, right: 60 });
        assert_eq!(pair.right.original_dimensions(), (41, 31));
        assert_eq!(*log.lock().unwrap(), vec![(40, 30), (41, 31)]);
    }

    #[test]
    fn decodes_left_before_right() {
        let data = [blob(JFIF_SOI, 10, 11, 20), blob(EXIF_SOI, 12, 13, 20)].concat();
        let source = MemorySource::new("order.mpo", data);
        let codec = TinyCodec::default();
        let log = codec.decoded.clone();
        let pair = ContainerPipeline::new()
            .with_decoder(BoundedDecoder::with_codec(codec))
            .run(&source, budget())
            .unwrap();
        assert_eq!(pair.left.offset(), 0);
        assert_eq!(pair.right.offset(), 20);
        assert_eq!(*log.lock().unwrap(), vec![(10, 11), (12, 13)]);
    }

    #[test]
    fn empty_container_reports_no_signatures() {
        let source = MemorySource::new("blank.mpo", vec![0u8; 100]);
        let err = scan_and_load(&source, budget()).unwrap_err();
        assert!(matches!(err, PipelineError::NoSignaturesFound { .. }));
        assert_eq!(err.stage(), PipelineStage::Scanning);
    }

    #[test]
    fn three_images_fail_classification() {
        let data = [
            blob(JFIF_SOI, 1, 1, 20),
            blob(JFIF_SOI, 1, 1, 20),
            blob(JFIF_SOI, 1, 1, 20),
        ]
        .concat();
        let source = MemorySource::new("three.mpo", data);
        let pipeline = ContainerPipeline::new()
            .with_decoder(BoundedDecoder::with_codec(TinyCodec::default()));
        let tracker = pipeline.tracker().clone();
        let err = pipeline.run(&source, budget()).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedSubImageCount { count: 3 }));
        assert_eq!(err.stage(), PipelineStage::Classifying);
        assert_eq!(tracker.get(), PipelineStage::Failed);
    }

    #[test]
    fn right_eye_probe_failure_names_right_eye() {
        let data = [blob(JFIF_SOI, 10, 10, 20), blob(EXIF_SOI, 0, 10, 20)].concat();
        let source = MemorySource::new("bad-right.mpo", data);
        let err = ContainerPipeline::new()
            .with_decoder(BoundedDecoder::with_codec(TinyCodec::default()))
            .run(&source, budget())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ProbeFailed {
                eye: Eye::Right,
                offset: 20,
                ..
            }
        ));
        assert_eq!(err.eye(), Some(Eye::Right));
    }

    #[test]
    fn right_eye_decode_failure_names_right_eye() {
        let data = [blob(JFIF_SOI, 10, 10, 20), blob(EXIF_SOI, UNDECODABLE, 10, 20)].concat();
        let source = MemorySource::new("bad-scan.mpo", data);
        let codec = TinyCodec::default();
        let log = codec.decoded.clone();
        let pipeline = ContainerPipeline::new().with_decoder(BoundedDecoder::with_codec(codec));
        let tracker = pipeline.tracker().clone();

        let err = pipeline.run(&source, budget()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DecodeFailed {
                eye: Eye::Right,
                offset: 20,
                cause: CodecError::UnsupportedFormat(_),
                ..
            }
        ));
        assert_eq!(err.stage(), PipelineStage::Decoding);
        assert_eq!(err.eye(), Some(Eye::Right));
        assert_eq!(tracker.get(), PipelineStage::Failed);
        assert_eq!(*log.lock().unwrap(), vec![(10, 10)]);
    }

    #[test]
    fn cancelled_before_start() {
        let data = [blob(JFIF_SOI, 10, 10, 20), blob(EXIF_SOI, 10, 10, 20)].concat();
        let source = MemorySource::new("pair.mpo", data);
        let token = CancelToken::new();
        token.cancel();
        let err = ContainerPipeline::new()
            .with_cancel(token)
            .run(&source, budget())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Cancelled {
                stage: PipelineStage::Scanning
            }
        ));
    }

    #[test]
    fn from_config_uses_signatures() {
        let config = ScanConfig::from_json_str(r#"{ "signatures": ["FFD8FFE1"], "chunk_size": 8 }"#)
            .unwrap();
        let data = [
            blob(JFIF_SOI, 5, 5, 20),
            blob(EXIF_SOI, 6, 6, 20),
            blob(EXIF_SOI, 7, 7, 20),
        ]
        .concat();
        let source = MemorySource::new("exif-only.mpo", data);
        let pair = ContainerPipeline::from_config(&config)
            .unwrap()
            .with_decoder(BoundedDecoder::with_codec(TinyCodec::default()))
            .run(&source, budget())
            .unwrap();
        assert_eq!(pair.assignment, StereoAssignment { left: 20, right: 40 });
    }

    #[test]
    fn stage_names() {
        assert_eq!(PipelineStage::Classifying.to_string(), "classifying");
        assert_eq!(PipelineStage::from_u8(PipelineStage::Done as u8), PipelineStage::Done);
        assert_eq!(
            serde_json::to_value(PipelineStage::Decoding).unwrap(),
            "decoding"
        );
    }
}
