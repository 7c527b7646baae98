#![forbid(unsafe_code)]

//! Frame decoding and pixel statistics.
//!
//! Face detection and identity embeddings are not computed here; they come
//! from a pluggable [`FaceAnalyzer`]. This module only turns raw frame bytes
//! into a [`GrayFrame`] and the cheap statistics the detectors need.

use std::sync::Arc;

use proctor_kernel_contracts::ph1proctor::{
    FrameFeatures, GrayFrame, IdentityEmbedding, GRAY_FRAME_MAX_DIMENSION,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaceAnalyzerError {
    #[error("face analyzer unavailable: {0}")]
    Unavailable(String),
    #[error("face analyzer rejected frame: {0}")]
    Rejected(String),
}

/// External face detection / recognition capability.
///
/// `detect_faces` must count only confident detections.
/// `extract_embedding` returns `Ok(None)` when no usable face was found.
pub trait FaceAnalyzer: Send + Sync {
    fn detect_faces(&self, frame: &GrayFrame) -> Result<u32, FaceAnalyzerError>;

    fn extract_embedding(
        &self,
        frame: &GrayFrame,
    ) -> Result<Option<IdentityEmbedding>, FaceAnalyzerError>;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Arc<A> {
    fn detect_faces(&self, frame: &GrayFrame) -> Result<u32, FaceAnalyzerError> {
        (**self).detect_faces(frame)
    }

    fn extract_embedding(
        &self,
        frame: &GrayFrame,
    ) -> Result<Option<IdentityEmbedding>, FaceAnalyzerError> {
        (**self).extract_embedding(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameExtractError {
    #[error("frame payload is empty")]
    Empty,
    #[error("undecodable frame: {0}")]
    Undecodable(&'static str),
    #[error("unsupported frame: {0}")]
    Unsupported(&'static str),
}

pub trait FrameFeatureExtractor: Send + Sync {
    /// `want_embedding` is set only on frames where an identity check is due.
    fn extract(
        &self,
        frame_bytes: &[u8],
        want_embedding: bool,
    ) -> Result<FrameFeatures, FrameExtractError>;
}

/// Decodes binary PGM (`P5`) frames and asks the analyzer for faces.
///
/// Analyzer failures degrade to missing signals instead of failing the frame.
#[derive(Debug, Clone)]
pub struct PgmFrameExtractor<A> {
    analyzer: A,
    max_dimension: u32,
}

impl<A: FaceAnalyzer> PgmFrameExtractor<A> {
    pub fn new(analyzer: A) -> Self {
        Self {
            analyzer,
            max_dimension: GRAY_FRAME_MAX_DIMENSION,
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension.clamp(1, GRAY_FRAME_MAX_DIMENSION);
        self
    }
}

impl<A: FaceAnalyzer> FrameFeatureExtractor for PgmFrameExtractor<A> {
    fn extract(
        &self,
        frame_bytes: &[u8],
        want_embedding: bool,
    ) -> Result<FrameFeatures, FrameExtractError> {
        let gray = decode_pgm(frame_bytes, self.max_dimension)?;
        let brightness = mean_brightness(&gray);

        let face_count = match self.analyzer.detect_faces(&gray) {
            Ok(n) => Some(n),
            Err(err) => {
                tracing::warn!(
                    target: "proctor.frame",
                    error = %err,
                    "face analyzer failed; continuing without face signal"
                );
                None
            }
        };

        let embedding = if want_embedding && face_count.unwrap_or(0) > 0 {
            match self.analyzer.extract_embedding(&gray) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(
                        target: "proctor.frame",
                        error = %err,
                        "embedding extraction failed; identity check will be silent"
                    );
                    None
                }
            }
        } else {
            None
        };

        FrameFeatures::v1(face_count, Some(brightness), Some(gray), embedding)
            .map_err(|_| FrameExtractError::Undecodable("frame features failed validation"))
    }
}

struct PgmHeaderReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PgmHeaderReader<'a> {
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.bytes.get(self.pos) {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'#') => {
                    while let Some(&b) = self.bytes.get(self.pos) {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn read_uint(&mut self, field: &'static str) -> Result<u32, FrameExtractError> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        while matches!(self.bytes.get(self.pos), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos || self.pos - start > 9 {
            return Err(FrameExtractError::Undecodable(field));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or(FrameExtractError::Undecodable(field))
    }
}

pub fn decode_pgm(bytes: &[u8], max_dimension: u32) -> Result<GrayFrame, FrameExtractError> {
    if bytes.is_empty() {
        return Err(FrameExtractError::Empty);
    }
    if !bytes.starts_with(b"P5") {
        return Err(FrameExtractError::Undecodable("missing P5 magic"));
    }
    let mut reader = PgmHeaderReader { bytes, pos: 2 };
    if !matches!(bytes.get(2), Some(b) if b.is_ascii_whitespace() || *b == b'#') {
        return Err(FrameExtractError::Undecodable("missing P5 magic"));
    }
    let width = reader.read_uint("pgm width")?;
    let height = reader.read_uint("pgm height")?;
    let maxval = reader.read_uint("pgm maxval")?;

    if width == 0 || height == 0 {
        return Err(FrameExtractError::Undecodable("pgm dimensions must be > 0"));
    }
    if width > max_dimension || height > max_dimension {
        return Err(FrameExtractError::Unsupported("frame dimensions exceed limit"));
    }
    if maxval == 0 {
        return Err(FrameExtractError::Undecodable("pgm maxval must be > 0"));
    }
    if maxval > 255 {
        return Err(FrameExtractError::Unsupported("16-bit pgm"));
    }

    // Exactly one whitespace byte separates the header from the raster.
    match bytes.get(reader.pos) {
        Some(b) if b.is_ascii_whitespace() => reader.pos += 1,
        _ => return Err(FrameExtractError::Undecodable("pgm header terminator")),
    }

    let need = (width as usize) * (height as usize);
    let raster = &bytes[reader.pos..];
    if raster.len() < need {
        return Err(FrameExtractError::Undecodable("truncated raster"));
    }

    let pixels: Vec<u8> = if maxval == 255 {
        raster[..need].to_vec()
    } else {
        raster[..need]
            .iter()
            .map(|&v| ((u32::from(v).min(maxval) * 255) / maxval) as u8)
            .collect()
    };

    GrayFrame::v1(width, height, pixels)
        .map_err(|_| FrameExtractError::Undecodable("raster failed validation"))
}

pub fn encode_pgm(frame: &GrayFrame) -> Vec<u8> {
    let mut out = format!("P5\n{} {}\n255\n", frame.width(), frame.height()).into_bytes();
    out.extend_from_slice(frame.pixels());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PixelStatsError {
    #[error("frame shape changed from {expected:?} to {got:?}")]
    ShapeMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },
    #[error("frame {width}x{height} is too small for a 3x3 kernel")]
    TooSmall { width: u32, height: u32 },
}

pub fn mean_brightness(frame: &GrayFrame) -> f64 {
    let sum: u64 = frame.pixels().iter().map(|&p| u64::from(p)).sum();
    sum as f64 / frame.pixels().len() as f64
}

/// Mean absolute pixel difference between two frames of the same shape.
pub fn motion_score(prev: &GrayFrame, cur: &GrayFrame) -> Result<f64, PixelStatsError> {
    if !prev.same_shape(cur) {
        return Err(PixelStatsError::ShapeMismatch {
            expected: (prev.width(), prev.height()),
            got: (cur.width(), cur.height()),
        });
    }
    let sum: u64 = prev
        .pixels()
        .iter()
        .zip(cur.pixels().iter())
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum();
    Ok(sum as f64 / cur.pixels().len() as f64)
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
pub fn laplacian_variance(frame: &GrayFrame) -> Result<f64, PixelStatsError> {
    let (w, h) = (frame.width(), frame.height());
    if w < 3 || h < 3 {
        return Err(PixelStatsError::TooSmall {
            width: w,
            height: h,
        });
    }

    let rows: Vec<&[u8]> = frame.pixels().chunks_exact(w as usize).collect();
    let mut sum: i64 = 0;
    let mut sum_sq: i64 = 0;
    for window in rows.windows(3) {
        let [up, mid, down] = window else {
            continue;
        };
        for ((m, u), d) in mid.windows(3).zip(&up[1..]).zip(&down[1..]) {
            let lap = 4 * i64::from(m[1])
                - i64::from(*u)
                - i64::from(*d)
                - i64::from(m[0])
                - i64::from(m[2]);
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let n = f64::from((w - 2) * (h - 2));
    let mean = sum as f64 / n;
    Ok((sum_sq as f64 / n - mean * mean).max(0.0))
}
