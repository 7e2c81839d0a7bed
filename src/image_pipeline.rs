//! Image classification, JPEG normalization and atomic blob writes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{codecs::jpeg::JpegEncoder, DynamicImage, ImageError, Rgb, RgbImage, RgbaImage};
use thiserror::Error;
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

use crate::config::FetchConfig;
use crate::protocol::DEGRADED_DETAIL_PREFIX;

pub const CANONICAL_EXTENSION: &str = "jpg";

/// Why a buffer could not be turned into a stored image. `Display` is the
/// manifest tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("got_html_not_image")]
    MarkupDocument,
    #[error("too_small")]
    TooSmall { len: usize },
    #[error("svg_requires_rasterizer")]
    RasterizerUnavailable,
    #[error("svg_rasterize_error:{0}")]
    Rasterize(String),
    #[error("unsupported_format")]
    UnsupportedFormat,
    #[error("write_error:{0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
    Bmp,
    Tiff,
    Svg,
}

impl SourceFormat {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::Webp),
            "image/gif" => Some(Self::Gif),
            "image/bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/tiff" => Some(Self::Tiff),
            "image/svg+xml" => Some(Self::Svg),
            _ => None,
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "jpe" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "gif" => Some(Self::Gif),
            "bmp" => Some(Self::Bmp),
            "tif" | "tiff" => Some(Self::Tiff),
            "svg" => Some(Self::Svg),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Tiff => "tif",
            Self::Svg => "svg",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Svg => "svg",
        }
    }
}

fn path_extension(source: &str) -> Option<&str> {
    let without_query = source.split(['?', '#']).next().unwrap_or_default();
    let file_name = without_query.rsplit(['/', '\\']).next().unwrap_or_default();
    let (_, extension) = file_name.rsplit_once('.')?;
    Some(extension)
}

/// Declared content type first, then the source path extension; anything
/// unrecognized is assumed to be JPEG.
pub fn detect_source_format(content_type: Option<&str>, source: &str) -> SourceFormat {
    content_type
        .and_then(SourceFormat::from_content_type)
        .or_else(|| path_extension(source).and_then(SourceFormat::from_extension))
        .unwrap_or(SourceFormat::Jpeg)
}

pub fn content_type_is_markup(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    lowered.contains("text/html") || lowered.contains("application/xhtml+xml")
}

/// Error pages served with an image content type.
pub fn looks_like_markup(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(2048)];
    let start = head
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(head.len());
    let trimmed = head[start..].to_ascii_lowercase();
    trimmed.starts_with(b"<!doctype html") || trimmed.starts_with(b"<html")
}

/// Magic-number sniffing for files whose provenance is unknown.
pub fn sniff_format(bytes: &[u8]) -> Option<SourceFormat> {
    if bytes.len() >= 8 && bytes[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some(SourceFormat::Png);
    }
    if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
        return Some(SourceFormat::Jpeg);
    }
    if bytes.len() >= 12 && bytes[0..4] == *b"RIFF" && bytes[8..12] == *b"WEBP" {
        return Some(SourceFormat::Webp);
    }
    if bytes.len() >= 6 && (&bytes[0..6] == b"GIF87a" || &bytes[0..6] == b"GIF89a") {
        return Some(SourceFormat::Gif);
    }
    if bytes.len() >= 4 && (bytes[0..4] == *b"II*\0" || bytes[0..4] == *b"MM\0*") {
        return Some(SourceFormat::Tiff);
    }
    if bytes.len() >= 2 && bytes[0] == b'B' && bytes[1] == b'M' {
        return Some(SourceFormat::Bmp);
    }
    let head = bytes[..bytes.len().min(256)].to_ascii_lowercase();
    if head.windows(4).any(|window| window == b"<svg") {
        return Some(SourceFormat::Svg);
    }
    None
}

pub(crate) fn image_error_kind(error: &ImageError) -> &'static str {
    match error {
        ImageError::Decoding(_) => "Decoding",
        ImageError::Encoding(_) => "Encoding",
        ImageError::Parameter(_) => "Parameter",
        ImageError::Limits(_) => "Limits",
        ImageError::Unsupported(_) => "Unsupported",
        ImageError::IoError(_) => "Io",
        #[allow(unreachable_patterns)]
        _ => "Image",
    }
}

fn io_error_kind(error: &io::Error) -> String {
    format!("{:?}", error.kind())
}

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xff && bytes[1] == 0xd8
}

fn decode_jpeg_non_strict(bytes: &[u8]) -> Option<DynamicImage> {
    if !looks_like_jpeg(bytes) {
        return None;
    }

    let options = DecoderOptions::new_cmd()
        .set_strict_mode(false)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(bytes, options);
    let pixels = decoder.decode().ok()?;
    let (width, height) = decoder.dimensions()?;
    let image = RgbImage::from_raw(width as u32, height as u32, pixels)?;
    Some(DynamicImage::ImageRgb8(image))
}

fn decode_image_from_memory_with_fallback(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    // Truncated or slightly malformed JPEGs from thumbnail servers still decode
    // with the lenient decoder.
    image::load_from_memory(bytes).or_else(|error| decode_jpeg_non_strict(bytes).ok_or(error))
}

/// Composites transparent pixels onto white.
fn flatten_to_rgb(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    flatten_rgba(&image.to_rgba8())
}

fn flatten_rgba(rgba: &RgbaImage) -> RgbImage {
    let (width, height) = rgba.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let [red, green, blue, alpha] = rgba.get_pixel(x, y).0;
        let alpha = u16::from(alpha);
        let blend =
            |channel: u8| ((u16::from(channel) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(red), blend(green), blend(blue)])
    })
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut encoded = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut encoded, quality);
    encoder.encode_image(rgb)?;
    Ok(encoded)
}

fn write_atomic(bytes: &[u8], temp_path: &Path, target_path: &Path) -> io::Result<()> {
    if temp_path.exists() {
        let _ = fs::remove_file(temp_path);
    }
    fs::write(temp_path, bytes)?;
    if let Err(error) = fs::rename(temp_path, target_path) {
        let _ = fs::remove_file(temp_path);
        return Err(error);
    }
    Ok(())
}

/// Rasterization failed inside the SVG renderer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct RasterizeError {
    pub kind: String,
}

impl RasterizeError {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

/// Optional capability for turning SVG documents into pixels.
pub trait SvgRasterizer {
    fn rasterize(&self, svg: &[u8], width_px: u32) -> Result<RgbaImage, RasterizeError>;
}

/// Destination for finished image files.
pub trait BlobStore {
    /// Writes `<stem>.<extension>`, replacing any previous file of that name.
    fn put(&self, stem: &str, extension: &str, bytes: &[u8]) -> io::Result<PathBuf>;
}

/// Plain directory on disk. Writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> io::Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, stem: &str, extension: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let target_path = self.root.join(format!("{stem}.{extension}"));
        let temp_path = self.root.join(format!("{stem}.{extension}.tmp"));
        write_atomic(bytes, &temp_path, &target_path)?;
        Ok(target_path)
    }
}

/// Where a buffer ended up after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// Re-encoded as JPEG.
    Normalized(PathBuf),
    /// Original bytes kept because decoding or re-encoding failed.
    SavedRaw { path: PathBuf, kind: String },
}

impl NormalizeOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Normalized(path) => path,
            Self::SavedRaw { path, .. } => path,
        }
    }

    pub fn degraded_tag(&self) -> Option<String> {
        match self {
            Self::Normalized(_) => None,
            Self::SavedRaw { kind, .. } => Some(format!("{DEGRADED_DETAIL_PREFIX}{kind}")),
        }
    }
}

/// Validates downloaded buffers and stores them as JPEG.
pub struct ImageNormalizer {
    store: Box<dyn BlobStore>,
    rasterizer: Option<Box<dyn SvgRasterizer>>,
    min_image_bytes: usize,
    jpeg_quality: u8,
    svg_width_px: u32,
}

impl ImageNormalizer {
    pub fn new(store: Box<dyn BlobStore>, config: &FetchConfig) -> Self {
        Self {
            store,
            rasterizer: None,
            min_image_bytes: config.min_image_bytes,
            jpeg_quality: config.jpeg_quality,
            svg_width_px: config.thumbnail_size_px,
        }
    }

    pub fn with_rasterizer(mut self, rasterizer: Box<dyn SvgRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn has_rasterizer(&self) -> bool {
        self.rasterizer.is_some()
    }

    /// Markup content type wins over everything, then the size floor.
    pub fn check_plausible(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), ConvertError> {
        if content_type.is_some_and(content_type_is_markup) {
            return Err(ConvertError::MarkupDocument);
        }
        if bytes.len() < self.min_image_bytes {
            return Err(ConvertError::TooSmall { len: bytes.len() });
        }
        if looks_like_markup(bytes) {
            return Err(ConvertError::MarkupDocument);
        }
        Ok(())
    }

    /// Decodes any supported raster format and re-encodes it as RGB JPEG.
    pub fn transcode_raster(&self, bytes: &[u8]) -> Result<Vec<u8>, ImageError> {
        let decoded = decode_image_from_memory_with_fallback(bytes)?;
        encode_jpeg(&flatten_to_rgb(decoded), self.jpeg_quality)
    }

    pub fn rasterize_svg(&self, bytes: &[u8]) -> Result<Vec<u8>, ConvertError> {
        let rasterizer = self
            .rasterizer
            .as_ref()
            .ok_or(ConvertError::RasterizerUnavailable)?;
        let rgba = rasterizer
            .rasterize(bytes, self.svg_width_px)
            .map_err(|error| ConvertError::Rasterize(error.kind))?;
        encode_jpeg(&flatten_rgba(&rgba), self.jpeg_quality)
            .map_err(|error| ConvertError::Rasterize(image_error_kind(&error).to_string()))
    }

    fn put(&self, stem: &str, extension: &str, bytes: &[u8]) -> Result<PathBuf, ConvertError> {
        self.store
            .put(stem, extension, bytes)
            .map_err(|error| ConvertError::Write(io_error_kind(&error)))
    }

    /// Stores `bytes` as `<stem>.jpg`, or verbatim under the detected
    /// extension when the raster cannot be re-encoded.
    pub fn normalize(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
        source: &str,
        stem: &str,
    ) -> Result<NormalizeOutcome, ConvertError> {
        self.check_plausible(bytes, content_type)?;

        let format = detect_source_format(content_type, source);
        if format == SourceFormat::Svg {
            let encoded = self.rasterize_svg(bytes)?;
            let path = self.put(stem, CANONICAL_EXTENSION, &encoded)?;
            return Ok(NormalizeOutcome::Normalized(path));
        }

        match self.transcode_raster(bytes) {
            Ok(encoded) => {
                let path = self.put(stem, CANONICAL_EXTENSION, &encoded)?;
                Ok(NormalizeOutcome::Normalized(path))
            }
            Err(error) => {
                let path = self.put(stem, format.extension(), bytes)?;
                Ok(NormalizeOutcome::SavedRaw {
                    path,
                    kind: image_error_kind(&error).to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};

    use super::*;

    /// Keeps written blobs in memory, keyed by file name.
    #[derive(Default)]
    pub struct MemoryBlobStore {
        pub files: RefCell<BTreeMap<String, Vec<u8>>>,
    }

    impl BlobStore for MemoryBlobStore {
        fn put(&self, stem: &str, extension: &str, bytes: &[u8]) -> io::Result<PathBuf> {
            let name = format!("{stem}.{extension}");
            self.files.borrow_mut().insert(name.clone(), bytes.to_vec());
            Ok(PathBuf::from("memory").join(name))
        }
    }

    impl BlobStore for std::rc::Rc<MemoryBlobStore> {
        fn put(&self, stem: &str, extension: &str, bytes: &[u8]) -> io::Result<PathBuf> {
            self.as_ref().put(stem, extension, bytes)
        }
    }

    pub struct FailingBlobStore;

    impl BlobStore for FailingBlobStore {
        fn put(&self, _stem: &str, _extension: &str, _bytes: &[u8]) -> io::Result<PathBuf> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    /// Noisy image so encoded output comfortably exceeds the size floor.
    pub fn sample_image(width: u32, height: u32, alpha: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(ImageBuffer::from_fn(width, height, |x, y| {
            let seed = x.wrapping_mul(2654435761) ^ y.wrapping_mul(40503);
            Rgba([
                (seed & 0xff) as u8,
                ((seed >> 8) & 0xff) as u8,
                ((seed >> 16) & 0xff) as u8,
                alpha,
            ])
        }))
    }

    pub fn encode_as(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let prepared = if format == ImageFormat::Jpeg {
            DynamicImage::ImageRgb8(image.to_rgb8())
        } else {
            image.clone()
        };
        prepared
            .write_to(&mut cursor, format)
            .expect("test image encoding should succeed");
        cursor.into_inner()
    }
}
