//! One-shot check of an image directory: every file is either already a
//! canonical JPEG, repaired into one, or reported.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::image_pipeline::{
    image_error_kind, sniff_format, BlobStore, ConvertError, FsBlobStore, ImageNormalizer,
    SourceFormat, CANONICAL_EXTENSION,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditVerdict {
    AlreadyCanonical,
    Repaired { from: SourceFormat, path: PathBuf },
    Unrepairable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub path: PathBuf,
    pub verdict: AuditVerdict,
}

fn has_canonical_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            extension.eq_ignore_ascii_case("jpg") || extension.eq_ignore_ascii_case("jpeg")
        })
}

fn unrepairable(reason: impl Into<String>) -> AuditVerdict {
    AuditVerdict::Unrepairable {
        reason: reason.into(),
    }
}

/// Regular files directly inside `dir`, sorted by name.
fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn audit_file(path: &Path, store: &FsBlobStore, normalizer: &ImageNormalizer) -> AuditVerdict {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) => return unrepairable(format!("read_error:{:?}", error.kind())),
    };
    if let Err(error) = normalizer.check_plausible(&bytes, None) {
        return unrepairable(error.to_string());
    }

    let Some(format) = sniff_format(&bytes) else {
        return unrepairable(ConvertError::UnsupportedFormat.to_string());
    };
    if format == SourceFormat::Jpeg && has_canonical_extension(path) {
        return AuditVerdict::AlreadyCanonical;
    }

    let encoded = if format == SourceFormat::Svg {
        match normalizer.rasterize_svg(&bytes) {
            Ok(encoded) => encoded,
            Err(error) => return unrepairable(error.to_string()),
        }
    } else {
        match normalizer.transcode_raster(&bytes) {
            Ok(encoded) => encoded,
            Err(error) => return unrepairable(format!("convert_error:{}", image_error_kind(&error))),
        }
    };

    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
        return unrepairable(ConvertError::Write("InvalidFileName".to_string()).to_string());
    };
    let existing = store.root().join(format!("{stem}.{CANONICAL_EXTENSION}"));
    if existing != path && existing.exists() {
        warn!(
            "Repairing {} replaces existing {}",
            path.display(),
            existing.display()
        );
    }
    let target = match store.put(stem, CANONICAL_EXTENSION, &encoded) {
        Ok(target) => target,
        Err(error) => {
            return unrepairable(ConvertError::Write(format!("{:?}", error.kind())).to_string())
        }
    };
    if target != path {
        if let Err(error) = fs::remove_file(path) {
            warn!("Repaired {} but could not remove it: {}", path.display(), error);
        }
    }
    AuditVerdict::Repaired {
        from: format,
        path: target,
    }
}

/// Classifies every regular file in `dir` (not recursive). Non-canonical
/// images are rewritten as `<stem>.jpg` next to the original, which is then
/// removed.
pub fn audit_directory(dir: &Path, normalizer: &ImageNormalizer) -> io::Result<Vec<AuditEntry>> {
    let store = FsBlobStore::new(dir);
    let mut entries = Vec::new();
    for path in list_files(dir)? {
        let verdict = audit_file(&path, &store, normalizer);
        debug!("{}: {:?}", path.display(), verdict);
        entries.push(AuditEntry { path, verdict });
    }
    Ok(entries)
}

/// Three sections: canonical files, repairs, problems.
pub fn render_report(entries: &[AuditEntry]) -> String {
    let mut ok = String::from("=== OK images ===");
    let mut repaired = String::from("=== Repaired (now .jpg) ===");
    let mut problems = String::from("=== Problem files (action needed) ===");
    for entry in entries {
        let path = entry.path.display();
        match &entry.verdict {
            AuditVerdict::AlreadyCanonical => ok.push_str(&format!("\n{path}")),
            AuditVerdict::Repaired { from, path: target } => repaired.push_str(&format!(
                "\n{}->{}  ->  {} (was {path})",
                from.label(),
                CANONICAL_EXTENSION,
                target.display()
            )),
            AuditVerdict::Unrepairable { reason } => {
                problems.push_str(&format!("\n{reason}  ->  {path}"))
            }
        }
    }
    format!("{ok}\n\n{repaired}\n\n{problems}")
}

/// True when some file still needs a human.
pub fn has_problems(entries: &[AuditEntry]) -> bool {
    entries
        .iter()
        .any(|entry| matches!(entry.verdict, AuditVerdict::Unrepairable { .. }))
}

#[cfg(test)]
mod tests {
    use image::{GenericImageView, ImageFormat, RgbaImage};

    use super::*;
    use crate::config::FetchConfig;
    use crate::image_pipeline::test_support::{encode_as, sample_image, MemoryBlobStore};
    use crate::image_pipeline::{RasterizeError, SvgRasterizer};

    fn normalizer() -> ImageNormalizer {
        ImageNormalizer::new(Box::new(MemoryBlobStore::default()), &FetchConfig::default())
    }

    fn verdict_for<'a>(entries: &'a [AuditEntry], dir: &Path, name: &str) -> &'a AuditVerdict {
        let path = dir.join(name);
        &entries
            .iter()
            .find(|entry| entry.path == path)
            .unwrap_or_else(|| panic!("{name} audited"))
            .verdict
    }

    struct TinyRasterizer;

    impl SvgRasterizer for TinyRasterizer {
        fn rasterize(&self, _svg: &[u8], width_px: u32) -> Result<RgbaImage, RasterizeError> {
            Ok(RgbaImage::from_pixel(width_px / 100, width_px / 100, image::Rgba([9, 9, 9, 255])))
        }
    }

    fn svg_bytes() -> Vec<u8> {
        let mut svg = b"<svg xmlns=\"http://www.w3.org/2000/svg\">".to_vec();
        svg.extend(std::iter::repeat(b' ').take(2048));
        svg.extend_from_slice(b"</svg>");
        svg
    }

    #[test]
    fn test_audit_directory_sorts_files_into_verdicts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let picture = sample_image(96, 64, 255);
        fs::write(root.join("egypt-date.jpg"), encode_as(&picture, ImageFormat::Jpeg)).unwrap();
        fs::write(root.join("peru-lucuma.png"), encode_as(&picture, ImageFormat::Png)).unwrap();
        fs::write(root.join("tiny.jpg"), [0xff, 0xd8, 0xff]).unwrap();
        let mut html = b"<!DOCTYPE html><html>gone</html>".to_vec();
        html.extend(std::iter::repeat(b' ').take(2048));
        fs::write(root.join("error-page.jpg"), html).unwrap();
        fs::write(root.join("flag.svg"), svg_bytes()).unwrap();
        fs::write(root.join("noise.bin"), vec![0x11u8; 4096]).unwrap();
        fs::create_dir(root.join("nested")).unwrap();

        let entries = audit_directory(root, &normalizer()).expect("audit runs");
        assert_eq!(entries.len(), 6);
        let names: Vec<String> = entries
            .iter()
            .map(|entry| entry.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        assert_eq!(
            verdict_for(&entries, root, "egypt-date.jpg"),
            &AuditVerdict::AlreadyCanonical
        );
        assert_eq!(
            verdict_for(&entries, root, "peru-lucuma.png"),
            &AuditVerdict::Repaired {
                from: SourceFormat::Png,
                path: root.join("peru-lucuma.jpg"),
            }
        );
        assert_eq!(
            verdict_for(&entries, root, "tiny.jpg"),
            &unrepairable("too_small")
        );
        assert_eq!(
            verdict_for(&entries, root, "error-page.jpg"),
            &unrepairable("got_html_not_image")
        );
        assert_eq!(
            verdict_for(&entries, root, "flag.svg"),
            &unrepairable("svg_requires_rasterizer")
        );
        assert_eq!(
            verdict_for(&entries, root, "noise.bin"),
            &unrepairable("unsupported_format")
        );
        assert!(has_problems(&entries));

        assert!(!root.join("peru-lucuma.png").exists());
        let repaired = fs::read(root.join("peru-lucuma.jpg")).expect("repaired file");
        let decoded = image::load_from_memory_with_format(&repaired, ImageFormat::Jpeg)
            .expect("repaired file is jpeg");
        assert_eq!(decoded.dimensions(), (96, 64));
        assert!(root.join("flag.svg").exists());
    }

    #[test]
    fn test_jpeg_with_wrong_extension_is_renamed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let jpeg = encode_as(&sample_image(96, 64, 255), ImageFormat::Jpeg);
        fs::write(root.join("kenya-mango.webp"), jpeg).unwrap();
        fs::write(root.join("chile-lucuma.JPEG"), encode_as(&sample_image(96, 64, 255), ImageFormat::Jpeg)).unwrap();

        let entries = audit_directory(root, &normalizer()).expect("audit runs");
        assert_eq!(
            verdict_for(&entries, root, "kenya-mango.webp"),
            &AuditVerdict::Repaired {
                from: SourceFormat::Jpeg,
                path: root.join("kenya-mango.jpg"),
            }
        );
        assert_eq!(
            verdict_for(&entries, root, "chile-lucuma.JPEG"),
            &AuditVerdict::AlreadyCanonical
        );
        assert!(!root.join("kenya-mango.webp").exists());
        assert!(!has_problems(&entries));
    }

    #[test]
    fn test_repair_replaces_existing_jpeg_with_same_stem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::write(
            root.join("fiji-breadfruit.jpg"),
            encode_as(&sample_image(80, 48, 255), ImageFormat::Jpeg),
        )
        .unwrap();
        fs::write(
            root.join("fiji-breadfruit.png"),
            encode_as(&sample_image(96, 64, 255), ImageFormat::Png),
        )
        .unwrap();

        let entries = audit_directory(root, &normalizer()).expect("audit runs");
        assert_eq!(
            verdict_for(&entries, root, "fiji-breadfruit.jpg"),
            &AuditVerdict::AlreadyCanonical
        );
        assert_eq!(
            verdict_for(&entries, root, "fiji-breadfruit.png"),
            &AuditVerdict::Repaired {
                from: SourceFormat::Png,
                path: root.join("fiji-breadfruit.jpg"),
            }
        );
        assert!(!root.join("fiji-breadfruit.png").exists());
        let kept = image::load_from_memory(&fs::read(root.join("fiji-breadfruit.jpg")).unwrap())
            .expect("jpeg decodes");
        assert_eq!(kept.dimensions(), (96, 64));
    }

    #[test]
    fn test_svg_is_repaired_when_rasterizer_is_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::write(root.join("flag.svg"), svg_bytes()).unwrap();
        let normalizer = normalizer().with_rasterizer(Box::new(TinyRasterizer));

        let entries = audit_directory(root, &normalizer).expect("audit runs");
        assert_eq!(
            entries,
            vec![AuditEntry {
                path: root.join("flag.svg"),
                verdict: AuditVerdict::Repaired {
                    from: SourceFormat::Svg,
                    path: root.join("flag.jpg"),
                },
            }]
        );
        assert!(!root.join("flag.svg").exists());
        assert!(root.join("flag.jpg").exists());
    }

    #[test]
    fn test_audit_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(audit_directory(&dir.path().join("absent"), &normalizer()).is_err());
    }

    #[test]
    fn test_render_report_lists_three_sections() {
        let entries = vec![
            AuditEntry {
                path: PathBuf::from("img/a.jpg"),
                verdict: AuditVerdict::AlreadyCanonical,
            },
            AuditEntry {
                path: PathBuf::from("img/b.png"),
                verdict: AuditVerdict::Repaired {
                    from: SourceFormat::Png,
                    path: PathBuf::from("img/b.jpg"),
                },
            },
            AuditEntry {
                path: PathBuf::from("img/c.jpg"),
                verdict: unrepairable("too_small"),
            },
        ];
        assert_eq!(
            render_report(&entries),
            "=== OK images ===\nimg/a.jpg\n\n\
             === Repaired (now .jpg) ===\npng->jpg  ->  img/b.jpg (was img/b.png)\n\n\
             === Problem files (action needed) ===\ntoo_small  ->  img/c.jpg"
        );
    }
}
