//! Result output: the framed console report and the sidecar text file.

use crate::resolve::ImageReference;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the sidecar file for an image, `<stem>_ocr.txt`.
///
/// Only the file stem is kept, so the sidecar lands in the working directory
/// even when the image was given as a path elsewhere.
pub fn output_path(image: &ImageReference) -> PathBuf {
    let stem = image
        .path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy();
    PathBuf::from(format!("{stem}_ocr.txt"))
}

/// Prints the recognized text inside its frame and writes the sidecar file
/// into the current directory.
pub fn persist(image: &ImageReference, text: &str) -> io::Result<PathBuf> {
    persist_in(Path::new("."), image, text)
}

pub fn persist_in(dir: &Path, image: &ImageReference, text: &str) -> io::Result<PathBuf> {
    let frame = "=".repeat(40);
    println!("\n{frame}");
    println!("OCR RESULT:");
    println!("{frame}\n");
    println!("{text}");
    println!("\n{frame}");

    let path = dir.join(output_path(image));
    std::fs::write(&path, text)?;
    info!("OCR result saved to: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(path: &str) -> ImageReference {
        ImageReference {
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn sidecar_name_keeps_the_stem_only() {
        assert_eq!(
            output_path(&reference("photos/receipt.JPG")),
            PathBuf::from("receipt_ocr.txt")
        );
        assert_eq!(
            output_path(&reference("scan.tiff")),
            PathBuf::from("scan_ocr.txt")
        );
    }

    #[test]
    fn writes_the_text_next_to_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = persist_in(dir.path(), &reference("invoice.png"), "TOTAL 42.00").unwrap();
        assert_eq!(path, dir.path().join("invoice_ocr.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "TOTAL 42.00");
    }

    #[test]
    fn overwrites_an_existing_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invoice_ocr.txt"), "stale").unwrap();
        let path = persist_in(dir.path(), &reference("invoice.png"), "fresh").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "fresh");
    }
}
