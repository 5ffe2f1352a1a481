//! Chat request construction.
//!
//! The target model family expects a document-OCR prompting protocol: one
//! user turn carrying the image first and a fixed instruction second. The
//! ordering and the instruction text are part of the protocol and are not
//! configurable.

use crate::resolve::ImageReference;
use std::path::PathBuf;

/// Instruction the model family was trained to follow for plain OCR.
pub const OCR_INSTRUCTION: &str = "Text Recognition:";

/// One piece of a multimodal user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Image { path: PathBuf },
    Text { text: String },
}

/// A single user turn. The processor renders the surrounding chat template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub parts: Vec<ContentPart>,
}

/// Build the OCR request for a resolved image: exactly one message with an
/// image part followed by the fixed instruction.
pub fn ocr_request(image: &ImageReference) -> Vec<ChatMessage> {
    vec![ChatMessage {
        parts: vec![
            ContentPart::Image {
                path: image.path.clone(),
            },
            ContentPart::Text {
                text: OCR_INSTRUCTION.to_string(),
            },
        ],
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::resolve_in;

    fn sample_image() -> ImageReference {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        std::fs::write(&path, b"x").unwrap();
        resolve_in(dir.path(), Some(&path)).unwrap()
    }

    #[test]
    fn request_is_one_message_image_then_text() {
        let image = sample_image();
        let messages = ocr_request(&image);
        assert_eq!(messages.len(), 1);
        let parts = &messages[0].parts;
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], ContentPart::Image { .. }));
        match &parts[1] {
            ContentPart::Text { text } => assert_eq!(text, OCR_INSTRUCTION),
            other => panic!("expected text part, got {other:?}"),
        }
    }

    #[test]
    fn image_part_carries_the_resolved_path() {
        let image = sample_image();
        let messages = ocr_request(&image);
        match &messages[0].parts[0] {
            ContentPart::Image { path } => assert_eq!(path, &image.path),
            other => panic!("expected image part, got {other:?}"),
        }
    }
}
