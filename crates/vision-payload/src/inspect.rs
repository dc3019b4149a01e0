use crate::{ChatPayload, ContentPart, ImageSource, MessageContent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageLocation {
    pub message: usize,
    pub part: usize,
}

/// One image found in a payload, waiting for a caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    /// 1-based, in scan order across the whole payload.
    pub index: usize,
    pub location: ImageLocation,
    pub source: ImageSource,
    pub detail: Option<String>,
}

/// Collect every image reference, numbering them top-to-bottom and
/// part-by-part. String content never carries images.
pub fn inspect(payload: &ChatPayload) -> Vec<ImageTask> {
    let mut tasks = Vec::new();
    for (message_idx, message) in payload.messages.iter().enumerate() {
        let Some(MessageContent::Parts(parts)) = &message.content else {
            continue;
        };
        for (part_idx, part) in parts.iter().enumerate() {
            if let ContentPart::ImageRef { source, .. } = part {
                tasks.push(ImageTask {
                    index: tasks.len() + 1,
                    location: ImageLocation {
                        message: message_idx,
                        part: part_idx,
                    },
                    source: source.clone(),
                    detail: part.image_detail().map(str::to_string),
                });
            }
        }
    }
    tasks
}
