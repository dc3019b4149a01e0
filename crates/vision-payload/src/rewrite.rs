use std::collections::{BTreeMap, BTreeSet};

use crate::{CaptionResult, Captions, ChatPayload, ContentPart, ImageTask, MessageContent};

/// Stands in for a description when captioning an image failed.
pub const CAPTION_FAILURE_MARKER: &str = "[图片识别失败]";

/// One `图片{N}内容：…` line per index, in the order given.
pub fn render_descriptions(indices: &[usize], captions: &Captions) -> String {
    indices
        .iter()
        .map(|index| {
            let text = match captions.get(index) {
                Some(CaptionResult::Description(text)) => text.as_str(),
                Some(CaptionResult::Failure { .. }) | None => CAPTION_FAILURE_MARKER,
            };
            format!("图片{index}内容：{text}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop every image part found by [`crate::inspect`] and append its
/// description to the end of the message it came from. Messages without
/// images, and every field other than `content`, are left as they were.
pub fn rewrite(payload: &ChatPayload, tasks: &[ImageTask], captions: &Captions) -> ChatPayload {
    let mut by_message: BTreeMap<usize, Vec<&ImageTask>> = BTreeMap::new();
    for task in tasks {
        by_message.entry(task.location.message).or_default().push(task);
    }

    let mut out = payload.clone();
    for (message_idx, mut owned) in by_message {
        let Some(message) = out.messages.get_mut(message_idx) else {
            continue;
        };
        let Some(MessageContent::Parts(parts)) = message.content.as_mut() else {
            continue;
        };
        owned.sort_by_key(|task| task.index);

        let image_parts: BTreeSet<usize> = owned.iter().map(|task| task.location.part).collect();
        let kept = std::mem::take(parts)
            .into_iter()
            .enumerate()
            .filter(|(idx, part)| !(part.is_image() && image_parts.contains(idx)))
            .map(|(_, part)| part)
            .collect::<Vec<_>>();

        let indices = owned.iter().map(|task| task.index).collect::<Vec<_>>();
        let block = render_descriptions(&indices, captions);
        message.content = Some(append_block(kept, &block));
    }
    out
}

fn append_block(mut parts: Vec<ContentPart>, block: &str) -> MessageContent {
    if parts.is_empty() {
        return MessageContent::Text(block.to_string());
    }
    // A lone plain text part collapses to string content; one carrying
    // extra keys (e.g. `cache_control`) stays a part so those keys survive.
    if let [ContentPart::Text { text, raw }] = parts.as_slice()
        && raw.keys().all(|key| key == "type" || key == "text")
    {
        return if text.is_empty() {
            MessageContent::Text(block.to_string())
        } else {
            MessageContent::Text(format!("{text}\n\n{block}"))
        };
    }
    parts.push(ContentPart::text(format!("\n\n{block}")));
    MessageContent::Parts(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureKind, inspect};
    use serde_json::{Value as JsonValue, json};

    fn run(body: JsonValue, captions: &[(usize, CaptionResult)]) -> JsonValue {
        let payload = ChatPayload::try_from(body).unwrap();
        let tasks = inspect(&payload);
        let captions = captions.iter().cloned().collect::<Captions>();
        JsonValue::from(rewrite(&payload, &tasks, &captions))
    }

    fn described(text: &str) -> CaptionResult {
        CaptionResult::Description(text.to_string())
    }

    #[test]
    fn payload_without_images_is_unchanged() {
        let body = json!({
            "model": "m",
            "stream": true,
            "messages": [
                {"role": "system", "content": "s"},
                {"role": "user", "content": [{"type": "text", "text": "t", "cache_control": {"type": "ephemeral"}}]}
            ],
            "seed": 7
        });
        assert_eq!(run(body.clone(), &[]), body);
    }

    #[test]
    fn single_image_becomes_numbered_description() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "这张图片里有什么？"},
                {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAA="}}
            ]}]
        });
        let out = run(body, &[(1, described("一只猫"))]);
        let content = out.pointer("/messages/0/content").unwrap();
        assert_eq!(
            content.as_str(),
            Some("这张图片里有什么？\n\n图片1内容：一只猫")
        );
        assert!(!out.to_string().contains("image_url"));
        assert_eq!(out.get("model"), Some(&json!("m")));
    }

    #[test]
    fn descriptions_follow_index_order_within_a_message() {
        let body = json!({
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://x/a.png"}},
                {"type": "image_url", "image_url": {"url": "https://x/b.png"}},
                {"type": "text", "text": "which is bigger?"}
            ]}]
        });
        let captions = [(2, described("a dog")), (1, described("a cat"))];
        let out = run(body, &captions);
        assert_eq!(
            out.pointer("/messages/0/content").and_then(JsonValue::as_str),
            Some("which is bigger?\n\n图片1内容：a cat\n图片2内容：a dog")
        );
    }

    #[test]
    fn failed_or_missing_caption_renders_marker() {
        let body = json!({
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://x/a.png"}},
                {"type": "image_url", "image_url": {"url": "https://x/b.png"}}
            ]}]
        });
        let captions = [(1, CaptionResult::failure(FailureKind::Timeout, "timed out after 1s"))];
        let out = run(body, &captions);
        let text = out
            .pointer("/messages/0/content")
            .and_then(JsonValue::as_str)
            .unwrap();
        assert_eq!(
            text,
            format!("图片1内容：{CAPTION_FAILURE_MARKER}\n图片2内容：{CAPTION_FAILURE_MARKER}")
        );
    }

    #[test]
    fn numbering_spans_messages_and_count_is_kept() {
        let body = json!({
            "messages": [
                {"role": "user", "content": [{"type": "image_url", "image_url": {"url": "https://x/1.png"}}]},
                {"role": "assistant", "content": "seen"},
                {"role": "user", "name": "bob", "content": [
                    {"type": "text", "text": "and this one"},
                    {"type": "image_url", "image_url": {"url": "https://x/2.png"}},
                    {"type": "image_url", "image_url": {"url": "https://x/3.png"}}
                ]}
            ]
        });
        let captions = [(1, described("one")), (2, described("two")), (3, described("three"))];
        let out = run(body, &captions);
        let messages = out.get("messages").and_then(JsonValue::as_array).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], json!("图片1内容：one"));
        assert_eq!(messages[1]["content"], json!("seen"));
        assert_eq!(messages[2]["name"], json!("bob"));
        assert_eq!(
            messages[2]["content"],
            json!("and this one\n\n图片2内容：two\n图片3内容：three")
        );

        let flat = out.to_string();
        let positions = (1..=3)
            .map(|n| flat.find(&format!("图片{n}内容")).unwrap())
            .collect::<Vec<_>>();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn text_part_with_extra_keys_is_not_collapsed() {
        let body = json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this", "cache_control": {"type": "ephemeral"}},
                {"type": "image_url", "image_url": {"url": "https://x/a.png"}}
            ]}]
        });
        let out = run(body, &[(1, described("a kite"))]);
        assert_eq!(
            out.pointer("/messages/0/content").unwrap(),
            &json!([
                {"type": "text", "text": "what is this", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "\n\n图片1内容：a kite"}
            ])
        );
    }

    #[test]
    fn non_text_parts_are_kept_and_block_is_appended_as_part() {
        let body = json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "listen and look"},
                {"type": "input_audio", "input_audio": {"data": "UklG", "format": "wav"}},
                {"type": "image_url", "image_url": {"url": "https://x/a.png"}}
            ]}]
        });
        let out = run(body, &[(1, described("a chart"))]);
        assert_eq!(
            out.pointer("/messages/0/content").unwrap(),
            &json!([
                {"type": "text", "text": "listen and look"},
                {"type": "input_audio", "input_audio": {"data": "UklG", "format": "wav"}},
                {"type": "text", "text": "\n\n图片1内容：a chart"}
            ])
        );
    }
}
