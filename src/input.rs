use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::debug;

use crate::error::CodexError;

/// What a turn sends to the agent.
#[derive(Debug)]
pub enum Input {
    Text(String),
    /// Text parts are joined with a blank line; images are attached in order.
    Segments(Vec<InputSegment>),
}

impl From<&str> for Input {
    fn from(text: &str) -> Self {
        Input::Text(text.to_string())
    }
}

impl From<String> for Input {
    fn from(text: String) -> Self {
        Input::Text(text)
    }
}

impl From<Vec<InputSegment>> for Input {
    fn from(segments: Vec<InputSegment>) -> Self {
        Input::Segments(segments)
    }
}

/// One piece of a multi-part prompt: text or an image attachment.
#[derive(Debug)]
pub struct InputSegment {
    kind: SegmentKind,
}

#[derive(Debug)]
enum SegmentKind {
    Text(String),
    LocalImage(PathBuf),
    /// Owned temp file, deleted when the run ends.
    TempImage(TempPath),
}

impl InputSegment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Text(text.into()),
        }
    }

    /// An image already on disk, passed through as `--image <path>`.
    pub fn local_image(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SegmentKind::LocalImage(path.into()),
        }
    }

    /// Write image bytes to a temp file.
    ///
    /// The type comes from `name`'s extension when it names an image type,
    /// otherwise from the data's magic bytes.
    pub fn image_bytes(name: &str, data: &[u8]) -> Result<Self, CodexError> {
        if data.is_empty() {
            return Err(CodexError::Image("image data is empty".into()));
        }
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let suffix = match media_type_for_extension(&ext) {
            Some(_) => ext,
            None => {
                let media = sniff_image(data).ok_or_else(|| {
                    CodexError::Image(format!("{name:?} does not contain a recognised image"))
                })?;
                extension_for_media_type(media).unwrap_or_default().to_string()
            }
        };
        Self::temp_image(data, &suffix)
    }

    /// Download an image into a temp file.
    ///
    /// The response must be 2xx with an `image/*` content type and a
    /// non-empty body.
    pub async fn image_url(url: &str) -> Result<Self, CodexError> {
        let resp = reqwest::get(url)
            .await
            .map_err(|e| CodexError::Image(format!("download image: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CodexError::Image(format!(
                "download image: unexpected status {}",
                status.as_u16()
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CodexError::Image("download image: missing Content-Type header".into()))?;
        let media = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !media.starts_with("image/") {
            return Err(CodexError::Image(format!(
                "download image: content-type {media:?} is not an image"
            )));
        }

        let data = resp
            .bytes()
            .await
            .map_err(|e| CodexError::Image(format!("read image body: {e}")))?;
        if data.is_empty() {
            return Err(CodexError::Image("download image: empty response body".into()));
        }

        let ext = extension_for_media_type(&media)
            .or_else(|| sniff_image(&data).and_then(extension_for_media_type))
            .unwrap_or_default();
        debug!(url, media = %media, bytes = data.len(), "image downloaded");
        Self::temp_image(&data, ext)
    }

    fn temp_image(data: &[u8], ext: &str) -> Result<Self, CodexError> {
        let suffix = if ext.is_empty() {
            String::new()
        } else {
            format!(".{ext}")
        };
        let mut file = tempfile::Builder::new()
            .prefix("codex-image-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| CodexError::Image(format!("create temp image: {e}")))?;
        file.write_all(data)
            .and_then(|()| file.flush())
            .map_err(|e| CodexError::Image(format!("write temp image: {e}")))?;
        Ok(Self {
            kind: SegmentKind::TempImage(file.into_temp_path()),
        })
    }

    /// Path the segment would attach, if it is an image.
    pub fn image_path(&self) -> Option<&Path> {
        match &self.kind {
            SegmentKind::Text(_) => None,
            SegmentKind::LocalImage(path) => Some(path.as_path()),
            SegmentKind::TempImage(path) => Some(&**path),
        }
    }
}

fn media_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

fn extension_for_media_type(media: &str) -> Option<&'static str> {
    match media {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        "image/svg+xml" => Some("svg"),
        _ => None,
    }
}

fn sniff_image(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else if data.starts_with(b"BM") {
        Some("image/bmp")
    } else {
        None
    }
}

// --- Normalization ---

/// Release actions run in reverse acquisition order when dropped.
#[derive(Default)]
pub(crate) struct ScopedResources {
    releases: Vec<Box<dyn FnOnce() + Send>>,
}

impl ScopedResources {
    pub(crate) fn defer(&mut self, release: impl FnOnce() + Send + 'static) {
        self.releases.push(Box::new(release));
    }

    pub(crate) fn len(&self) -> usize {
        self.releases.len()
    }
}

impl std::fmt::Debug for ScopedResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedResources")
            .field("releases", &self.releases.len())
            .finish()
    }
}

impl Drop for ScopedResources {
    fn drop(&mut self) {
        while let Some(release) = self.releases.pop() {
            release();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct NormalizedInput {
    pub prompt: String,
    pub images: Vec<PathBuf>,
    pub resources: ScopedResources,
}

pub(crate) fn normalize_input(input: Input) -> Result<NormalizedInput, CodexError> {
    let segments = match input {
        Input::Text(prompt) => {
            return Ok(NormalizedInput {
                prompt,
                ..Default::default()
            })
        }
        Input::Segments(segments) => segments,
    };
    if segments.is_empty() {
        return Err(CodexError::Input("no input segments".into()));
    }

    // An early return drops `out`, releasing temp images taken so far.
    let mut out = NormalizedInput::default();
    let mut texts = Vec::new();
    for (i, segment) in segments.into_iter().enumerate() {
        match segment.kind {
            SegmentKind::Text(text) if text.is_empty() => {
                return Err(CodexError::Input(format!("input segment {i} is empty")));
            }
            SegmentKind::Text(text) => texts.push(text),
            SegmentKind::LocalImage(path) if path.as_os_str().is_empty() => {
                return Err(CodexError::Input(format!("input segment {i} has an empty image path")));
            }
            SegmentKind::LocalImage(path) => out.images.push(path),
            SegmentKind::TempImage(path) => {
                out.images.push(path.to_path_buf());
                out.resources.defer(move || {
                    if let Err(err) = path.close() {
                        debug!(error = %err, "removing temp image");
                    }
                });
            }
        }
    }
    out.prompt = texts.join("\n\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn text_segments_join_with_blank_line_and_images_keep_order() {
        let input = Input::Segments(vec![
            InputSegment::text("Describe these"),
            InputSegment::local_image("/tmp/one.png"),
            InputSegment::text("Be brief"),
            InputSegment::local_image("/tmp/two.jpg"),
        ]);
        let normalized = normalize_input(input).unwrap();
        assert_eq!(normalized.prompt, "Describe these\n\nBe brief");
        assert_eq!(
            normalized.images,
            vec![PathBuf::from("/tmp/one.png"), PathBuf::from("/tmp/two.jpg")]
        );
        assert_eq!(normalized.resources.len(), 0);
    }

    #[test]
    fn plain_text_passes_through() {
        let normalized = normalize_input("hello".into()).unwrap();
        assert_eq!(normalized.prompt, "hello");
        assert!(normalized.images.is_empty());
    }

    #[test]
    fn empty_segments_are_rejected() {
        let err = normalize_input(Input::Segments(vec![
            InputSegment::text("ok"),
            InputSegment::text(""),
        ]))
        .unwrap_err();
        assert!(matches!(err, CodexError::Input(ref m) if m.contains("segment 1")));
        assert!(normalize_input(Input::Segments(Vec::new())).is_err());
    }

    #[test]
    fn temp_images_are_removed_when_resources_drop() {
        let segment = InputSegment::image_bytes("shot", PNG).unwrap();
        let path = segment.image_path().unwrap().to_path_buf();
        assert_eq!(path.extension().unwrap(), "png");
        assert!(path.exists());

        let normalized = normalize_input(Input::Segments(vec![
            InputSegment::text("what is this"),
            segment,
        ]))
        .unwrap();
        assert_eq!(normalized.images, vec![path.clone()]);
        drop(normalized);
        assert!(!path.exists());
    }

    #[test]
    fn temp_image_is_released_when_a_later_segment_is_invalid() {
        let segment = InputSegment::image_bytes("a.png", PNG).unwrap();
        let path = segment.image_path().unwrap().to_path_buf();
        let res = normalize_input(Input::Segments(vec![segment, InputSegment::text("")]));
        assert!(res.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn image_bytes_prefers_a_known_extension() {
        let segment = InputSegment::image_bytes("diagram.SVG", b"<svg/>").unwrap();
        assert_eq!(segment.image_path().unwrap().extension().unwrap(), "svg");
    }

    #[test]
    fn image_bytes_rejects_non_images() {
        assert!(matches!(
            InputSegment::image_bytes("notes.txt", b"plain text"),
            Err(CodexError::Image(_))
        ));
        assert!(InputSegment::image_bytes("x.png", b"").is_err());
    }

    #[test]
    fn resources_release_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut resources = ScopedResources::default();
        for i in 0..3 {
            let order = order.clone();
            resources.defer(move || order.lock().unwrap().push(i));
        }
        drop(resources);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }
}
