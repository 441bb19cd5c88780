//! Screenshot capture: viewport, full page, clip rect, or a single
//! element. Inline results are size-capped; file saves keep native
//! resolution.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::error::BrokerError;

use super::{CAPTURE_TIMEOUT, MAX_INLINE_DIMENSION, ToolDispatcher, ToolReply, interact};

const DEFAULT_QUALITY: u64 = 80;

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let quality = args
        .get("quality")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_QUALITY)
        .min(100);
    let full_page = args
        .get("full_page")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let file_path = args.get("file_path").and_then(Value::as_str);
    let outline = args
        .get("outline_clickable")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    // Element crop: bring it into view first, then clip to its rect.
    let clip = if let Some(selector) = args.get("selector").and_then(Value::as_str) {
        interact::scroll_into_view(d, selector).await?;
        d.sleep(100).await;
        Some(element_clip(d, selector).await?)
    } else {
        args.get("clip").cloned()
    };

    if outline {
        let _ = d.eval(OUTLINE_ON_JS).await;
    }

    let mut params = json!({
        "format": "jpeg",
        "quality": quality,
        "captureBeyondViewport": full_page,
    });
    if let Some(clip) = clip {
        params["clip"] = normalize_clip(&clip)?;
    }
    let capture = d
        .cdp_with_timeout("Page.captureScreenshot", params, Some(CAPTURE_TIMEOUT))
        .await;

    if outline {
        let _ = d.eval(OUTLINE_OFF_JS).await;
    }
    let capture = capture?;

    let data = capture
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Peer {
            message: "capture returned no image data".into(),
        })?
        .to_owned();

    if let Some(path) = file_path {
        let bytes = BASE64
            .decode(&data)
            .map_err(|e| BrokerError::Io(format!("invalid image payload: {e}")))?;
        let size = bytes.len();
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| BrokerError::Io(format!("writing {path}: {e}")))?;
        return Ok(ToolReply::json(
            &format!("Saved screenshot to {path} ({size} bytes)."),
            json!({"success": true, "file_path": path, "bytes": size}),
        ));
    }

    // Inline responses get downscaled when oversized; the extension has
    // the canvas.
    let data = cap_inline_dimensions(d, data).await;
    Ok(ToolReply::text(
        "Screenshot captured.",
        json!({"success": true, "format": "jpeg"}),
    )
    .with_image(data, "image/jpeg"))
}

async fn element_clip(d: &ToolDispatcher, selector: &str) -> Result<Value, BrokerError> {
    let snippet = format!(
        r"(function() {{
{resolve}
  var el = __resolveSelector({sel});
  if (!el) {{ return null; }}
  var r = el.getBoundingClientRect();
  return {{x: r.left, y: r.top, width: r.width, height: r.height}};
}})()",
        resolve = super::primitives::RESOLVE_SELECTOR_JS,
        sel = super::primitives::json_string(selector),
    );
    let rect = d.eval(&snippet).await?;
    if rect.is_null() {
        return Err(BrokerError::ElementNotFound {
            selector: selector.to_owned(),
            hints: super::find_alternatives(d.transport(), selector).await,
        });
    }
    Ok(rect)
}

fn normalize_clip(clip: &Value) -> Result<Value, BrokerError> {
    let get = |key: &str| clip.get(key).and_then(Value::as_f64);
    match (get("x"), get("y"), get("width"), get("height")) {
        (Some(x), Some(y), Some(width), Some(height)) if width > 0.0 && height > 0.0 => {
            Ok(json!({"x": x, "y": y, "width": width, "height": height, "scale": 1}))
        }
        _ => Err(BrokerError::InvalidParams(
            "clip requires positive x, y, width, height".into(),
        )),
    }
}

/// Downscale inline images whose either dimension exceeds the cap.
/// Best-effort: an extension without `resizeImage` returns the original.
async fn cap_inline_dimensions(d: &ToolDispatcher, data: String) -> String {
    let Ok(bytes) = BASE64.decode(&data) else {
        return data;
    };
    let Some((width, height)) = image_dimensions(&bytes) else {
        return data;
    };
    if width <= MAX_INLINE_DIMENSION && height <= MAX_INLINE_DIMENSION {
        return data;
    }
    let resized = d
        .transport()
        .send_cmd(
            "resizeImage",
            Some(json!({
                "data": data,
                "mimeType": "image/jpeg",
                "maxDimension": MAX_INLINE_DIMENSION,
            })),
            Some(CAPTURE_TIMEOUT),
        )
        .await;
    match resized {
        Ok(value) => value
            .get("data")
            .and_then(Value::as_str)
            .map_or(data, str::to_owned),
        Err(_) => data,
    }
}

const OUTLINE_ON_JS: &str = r"(function() {
  var style = document.createElement('style');
  style.id = '__supersurf_outline';
  style.textContent = 'a, button, input, select, textarea, [onclick], [role=button] '
    + '{ outline: 2px solid rgba(255, 80, 80, 0.9) !important; }';
  document.head.appendChild(style);
  return true;
})()";

const OUTLINE_OFF_JS: &str = r"(function() {
  var style = document.getElementById('__supersurf_outline');
  if (style) { style.remove(); }
  return true;
})()";

// ===========================================================================
// Image header sniffing
// ===========================================================================

/// Read pixel dimensions from a JPEG or PNG header, without an image
/// library.
#[must_use]
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    png_dimensions(bytes).or_else(|| jpeg_dimensions(bytes))
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 24 || bytes[..8] != PNG_MAGIC {
        return None;
    }
    // IHDR is always the first chunk: length(4) type(4) width(4) height(4).
    if &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }
    let mut pos = 2;
    while pos + 9 < bytes.len() {
        if bytes[pos] != 0xFF {
            pos += 1;
            continue;
        }
        let marker = bytes[pos + 1];
        // SOF0..SOF15 except DHT(C4), JPG(C8), DAC(CC) carry dimensions.
        if (0xC0..=0xCF).contains(&marker) && ![0xC4, 0xC8, 0xCC].contains(&marker) {
            let height = u32::from(u16::from_be_bytes([bytes[pos + 5], bytes[pos + 6]]));
            let width = u32::from(u16::from_be_bytes([bytes[pos + 7], bytes[pos + 8]]));
            return Some((width, height));
        }
        let length = usize::from(u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]));
        if length < 2 {
            return None;
        }
        pos += 2 + length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    fn jpeg_with_sof0(width: u16, height: u16) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        // APP0 segment to skip over.
        bytes.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        bytes.extend_from_slice(&[0u8; 14]);
        // SOF0: marker, length, precision, height, width.
        bytes.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&[0x03]);
        bytes
    }

    #[test]
    fn png_dimensions_parsed() {
        let bytes = png_header(2560, 1440);
        assert_eq!(image_dimensions(&bytes), Some((2560, 1440)));
    }

    #[test]
    fn jpeg_dimensions_parsed() {
        let bytes = jpeg_with_sof0(1920, 1080);
        assert_eq!(image_dimensions(&bytes), Some((1920, 1080)));
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(image_dimensions(b"not an image"), None);
        assert_eq!(image_dimensions(&[]), None);
    }

    #[test]
    fn jpeg_skips_dht_markers() {
        let mut bytes = vec![0xFF, 0xD8];
        // DHT (C4) must not be mistaken for a SOF segment.
        bytes.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x04, 0x00, 0x00]);
        bytes.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        bytes.extend_from_slice(&600u16.to_be_bytes());
        bytes.extend_from_slice(&800u16.to_be_bytes());
        bytes.push(0x03);
        assert_eq!(image_dimensions(&bytes), Some((800, 600)));
    }

    #[test]
    fn normalize_clip_validates() {
        let clip = json!({"x": 0, "y": 10, "width": 100, "height": 50});
        let normalized = normalize_clip(&clip).unwrap();
        assert_eq!(normalized["scale"], 1);

        assert!(normalize_clip(&json!({"x": 0, "y": 0, "width": 0, "height": 5})).is_err());
        assert!(normalize_clip(&json!({"x": 0})).is_err());
    }
}
