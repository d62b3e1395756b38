//! MIME detection and extension selection for downloaded media.

use reqwest::Url;

/// Leading-byte signatures of the formats the remote CDN serves.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    let starts = |sig: &[u8]| bytes.starts_with(sig);

    if starts(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if starts(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if starts(b"GIF87a") || starts(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        match &bytes[8..12] {
            b"avif" | b"avis" => Some("image/avif"),
            b"heic" | b"heix" | b"mif1" => Some("image/heic"),
            b"qt  " => Some("video/quicktime"),
            _ => Some("video/mp4"),
        }
    } else if starts(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some("video/webm")
    } else if starts(b"BM") && bytes.len() > 14 {
        Some("image/bmp")
    } else {
        None
    }
}

/// Lowercased `type/subtype` without parameters. Empty values and HTML pages
/// (a common anti-bot answer) are treated as unknown.
pub fn usable_mime(raw: Option<&str>) -> Option<String> {
    let parsed: mime::Mime = raw?.trim().parse().ok()?;
    let essence = parsed.essence_str().to_ascii_lowercase();
    if essence.is_empty() || essence == "text/html" || essence == "application/xhtml+xml" {
        return None;
    }
    Some(essence)
}

/// Picks the stored MIME type: a recognised signature wins, then the declared
/// type, then the response header, then `application/octet-stream`.
pub fn choose_mime(bytes: &[u8], declared: Option<&str>, returned: Option<&str>) -> String {
    sniff_mime(bytes)
        .map(str::to_string)
        .or_else(|| usable_mime(declared))
        .or_else(|| usable_mime(returned))
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let ext = match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/heic" => "heic",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "application/x-mpegurl" | "application/vnd.apple.mpegurl" => "m3u8",
        "application/octet-stream" => return None,
        other => return mime_guess::get_mime_extensions_str(other).and_then(|exts| exts.first().copied()),
    };
    Some(ext)
}

/// Extension of the URL's last path segment. CDN paths like
/// `.../bafkrei...@jpeg` carry the format after the `@`.
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?;
    let ext = segment
        .rsplit_once('@')
        .map(|(_, ext)| ext)
        .or_else(|| segment.rsplit_once('.').map(|(_, ext)| ext))?;

    let ext = ext.to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(if ext == "jpeg" { "jpg".to_string() } else { ext })
}

pub fn choose_extension(mime_type: &str, url: &str) -> String {
    extension_for_mime(mime_type)
        .map(str::to_string)
        .or_else(|| extension_from_url(url))
        .unwrap_or_else(|| "bin".to_string())
}
