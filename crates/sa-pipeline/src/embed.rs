//! Typed view over the loosely-typed embed payload attached to a post.

use sa_core::{EmbedType, MediaRequest};
use serde_json::Value;

/// File extensions that mark an external link as a direct media file.
const DIRECT_MEDIA_EXTENSIONS: &[&str] = &["gif", "jpg", "jpeg", "png", "webp", "mp4"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub fullsize: String,
    pub alt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRef {
    pub uri: String,
    pub title: Option<String>,
    pub thumb: Option<String>,
}

/// Media half of a record-with-media embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEmbed {
    Images(Vec<ImageRef>),
    External(ExternalRef),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Embed {
    Images(Vec<ImageRef>),
    External(ExternalRef),
    Record { uri: Option<String> },
    RecordWithMedia { uri: Option<String>, media: MediaEmbed },
    /// Any shape we do not model, kept verbatim
    Unknown(Value),
}

impl Embed {
    /// Classifies an embed view. The `$type` tag decides when present;
    /// otherwise the shape is matched in priority order
    /// images > external > record > record-with-media.
    pub fn parse(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::Unknown(raw.clone());
        };

        let type_tag = obj.get("$type").and_then(Value::as_str).unwrap_or_default();
        let base = type_tag.split('#').next().unwrap_or_default();
        match base {
            "app.bsky.embed.images" => return Self::Images(parse_images(raw)),
            "app.bsky.embed.external" => {
                if let Some(external) = parse_external(raw) {
                    return Self::External(external);
                }
            }
            "app.bsky.embed.record" => return Self::Record { uri: record_uri(raw) },
            "app.bsky.embed.recordWithMedia" => return parse_record_with_media(raw),
            _ => {}
        }

        if obj.get("images").is_some_and(Value::is_array) {
            Self::Images(parse_images(raw))
        } else if let Some(external) = parse_external(raw) {
            Self::External(external)
        } else if obj.contains_key("record") && !obj.contains_key("media") {
            Self::Record { uri: record_uri(raw) }
        } else if obj.contains_key("record") {
            parse_record_with_media(raw)
        } else {
            Self::Unknown(raw.clone())
        }
    }

    pub fn embed_type(&self) -> EmbedType {
        match self {
            Self::Images(_) => EmbedType::Images,
            Self::External(_) => EmbedType::External,
            Self::Record { .. } => EmbedType::Record,
            Self::RecordWithMedia { .. } => EmbedType::RecordWithMedia,
            Self::Unknown(_) => EmbedType::None,
        }
    }

    /// Downloadable references owned by the post `owner_uri`.
    pub fn media_refs(&self, owner_uri: &str) -> Vec<MediaRequest> {
        match self {
            Self::Images(images) => image_requests(images, owner_uri),
            Self::External(external) => external_requests(external, owner_uri),
            Self::RecordWithMedia { media, .. } => match media {
                MediaEmbed::Images(images) => image_requests(images, owner_uri),
                MediaEmbed::External(external) => external_requests(external, owner_uri),
                MediaEmbed::Unknown => Vec::new(),
            },
            Self::Record { .. } | Self::Unknown(_) => Vec::new(),
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn dimension(value: Option<&Value>) -> Option<u32> {
    value.and_then(Value::as_u64).and_then(|v| u32::try_from(v).ok())
}

fn parse_images(raw: &Value) -> Vec<ImageRef> {
    raw.get("images")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter_map(|image| {
                    let aspect = image.get("aspectRatio");
                    Some(ImageRef {
                        fullsize: non_empty_str(image.get("fullsize"))
                            .or_else(|| non_empty_str(image.get("thumb")))?,
                        alt: non_empty_str(image.get("alt")),
                        width: dimension(aspect.and_then(|a| a.get("width"))),
                        height: dimension(aspect.and_then(|a| a.get("height"))),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_external(raw: &Value) -> Option<ExternalRef> {
    let external = raw.get("external")?;
    Some(ExternalRef {
        uri: non_empty_str(external.get("uri"))?,
        title: non_empty_str(external.get("title")),
        thumb: non_empty_str(external.get("thumb")),
    })
}

/// `record.uri` on a record view, `record.record.uri` on a record-with-media view.
fn record_uri(raw: &Value) -> Option<String> {
    let record = raw.get("record")?;
    non_empty_str(record.get("uri")).or_else(|| non_empty_str(record.get("record").and_then(|r| r.get("uri"))))
}

fn parse_record_with_media(raw: &Value) -> Embed {
    let media = match raw.get("media") {
        Some(media) => match Embed::parse(media) {
            Embed::Images(images) => MediaEmbed::Images(images),
            Embed::External(external) => MediaEmbed::External(external),
            _ => MediaEmbed::Unknown,
        },
        None => MediaEmbed::Unknown,
    };
    Embed::RecordWithMedia { uri: record_uri(raw), media }
}

fn image_requests(images: &[ImageRef], owner_uri: &str) -> Vec<MediaRequest> {
    images
        .iter()
        .map(|image| MediaRequest {
            source_url: image.fullsize.clone(),
            owner_uri: owner_uri.to_string(),
            alt_text: image.alt.clone(),
            width: image.width,
            height: image.height,
            ..Default::default()
        })
        .collect()
}

fn external_requests(external: &ExternalRef, owner_uri: &str) -> Vec<MediaRequest> {
    let mut requests = Vec::new();
    if let Some(thumb) = &external.thumb {
        requests.push(MediaRequest {
            source_url: thumb.clone(),
            owner_uri: owner_uri.to_string(),
            alt_text: external.title.clone(),
            ..Default::default()
        });
    }
    if is_direct_media_link(&external.uri) {
        requests.push(MediaRequest {
            source_url: external.uri.clone(),
            owner_uri: owner_uri.to_string(),
            alt_text: external.title.clone(),
            ..Default::default()
        });
    }
    requests
}

fn is_direct_media_link(uri: &str) -> bool {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let Some((_, tail)) = path.rsplit_once('/') else {
        return false;
    };
    tail.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| DIRECT_MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_images_view() {
        let raw = json!({
            "$type": "app.bsky.embed.images#view",
            "images": [
                {"thumb": "https://cdn/t1", "fullsize": "https://cdn/f1@jpeg", "alt": "a cat",
                 "aspectRatio": {"width": 800, "height": 600}},
                {"thumb": "https://cdn/t2", "alt": ""}
            ]
        });
        let embed = Embed::parse(&raw);
        assert_eq!(embed.embed_type(), EmbedType::Images);

        let refs = embed.media_refs("at://did:plc:a/app.bsky.feed.post/1");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].source_url, "https://cdn/f1@jpeg");
        assert_eq!(refs[0].alt_text.as_deref(), Some("a cat"));
        assert_eq!((refs[0].width, refs[0].height), (Some(800), Some(600)));
        assert_eq!(refs[1].source_url, "https://cdn/t2");
        assert_eq!(refs[1].alt_text, None);
    }

    #[test]
    fn test_images_shape_wins_over_other_keys() {
        let raw = json!({
            "images": [{"fullsize": "https://cdn/f"}],
            "external": {"uri": "https://example.com"},
            "record": {"uri": "at://did:plc:b/app.bsky.feed.post/2"}
        });
        assert_eq!(Embed::parse(&raw).embed_type(), EmbedType::Images);
    }

    #[test]
    fn test_external_thumb_and_direct_link() {
        let raw = json!({
            "$type": "app.bsky.embed.external#view",
            "external": {"uri": "https://media.example/clip.GIF?x=1", "title": "clip", "thumb": "https://cdn/thumb"}
        });
        let refs = Embed::parse(&raw).media_refs("at://p");
        let urls: Vec<_> = refs.iter().map(|r| r.source_url.as_str()).collect();
        assert_eq!(urls, ["https://cdn/thumb", "https://media.example/clip.GIF?x=1"]);

        let page = json!({"external": {"uri": "https://example.com/article"}});
        let embed = Embed::parse(&page);
        assert_eq!(embed.embed_type(), EmbedType::External);
        assert!(embed.media_refs("at://p").is_empty());
    }

    #[test]
    fn test_record_and_record_with_media() {
        let quote = json!({
            "$type": "app.bsky.embed.record#view",
            "record": {"uri": "at://did:plc:b/app.bsky.feed.post/2"}
        });
        assert_eq!(
            Embed::parse(&quote),
            Embed::Record { uri: Some("at://did:plc:b/app.bsky.feed.post/2".into()) }
        );

        let mixed = json!({
            "record": {"record": {"uri": "at://did:plc:b/app.bsky.feed.post/3"}},
            "media": {"$type": "app.bsky.embed.images#view", "images": [{"fullsize": "https://cdn/m"}]}
        });
        let embed = Embed::parse(&mixed);
        assert_eq!(embed.embed_type(), EmbedType::RecordWithMedia);
        let Embed::RecordWithMedia { uri, .. } = &embed else { panic!("wrong variant") };
        assert_eq!(uri.as_deref(), Some("at://did:plc:b/app.bsky.feed.post/3"));
        assert_eq!(embed.media_refs("at://p")[0].source_url, "https://cdn/m");
    }

    #[test]
    fn test_unknown_shapes_are_kept() {
        let video = json!({"$type": "app.bsky.embed.video#view", "playlist": "https://v/p.m3u8"});
        let embed = Embed::parse(&video);
        assert_eq!(embed, Embed::Unknown(video.clone()));
        assert_eq!(embed.embed_type(), EmbedType::None);
        assert!(embed.media_refs("at://p").is_empty());

        assert_eq!(Embed::parse(&json!("text")).embed_type(), EmbedType::None);
    }
}
