use relaypool::Event;
use sha2::{Digest, Sha256};
use url::Url;

/// Secondary identity for an event. Two events with the same fingerprint
/// are the same content, even under different ids.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, event: &Event) -> Option<String>;
}

/// Fingerprints video events by the media they point at.
///
/// The url is taken from the first of: an `imeta` tag's `url` entry, a
/// `url` tag, an `r` tag, or the first http(s) link in the content. It is
/// normalized (scheme and host lowercased, query and fragment dropped,
/// trailing slash trimmed) before hashing, so the same file served with
/// different cache-busting parameters still collides.
#[derive(Default, Clone, Copy)]
pub struct MediaUrlFingerprint;

impl MediaUrlFingerprint {
    pub fn media_url(event: &Event) -> Option<&str> {
        let imeta = event.tags.iter().find_map(|tag| match tag.as_slice() {
            [name, entries @ ..] if name == "imeta" => entries
                .iter()
                .find_map(|entry| entry.strip_prefix("url ").map(str::trim)),
            _ => None,
        });

        imeta
            .or_else(|| event.tag_values("url").find(|v| is_http(v)))
            .or_else(|| event.tag_values("r").find(|v| is_http(v)))
            .or_else(|| event.content.split_whitespace().find(|w| is_http(w)))
    }
}

fn is_http(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://")
}

fn normalize(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            let normalized = url.to_string();
            normalized.trim_end_matches('/').to_owned()
        }
        Err(_) => raw.trim().trim_end_matches('/').to_lowercase(),
    }
}

impl Fingerprinter for MediaUrlFingerprint {
    fn fingerprint(&self, event: &Event) -> Option<String> {
        let url = Self::media_url(event)?;
        let digest = Sha256::digest(normalize(url).as_bytes());
        Some(hex::encode(digest))
    }
}

/// Only exact ids count as duplicates.
pub struct NoFingerprint;

impl Fingerprinter for NoFingerprint {
    fn fingerprint(&self, _event: &Event) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaypool::{EventId, Pubkey};

    fn ev(tags: Vec<Vec<&str>>, content: &str) -> Event {
        Event {
            id: EventId::new([0; 32]),
            pubkey: Pubkey::new([0; 32]),
            created_at: 0,
            kind: 34235,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: content.to_owned(),
            sig: String::new(),
        }
    }

    #[test]
    fn prefers_imeta_url() {
        let e = ev(
            vec![
                vec!["url", "https://other.example.com/b.mp4"],
                vec!["imeta", "dim 1920x1080", "url https://cdn.example.com/a.mp4"],
            ],
            "",
        );
        assert_eq!(
            MediaUrlFingerprint::media_url(&e),
            Some("https://cdn.example.com/a.mp4")
        );
    }

    #[test]
    fn falls_back_to_content_links() {
        let e = ev(vec![vec!["t", "cats"]], "look at this https://v.example.com/x.mp4 wow");
        assert_eq!(
            MediaUrlFingerprint::media_url(&e),
            Some("https://v.example.com/x.mp4")
        );
        assert!(MediaUrlFingerprint.fingerprint(&ev(vec![], "no links")).is_none());
    }

    #[test]
    fn same_media_different_spelling_collides() {
        let a = ev(vec![vec!["url", "https://CDN.example.com/a.mp4?token=1"]], "");
        let b = ev(vec![vec!["r", "https://cdn.example.com/a.mp4#t=3"]], "");
        let c = ev(vec![vec!["url", "https://cdn.example.com/b.mp4"]], "");

        let fa = MediaUrlFingerprint.fingerprint(&a).unwrap();
        assert_eq!(Some(fa.clone()), MediaUrlFingerprint.fingerprint(&b));
        assert_ne!(Some(fa.clone()), MediaUrlFingerprint.fingerprint(&c));
        assert_eq!(fa.len(), 64);
    }
}
