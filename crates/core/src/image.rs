//! Container image reference display helpers.

use once_cell::sync::Lazy;
use regex::Regex;

static DEFAULT_REGISTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(index\.)?docker\.io/(library/)?").expect("static regex"));
static LATEST_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r":latest$").expect("static regex"));
static LONG_DIGEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*@sha256:)([0-9a-f]{8})[0-9a-f]+$").expect("static regex"));

/// `docker.io/library/nginx:latest` -> `nginx`; digests are cut to 8 hex chars.
pub fn shortened_image(image: &str) -> String {
    let s = DEFAULT_REGISTRY.replace(image, "");
    let s = LATEST_TAG.replace(&s, "");
    LONG_DIGEST.replace(&s, "${1}${2}\u{2026}").into_owned()
}
