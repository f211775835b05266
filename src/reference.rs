//! Image reference normalization.
//!
//! User-supplied references follow the docker conventions: the registry may
//! be omitted (meaning `docker.io`), official images may omit `library/`, and
//! the version may be omitted (meaning the `latest` tag).  [`normalize`] turns
//! any such string into a fully qualified [`Reference`] whose string form
//! normalizes to itself.

use core::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    digest::Digest,
    error::{Error, Result},
};

pub const DEFAULT_DOMAIN: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const NAME_TOTAL_LENGTH_MAX: usize = 255;

static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "^",
        "(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
        "(?:\\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*",
        "(?::[0-9]+)?",
        "$",
    ))
    .unwrap()
});

static PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "^",
        "[a-z0-9]+(?:(?:\\.|_|__|-+)[a-z0-9]+)*",
        "(?:/[a-z0-9]+(?:(?:\\.|_|__|-+)[a-z0-9]+)*)*",
        "$",
    ))
    .unwrap()
});

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,127}$").unwrap());

static HEX_ID: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-f0-9]{64}$").unwrap());

/// What a reference points at within its repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Tag(String),
    Digest(Digest),
}

/// A fully qualified image reference.
///
/// Always carries a registry domain, a repository path and exactly one of a
/// tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    domain: String,
    path: String,
    target: Target,
}

fn invalid(reference: &str, reason: impl Into<String>) -> Error {
    Error::InvalidReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

/// Splits the remote name into domain and repository path.
///
/// The first component is a registry host when it looks like one: it
/// contains a dot or a port, is `localhost`, or has upper-case characters
/// (which repository paths never do).
fn split_domain(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains(['.', ':'])
                || first == "localhost"
                || first.bytes().any(|b| b.is_ascii_uppercase()) =>
        {
            (first, rest)
        }
        _ => (DEFAULT_DOMAIN, name),
    }
}

/// Canonicalizes an image reference.
///
/// When both a tag and a digest are given, the digest wins and the tag is
/// dropped.
pub fn normalize(reference: &str) -> Result<Reference> {
    if reference.is_empty() {
        return Err(invalid(reference, "empty reference"));
    }
    if HEX_ID.is_match(reference) {
        return Err(invalid(
            reference,
            "cannot specify 64-byte hexadecimal strings",
        ));
    }

    let (remainder, digest) = match reference.split_once('@') {
        Some((remainder, digest)) => {
            let digest = digest
                .parse::<Digest>()
                .map_err(|e| invalid(reference, e.to_string()))?;
            (remainder, Some(digest))
        }
        None => (reference, None),
    };

    // A colon after the last slash separates the tag.
    let (name, tag) = match remainder.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (remainder, None),
    };
    if let Some(tag) = tag {
        if !TAG.is_match(tag) {
            return Err(invalid(reference, format!("invalid tag {tag:?}")));
        }
    }

    let (domain, path) = split_domain(name);
    if !DOMAIN.is_match(domain) {
        return Err(invalid(reference, format!("invalid domain {domain:?}")));
    }
    if path.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(invalid(reference, "repository name must be lowercase"));
    }
    if !PATH.is_match(path) {
        return Err(invalid(reference, format!("invalid repository path {path:?}")));
    }

    let domain = match domain {
        LEGACY_DEFAULT_DOMAIN => DEFAULT_DOMAIN,
        other => other,
    };
    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("{OFFICIAL_REPO_PREFIX}{path}")
    } else {
        path.to_string()
    };
    if domain.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
        return Err(invalid(
            reference,
            format!("repository name must not be more than {NAME_TOTAL_LENGTH_MAX} characters"),
        ));
    }

    let target = match (digest, tag) {
        (Some(digest), _) => Target::Digest(digest),
        (None, Some(tag)) => Target::Tag(tag.to_string()),
        (None, None) => Target::Tag(DEFAULT_TAG.to_string()),
    };

    Ok(Reference {
        domain: domain.to_string(),
        path,
        target,
    })
}

impl Reference {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The repository name: `domain/path`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.target {
            Target::Tag(tag) => Some(tag),
            Target::Digest(_) => None,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.target {
            Target::Tag(_) => None,
            Target::Digest(digest) => Some(digest),
        }
    }

    /// `name:tag`, for tagged references.
    pub fn repo_tag(&self) -> Option<String> {
        self.tag().map(|tag| format!("{}:{tag}", self.name()))
    }

    /// `name@digest` for the given content digest.
    pub fn repo_digest(&self, digest: &Digest) -> String {
        format!("{}@{digest}", self.name())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Tag(tag) => write!(f, "{}/{}:{tag}", self.domain, self.path),
            Target::Digest(digest) => write!(f, "{}/{}@{digest}", self.domain, self.path),
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        normalize(s)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    const BUSYBOX_DIGEST: &str =
        "sha256:e6693c20186f837fc393390135d8a598a96a833917917789d63766cab6c59582";

    fn n(s: &str) -> String {
        normalize(s).unwrap().to_string()
    }

    #[test]
    fn test_normalize_docker_hub() {
        let full = "docker.io/library/busybox:latest";
        for short in [
            "busybox",
            "busybox:latest",
            "library/busybox",
            "docker.io/busybox",
            "docker.io/library/busybox",
            "docker.io/busybox:latest",
            "library/busybox:latest",
            "docker.io/library/busybox:latest",
            "index.docker.io/busybox",
        ] {
            assert_eq!(n(short), full, "{short}");
        }
        assert_eq!(
            n(&format!("busybox@{BUSYBOX_DIGEST}")),
            format!("docker.io/library/busybox@{BUSYBOX_DIGEST}")
        );
        assert_eq!(n("gcr.io/library/busybox"), "gcr.io/library/busybox:latest");
        assert_eq!(n("someuser/app:1.0"), "docker.io/someuser/app:1.0");
    }

    #[test]
    fn test_normalize_registries() {
        assert_eq!(
            n("registry.example/app:v1"),
            "registry.example/app:v1"
        );
        assert_eq!(n("localhost/app"), "localhost/app:latest");
        assert_eq!(n("localhost:5000/a/b:c"), "localhost:5000/a/b:c");
        assert_eq!(n("Registry/app"), "Registry/app:latest");
    }

    #[test]
    fn test_tag_and_digest() {
        let r = normalize(&format!("registry.example/app:v1@{BUSYBOX_DIGEST}")).unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest().unwrap().to_string(), BUSYBOX_DIGEST);
        assert_eq!(r.repo_tag(), None);
    }

    #[test]
    fn test_idempotent() {
        for s in [
            "busybox",
            "gcr.io/library/busybox",
            "localhost:5000/a/b:c",
            &format!("busybox@{BUSYBOX_DIGEST}"),
        ] {
            let once = n(s);
            assert_eq!(n(&once), once);
        }
    }

    #[test]
    fn test_invalid() {
        for bad in [
            "",
            "UPPER",
            "docker.io/UPPER",
            "busybox:",
            "busybox:.bad",
            "busybox@sha256:abc",
            "busybox@",
            "/busybox",
            "busybox/",
            "a//b",
            " busybox",
            "-busybox",
            "e6693c20186f837fc393390135d8a598a96a833917917789d63766cab6c59582",
            &format!("{}/{}", "registry.example", "a".repeat(250)),
        ] {
            match normalize(bad) {
                Err(Error::InvalidReference { .. }) => {}
                other => panic!("{bad:?} gave {other:?}"),
            }
        }
    }

    #[test]
    fn test_derived_names() {
        let r = normalize("registry.example/app:v1").unwrap();
        assert_eq!(r.name(), "registry.example/app");
        assert_eq!(r.repo_tag().unwrap(), "registry.example/app:v1");
        let d: Digest = BUSYBOX_DIGEST.parse().unwrap();
        assert_eq!(
            r.repo_digest(&d),
            format!("registry.example/app@{BUSYBOX_DIGEST}")
        );
    }
}
