//! Node path codec.
//!
//! Bidirectional mapping between the registration model (root group, service
//! name, provider descriptor) and coordination-store node paths:
//!
//! ```text
//! /[<group>]/<encode(serviceName)>/<encode(fullProviderDescriptor)>
//! ```
//!
//! Descriptor strings contain `/`, `:` and `?`, so each one is collapsed to a
//! single path segment with a percent codec that is a bijection over the full
//! descriptor alphabet. Pure functions, no I/O.

use percent_encoding::percent_decode_str;
use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;

use crate::constants::ANY_SERVICE;
use crate::constants::PATH_SEPARATOR;
use crate::url::ServiceUrl;

/// Every byte outside `[A-Za-z0-9._-]` is percent-encoded.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Encode an arbitrary string into one store path segment.
pub fn encode(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT).to_string()
}

/// Inverse of [`encode`]. Applied to every child name read from the store
/// before any comparison or parsing.
pub fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// The decoded last segment of a node path.
pub(crate) fn last_segment_decoded(path: &str) -> String {
    decode(path.rsplit(PATH_SEPARATOR).next().unwrap_or(path))
}

/// Maps services and providers into the configured namespace prefix.
#[derive(Debug, Clone)]
pub struct PathCodec {
    /// Empty, or `/<group>`. Immutable after construction.
    root: String,
}

impl PathCodec {
    pub fn new(group: Option<&str>) -> Self {
        let root = match group.map(|g| g.trim_matches('/')) {
            Some(group) if !group.is_empty() => format!("{PATH_SEPARATOR}{group}"),
            _ => String::new(),
        };
        Self { root }
    }

    /// The all-services root: `/<group>`, or `/` when no group is configured.
    pub fn root_path(&self) -> String {
        if self.root.is_empty() {
            PATH_SEPARATOR.to_string()
        } else {
            self.root.clone()
        }
    }

    /// `/[<group>]/<encode(service)>`; the wildcard service maps to the root.
    pub fn service_path(&self, service: &str) -> String {
        if service == ANY_SERVICE {
            return self.root_path();
        }
        format!("{}{}{}", self.root, PATH_SEPARATOR, encode(service))
    }

    /// `/[<group>]/<encode(service)>/<encode(descriptor)>`
    pub fn provider_path(&self, url: &ServiceUrl) -> String {
        format!(
            "{}{}{}",
            self.service_path(url.service_name()),
            PATH_SEPARATOR,
            encode(&url.to_string())
        )
    }

    /// Whether the root namespace node needs to be created on a new session.
    /// The bare `/` always exists in the store.
    pub fn has_group(&self) -> bool {
        !self.root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_round_trip_over_descriptor_alphabet() {
        let cases = [
            "dubbo://10.0.0.1:20880/com.foo.Greeter?version=1.0",
            "a/b/c",
            "host:port?k=v&k2=v2",
            "plain",
            "space and %percent+plus",
            "unicode-你好",
        ];
        for raw in cases {
            assert_eq!(decode(&encode(raw)), raw, "round trip failed for {raw}");
        }
    }

    #[test]
    fn test_encoded_segment_contains_no_separator() {
        let encoded = encode("dubbo://10.0.0.1:20880/com.foo.Greeter?version=1.0");
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('?'));
        assert!(!encoded.contains(':'));
    }

    #[test]
    fn test_service_and_provider_layout() {
        let codec = PathCodec::new(Some("dubbo"));
        assert_eq!(codec.root_path(), "/dubbo");
        assert_eq!(codec.service_path("com.foo.Greeter"), "/dubbo/com.foo.Greeter");

        let provider: ServiceUrl = "dubbo://10.0.0.1:20880/com.foo.Greeter?version=1.0"
            .parse()
            .unwrap();
        let path = codec.provider_path(&provider);
        assert!(path.starts_with("/dubbo/com.foo.Greeter/dubbo%3A%2F%2F10.0.0.1%3A20880"));
        // the provider segment must decode back to the exact descriptor
        assert_eq!(last_segment_decoded(&path), provider.to_string());
    }

    #[test]
    fn test_empty_group_layout() {
        let codec = PathCodec::new(None);
        assert_eq!(codec.root_path(), "/");
        assert_eq!(codec.service_path("com.foo.Greeter"), "/com.foo.Greeter");
        assert!(!codec.has_group());
    }

    #[test]
    fn test_wildcard_service_maps_to_root() {
        let codec = PathCodec::new(Some("dubbo"));
        assert_eq!(codec.service_path(ANY_SERVICE), "/dubbo");
    }

    #[test]
    fn test_group_with_leading_separator() {
        let codec = PathCodec::new(Some("/dubbo"));
        assert_eq!(codec.root_path(), "/dubbo");
    }
}
