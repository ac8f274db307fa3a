//! Subscriber identity resolution.
//!
//! Splits raw sender ids into tenant prefix + local number and, on request,
//! resolves a region code. Region resolution is two-stage: a best-effort
//! number-format inference first, then a keyed lookup in the external
//! identity cache. Every failure mode here is event-scoped and recoverable;
//! callers drop the offending event.

pub mod cache;

use thiserror::Error;

use self::cache::IdentityCache;

/// Prefix substituted when the leading characters of a raw id are not
/// alphabetic.
pub const FALLBACK_PREFIX: &str = "zz";

/// Filler suffix appended to a local number before format inference.
///
/// Heuristic only: the filler and the digit cut-off below reproduce the
/// observed behavior of the platform and carry no deeper meaning. A real
/// country source for subscriber numbers would replace both.
const REGION_GUESS_FILLER: &str = "999999999999";

/// Digit length the padded number is truncated to before inference.
const REGION_GUESS_DIGITS: usize = 12;

/// Ephemeral identity of an event's sender. Never persisted by this core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberIdentity {
    pub prefix: String,
    pub local_number: String,
    pub region_code: Option<String>,
}

/// Failure modes of region resolution.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("no cache record for subscriber {raw_id}")]
    EmptyUser { raw_id: String },

    #[error("undecodable cache record for subscriber {raw_id}")]
    InvalidUserData {
        raw_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache record for subscriber {raw_id} carries no region")]
    EmptyRegionCode { raw_id: String },

    #[error("identity cache lookup failed")]
    Cache(#[from] redis::RedisError),
}

/// Splits a raw sender id into (tenant prefix, local number).
///
/// The prefix is the two leading ASCII-alphabetic characters; anything else
/// falls back to [`FALLBACK_PREFIX`] with the whole string as the local
/// number.
pub fn split(raw_id: &str) -> (String, String) {
    let bytes = raw_id.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1].is_ascii_alphabetic() {
        (raw_id[..2].to_string(), raw_id[2..].to_string())
    } else {
        (FALLBACK_PREFIX.to_string(), raw_id.to_string())
    }
}

/// Best-effort region inference from the local number alone.
///
/// Pads the number with [`REGION_GUESS_FILLER`], truncates to
/// [`REGION_GUESS_DIGITS`] digits and feeds the result to number-format
/// parsing. Approximate by design, not authoritative.
pub fn infer_region(local_number: &str) -> Option<String> {
    if local_number.is_empty() {
        return None;
    }

    let mut candidate = String::with_capacity(REGION_GUESS_DIGITS + 1);
    candidate.push('+');
    candidate.extend(
        local_number
            .chars()
            .chain(REGION_GUESS_FILLER.chars())
            .take(REGION_GUESS_DIGITS),
    );

    let number = phonenumber::parse(None, &candidate).ok()?;
    number.country().id().map(|id| id.as_ref().to_string())
}

/// Two-stage subscriber identity resolver.
pub struct IdentityResolver {
    cache: Option<IdentityCache>,
}

impl IdentityResolver {
    /// Creates a resolver. Without a cache, every fallback lookup behaves
    /// as an absent entry.
    pub fn new(cache: Option<IdentityCache>) -> Self {
        Self { cache }
    }

    /// Resolves a raw sender id.
    ///
    /// With `want_region` unset this performs no external calls and returns
    /// a `None` region. Otherwise direct inference is attempted first and
    /// the cache consulted only when inference yields nothing.
    pub async fn resolve(
        &self,
        raw_id: &str,
        want_region: bool,
    ) -> Result<SubscriberIdentity, IdentityError> {
        let (prefix, local_number) = split(raw_id);

        if !want_region {
            return Ok(SubscriberIdentity {
                prefix,
                local_number,
                region_code: None,
            });
        }

        if let Some(region) = infer_region(&local_number) {
            return Ok(SubscriberIdentity {
                prefix,
                local_number,
                region_code: Some(region),
            });
        }

        let region = self.lookup_region(raw_id).await?;
        Ok(SubscriberIdentity {
            prefix,
            local_number,
            region_code: Some(region),
        })
    }

    /// Cache fallback: one keyed round trip for this event only.
    async fn lookup_region(&self, raw_id: &str) -> Result<String, IdentityError> {
        let Some(cache) = &self.cache else {
            return Err(IdentityError::EmptyUser {
                raw_id: raw_id.to_string(),
            });
        };

        let payload = cache
            .lookup(raw_id)
            .await?
            .ok_or_else(|| IdentityError::EmptyUser {
                raw_id: raw_id.to_string(),
            })?;

        let record = cache::decode(&payload).map_err(|source| IdentityError::InvalidUserData {
            raw_id: raw_id.to_string(),
            source,
        })?;

        record
            .region_code()
            .ok_or_else(|| IdentityError::EmptyRegionCode {
                raw_id: raw_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_alphabetic_prefix() {
        assert_eq!(
            split("am37455909314"),
            ("am".to_string(), "37455909314".to_string())
        );
        assert_eq!(
            split("zz37455909314"),
            ("zz".to_string(), "37455909314".to_string())
        );
    }

    #[test]
    fn test_split_non_alphabetic_falls_back() {
        assert_eq!(
            split("37455909314"),
            ("zz".to_string(), "37455909314".to_string())
        );
        assert_eq!(split("a1234"), ("zz".to_string(), "a1234".to_string()));
        assert_eq!(split(""), ("zz".to_string(), "".to_string()));
        assert_eq!(split("a"), ("zz".to_string(), "a".to_string()));
    }

    #[test]
    fn test_infer_region_rejects_junk() {
        assert_eq!(infer_region(""), None);
        assert_eq!(infer_region("x"), None);
        // A leading zero is not a valid country-code start.
        assert_eq!(infer_region("0"), None);
    }

    #[test]
    fn test_infer_region_from_full_number() {
        // 374 is an unambiguous country code, so inference resolves even
        // though the padded tail is garbage.
        assert!(infer_region("37455909314").is_some());
    }

    #[tokio::test]
    async fn test_resolve_without_region_makes_no_lookup() {
        let resolver = IdentityResolver::new(None);
        let identity = resolver
            .resolve("zz37455909314", false)
            .await
            .expect("split never fails");

        assert_eq!(
            identity,
            SubscriberIdentity {
                prefix: "zz".to_string(),
                local_number: "37455909314".to_string(),
                region_code: None,
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_empty_user_when_nothing_resolves() {
        let resolver = IdentityResolver::new(None);
        let err = resolver.resolve("zz0", true).await.unwrap_err();
        assert!(matches!(err, IdentityError::EmptyUser { .. }));
    }

    #[tokio::test]
    async fn test_resolve_with_region_uses_inference_first() {
        // No cache configured: success proves the direct path answered.
        let resolver = IdentityResolver::new(None);
        let identity = resolver
            .resolve("am37455909314", true)
            .await
            .expect("inference resolves");

        assert_eq!(identity.prefix, "am");
        assert_eq!(identity.local_number, "37455909314");
        assert!(identity.region_code.is_some());
    }
}
