#[cfg(test)]
mod __test__ {

  use std::collections::HashMap;

  use crate::config::PrivacyConfig;
  use crate::event::{Metadata, MetadataValue};
  use crate::redact::Redactor;

  fn redactor() -> Redactor {
    Redactor::new(&PrivacyConfig::default())
  }

  #[test]
  fn test_redact_headers_case_insensitive() {
    let mut headers = HashMap::new();
    headers.insert("Authorization".to_string(), "Bearer abc".to_string());
    headers.insert("Content-Type".to_string(), "application/json".to_string());

    let out = redactor().redact_headers(&headers);
    assert_eq!(out["Authorization"], "<redacted>");
    assert_eq!(out["Content-Type"], "application/json");
  }

  #[test]
  fn test_redact_metadata_replaces_with_string_placeholder() {
    let mut metadata = Metadata::new();
    metadata.insert("Password".to_string(), MetadataValue::Int(1234));
    metadata.insert("attempt".to_string(), MetadataValue::Int(2));

    let out = redactor().redact_metadata(&metadata);
    assert_eq!(
      out["Password"],
      MetadataValue::String("<redacted>".to_string())
    );
    assert_eq!(out["attempt"], MetadataValue::Int(2));
  }

  #[test]
  fn test_redact_url_query_params() {
    let out = redactor().redact_url("https://api.example.com/v1/items?page=2&TOKEN=s3cret");
    assert!(out.contains("page=2"));
    assert!(out.contains("TOKEN=%3Credacted%3E") || out.contains("TOKEN=<redacted>"));
    assert!(!out.contains("s3cret"));
  }

  #[test]
  fn test_redact_url_without_query_unchanged() {
    let url = "https://api.example.com/v1/items";
    assert_eq!(redactor().redact_url(url), url);
  }

  #[test]
  fn test_redact_url_unparseable_passes_through() {
    let url = "not a url at all";
    assert_eq!(redactor().redact_url(url), url);
  }

  #[test]
  fn test_redaction_is_idempotent() {
    let r = redactor();

    let mut headers = HashMap::new();
    headers.insert("Cookie".to_string(), "session=1".to_string());
    let once = r.redact_headers(&headers);
    let twice = r.redact_headers(&once);
    assert_eq!(once, twice);

    let url = "https://example.com/path?api_key=zzz&x=1";
    let once = r.redact_url(url);
    let twice = r.redact_url(&once);
    assert_eq!(once, twice);

    let mut metadata = Metadata::new();
    metadata.insert("token".to_string(), MetadataValue::from("abc"));
    let once = r.redact_metadata(&metadata);
    let twice = r.redact_metadata(&once);
    assert_eq!(once, twice);
  }
}
