//! Case-insensitive substitution of configured sensitive values with a
//! placeholder. Pure transforms; idempotent by construction.

mod __test__;

use std::collections::{HashMap, HashSet};
use url::Url;

use crate::config::PrivacyConfig;
use crate::event::{Metadata, MetadataValue};

#[derive(Debug, Clone)]
pub struct Redactor {
  headers: HashSet<String>,
  metadata_keys: HashSet<String>,
  query_params: HashSet<String>,
  placeholder: String,
}

fn lowered(names: &[String]) -> HashSet<String> {
  names.iter().map(|n| n.to_lowercase()).collect()
}

impl Redactor {
  pub fn new(privacy: &PrivacyConfig) -> Self {
    Self {
      headers: lowered(&privacy.redacted_headers),
      metadata_keys: lowered(&privacy.redacted_metadata_keys),
      query_params: lowered(&privacy.redacted_query_params),
      placeholder: privacy.placeholder.clone(),
    }
  }

  pub fn placeholder(&self) -> &str {
    &self.placeholder
  }

  /// Copy of `headers` with every configured name mapped to the placeholder.
  pub fn redact_headers(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
      .iter()
      .map(|(k, v)| {
        if self.headers.contains(&k.to_lowercase()) {
          (k.clone(), self.placeholder.clone())
        } else {
          (k.clone(), v.clone())
        }
      })
      .collect()
  }

  /// Same rule over metadata, replacing matches with a string placeholder.
  pub fn redact_metadata(&self, metadata: &Metadata) -> Metadata {
    metadata
      .iter()
      .map(|(k, v)| {
        if self.metadata_keys.contains(&k.to_lowercase()) {
          (k.clone(), MetadataValue::String(self.placeholder.clone()))
        } else {
          (k.clone(), v.clone())
        }
      })
      .collect()
  }

  /// Rewrites redacted query parameter values. Unparseable URLs pass through
  /// unchanged.
  pub fn redact_url(&self, url: &str) -> String {
    let mut parsed = match Url::parse(url) {
      Ok(u) => u,
      Err(_) => return url.to_string(),
    };

    if parsed.query().is_none() {
      return url.to_string();
    }

    let pairs: Vec<(String, String)> = parsed
      .query_pairs()
      .map(|(k, v)| {
        if self.query_params.contains(&k.to_lowercase()) {
          (k.into_owned(), self.placeholder.clone())
        } else {
          (k.into_owned(), v.into_owned())
        }
      })
      .collect();

    parsed
      .query_pairs_mut()
      .clear()
      .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    parsed.to_string()
  }
}
