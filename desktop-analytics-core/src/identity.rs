//! User identity and privacy reduction
//!
//! An [`Identity`] is whatever the host knows about the person using the
//! application. Unless PII retention is requested, only the output of
//! [`Identity::sanitized`] ever leaves the process.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Number of digest bytes appended to an obfuscated name (8 hex chars).
const NAME_DIGEST_BYTES: usize = 4;

/// Information about the user, typically reloaded from host settings on every run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub ui_language_code: String,
    /// Extra traits; the caller is responsible for keeping PII out of these
    pub other_properties: BTreeMap<String, String>,
}

impl Identity {
    /// Produce a privacy-reduced copy.
    ///
    /// - Non-blank names become their first character followed by a short
    ///   digest of the full value.
    /// - Emails keep everything from the first `@` onward; values without an
    ///   `@` pass through.
    /// - Blank fields and `other_properties` pass through unchanged.
    pub fn sanitized(&self) -> Identity {
        Identity {
            first_name: obfuscate_name(&self.first_name),
            last_name: obfuscate_name(&self.last_name),
            email: email_domain(&self.email),
            ui_language_code: self.ui_language_code.clone(),
            other_properties: self.other_properties.clone(),
        }
    }

    /// "First Last" as reported in the `UserName` property
    pub fn display_name(&self) -> String {
        if self.first_name.trim().is_empty() {
            self.last_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

fn obfuscate_name(name: &str) -> String {
    let Some(first) = name.chars().next() else {
        return String::new();
    };
    if name.trim().is_empty() {
        return name.to_string();
    }

    let digest = Sha256::digest(name.as_bytes());
    format!("{}{}", first, hex::encode(&digest[..NAME_DIGEST_BYTES]))
}

fn email_domain(email: &str) -> String {
    match email.find('@') {
        Some(at) => email[at..].to_string(),
        None => email.to_string(),
    }
}
