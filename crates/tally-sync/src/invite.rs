//! Invite payloads for device pairing.
//!
//! An invite bootstraps a direct connection and nothing more — it carries
//! the account identifier, the host device code, and the display name of
//! the group, never ledger data. Two textual forms are accepted:
//!
//! - colon form (typed or QR): `et:{account}:{hostDevice}:{urlEncodedName}`
//! - URL form: any URL whose query carries `account`, `device`, `name`
//!
//! Anything else is rejected outright; there is no partial recovery from a
//! mangled invite.

use std::fmt;
use std::str::FromStr;

use tally_core::error::SyncError;
use tally_core::model::id::{AccountId, DeviceId};

/// A parsed invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    /// The shared account to join.
    pub account: AccountId,
    /// The host device to dial.
    pub host: DeviceId,
    /// Group display name, for the join prompt.
    pub name: String,
}

impl Invite {
    /// Render the colon form (`et:...`).
    #[must_use]
    pub fn code(&self) -> String {
        format!(
            "et:{}:{}:{}",
            self.account,
            self.host,
            percent_encode(&self.name)
        )
    }

    /// Render the URL form.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "https://tally.app/join?account={}&device={}&name={}",
            self.account,
            self.host,
            percent_encode(&self.name)
        )
    }

    /// Parse either accepted form.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInvite`] for anything that is not a
    /// well-formed invite in one of the two forms.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("et:") {
            return Self::parse_colon(rest);
        }
        if let Some((_, query)) = raw.split_once('?') {
            return Self::parse_query(query);
        }
        Err(SyncError::InvalidInvite(
            "expected an et: code or an invite URL".to_string(),
        ))
    }

    fn parse_colon(rest: &str) -> Result<Self, SyncError> {
        let mut parts = rest.splitn(3, ':');
        let (Some(account), Some(host), Some(name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SyncError::InvalidInvite(
                "et: code needs account, device, and name".to_string(),
            ));
        };
        Self::build(account, host, name)
    }

    fn parse_query(query: &str) -> Result<Self, SyncError> {
        let mut account = None;
        let mut device = None;
        let mut name = None;
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "account" => account = Some(value),
                "device" => device = Some(value),
                "name" => name = Some(value),
                _ => {}
            }
        }
        let (Some(account), Some(device), Some(name)) = (account, device, name) else {
            return Err(SyncError::InvalidInvite(
                "invite URL needs account, device, and name parameters".to_string(),
            ));
        };
        Self::build(account, device, name)
    }

    fn build(account: &str, host: &str, encoded_name: &str) -> Result<Self, SyncError> {
        let account = AccountId::from_str(account)
            .map_err(|err| SyncError::InvalidInvite(err.to_string()))?;
        let host = DeviceId::from_str(host)
            .map_err(|err| SyncError::InvalidInvite(err.to_string()))?;
        let name = percent_decode(encoded_name)
            .ok_or_else(|| SyncError::InvalidInvite("bad percent-encoding in name".to_string()))?;
        if name.is_empty() {
            return Err(SyncError::InvalidInvite("empty group name".to_string()));
        }
        Ok(Self {
            account,
            host,
            name,
        })
    }
}

impl fmt::Display for Invite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

// ---------------------------------------------------------------------------
// Percent encoding
// ---------------------------------------------------------------------------

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

/// Strict decode: a stray `%` or invalid UTF-8 is a `None`, not a guess.
fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
