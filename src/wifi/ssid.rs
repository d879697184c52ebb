//! Hosted access point names and setup flags.

use rand_core::{OsRng, RngCore, TryRngCore};

const MAX_SSID_PREFIX_LENGTH: usize = 20;
const FLAG_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const WIFI_NEEDS_SETUP: u16 = 1 << 0;
const GCD_NEEDS_REGISTRATION: u16 = 1 << 1;

/// Two character encoding of the device setup flags
///
/// Shared by the hosted SSID and the `flags` discovery record so that clients
/// can tell what a device still needs before connecting to it.
pub fn encode_flags(wifi_needs_setup: bool, gcd_needs_registration: bool) -> String {
    let mut flags = 0u16;
    if wifi_needs_setup {
        flags |= WIFI_NEEDS_SETUP;
    }
    if gcd_needs_registration {
        flags |= GCD_NEEDS_REGISTRATION;
    }

    [(flags >> 6) & 0x3f, flags & 0x3f]
        .iter()
        .map(|&bits| FLAG_ALPHABET[bits as usize] as char)
        .collect()
}

/// Generates `"<name> <idx>.<model><flags>prv"` names
///
/// The index is drawn once per generator so the SSID stays stable for the
/// lifetime of the process but differs between identical devices.
#[derive(Clone, Debug)]
pub struct SsidGenerator {
    index: u8,
}

impl Default for SsidGenerator {
    fn default() -> Self {
        Self {
            index: (OsRng.unwrap_err().next_u32() % 100) as u8,
        }
    }
}

impl SsidGenerator {
    pub fn with_index(index: u8) -> Self {
        Self { index: index % 100 }
    }

    /// `model_id` is expected to be validated to five characters at load time.
    pub fn generate(&self, name: &str, model_id: &str, flags: &str) -> String {
        let index = self.index.to_string();
        let max_name_length = MAX_SSID_PREFIX_LENGTH - index.len() - 1;
        let name: String = name.chars().take(max_name_length).collect();

        format!("{name} {index}.{model_id:.5}{flags:2.2}prv")
    }
}
