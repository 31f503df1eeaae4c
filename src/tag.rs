//! Query-tag generation.
//!
//! Every warehouse call carries a fresh correlation tag of the form
//! `cdesk_<16 hex>`. The same tag is set on the warehouse session and written
//! into any event recorded for that call, which is what lets an operator join
//! a desktop-side trace to warehouse query history.
//!
//! The 16-character width is deliberate: 64 bits puts the birthday-collision
//! 50% mark at ~4e9 tags, where 8 hex characters would collide within tens
//! of thousands.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{RelayError, RelayResult};

/// Prefix shared by every tag this system emits.
pub const TAG_PREFIX: &str = "cdesk_";

/// Hex characters following the prefix.
pub const TAG_HEX_WIDTH: usize = 16;

/// Generates fresh, globally unique correlation tags.
///
/// Construction probes the OS random source once; a host that cannot supply
/// 64 bits of entropy fails fast with `ConfigError` rather than emitting
/// colliding tags later.
#[derive(Debug, Clone, Copy)]
pub struct TagGenerator {
    _probed: (),
}

impl TagGenerator {
    pub fn new() -> RelayResult<Self> {
        let mut probe = [0u8; 8];
        OsRng.try_fill_bytes(&mut probe).map_err(|e| {
            RelayError::config(format!("no usable random source for query tags: {e}"))
        })?;
        Ok(Self { _probed: () })
    }

    /// Produce one tag. Never reuse a tag across calls.
    pub fn generate(&self) -> String {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        format!("{}{:016x}", TAG_PREFIX, u64::from_be_bytes(bytes))
    }

    /// Check that a string is a well-formed tag (`cdesk_` + 16 lowercase hex).
    pub fn is_valid(tag: &str) -> bool {
        match tag.strip_prefix(TAG_PREFIX) {
            Some(hex) => {
                hex.len() == TAG_HEX_WIDTH
                    && hex
                        .bytes()
                        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            }
            None => false,
        }
    }
}
