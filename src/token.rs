//! Random tokens: the SSH canary and short unique identifiers.
//!
//! Generation takes the entropy source as a parameter so callers decide
//! between the OS generator and a seeded one in tests.

use std::fmt;
use std::fmt::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// Number of random bytes behind a canary (256 bits).
pub const CANARY_BYTES: usize = 32;

/// Location of the canary file on a freshly booted node.
pub const CANARY_PATH: &str = "/tmp/ssh-canary";

/// Single-use secret embedded in a node's bootstrap payload and read back
/// over SSH to prove the session reached the node we created.
#[derive(Clone, Eq, PartialEq)]
pub struct Canary(String);

impl Canary {
    /// Draws a fresh canary from `rng`.
    #[must_use]
    pub fn generate(rng: &mut impl RngCore) -> Self {
        Self(create_token(rng, CANARY_BYTES))
    }

    /// Returns the encoded value written into the payload.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Compares a value read from the node. At most one trailing newline is
    /// tolerated; any other difference is a mismatch.
    #[must_use]
    pub fn matches(&self, observed: &str) -> bool {
        observed.strip_suffix('\n').unwrap_or(observed) == self.0
    }
}

impl fmt::Debug for Canary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Canary(..)")
    }
}

/// Returns `len` random bytes encoded as unpadded URL-safe base64.
#[must_use]
pub fn create_token(rng: &mut impl RngCore, len: usize) -> String {
    URL_SAFE_NO_PAD.encode(random_bytes(rng, len))
}

/// Returns `len` random bytes.
#[must_use]
pub fn random_bytes(rng: &mut impl RngCore, len: usize) -> Vec<u8> {
    let mut bytes = vec![0_u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Eight lowercase hex characters used in generated minion ids.
#[must_use]
pub fn unique_id(rng: &mut impl RngCore) -> String {
    random_bytes(rng, 4)
        .iter()
        .fold(String::with_capacity(8), |mut acc, byte| {
            write!(acc, "{byte:02x}").ok();
            acc
        })
}
