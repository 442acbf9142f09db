use std::sync::Mutex;

use data_model::{Endpoint, HandlerDefinition};
use rand::{rngs::StdRng, Rng, SeedableRng};

const NAME_PREFIX: &str = "llr";
const SUFFIX_LEN: usize = 6;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generates sandbox container names of the form
/// `llr-<logical id>-<method><path>-<suffix>`.
///
/// The prefix makes sandboxes easy to spot in container listings. The random
/// suffix keeps restarts of the same endpoint, and concurrent runners against
/// the same engine, from colliding.
pub struct NameGenerator<R = StdRng> {
    rng: Mutex<R>,
}

impl NameGenerator<StdRng> {
    pub fn from_os_rng() -> Self {
        Self::new(StdRng::from_os_rng())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> NameGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    pub fn generate(&self, endpoint: &Endpoint, definition: &HandlerDefinition) -> String {
        format!(
            "{}-{}-{}{}-{}",
            NAME_PREFIX,
            definition.logical_id,
            endpoint.method,
            sanitize_path(&endpoint.url_path),
            self.suffix()
        )
    }

    fn suffix(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect()
    }
}

/// Path separators, and anything else a container name may not contain,
/// become underscores.
fn sanitize_path(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
