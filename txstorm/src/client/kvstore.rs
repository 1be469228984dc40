use bytes::{BufMut, Bytes, BytesMut};
use rand::{distr::Alphanumeric, rngs::StdRng, Rng, SeedableRng};

use super::{Client, ClientFactory};
use crate::{
    cfg::Config,
    error::{ClientError, ConfigError},
};

/// Symbols used for key suffixes, in ascending order.
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
/// Length of the random per-client key prefix.
///
/// Allows 62^5 = 916,132,832 distinct client IDs.
pub const CLIENT_ID_LEN: usize = 5;
/// A key/value pair needs at least one character of value.
const MIN_VALUE_LEN: usize = 1;
/// The longest key suffix we are willing to use.
const MAX_SUFFIX_LEN: usize = 16;

/// Returns the key suffix length required to encode `max_count` unique
/// values using `alphabet_size` symbols.
///
/// This is the smallest length `l` such that `alphabet_size^l > max_count`,
/// plus one extra symbol of margin.
pub fn min_suffix_len(alphabet_size: u64, max_count: u64) -> Result<usize, ConfigError> {
    if alphabet_size < 2 {
        return Err(ConfigError::InvalidAlphabet(alphabet_size));
    }
    if max_count == 0 {
        return Err(ConfigError::ZeroTxs);
    }

    let mut capacity = 1u64;
    for len in 1..MAX_SUFFIX_LEN {
        capacity = match capacity.checked_mul(alphabet_size) {
            Some(v) => v,
            // Beyond u64, thus beyond any possible count.
            None => return Ok(len + 1),
        };
        if capacity > max_count {
            return Ok(len + 1);
        }
    }

    Err(ConfigError::TooManyTxs(max_count))
}

/// Creates clients generating random "key=value" transactions for a
/// key/value store application.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvStoreClientFactory;

impl KvStoreClientFactory {
    pub const NAME: &'static str = "kvstore";

    /// Returns the smallest transaction size acceptable for the config.
    pub fn min_tx_size(cfg: &Config) -> Result<usize, ConfigError> {
        let suffix_len = min_suffix_len(ALPHABET.len() as u64, cfg.max_txs_per_connection())?;

        // "[client_id][suffix]=[value]"
        Ok(CLIENT_ID_LEN + suffix_len + 1 + MIN_VALUE_LEN)
    }
}

impl ClientFactory for KvStoreClientFactory {
    fn validate_config(&self, cfg: &Config) -> Result<(), ConfigError> {
        let min = Self::min_tx_size(cfg)?;
        if cfg.size < min {
            return Err(ConfigError::TooSmall { size: cfg.size, min });
        }

        Ok(())
    }

    fn new_client(&self, cfg: &Config) -> Result<Box<dyn Client>, ConfigError> {
        self.validate_config(cfg)?;

        let suffix_len = min_suffix_len(ALPHABET.len() as u64, cfg.max_txs_per_connection())?;
        let client = KvStoreClient::new(suffix_len, cfg.size);

        Ok(Box::new(client))
    }
}

/// Generates transactions of the form `[client_id][suffix]=[value]`.
///
/// The client ID is random, the suffix is a zero-padded base-62 counter and
/// the value is random padding up to the configured size.
#[derive(Debug)]
pub struct KvStoreClient {
    prefix: [u8; CLIENT_ID_LEN],
    suffix_len: usize,
    value_len: usize,
    /// Number of transactions generated so far.
    counter: u64,
    /// Number of distinct suffixes.
    capacity: u64,
    rng: StdRng,
}

impl KvStoreClient {
    fn new(suffix_len: usize, size: usize) -> Self {
        let mut rng = StdRng::from_os_rng();
        let mut prefix = [0; CLIENT_ID_LEN];
        for b in prefix.iter_mut() {
            *b = rng.sample(Alphanumeric);
        }

        let capacity = (ALPHABET.len() as u64).saturating_pow(suffix_len as u32);
        let value_len = size - CLIENT_ID_LEN - suffix_len - 1;

        Self {
            prefix,
            suffix_len,
            value_len,
            counter: 0,
            capacity,
            rng,
        }
    }

    /// Writes the counter as a zero-padded base-62 number.
    #[inline]
    fn put_suffix(&self, buf: &mut BytesMut) {
        let base = ALPHABET.len() as u64;
        let offset = buf.len();
        buf.put_bytes(ALPHABET[0], self.suffix_len);

        let mut n = self.counter;
        for idx in (offset..offset + self.suffix_len).rev() {
            if n == 0 {
                break;
            }
            buf[idx] = ALPHABET[(n % base) as usize];
            n /= base;
        }
    }
}

impl Client for KvStoreClient {
    fn generate_tx(&mut self) -> Result<Bytes, ClientError> {
        if self.counter >= self.capacity {
            return Err(ClientError::Exhausted { capacity: self.capacity });
        }

        let mut buf = BytesMut::with_capacity(CLIENT_ID_LEN + self.suffix_len + 1 + self.value_len);
        buf.put_slice(&self.prefix);
        self.put_suffix(&mut buf);
        buf.put_u8(b'=');
        for _ in 0..self.value_len {
            buf.put_u8(self.rng.sample(Alphanumeric));
        }
        self.counter += 1;

        Ok(buf.freeze())
    }
}
