//! Per-stream AES-128-CTR decryption of mirrored media payloads.
//!
//! A [`StreamDecryptor`] owns one content key. Binding it to a stream
//! connection id derives the CTR key and IV; from then on every `decrypt`
//! call continues the keystream exactly where the previous one stopped, so
//! payloads may be fed in chunks of any size.

use std::sync::Arc;

use ctr::cipher::{KeyIvInit, StreamCipher};
use fpmirror_core::{LogSink, default_sink};
use tracing::Level;
use zeroize::Zeroizing;

use crate::error::FairPlayError;
use crate::keys::{ContentKey, stream_key_iv};
use crate::wire::CONTENT_KEY_LEN;

pub(crate) type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

struct BoundStream {
    cipher: Aes128Ctr,
    stream_connection_id: u64,
    position: u64,
}

/// Decrypts the payloads of one mirrored stream at a time.
pub struct StreamDecryptor {
    content_key: Option<Zeroizing<[u8; CONTENT_KEY_LEN]>>,
    stream: Option<BoundStream>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for StreamDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecryptor")
            .field("stream_connection_id", &self.stream_connection_id())
            .field("position", &self.position())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl StreamDecryptor {
    /// Store a 16-byte content key. No stream is bound yet.
    pub fn new(content_key: &[u8]) -> Result<Self, FairPlayError> {
        let key = <[u8; CONTENT_KEY_LEN]>::try_from(content_key).map_err(|_| {
            FairPlayError::InvalidKeyLength {
                expected: CONTENT_KEY_LEN,
                actual: content_key.len(),
            }
        })?;
        Ok(Self::with_key(Zeroizing::new(key)))
    }

    /// Copy the key out of a [`ContentKey`] returned by the handshake engine.
    pub fn from_content_key(content_key: &ContentKey) -> Self {
        Self::with_key(Zeroizing::new(*content_key.as_bytes()))
    }

    fn with_key(key: Zeroizing<[u8; CONTENT_KEY_LEN]>) -> Self {
        Self {
            content_key: Some(key),
            stream: None,
            sink: default_sink(),
        }
    }

    /// Route log lines to `sink` instead of `tracing`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Bind to `stream_connection_id`, restarting the keystream at offset 0.
    pub fn init_stream(&mut self, stream_connection_id: u64) -> Result<(), FairPlayError> {
        let content_key = self.content_key.as_ref().ok_or(FairPlayError::Destroyed)?;
        let (key, iv) = stream_key_iv(content_key, stream_connection_id);
        let cipher = Aes128Ctr::new((&*key).into(), (&iv).into());

        let previous = self
            .stream
            .replace(BoundStream {
                cipher,
                stream_connection_id,
                position: 0,
            })
            .map(|old| old.stream_connection_id);

        let message = previous.map_or_else(
            || format!("stream {stream_connection_id} bound"),
            |old| format!("stream {stream_connection_id} bound (was {old})"),
        );
        self.sink.log(Level::DEBUG, &message);
        Ok(())
    }

    /// Decrypt `input`, returning a buffer of the same length.
    pub fn decrypt(&mut self, input: &[u8]) -> Result<Vec<u8>, FairPlayError> {
        let mut output = input.to_vec();
        self.decrypt_in_place(&mut output)?;
        Ok(output)
    }

    /// Decrypt `buf` in place and advance the stream position.
    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) -> Result<(), FairPlayError> {
        if self.content_key.is_none() {
            return Err(FairPlayError::Destroyed);
        }
        let stream = self.stream.as_mut().ok_or(FairPlayError::NotInitialized)?;
        stream
            .cipher
            .try_apply_keystream(buf)
            .map_err(|e| FairPlayError::CryptoFailure(format!("keystream exhausted: {e}")))?;
        stream.position += buf.len() as u64;
        Ok(())
    }

    /// Plaintext bytes produced since the last `init_stream`.
    pub fn position(&self) -> u64 {
        self.stream.as_ref().map_or(0, |s| s.position)
    }

    /// Id of the bound stream, if any.
    pub fn stream_connection_id(&self) -> Option<u64> {
        self.stream.as_ref().map(|s| s.stream_connection_id)
    }

    pub const fn is_destroyed(&self) -> bool {
        self.content_key.is_none()
    }

    /// Zeroise the key and stream state. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.content_key.take().is_some() {
            self.stream = None;
            self.sink.log(Level::DEBUG, "stream decryptor destroyed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sender::encrypt_stream;
    use aes::cipher::{BlockEncrypt, KeyInit};

    const KEY: [u8; 16] = *b"mirror-test-key!";

    fn bound(stream_id: u64) -> StreamDecryptor {
        let mut decryptor = StreamDecryptor::new(&KEY).unwrap();
        decryptor.init_stream(stream_id).unwrap();
        decryptor
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn new_rejects_wrong_key_length() {
        for len in [0, 15, 17, 32] {
            let err = StreamDecryptor::new(&vec![0u8; len]).unwrap_err();
            assert!(matches!(
                err,
                FairPlayError::InvalidKeyLength { expected: 16, actual } if actual == len
            ));
        }
    }

    #[test]
    fn rebinding_logs_previous_stream() {
        let sink = fpmirror_core::MemorySink::new();
        let mut decryptor = StreamDecryptor::new(&KEY).unwrap().with_sink(sink.clone());
        decryptor.init_stream(3).unwrap();
        decryptor.init_stream(9).unwrap();

        let messages: Vec<String> = sink.lines().into_iter().map(|(_, line)| line).collect();
        assert_eq!(messages, ["stream 3 bound", "stream 9 bound (was 3)"]);
    }

    #[test]
    fn decrypt_before_init_stream_fails() {
        let mut decryptor = StreamDecryptor::new(&KEY).unwrap();
        assert!(matches!(
            decryptor.decrypt(b"payload"),
            Err(FairPlayError::NotInitialized)
        ));
        assert_eq!(decryptor.position(), 0);
    }

    #[test]
    fn keystream_is_aes_ctr_with_big_endian_counter() {
        let (key, iv) = stream_key_iv(&KEY, 1);
        let aes = aes::Aes128::new((&*key).into());

        let mut expected = Vec::new();
        let counter = u128::from_be_bytes(iv);
        for offset in 0..2u128 {
            let mut block = aes::Block::from(counter.wrapping_add(offset).to_be_bytes());
            aes.encrypt_block(&mut block);
            expected.extend_from_slice(&block);
        }

        let keystream = bound(1).decrypt(&[0u8; 32]).unwrap();
        assert_eq!(keystream, expected);
    }

    #[test]
    fn chunked_decrypt_matches_single_call() {
        let plaintext = sample(188);
        let ciphertext = encrypt_stream(&KEY, 7, &plaintext);
        let whole = bound(7).decrypt(&ciphertext).unwrap();
        assert_eq!(whole, plaintext);

        for split in [0, 1, 15, 16, 17, 100, 187, 188] {
            let mut decryptor = bound(7);
            let mut joined = decryptor.decrypt(&ciphertext[..split]).unwrap();
            joined.extend(decryptor.decrypt(&ciphertext[split..]).unwrap());
            assert_eq!(joined, whole, "split at {split}");
            assert_eq!(decryptor.position(), 188);
        }
    }

    #[test]
    fn many_small_chunks_match_single_call() {
        let ciphertext = sample(1000);
        let whole = bound(3).decrypt(&ciphertext).unwrap();

        let mut decryptor = bound(3);
        let mut joined = Vec::new();
        for chunk in ciphertext.chunks(7) {
            joined.extend(decryptor.decrypt(chunk).unwrap());
        }
        assert_eq!(joined, whole);
    }

    #[test]
    fn in_place_matches_copying_decrypt() {
        let ciphertext = sample(64);
        let expected = bound(9).decrypt(&ciphertext).unwrap();

        let mut buf = ciphertext;
        bound(9).decrypt_in_place(&mut buf).unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn reinit_restarts_keystream() {
        let ciphertext = sample(50);
        let mut decryptor = bound(11);
        let first = decryptor.decrypt(&ciphertext).unwrap();
        assert_eq!(decryptor.position(), 50);

        decryptor.init_stream(11).unwrap();
        assert_eq!(decryptor.position(), 0);
        assert_eq!(decryptor.decrypt(&ciphertext).unwrap(), first);
    }

    #[test]
    fn different_stream_ids_give_different_plaintext() {
        let ciphertext = sample(64);
        let mut decryptor = bound(1);
        let a = decryptor.decrypt(&ciphertext).unwrap();
        decryptor.init_stream(2).unwrap();
        let b = decryptor.decrypt(&ciphertext).unwrap();
        assert_ne!(a, b);
        assert_eq!(decryptor.stream_connection_id(), Some(2));
    }

    #[test]
    fn decrypt_is_deterministic() {
        let ciphertext = sample(300);
        let a = bound(u64::MAX).decrypt(&ciphertext).unwrap();
        let b = bound(u64::MAX).decrypt(&ciphertext).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut decryptor = bound(5);
        assert!(decryptor.decrypt(&[]).unwrap().is_empty());
        assert_eq!(decryptor.position(), 0);
    }

    #[test]
    fn destroy_is_idempotent_and_final() {
        let mut decryptor = bound(5);
        decryptor.destroy();
        decryptor.destroy();
        assert!(decryptor.is_destroyed());
        assert!(matches!(decryptor.decrypt(b"x"), Err(FairPlayError::Destroyed)));
        assert!(matches!(decryptor.init_stream(5), Err(FairPlayError::Destroyed)));
        assert_eq!(decryptor.stream_connection_id(), None);
    }

    #[test]
    fn independent_streams_run_in_parallel() {
        let handles: Vec<_> = (0..4u64)
            .map(|id| {
                std::thread::spawn(move || {
                    let plaintext = sample(4096);
                    let ciphertext = encrypt_stream(&KEY, id, &plaintext);
                    let mut decryptor = bound(id);
                    let mut out = Vec::new();
                    for chunk in ciphertext.chunks(188) {
                        out.extend(decryptor.decrypt(chunk).unwrap());
                    }
                    out == plaintext
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
