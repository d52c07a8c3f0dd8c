//! Length-prefixed message framing between cluster processes.
//!
//! Wire layout per message: a 4-byte big-endian length, one message id
//! byte, then the body. The body is the user payload run through the
//! configured compressor and then the cipher; decoders mirror the two
//! stages in reverse. The first message a child ever emits is HELLO
//! carrying its pid.

use std::io::{self, Write};

use aes::cipher::{KeyIvInit, StreamCipher};
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};

/// Message ids on the wire.
pub const HELLO: u8 = 1;
pub const GENERAL: u8 = 2;

/// Frame length prefix plus message id byte.
const FRAME_OVERHEAD: usize = 5;

/// Upper bound accepted from a peer; anything larger is a corrupt stream.
const MAX_MESSAGE: usize = 512 * 1024 * 1024;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Payload compression applied before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    None,
    Deflate,
}

/// Payload encryption, keyed from password + salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cipher {
    #[default]
    None,
    Aes128,
    Aes192,
    Aes256,
}

/// Shared transform configuration for one peer pair.
#[derive(Debug, Clone, Default)]
pub struct Transform {
    method: Method,
    cipher: Cipher,
    key: [u8; 32],
    keyed: bool,
}

impl Transform {
    pub fn new() -> Transform {
        Transform::default()
    }

    pub fn compressor(&mut self, method: Method) {
        self.method = method;
    }

    pub fn cipher(&mut self, cipher: Cipher) {
        self.cipher = cipher;
    }

    /// Derive the AES key from password and salt (SHA-256 over both).
    pub fn password(&mut self, password: &str, salt: &str) {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt.as_bytes());
        self.key = hasher.finalize().into();
        self.keyed = true;
    }

    fn seal(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let compressed = match self.method {
            Method::None => payload.to_vec(),
            Method::Deflate => {
                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::with_capacity(payload.len() / 2 + 16),
                    flate2::Compression::default(),
                );
                encoder.write_all(payload)?;
                encoder.finish()?
            }
        };

        if self.cipher == Cipher::None {
            return Ok(compressed);
        }
        if !self.keyed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cipher configured without a password",
            ));
        }

        let iv: [u8; 16] = rand::random();
        let mut sealed = Vec::with_capacity(16 + compressed.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&compressed);
        self.apply_keystream(&iv, &mut sealed[16..]);
        Ok(sealed)
    }

    fn open(&self, body: &[u8]) -> io::Result<Vec<u8>> {
        let compressed = if self.cipher == Cipher::None {
            body.to_vec()
        } else {
            if body.len() < 16 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "encrypted message shorter than its IV",
                ));
            }
            let (iv, rest) = body.split_at(16);
            let mut iv_arr = [0u8; 16];
            iv_arr.copy_from_slice(iv);
            let mut clear = rest.to_vec();
            self.apply_keystream(&iv_arr, &mut clear);
            clear
        };

        match self.method {
            Method::None => Ok(compressed),
            Method::Deflate => {
                let mut decoder = flate2::write::DeflateDecoder::new(Vec::new());
                decoder.write_all(&compressed)?;
                decoder
                    .finish()
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
            }
        }
    }

    fn apply_keystream(&self, iv: &[u8; 16], data: &mut [u8]) {
        match self.cipher {
            Cipher::None => {}
            Cipher::Aes128 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&self.key[..16]);
                let mut ctr = Aes128Ctr::new(&key.into(), iv.into());
                ctr.apply_keystream(data);
            }
            Cipher::Aes192 => {
                let mut key = [0u8; 24];
                key.copy_from_slice(&self.key[..24]);
                let mut ctr = Aes192Ctr::new(&key.into(), iv.into());
                ctr.apply_keystream(data);
            }
            Cipher::Aes256 => {
                let mut ctr = Aes256Ctr::new(&self.key.into(), iv.into());
                ctr.apply_keystream(data);
            }
        }
    }
}

/// Framer for one write direction.
///
/// Pushed messages accumulate in the queue; `chunk` bounds how much one
/// `next_chunk` hands to the kernel, sized from the socket's send buffer.
#[derive(Debug)]
pub struct Encoder {
    transform: Transform,
    queue: BytesMut,
    chunk: usize,
}

impl Encoder {
    pub fn new(transform: Transform, chunk: usize) -> Encoder {
        Encoder {
            transform,
            queue: BytesMut::new(),
            chunk: chunk.max(512),
        }
    }

    /// Frame a message onto the queue.
    pub fn push(&mut self, id: u8, payload: &[u8]) -> io::Result<()> {
        let body = self.transform.seal(payload)?;
        self.queue.reserve(FRAME_OVERHEAD + body.len());
        self.queue.put_u32((body.len() + 1) as u32);
        self.queue.put_u8(id);
        self.queue.put_slice(&body);
        Ok(())
    }

    /// The next at-most-`chunk` bytes to write, without consuming them.
    pub fn next_chunk(&self) -> Option<&[u8]> {
        if self.queue.is_empty() {
            None
        } else {
            Some(&self.queue[..self.queue.len().min(self.chunk)])
        }
    }

    /// Drop `written` bytes after a successful write.
    pub fn advance(&mut self, written: usize) {
        self.queue.advance(written);
    }

    /// Re-size the write chunk, e.g. once the real socket is known.
    pub fn set_chunk(&mut self, chunk: usize) {
        self.chunk = chunk.max(512);
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Framer for one read direction.
#[derive(Debug)]
pub struct Decoder {
    transform: Transform,
    buffer: BytesMut,
}

impl Decoder {
    pub fn new(transform: Transform) -> Decoder {
        Decoder {
            transform,
            buffer: BytesMut::new(),
        }
    }

    /// Feed received bytes; complete messages surface through `message`.
    pub fn feed<F>(&mut self, bytes: &[u8], mut message: F) -> io::Result<()>
    where
        F: FnMut(u8, &[u8]),
    {
        self.buffer.extend_from_slice(bytes);
        loop {
            if self.buffer.len() < FRAME_OVERHEAD {
                return Ok(());
            }
            let length = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if length == 0 || length > MAX_MESSAGE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "corrupt message length",
                ));
            }
            if self.buffer.len() < 4 + length {
                return Ok(());
            }
            self.buffer.advance(4);
            let frame = self.buffer.split_to(length);
            let id = frame[0];
            let body = self.transform.open(&frame[1..])?;
            message(id, &body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(encoder: &mut Encoder, decoder: &mut Decoder) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(chunk) = encoder.next_chunk() {
            let taken = chunk.len();
            let bytes = chunk.to_vec();
            encoder.advance(taken);
            decoder
                .feed(&bytes, |id, body| out.push((id, body.to_vec())))
                .unwrap();
        }
        out
    }

    #[test]
    fn hello_then_general_in_order() {
        let mut encoder = Encoder::new(Transform::new(), 8);
        let mut decoder = Decoder::new(Transform::new());
        let pid = 4321u32;
        encoder.push(HELLO, &pid.to_ne_bytes()).unwrap();
        encoder.push(GENERAL, b"payload").unwrap();

        // A tiny chunk size exercises reassembly on the decoder side.
        let messages = pump(&mut encoder, &mut decoder);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, HELLO);
        assert_eq!(messages[0].1, pid.to_ne_bytes());
        assert_eq!(messages[1], (GENERAL, b"payload".to_vec()));
    }

    #[test]
    fn sealed_and_compressed_mirror() {
        let mut transform = Transform::new();
        transform.compressor(Method::Deflate);
        transform.cipher(Cipher::Aes256);
        transform.password("secret", "pepper");

        let mut encoder = Encoder::new(transform.clone(), 4096);
        let mut decoder = Decoder::new(transform);
        let payload = vec![7u8; 10_000];
        encoder.push(GENERAL, &payload).unwrap();

        // Compression must actually bite on repetitive payloads.
        assert!(encoder.backlog() < payload.len() / 2);

        let messages = pump(&mut encoder, &mut decoder);
        assert_eq!(messages, vec![(GENERAL, payload)]);
    }

    #[test]
    fn wrong_password_fails_decompression() {
        let mut good = Transform::new();
        good.compressor(Method::Deflate);
        good.cipher(Cipher::Aes128);
        good.password("right", "salt");

        let mut bad = good.clone();
        bad.password("wrong", "salt");

        let mut encoder = Encoder::new(good, 4096);
        let mut decoder = Decoder::new(bad);
        encoder.push(GENERAL, b"attack at dawn").unwrap();

        let chunk = encoder.next_chunk().unwrap().to_vec();
        let result = decoder.feed(&chunk, |_, _| {});
        assert!(result.is_err());
    }

    #[test]
    fn cipher_without_password_is_refused() {
        let mut transform = Transform::new();
        transform.cipher(Cipher::Aes128);
        let mut encoder = Encoder::new(transform, 4096);
        assert!(encoder.push(GENERAL, b"x").is_err());
    }
}
