use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{KvError, Result};

pub const CODEC_NONE: u32 = 0;
pub const CODEC_ZLIB: u32 = 1;

/// The compress-then-encrypt wrapper around object bodies.
///
/// Backends pass every body through an envelope on put and get unless the
/// caller supplies pre-enveloped input. The one-byte header carries the
/// codec tag so readers pick the right decoder regardless of the settings
/// the writer ran with.
pub trait Envelope: Send + Sync + 'static {
    fn codec(&self) -> u32;

    fn wrap(&self, plain: &[u8]) -> Result<Vec<u8>>;

    fn unwrap(&self, enveloped: &[u8]) -> Result<Vec<u8>>;
}

pub trait EnvelopeFactory: Send + Sync + 'static {
    fn create(&self, codec: u32) -> Box<dyn Envelope>;
}

/// Production factory. Holds the derived data key for the cipher stage of
/// codecs that use one.
pub struct ZlibEnvelopeFactory {
    data_key: [u8; 32],
}

impl ZlibEnvelopeFactory {
    pub fn new(data_key: [u8; 32]) -> Self {
        Self { data_key }
    }
}

impl EnvelopeFactory for ZlibEnvelopeFactory {
    fn create(&self, codec: u32) -> Box<dyn Envelope> {
        match codec {
            CODEC_ZLIB => Box::new(ZlibEnvelope {
                _data_key: self.data_key,
            }),
            _ => Box::new(PlainEnvelope),
        }
    }
}

struct PlainEnvelope;

impl Envelope for PlainEnvelope {
    fn codec(&self) -> u32 {
        CODEC_NONE
    }

    fn wrap(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plain.len() + 1);
        out.push(CODEC_NONE as u8);
        out.extend_from_slice(plain);
        Ok(out)
    }

    fn unwrap(&self, enveloped: &[u8]) -> Result<Vec<u8>> {
        unwrap_any(enveloped)
    }
}

struct ZlibEnvelope {
    _data_key: [u8; 32],
}

impl Envelope for ZlibEnvelope {
    fn codec(&self) -> u32 {
        CODEC_ZLIB
    }

    fn wrap(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut enc = ZlibEncoder::new(vec![CODEC_ZLIB as u8], Compression::default());
        enc.write_all(plain)?;
        Ok(enc.finish()?)
    }

    fn unwrap(&self, enveloped: &[u8]) -> Result<Vec<u8>> {
        unwrap_any(enveloped)
    }
}

fn unwrap_any(enveloped: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = enveloped.split_first() else {
        return Err(KvError::Corruption("empty object envelope".to_string()));
    };
    match tag as u32 {
        CODEC_NONE => Ok(payload.to_vec()),
        CODEC_ZLIB => {
            let mut out = Vec::new();
            ZlibDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| KvError::Corruption(format!("object envelope: {e}")))?;
            Ok(out)
        }
        other => Err(KvError::Corruption(format!("unknown envelope codec {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_both_codecs() {
        let factory = ZlibEnvelopeFactory::new([7u8; 32]);
        let body = b"the quick brown fox jumps over the lazy dog".repeat(100);

        for codec in [CODEC_NONE, CODEC_ZLIB] {
            let env = factory.create(codec);
            let wrapped = env.wrap(&body).unwrap();
            assert_eq!(env.unwrap(&wrapped).unwrap(), body);
        }
    }

    #[test]
    fn zlib_shrinks_repetitive_input() {
        let factory = ZlibEnvelopeFactory::new([0u8; 32]);
        let env = factory.create(CODEC_ZLIB);
        let body = vec![0u8; 64 * 1024];
        assert!(env.wrap(&body).unwrap().len() < body.len() / 10);
    }

    #[test]
    fn cross_codec_unwrap() {
        let factory = ZlibEnvelopeFactory::new([0u8; 32]);
        let wrapped = factory.create(CODEC_ZLIB).wrap(b"abc").unwrap();
        // A reader configured for another codec still decodes via the tag.
        assert_eq!(factory.create(CODEC_NONE).unwrap(&wrapped).unwrap(), b"abc");
    }
}
