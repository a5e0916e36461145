use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use flate2::{
    Compression,
    read::{DeflateDecoder, GzDecoder, ZlibDecoder},
    write::{DeflateEncoder, GzEncoder, ZlibEncoder},
};
use rquickjs::{Ctx, Exception, Function, Object, TypedArray, Value};

use super::{byte_array, bytes};
use crate::internal::HostEnv;

#[derive(Debug, Clone, Copy)]
enum Format {
    Gzip,
    Zlib,
    Raw,
}

impl Format {
    fn compress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        let level = Compression::default();
        match self {
            Self::Gzip => {
                let mut e = GzEncoder::new(Vec::new(), level);
                e.write_all(data)?;
                e.finish()
            }
            Self::Zlib => {
                let mut e = ZlibEncoder::new(Vec::new(), level);
                e.write_all(data)?;
                e.finish()
            }
            Self::Raw => {
                let mut e = DeflateEncoder::new(Vec::new(), level);
                e.write_all(data)?;
                e.finish()
            }
        }
    }

    /// Inflates at most `limit` bytes.
    fn decompress(self, data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        let reader: Box<dyn Read + '_> = match self {
            Self::Gzip => Box::new(GzDecoder::new(data)),
            Self::Zlib => Box::new(ZlibDecoder::new(data)),
            Self::Raw => Box::new(DeflateDecoder::new(data)),
        };
        let mut out = Vec::new();
        reader
            .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
            .read_to_end(&mut out)?;
        if out.len() > limit {
            return Err(io::Error::other(
                "decompressed output exceeds the sandbox memory limit",
            ));
        }
        Ok(out)
    }
}

const OPERATIONS: [(&str, Format, bool); 6] = [
    ("gzip", Format::Gzip, true),
    ("gunzip", Format::Gzip, false),
    ("deflate", Format::Zlib, true),
    ("inflate", Format::Zlib, false),
    ("deflateRaw", Format::Raw, true),
    ("inflateRaw", Format::Raw, false),
];

pub fn register<'js>(ctx: &Ctx<'js>, native: &Object<'js>, env: &Arc<HostEnv>) -> rquickjs::Result<()> {
    let limit = env.policy.max_memory();
    for (name, format, compress) in OPERATIONS {
        native.set(
            name,
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, data: Value<'js>| -> rquickjs::Result<TypedArray<'js, u8>> {
                    let input = bytes(&ctx, &data)?;
                    let output = if compress {
                        format.compress(&input)
                    } else {
                        format.decompress(&input, limit)
                    }
                    .map_err(|e| Exception::throw_message(&ctx, &format!("zlib: {e}")))?;
                    byte_array(&ctx, output)
                },
            )?,
        )?;
    }
    Ok(())
}
