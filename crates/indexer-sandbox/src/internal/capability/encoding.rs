use std::fmt::Write as _;

use base64::{
    Engine as _,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose::STANDARD},
};
use rquickjs::{Ctx, Exception, Function, Object, TypedArray, Value, function::Opt};

use super::{byte_array, bytes};

/// Decoder that accepts what Node accepts: missing padding, the url-safe
/// alphabet and embedded whitespace.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Hex,
    Base64,
    Latin1,
}

impl Encoding {
    pub fn parse(name: Option<&str>) -> Option<Self> {
        match name.map(str::to_ascii_lowercase).as_deref() {
            None | Some("utf8" | "utf-8") => Some(Self::Utf8),
            Some("hex") => Some(Self::Hex),
            Some("base64" | "base64url") => Some(Self::Base64),
            Some("latin1" | "binary" | "ascii") => Some(Self::Latin1),
            _ => None,
        }
    }

    pub fn encode(self, data: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(data).into_owned(),
            Self::Hex => {
                let mut out = String::with_capacity(data.len() * 2);
                for b in data {
                    let _ = write!(&mut out, "{b:02x}");
                }
                out
            }
            Self::Base64 => STANDARD.encode(data),
            Self::Latin1 => data.iter().copied().map(char::from).collect(),
        }
    }

    pub fn decode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Hex => text
                .as_bytes()
                .chunks_exact(2)
                .map_while(|pair| {
                    let hi = char::from(pair[0]).to_digit(16)?;
                    let lo = char::from(pair[1]).to_digit(16)?;
                    u8::try_from(hi * 16 + lo).ok()
                })
                .collect(),
            Self::Base64 => {
                let cleaned: String = text
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .map(|c| match c {
                        '-' => '+',
                        '_' => '/',
                        other => other,
                    })
                    .collect();
                LENIENT.decode(cleaned).unwrap_or_default()
            }
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c) & 0xff).unwrap_or_default())
                .collect(),
        }
    }
}

fn encoding(ctx: &Ctx<'_>, name: Option<String>) -> rquickjs::Result<Encoding> {
    Encoding::parse(name.as_deref()).ok_or_else(|| {
        Exception::throw_type(
            ctx,
            &format!("unknown encoding: {}", name.unwrap_or_default()),
        )
    })
}

/// `encode(data, encoding?) -> string` and `decode(text, encoding?) -> Uint8Array`.
pub fn register<'js>(ctx: &Ctx<'js>, native: &Object<'js>) -> rquickjs::Result<()> {
    native.set(
        "encode",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, data: Value<'js>, name: Opt<String>| -> rquickjs::Result<String> {
                let encoding = encoding(&ctx, name.0)?;
                Ok(encoding.encode(&bytes(&ctx, &data)?))
            },
        )?,
    )?;
    native.set(
        "decode",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, text: String, name: Opt<String>| -> rquickjs::Result<TypedArray<'js, u8>> {
                let encoding = encoding(&ctx, name.0)?;
                byte_array(&ctx, encoding.decode(&text))
            },
        )?,
    )?;
    native.set(
        "isEncoding",
        Function::new(ctx.clone(), |name: String| {
            Encoding::parse(Some(&name)).is_some()
        })?,
    )
}
