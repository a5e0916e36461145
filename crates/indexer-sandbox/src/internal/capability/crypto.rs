use rand::RngCore as _;
use rquickjs::{Ctx, Exception, Function, Object, TypedArray, Value};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use super::{byte_array, bytes};

const HASHES: [&str; 4] = ["sha224", "sha256", "sha384", "sha512"];
const MAX_RANDOM_BYTES: u32 = 64 * 1024;

fn digest(algorithm: &str, chunks: &[Vec<u8>]) -> Option<Vec<u8>> {
    fn run<D: Digest>(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut h = D::new();
        for chunk in chunks {
            h.update(chunk);
        }
        h.finalize().to_vec()
    }

    match algorithm.to_ascii_lowercase().as_str() {
        "sha224" => Some(run::<Sha224>(chunks)),
        "sha256" => Some(run::<Sha256>(chunks)),
        "sha384" => Some(run::<Sha384>(chunks)),
        "sha512" => Some(run::<Sha512>(chunks)),
        _ => None,
    }
}

pub fn register<'js>(ctx: &Ctx<'js>, native: &Object<'js>) -> rquickjs::Result<()> {
    native.set(
        "digest",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, algorithm: String, data: Vec<Value<'js>>| -> rquickjs::Result<TypedArray<'js, u8>> {
                let chunks = data
                    .iter()
                    .map(|chunk| bytes(&ctx, chunk))
                    .collect::<rquickjs::Result<Vec<_>>>()?;
                let out = digest(&algorithm, &chunks).ok_or_else(|| {
                    Exception::throw_message(&ctx, &format!("Digest method not supported: {algorithm}"))
                })?;
                byte_array(&ctx, out)
            },
        )?,
    )?;
    native.set("hashes", HASHES.to_vec())?;
    native.set(
        "randomBytes",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, size: f64| -> rquickjs::Result<TypedArray<'js, u8>> {
                if !(0.0..=f64::from(MAX_RANDOM_BYTES)).contains(&size) || size.fract() != 0.0 {
                    return Err(Exception::throw_range(
                        &ctx,
                        &format!("size must be an integer between 0 and {MAX_RANDOM_BYTES}"),
                    ));
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let mut buf = vec![0u8; size as usize];
                rand::rng().fill_bytes(&mut buf);
                byte_array(&ctx, buf)
            },
        )?,
    )?;
    native.set(
        "randomUUID",
        Function::new(ctx.clone(), || uuid::Uuid::new_v4().to_string())?,
    )
}
