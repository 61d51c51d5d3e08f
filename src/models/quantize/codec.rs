//! Built-in block quantizer
//!
//! Treats a weights payload as a flat stream of little-endian f32 values (a
//! trailing partial value is zero-padded) and writes a small container:
//!
//! ```text
//! [magic "MKQ1"][precision u8][reserved 3][original_len u64][block_size u32][reserved u32]
//! FP16: [f16 LE] * elements
//! INT8: per block: [scale f32 LE][i8 * block]
//! INT4: per block: [scale f32 LE][packed nibbles, low nibble first]
//! ```
//!
//! Integer blocks use symmetric absmax scaling: `value ≈ q * scale`. The
//! scale travels with each block so dequantization needs nothing else.
//! Non-finite inputs never influence a scale; NaN encodes as zero and
//! infinities saturate.

use super::{Converter, PrecisionLevel};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"MKQ1";
pub const HEADER_LEN: usize = 24;
pub const DEFAULT_BLOCK_SIZE: usize = 64;
/// Smallest block for which INT8 output is smaller than FP16 (each block carries a 4-byte scale)
pub const MIN_BLOCK_SIZE: usize = 8;

const INT8_MAX: f32 = 127.0;
const INT4_MAX: f32 = 7.0;
const READ_CHUNK: usize = 64 * 1024;

/// Errors from the built-in codec
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("not a quantized container")]
    BadMagic,

    #[error("container is truncated")]
    Truncated,

    #[error("unknown precision code {0}")]
    UnknownPrecision(u8),

    #[error("expected a {expected} container, found {found}")]
    WrongPrecision {
        expected: PrecisionLevel,
        found: PrecisionLevel,
    },

    #[error("conversion {from} -> {to} is not supported")]
    Unsupported {
        from: PrecisionLevel,
        to: PrecisionLevel,
    },
}

/// Fixed-size container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub precision: PrecisionLevel,
    /// Byte length of the FP32 payload the container was derived from
    pub original_len: u64,
    pub block_size: u32,
}

impl Header {
    /// Number of f32 values represented
    pub fn elements(&self) -> u64 {
        self.original_len.div_ceil(4)
    }

    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(MAGIC);
        buf[4] = self.precision.code();
        buf[8..16].copy_from_slice(&self.original_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.block_size.to_le_bytes());
        w.write_all(&buf)
    }

    fn read_from(r: &mut impl Read) -> Result<Self, CodecError> {
        let mut buf = [0u8; HEADER_LEN];
        read_exact(r, &mut buf)?;
        if &buf[..4] != MAGIC {
            return Err(CodecError::BadMagic);
        }
        let precision =
            PrecisionLevel::from_code(buf[4]).ok_or(CodecError::UnknownPrecision(buf[4]))?;
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[8..16]);
        let mut block = [0u8; 4];
        block.copy_from_slice(&buf[16..20]);
        Ok(Self {
            precision,
            original_len: u64::from_le_bytes(len),
            block_size: u32::from_le_bytes(block),
        })
    }
}

/// Expected output size of a conversion from an FP32 payload of `source_len` bytes
pub fn encoded_len(source_len: u64, level: PrecisionLevel, block_size: usize) -> u64 {
    let elements = source_len.div_ceil(4);
    let blocks = elements.div_ceil(block_size as u64);
    let header = HEADER_LEN as u64;
    match level {
        PrecisionLevel::Fp32 => source_len,
        PrecisionLevel::Fp16 => header + elements * 2,
        PrecisionLevel::Int8 => header + blocks * 4 + elements,
        PrecisionLevel::Int4 => {
            let full = elements / block_size as u64;
            let tail = elements % block_size as u64;
            header + blocks * 4 + full * (block_size as u64).div_ceil(2) + tail.div_ceil(2)
        }
    }
}

/// Pure-Rust converter using the container format above
#[derive(Debug, Clone)]
pub struct BlockQuantizer {
    block_size: usize,
}

impl Default for BlockQuantizer {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl BlockQuantizer {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(MIN_BLOCK_SIZE),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocking conversion between two files
    pub fn convert_file(
        &self,
        input: &Path,
        output: &Path,
        from: PrecisionLevel,
        to: PrecisionLevel,
    ) -> Result<(), CodecError> {
        let original_len = std::fs::metadata(input)?.len();
        let mut reader = BufReader::new(File::open(input)?);
        let mut writer = BufWriter::new(File::create(output)?);

        match (from, to) {
            (PrecisionLevel::Fp32, PrecisionLevel::Fp16) => {
                encode_fp16(&mut reader, &mut writer, original_len)?
            }
            (PrecisionLevel::Fp32, PrecisionLevel::Int8) => {
                encode_int8(&mut reader, &mut writer, original_len, self.block_size)?
            }
            (PrecisionLevel::Int8, PrecisionLevel::Int4) => encode_int4(&mut reader, &mut writer)?,
            (from, to) => return Err(CodecError::Unsupported { from, to }),
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[async_trait]
impl Converter for BlockQuantizer {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        from: PrecisionLevel,
        to: PrecisionLevel,
    ) -> anyhow::Result<()> {
        let quantizer = self.clone();
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || quantizer.convert_file(&input, &output, from, to))
            .await??;
        Ok(())
    }

    fn name(&self) -> &str {
        "builtin"
    }
}

fn encode_fp16(reader: &mut impl Read, writer: &mut impl Write, original_len: u64) -> Result<(), CodecError> {
    Header {
        precision: PrecisionLevel::Fp16,
        original_len,
        block_size: 0,
    }
    .write_to(writer)?;

    let mut raw = vec![0u8; READ_CHUNK];
    let mut out = Vec::with_capacity(READ_CHUNK / 2);
    loop {
        let n = read_full(reader, &mut raw)?;
        if n == 0 {
            break;
        }
        out.clear();
        for value in f32_values(&mut raw, n) {
            out.extend_from_slice(&f32_to_f16_bits(value).to_le_bytes());
        }
        writer.write_all(&out)?;
    }
    Ok(())
}

fn encode_int8(
    reader: &mut impl Read,
    writer: &mut impl Write,
    original_len: u64,
    block_size: usize,
) -> Result<(), CodecError> {
    Header {
        precision: PrecisionLevel::Int8,
        original_len,
        block_size: block_size as u32,
    }
    .write_to(writer)?;

    let mut raw = vec![0u8; block_size * 4];
    let mut out = Vec::with_capacity(block_size + 4);
    loop {
        let n = read_full(reader, &mut raw)?;
        if n == 0 {
            break;
        }
        let values = f32_values(&mut raw, n);
        let absmax = values
            .iter()
            .filter(|v| v.is_finite())
            .fold(0.0f32, |acc, v| acc.max(v.abs()));
        let scale = absmax / INT8_MAX;

        out.clear();
        out.extend_from_slice(&scale.to_le_bytes());
        out.extend(values.iter().map(|&v| quantize(v, scale, INT8_MAX) as u8));
        writer.write_all(&out)?;
    }
    Ok(())
}

/// Requantize an INT8 container to 4 bits per value
fn encode_int4(reader: &mut impl Read, writer: &mut impl Write) -> Result<(), CodecError> {
    let header = Header::read_from(reader)?;
    if header.precision != PrecisionLevel::Int8 {
        return Err(CodecError::WrongPrecision {
            expected: PrecisionLevel::Int8,
            found: header.precision,
        });
    }
    Header {
        precision: PrecisionLevel::Int4,
        ..header
    }
    .write_to(writer)?;

    let block_size = header.block_size.max(1) as usize;
    let mut remaining = header.elements();
    let mut scale_buf = [0u8; 4];
    let mut q8 = vec![0u8; block_size];
    let mut out = Vec::with_capacity(block_size / 2 + 5);

    while remaining > 0 {
        let count = remaining.min(block_size as u64) as usize;
        read_exact(reader, &mut scale_buf)?;
        read_exact(reader, &mut q8[..count])?;
        let scale8 = f32::from_le_bytes(scale_buf);

        let absmax = q8[..count]
            .iter()
            .map(|&b| (b as i8 as i32).abs())
            .max()
            .unwrap_or(0);

        let (scale4, factor) = if absmax == 0 {
            (0.0, 0.0)
        } else {
            (scale8 * absmax as f32 / INT4_MAX, INT4_MAX / absmax as f32)
        };

        out.clear();
        out.extend_from_slice(&scale4.to_le_bytes());
        for pair in q8[..count].chunks(2) {
            let lo = ((pair[0] as i8 as f32) * factor).round() as i8;
            let hi = pair
                .get(1)
                .map(|&b| ((b as i8 as f32) * factor).round() as i8)
                .unwrap_or(0);
            out.push(pack_nibbles(lo, hi));
        }
        writer.write_all(&out)?;
        remaining -= count as u64;
    }
    Ok(())
}

/// Decode a container back to f32 values
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    let mut cursor = bytes;
    let header = Header::read_from(&mut cursor)?;
    let elements = header.elements();

    // Every element takes at least half a byte of body; reject headers claiming more
    if elements.div_ceil(2) > cursor.len() as u64 {
        return Err(CodecError::Truncated);
    }
    let elements = elements as usize;
    let mut values = Vec::with_capacity(elements);

    match header.precision {
        PrecisionLevel::Fp16 => {
            let body = cursor.get(..elements * 2).ok_or(CodecError::Truncated)?;
            values.extend(
                body.chunks_exact(2)
                    .map(|c| f16_bits_to_f32(u16::from_le_bytes([c[0], c[1]]))),
            );
        }
        PrecisionLevel::Int8 | PrecisionLevel::Int4 => {
            let block_size = header.block_size.max(1) as usize;
            let mut remaining = elements;
            while remaining > 0 {
                let count = remaining.min(block_size);
                let body_len = if header.precision == PrecisionLevel::Int8 {
                    count
                } else {
                    count.div_ceil(2)
                };
                let block = cursor.get(..4 + body_len).ok_or(CodecError::Truncated)?;
                let scale = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
                let body = &block[4..];

                if header.precision == PrecisionLevel::Int8 {
                    values.extend(body.iter().map(|&b| b as i8 as f32 * scale));
                } else {
                    for (i, &byte) in body.iter().enumerate() {
                        let (lo, hi) = unpack_nibbles(byte);
                        values.push(lo as f32 * scale);
                        if i * 2 + 1 < count {
                            values.push(hi as f32 * scale);
                        }
                    }
                }

                cursor = &cursor[4 + body_len..];
                remaining -= count;
            }
        }
        PrecisionLevel::Fp32 => return Err(CodecError::BadMagic),
    }

    Ok(values)
}

/// Symmetric linear quantization to `[-max, max]`
fn quantize(value: f32, scale: f32, max: f32) -> i8 {
    if value.is_nan() {
        return 0;
    }
    if value.is_infinite() {
        return if value > 0.0 { max as i8 } else { -(max as i8) };
    }
    if scale == 0.0 {
        return 0;
    }
    (value / scale).round().clamp(-max, max) as i8
}

fn pack_nibbles(lo: i8, hi: i8) -> u8 {
    ((lo as u8) & 0x0f) | (((hi as u8) & 0x0f) << 4)
}

fn unpack_nibbles(byte: u8) -> (i8, i8) {
    let lo = ((byte << 4) as i8) >> 4;
    let hi = (byte as i8) >> 4;
    (lo, hi)
}

/// Interpret the first `n` bytes of `raw` as f32 values, zero-padding a partial tail
fn f32_values(raw: &mut [u8], n: usize) -> Vec<f32> {
    let padded = n.div_ceil(4) * 4;
    raw[n..padded].fill(0);
    raw[..padded]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Fill `buf` as far as the reader allows; returns bytes read (0 at EOF)
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), CodecError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => CodecError::Truncated,
        _ => CodecError::Io(e),
    })
}

/// IEEE 754 binary32 to binary16, round to nearest even
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let x = value.to_bits();
    let sign = (x & 0x8000_0000) >> 16;
    let exp = (x & 0x7f80_0000) >> 23;
    let man = x & 0x007f_ffff;

    if exp == 0xff {
        let nan_bit = if man == 0 { 0 } else { 0x0200 };
        return (sign | 0x7c00 | nan_bit | (man >> 13)) as u16;
    }

    let half_exp = exp as i32 - 127 + 15;
    if half_exp >= 0x1f {
        return (sign | 0x7c00) as u16;
    }

    if half_exp <= 0 {
        if 14 - half_exp > 24 {
            return sign as u16;
        }
        let man = man | 0x0080_0000;
        let mut half_man = man >> (14 - half_exp);
        let round_bit = 1 << (13 - half_exp);
        if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
            half_man += 1;
        }
        return (sign | half_man) as u16;
    }

    let half = sign | ((half_exp as u32) << 10) | (man >> 13);
    let round_bit = 0x0000_1000;
    if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
        (half + 1) as u16
    } else {
        half as u16
    }
}

/// IEEE 754 binary16 to binary32
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let man = (bits & 0x03ff) as u32;

    let out = match (exp, man) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalize
            let mut e: i32 = -14;
            let mut m = man;
            while m & 0x0400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (((e + 127) as u32) << 23) | ((m & 0x03ff) << 13)
        }
        (0x1f, _) => sign | 0x7f80_0000 | (man << 13),
        _ => sign | ((exp + 127 - 15) << 23) | (man << 13),
    };
    f32::from_bits(out)
}
