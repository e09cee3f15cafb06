//! Huffman coding for HPACK string literals.
//! https://httpwg.org/specs/rfc7541.html#huffman.code

use bytes::BytesMut;
use std::sync::OnceLock;

/// `(bits, code)` per symbol, 0..=255 plus EOS at 256.
#[rustfmt::skip]
const TABLE: [(u8, u32); 257] = [
    (13, 0x1ff8), (23, 0x7fffd8), (28, 0xffff_fe2), (28, 0xffff_fe3),
    (28, 0xffff_fe4), (28, 0xffff_fe5), (28, 0xffff_fe6), (28, 0xffff_fe7),
    (28, 0xffff_fe8), (24, 0xffffea), (30, 0x3fff_fffc), (28, 0xffff_fe9),
    (28, 0xffff_fea), (30, 0x3fff_fffd), (28, 0xffff_feb), (28, 0xffff_fec),
    (28, 0xffff_fed), (28, 0xffff_fee), (28, 0xffff_fef), (28, 0xffff_ff0),
    (28, 0xffff_ff1), (28, 0xffff_ff2), (30, 0x3fff_fffe), (28, 0xffff_ff3),
    (28, 0xffff_ff4), (28, 0xffff_ff5), (28, 0xffff_ff6), (28, 0xffff_ff7),
    (28, 0xffff_ff8), (28, 0xffff_ff9), (28, 0xffff_ffa), (28, 0xffff_ffb),
    ( 6, 0x14), (10, 0x3f8), (10, 0x3f9), (12, 0xffa),
    (13, 0x1ff9), ( 6, 0x15), ( 8, 0xf8), (11, 0x7fa),
    (10, 0x3fa), (10, 0x3fb), ( 8, 0xf9), (11, 0x7fb),
    ( 8, 0xfa), ( 6, 0x16), ( 6, 0x17), ( 6, 0x18),
    ( 5, 0x0), ( 5, 0x1), ( 5, 0x2), ( 6, 0x19),
    ( 6, 0x1a), ( 6, 0x1b), ( 6, 0x1c), ( 6, 0x1d),
    ( 6, 0x1e), ( 6, 0x1f), ( 7, 0x5c), ( 8, 0xfb),
    (15, 0x7ffc), ( 6, 0x20), (12, 0xffb), (10, 0x3fc),
    (13, 0x1ffa), ( 6, 0x21), ( 7, 0x5d), ( 7, 0x5e),
    ( 7, 0x5f), ( 7, 0x60), ( 7, 0x61), ( 7, 0x62),
    ( 7, 0x63), ( 7, 0x64), ( 7, 0x65), ( 7, 0x66),
    ( 7, 0x67), ( 7, 0x68), ( 7, 0x69), ( 7, 0x6a),
    ( 7, 0x6b), ( 7, 0x6c), ( 7, 0x6d), ( 7, 0x6e),
    ( 7, 0x6f), ( 7, 0x70), ( 7, 0x71), ( 7, 0x72),
    ( 8, 0xfc), ( 7, 0x73), ( 8, 0xfd), (13, 0x1ffb),
    (19, 0x7fff0), (13, 0x1ffc), (14, 0x3ffc), ( 6, 0x22),
    (15, 0x7ffd), ( 5, 0x3), ( 6, 0x23), ( 5, 0x4),
    ( 6, 0x24), ( 5, 0x5), ( 6, 0x25), ( 6, 0x26),
    ( 6, 0x27), ( 5, 0x6), ( 7, 0x74), ( 7, 0x75),
    ( 6, 0x28), ( 6, 0x29), ( 6, 0x2a), ( 5, 0x7),
    ( 6, 0x2b), ( 7, 0x76), ( 6, 0x2c), ( 5, 0x8),
    ( 5, 0x9), ( 6, 0x2d), ( 7, 0x77), ( 7, 0x78),
    ( 7, 0x79), ( 7, 0x7a), ( 7, 0x7b), (15, 0x7ffe),
    (11, 0x7fc), (14, 0x3ffd), (13, 0x1ffd), (28, 0xffff_ffc),
    (20, 0xfffe6), (22, 0x3fffd2), (20, 0xfffe7), (20, 0xfffe8),
    (22, 0x3fffd3), (22, 0x3fffd4), (22, 0x3fffd5), (23, 0x7fffd9),
    (22, 0x3fffd6), (23, 0x7fffda), (23, 0x7fffdb), (23, 0x7fffdc),
    (23, 0x7fffdd), (23, 0x7fffde), (24, 0xffffeb), (23, 0x7fffdf),
    (24, 0xffffec), (24, 0xffffed), (22, 0x3fffd7), (23, 0x7fffe0),
    (24, 0xffffee), (23, 0x7fffe1), (23, 0x7fffe2), (23, 0x7fffe3),
    (23, 0x7fffe4), (21, 0x1fffdc), (22, 0x3fffd8), (23, 0x7fffe5),
    (22, 0x3fffd9), (23, 0x7fffe6), (23, 0x7fffe7), (24, 0xffffef),
    (22, 0x3fffda), (21, 0x1fffdd), (20, 0xfffe9), (22, 0x3fffdb),
    (22, 0x3fffdc), (23, 0x7fffe8), (23, 0x7fffe9), (21, 0x1fffde),
    (23, 0x7fffea), (22, 0x3fffdd), (22, 0x3fffde), (24, 0xfffff0),
    (21, 0x1fffdf), (22, 0x3fffdf), (23, 0x7fffeb), (23, 0x7fffec),
    (21, 0x1fffe0), (21, 0x1fffe1), (22, 0x3fffe0), (21, 0x1fffe2),
    (23, 0x7fffed), (22, 0x3fffe1), (23, 0x7fffee), (23, 0x7fffef),
    (20, 0xfffea), (22, 0x3fffe2), (22, 0x3fffe3), (22, 0x3fffe4),
    (23, 0x7ffff0), (22, 0x3fffe5), (22, 0x3fffe6), (23, 0x7ffff1),
    (26, 0x3fff_fe0), (26, 0x3fff_fe1), (20, 0xfffeb), (19, 0x7fff1),
    (22, 0x3fffe7), (23, 0x7ffff2), (22, 0x3fffe8), (25, 0x1fff_fec),
    (26, 0x3fff_fe2), (26, 0x3fff_fe3), (26, 0x3fff_fe4), (27, 0x7fff_fde),
    (27, 0x7fff_fdf), (26, 0x3fff_fe5), (24, 0xfffff1), (25, 0x1fff_fed),
    (19, 0x7fff2), (21, 0x1fffe3), (26, 0x3fff_fe6), (27, 0x7fff_fe0),
    (27, 0x7fff_fe1), (26, 0x3fff_fe7), (27, 0x7fff_fe2), (24, 0xfffff2),
    (21, 0x1fffe4), (21, 0x1fffe5), (26, 0x3fff_fe8), (26, 0x3fff_fe9),
    (28, 0xffff_ffd), (27, 0x7fff_fe3), (27, 0x7fff_fe4), (27, 0x7fff_fe5),
    (20, 0xfffec), (24, 0xfffff3), (20, 0xfffed), (21, 0x1fffe6),
    (22, 0x3fffe9), (21, 0x1fffe7), (21, 0x1fffe8), (23, 0x7ffff3),
    (22, 0x3fffea), (22, 0x3fffeb), (25, 0x1fff_fee), (25, 0x1fff_fef),
    (24, 0xfffff4), (24, 0xfffff5), (26, 0x3fff_fea), (23, 0x7ffff4),
    (26, 0x3fff_feb), (27, 0x7fff_fe6), (26, 0x3fff_fec), (26, 0x3fff_fed),
    (27, 0x7fff_fe7), (27, 0x7fff_fe8), (27, 0x7fff_fe9), (27, 0x7fff_fea),
    (27, 0x7fff_feb), (28, 0xffff_ffe), (27, 0x7fff_fec), (27, 0x7fff_fed),
    (27, 0x7fff_fee), (27, 0x7fff_fef), (27, 0x7fff_ff0), (26, 0x3fff_fee),
    (30, 0x3fff_ffff),
];

const EOS: usize = 256;

/// Binary decode tree. `child >= 0` is a node index, `child <= -2` is the
/// leaf symbol `-(child + 2)`, `-1` is unassigned (impossible for a complete
/// code, so hitting it means corrupt input).
fn tree() -> &'static Vec<[i32; 2]> {
    static TREE: OnceLock<Vec<[i32; 2]>> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut nodes: Vec<[i32; 2]> = vec![[-1, -1]];
        for (symbol, &(bits, code)) in TABLE.iter().enumerate() {
            let mut node = 0_usize;
            for shift in (0..bits).rev() {
                let bit = ((code >> shift) & 1) as usize;
                if shift == 0 {
                    nodes[node][bit] = -(symbol as i32) - 2;
                } else {
                    node = match nodes[node][bit] {
                        -1 => {
                            nodes.push([-1, -1]);
                            let next = nodes.len() - 1;
                            nodes[node][bit] = next as i32;
                            next
                        }
                        next => next as usize,
                    };
                }
            }
        }
        nodes
    })
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HuffmanError {
    #[error("encountered EOS inside a huffman string")]
    UnexpectedEos,
    #[error("huffman padding is not a prefix of EOS")]
    BadPadding,
}

/// Bytes the Huffman form of `src` would occupy, without encoding it.
#[must_use]
pub fn encoded_len(src: &[u8]) -> usize {
    let bits: u64 = src.iter().map(|&b| u64::from(TABLE[b as usize].0)).sum();
    ((bits + 7) / 8) as usize
}

pub fn encode(src: &[u8], dst: &mut BytesMut) {
    let mut current: u64 = 0;
    let mut bits: u32 = 0;
    dst.reserve(encoded_len(src));
    for &byte in src {
        let (len, code) = TABLE[byte as usize];
        current = (current << len) | u64::from(code);
        bits += u32::from(len);
        while bits >= 8 {
            bits -= 8;
            dst.extend_from_slice(&[(current >> bits) as u8]);
        }
    }
    if bits > 0 {
        // pad with the MSBs of EOS, i.e. all ones
        let pad = 8 - bits;
        dst.extend_from_slice(&[((current << pad) as u8) | ((1 << pad) - 1) as u8]);
    }
}

pub fn decode(src: &[u8]) -> Result<Vec<u8>, HuffmanError> {
    let tree = tree();
    let mut out = Vec::with_capacity(src.len() * 8 / 5);
    let mut node = 0_usize;
    let mut depth = 0_u8;
    let mut all_ones = true;
    for &byte in src {
        for shift in (0..8).rev() {
            let bit = usize::from((byte >> shift) & 1);
            match tree[node][bit] {
                child if child >= 0 => {
                    node = child as usize;
                    depth += 1;
                    all_ones &= bit == 1;
                }
                -1 => return Err(HuffmanError::BadPadding),
                leaf => {
                    let symbol = (-(leaf + 2)) as usize;
                    if symbol == EOS {
                        return Err(HuffmanError::UnexpectedEos);
                    }
                    out.push(symbol as u8);
                    node = 0;
                    depth = 0;
                    all_ones = true;
                }
            }
        }
    }
    // A partial code at the end must be the MSBs of EOS and shorter than a
    // byte (RFC 7541 §5.2).
    if depth > 7 || !all_ones {
        return Err(HuffmanError::BadPadding);
    }
    Ok(out)
}
