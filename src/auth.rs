/// Challenge-response login cipher, recovered from the vendor client
/// binary. DES-ECB over two 8-byte ASCII blocks, with three deviations
/// from FIPS 46 that the DVR firmware shares:
///
///   1. byte→bit unpacking is LSB-first (plaintext and key),
///   2. bit→byte packing after the final permutation is LSB-first,
///   3. each S-box emits its 4 output bits LSB-first.
///
/// The halves are also not swapped after round 16: the vendor code swaps
/// in place each round, so the "final swap" of textbook descriptions never
/// happens. Everything else (tables, key schedule, Feistel structure) is
/// standard. None of the DES crates can express this, hence the bit-array
/// implementation below, which mirrors the vendor's 64-bit work buffer.
///
/// Block 1 encrypts `sprintf("%8x", atoi(nonce) + 1)`; block 2 encrypts
/// `sprintf("%8x", r)` for an arbitrary 15-bit filler the DVR ignores.
/// Token = lowercase hex of both ciphertext blocks.

const IP: [u8; 64] = [
    58, 50, 42, 34, 26, 18, 10, 2, 60, 52, 44, 36, 28, 20, 12, 4, //
    62, 54, 46, 38, 30, 22, 14, 6, 64, 56, 48, 40, 32, 24, 16, 8, //
    57, 49, 41, 33, 25, 17, 9, 1, 59, 51, 43, 35, 27, 19, 11, 3, //
    61, 53, 45, 37, 29, 21, 13, 5, 63, 55, 47, 39, 31, 23, 15, 7,
];

const FP: [u8; 64] = [
    40, 8, 48, 16, 56, 24, 64, 32, 39, 7, 47, 15, 55, 23, 63, 31, //
    38, 6, 46, 14, 54, 22, 62, 30, 37, 5, 45, 13, 53, 21, 61, 29, //
    36, 4, 44, 12, 52, 20, 60, 28, 35, 3, 43, 11, 51, 19, 59, 27, //
    34, 2, 42, 10, 50, 18, 58, 26, 33, 1, 41, 9, 49, 17, 57, 25,
];

const E: [u8; 48] = [
    32, 1, 2, 3, 4, 5, 4, 5, 6, 7, 8, 9, //
    8, 9, 10, 11, 12, 13, 12, 13, 14, 15, 16, 17, //
    16, 17, 18, 19, 20, 21, 20, 21, 22, 23, 24, 25, //
    24, 25, 26, 27, 28, 29, 28, 29, 30, 31, 32, 1,
];

const P: [u8; 32] = [
    16, 7, 20, 21, 29, 12, 28, 17, 1, 15, 23, 26, 5, 18, 31, 10, //
    2, 8, 24, 14, 32, 27, 3, 9, 19, 13, 30, 6, 22, 11, 4, 25,
];

const PC1: [u8; 56] = [
    57, 49, 41, 33, 25, 17, 9, 1, 58, 50, 42, 34, 26, 18, //
    10, 2, 59, 51, 43, 35, 27, 19, 11, 3, 60, 52, 44, 36, //
    63, 55, 47, 39, 31, 23, 15, 7, 62, 54, 46, 38, 30, 22, //
    14, 6, 61, 53, 45, 37, 29, 21, 13, 5, 28, 20, 12, 4,
];

const PC2: [u8; 48] = [
    14, 17, 11, 24, 1, 5, 3, 28, 15, 6, 21, 10, //
    23, 19, 12, 4, 26, 8, 16, 7, 27, 20, 13, 2, //
    41, 52, 31, 37, 47, 55, 30, 40, 51, 45, 33, 48, //
    44, 49, 39, 56, 34, 53, 46, 42, 50, 36, 29, 32,
];

const SHIFTS: [u8; 16] = [1, 1, 2, 2, 2, 2, 2, 2, 1, 2, 2, 2, 2, 2, 2, 1];

#[rustfmt::skip]
const SBOX: [[[u8; 16]; 4]; 8] = [
    [
        [14, 4, 13, 1, 2, 15, 11, 8, 3, 10, 6, 12, 5, 9, 0, 7],
        [0, 15, 7, 4, 14, 2, 13, 1, 10, 6, 12, 11, 9, 5, 3, 8],
        [4, 1, 14, 8, 13, 6, 2, 11, 15, 12, 9, 7, 3, 10, 5, 0],
        [15, 12, 8, 2, 4, 9, 1, 7, 5, 11, 3, 14, 10, 0, 6, 13],
    ],
    [
        [15, 1, 8, 14, 6, 11, 3, 4, 9, 7, 2, 13, 12, 0, 5, 10],
        [3, 13, 4, 7, 15, 2, 8, 14, 12, 0, 1, 10, 6, 9, 11, 5],
        [0, 14, 7, 11, 10, 4, 13, 1, 5, 8, 12, 6, 9, 3, 2, 15],
        [13, 8, 10, 1, 3, 15, 4, 2, 11, 6, 7, 12, 0, 5, 14, 9],
    ],
    [
        [10, 0, 9, 14, 6, 3, 15, 5, 1, 13, 12, 7, 11, 4, 2, 8],
        [13, 7, 0, 9, 3, 4, 6, 10, 2, 8, 5, 14, 12, 11, 15, 1],
        [13, 6, 4, 9, 8, 15, 3, 0, 11, 1, 2, 12, 5, 10, 14, 7],
        [1, 10, 13, 0, 6, 9, 8, 7, 4, 15, 14, 3, 11, 5, 2, 12],
    ],
    [
        [7, 13, 14, 3, 0, 6, 9, 10, 1, 2, 8, 5, 11, 12, 4, 15],
        [13, 8, 11, 5, 6, 15, 0, 3, 4, 7, 2, 12, 1, 10, 14, 9],
        [10, 6, 9, 0, 12, 11, 7, 13, 15, 1, 3, 14, 5, 2, 8, 4],
        [3, 15, 0, 6, 10, 1, 13, 8, 9, 4, 5, 11, 12, 7, 2, 14],
    ],
    [
        [2, 12, 4, 1, 7, 10, 11, 6, 8, 5, 3, 15, 13, 0, 14, 9],
        [14, 11, 2, 12, 4, 7, 13, 1, 5, 0, 15, 10, 3, 9, 8, 6],
        [4, 2, 1, 11, 10, 13, 7, 8, 15, 9, 12, 5, 6, 3, 0, 14],
        [11, 8, 12, 7, 1, 14, 2, 13, 6, 15, 0, 9, 10, 4, 5, 3],
    ],
    [
        [12, 1, 10, 15, 9, 2, 6, 8, 0, 13, 3, 4, 14, 7, 5, 11],
        [10, 15, 4, 2, 7, 12, 9, 5, 6, 1, 13, 14, 0, 11, 3, 8],
        [9, 14, 15, 5, 2, 8, 12, 3, 7, 0, 4, 10, 1, 13, 11, 6],
        [4, 3, 2, 12, 9, 5, 15, 10, 11, 14, 1, 7, 6, 0, 8, 13],
    ],
    [
        [4, 11, 2, 14, 15, 0, 8, 13, 3, 12, 9, 7, 5, 10, 6, 1],
        [13, 0, 11, 7, 4, 9, 1, 10, 14, 3, 5, 12, 2, 15, 8, 6],
        [1, 4, 11, 13, 12, 3, 7, 14, 10, 15, 6, 8, 0, 5, 9, 2],
        [6, 11, 13, 8, 1, 4, 10, 7, 9, 5, 0, 15, 14, 2, 3, 12],
    ],
    [
        [13, 2, 8, 4, 6, 15, 11, 1, 10, 9, 3, 14, 5, 0, 12, 7],
        [1, 15, 13, 8, 10, 3, 7, 4, 12, 5, 6, 11, 0, 14, 9, 2],
        [7, 11, 4, 1, 9, 12, 14, 2, 0, 6, 10, 13, 15, 3, 5, 8],
        [2, 1, 14, 7, 4, 10, 8, 13, 15, 12, 9, 0, 3, 5, 6, 11],
    ],
];

/// Deviation 1: each byte contributes its bits low-to-high.
fn bits_from_bytes(data: &[u8; 8]) -> [u8; 64] {
    let mut bits = [0u8; 64];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = (data[i / 8] >> (i % 8)) & 1;
    }
    bits
}

/// Deviation 2: bit index i lands in byte i/8 at position i%8.
fn bytes_from_bits(bits: &[u8; 64]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, &bit) in bits.iter().enumerate() {
        out[i / 8] |= bit << (i % 8);
    }
    out
}

fn permute<const N: usize>(bits: &[u8], table: &[u8; N]) -> [u8; N] {
    let mut out = [0u8; N];
    for (o, &t) in out.iter_mut().zip(table.iter()) {
        *o = bits[t as usize - 1];
    }
    out
}

fn subkeys(key_bits: &[u8; 64]) -> [[u8; 48]; 16] {
    let pc1 = permute(key_bits, &PC1);
    let mut c = [0u8; 28];
    let mut d = [0u8; 28];
    c.copy_from_slice(&pc1[..28]);
    d.copy_from_slice(&pc1[28..]);

    let mut keys = [[0u8; 48]; 16];
    for (round, &shift) in SHIFTS.iter().enumerate() {
        c.rotate_left(shift as usize);
        d.rotate_left(shift as usize);
        let mut cd = [0u8; 56];
        cd[..28].copy_from_slice(&c);
        cd[28..].copy_from_slice(&d);
        keys[round] = permute(&cd, &PC2);
    }
    keys
}

fn feistel(right: &[u8; 32], key: &[u8; 48]) -> [u8; 32] {
    let expanded = permute(right, &E);
    let mut x = [0u8; 48];
    for (i, b) in x.iter_mut().enumerate() {
        *b = expanded[i] ^ key[i];
    }

    let mut sbox_out = [0u8; 32];
    for (box_no, sbox) in SBOX.iter().enumerate() {
        let chunk = &x[box_no * 6..box_no * 6 + 6];
        // Row/column selection is standard DES.
        let row = ((chunk[0] << 1) | chunk[5]) as usize;
        let col = ((chunk[1] << 3) | (chunk[2] << 2) | (chunk[3] << 1) | chunk[4]) as usize;
        let v = sbox[row][col];
        // Deviation 3: output bits low-to-high.
        for j in 0..4 {
            sbox_out[box_no * 4 + j] = (v >> j) & 1;
        }
    }
    permute(&sbox_out, &P)
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, o) in out.iter_mut().enumerate() {
        *o = a[i] ^ b[i];
    }
    out
}

/// One ECB block. The final permutation is applied to L16||R16: the
/// in-place round swaps leave the halves where textbook DES would swap
/// them once more.
fn encrypt_block(key: &[u8; 8], block: &[u8; 8]) -> [u8; 8] {
    let keys = subkeys(&bits_from_bytes(key));
    let m = permute(&bits_from_bytes(block), &IP);

    let mut l = [0u8; 32];
    let mut r = [0u8; 32];
    l.copy_from_slice(&m[..32]);
    r.copy_from_slice(&m[32..]);

    for key in &keys {
        let next_r = xor32(&l, &feistel(&r, key));
        l = r;
        r = next_r;
    }

    let mut pre = [0u8; 64];
    pre[..32].copy_from_slice(&l);
    pre[32..].copy_from_slice(&r);
    bytes_from_bits(&permute(&pre, &FP))
}

/// C `atoi`: optional leading whitespace and sign, greedy digits,
/// wrapping 32-bit arithmetic. The DVR's nonce is decimal ASCII but the
/// vendor client feeds it through atoi verbatim, junk suffix and all.
fn atoi(s: &str) -> i32 {
    let mut chars = s
        .trim_start_matches([' ', '\t', '\n', '\r', '\x0b', '\x0c'])
        .chars()
        .peekable();
    let mut negative = false;
    if let Some(&c) = chars.peek() {
        if c == '+' || c == '-' {
            negative = c == '-';
            chars.next();
        }
    }
    let mut n: i32 = 0;
    for c in chars {
        match c.to_digit(10) {
            Some(d) => n = n.wrapping_mul(10).wrapping_add(d as i32),
            None => break,
        }
    }
    if negative {
        n.wrapping_neg()
    } else {
        n
    }
}

fn block_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, b) in key.iter_mut().zip(password.bytes()) {
        *slot = b;
    }
    key
}

fn hex_block(v: u32) -> [u8; 8] {
    let mut block = [0u8; 8];
    block.copy_from_slice(format!("{v:>8x}").as_bytes());
    block
}

/// Compute the 32-hex-char login token for a nonce/password pair, with an
/// explicit block-2 filler. The DVR never validates block 2; `r` is
/// masked to 15 bits as the vendor client does.
pub fn login_token_with_fill(nonce: &str, password: &str, r: u16) -> String {
    let key = block_key(password);
    let b1 = hex_block((atoi(nonce) as u32).wrapping_add(1));
    let b2 = hex_block(u32::from(r & 0x7fff));

    let mut token = String::with_capacity(32);
    for byte in encrypt_block(&key, &b1)
        .iter()
        .chain(encrypt_block(&key, &b2).iter())
    {
        token.push_str(&format!("{byte:02x}"));
    }
    token
}

/// Production entry point: deterministic token with `r = 0`.
pub fn login_token(nonce: &str, password: &str) -> String {
    login_token_with_fill(nonce, password, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of `encrypt_block`: reversed subkey order, with the round
    /// recurrence inverted and the unswapped-halves layout honored.
    fn decrypt_block(key: &[u8; 8], block: &[u8; 8]) -> [u8; 8] {
        let keys = subkeys(&bits_from_bytes(key));
        let pre = permute(&bits_from_bytes(block), &IP);

        let mut l = [0u8; 32];
        let mut r = [0u8; 32];
        l.copy_from_slice(&pre[..32]);
        r.copy_from_slice(&pre[32..]);

        for key in keys.iter().rev() {
            let prev_l = xor32(&r, &feistel(&l, key));
            r = l;
            l = prev_l;
        }

        let mut m = [0u8; 64];
        m[..32].copy_from_slice(&l);
        m[32..].copy_from_slice(&r);
        bytes_from_bits(&permute(&m, &FP))
    }

    #[test]
    fn pinned_vectors() {
        // All with r = 0; generated from the reference model whose
        // deviations-reverted form reproduces the FIPS 46 vector.
        assert_eq!(
            login_token("0", "123456"),
            "20c2dfa9ba20b79b630dee61234b8b6a"
        );
        assert_eq!(
            login_token("1873207978", "123456"),
            "dc3caabe32080b57630dee61234b8b6a"
        );
        assert_eq!(login_token("7", "admin"), "30f01ef0e7a081e5512e752af86d913f");
        assert_eq!(login_token("0", ""), "3ec5e7ad0a59d52c1b92e945e8ad5742");
    }

    #[test]
    fn atoi_semantics() {
        // Empty nonce parses as 0; non-digit suffixes are ignored.
        assert_eq!(login_token("", "123456"), login_token("0", "123456"));
        assert_eq!(
            login_token("42abc", "123456"),
            "0bb04d0f27d6a322630dee61234b8b6a"
        );
        assert_eq!(login_token("42abc", "123456"), login_token("42", "123456"));
        assert_eq!(login_token("  7", "x"), login_token("7", "x"));
        assert_eq!(atoi("1873207978"), 1_873_207_978);
        assert_eq!(atoi("-12"), -12);
        assert_eq!(atoi("abc"), 0);
    }

    #[test]
    fn short_passwords_are_zero_padded() {
        assert_eq!(login_token("5", "abc"), login_token("5", "abc\u{0}"));
        assert_eq!(
            login_token("5", "abc"),
            "79e6449610d4a22612e3ae47c713aba4"
        );
    }

    #[test]
    fn password_truncates_at_eight_bytes() {
        assert_eq!(
            login_token("0", "12345678"),
            login_token("0", "123456789")
        );
        assert_eq!(
            login_token("0", "12345678"),
            "71bca01a6e35e8e0255c5783be82d29a"
        );
    }

    #[test]
    fn second_half_depends_only_on_fill() {
        let a = login_token("0", "123456");
        let b = login_token("99", "123456");
        assert_ne!(a[..16], b[..16]);
        assert_eq!(a[16..], b[16..]);
    }

    #[test]
    fn equal_blocks_encrypt_equally() {
        // Nonce "0" makes block 1 "       1"; r = 1 makes block 2 the
        // same, so both ciphertext halves must match.
        let t = login_token_with_fill("0", "123456", 1);
        assert_eq!(t[..16], t[16..]);
        assert_eq!(t, "20c2dfa9ba20b79b20c2dfa9ba20b79b");
    }

    #[test]
    fn decrypt_recovers_plaintext_blocks() {
        let key = block_key("123456");
        for nonce in ["0", "1873207978", "555"] {
            let b1 = hex_block((atoi(nonce) as u32).wrapping_add(1));
            let ct = encrypt_block(&key, &b1);
            assert_eq!(decrypt_block(&key, &ct), b1);
        }
    }

    #[test]
    fn block_formatting_matches_sprintf() {
        assert_eq!(&hex_block(1), b"       1");
        assert_eq!(&hex_block(0x1234abcd), b"1234abcd");
        assert_eq!(&hex_block(0), b"       0");
    }
}
