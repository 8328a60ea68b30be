//! The 26-bit error-detecting code stored in the last four spare bytes of every NAND page.
//!
//! The code is a bit-serial LFSR run over the physical page (user data, then spare) taken as
//! complemented little-endian 32-bit words. It covers the 512 user bytes and the first 102 bits of
//! the spare area, so the lower six bits of spare byte 12 (the block type) are carried through
//! into the first code byte unchanged. Detection only: nothing here tries to correct data.

/// Number of LFSR steps, i.e. bits covered
const ECC_STEPS: u32 = 0x1066;

const ECC_POLY: u32 = 0x695_4559;

/// Offset of the code within the spare area
pub const ECC_OFFSET: usize = 12;

/// Compute the code for a page.
///
/// `user` is the page's 512 data bytes and `spare` its 16 spare bytes. Missing bytes (short
/// slices) read as erased flash.
pub fn compute(user: &[u8], spare: &[u8]) -> [u8; 4] {
    let mut bytes = user
        .iter()
        .chain(spare.iter())
        .copied()
        .chain(std::iter::repeat(0xFF));

    let mut val: u32 = 0;
    let mut v: u32 = 0;
    for i in 0..ECC_STEPS {
        if i & 31 == 0 {
            let word: [u8; 4] = std::array::from_fn(|_| bytes.next().unwrap_or(0xFF));
            v = !u32::from_le_bytes(word);
        }
        val ^= v & 1;
        v >>= 1;
        if val & 1 != 0 {
            val ^= ECC_POLY;
        }
        val >>= 1;
    }

    let val = !val;
    let block_type = spare.get(ECC_OFFSET).copied().unwrap_or(0xFF) & 0x3F;

    [
        ((val << 6) as u8) | block_type,
        (val >> 2) as u8,
        (val >> 10) as u8,
        (val >> 18) as u8,
    ]
}

/// Check a page against the code stored in its spare area
pub fn verify(user: &[u8], spare: &[u8]) -> bool {
    match spare.get(ECC_OFFSET..ECC_OFFSET + 4) {
        Some(stored) => stored == compute(user, spare),
        None => false,
    }
}

/// Store the correct code into a page's spare area.
///
/// Spare slices shorter than 16 bytes are left untouched.
pub fn fill(user: &[u8], spare: &mut [u8]) {
    let code = compute(user, spare);
    if let Some(stored) = spare.get_mut(ECC_OFFSET..ECC_OFFSET + 4) {
        stored.copy_from_slice(&code);
    }
}

#[cfg(test)]
fn test_page() -> (Vec<u8>, Vec<u8>) {
    let user: Vec<u8> = (0..512).map(|i| (i * 7 + 3) as u8).collect();
    let mut spare = vec![0u8; 16];
    spare[12] = 0x31;
    (user, spare)
}

#[test]
fn test_deterministic() {
    let (user, spare) = test_page();
    assert_eq!(compute(&user, &spare), compute(&user, &spare));
}

#[test]
fn test_single_bit_flips_detected() {
    let (user, spare) = test_page();
    let good = compute(&user, &spare);

    for bit in [0, 1, 7, 8, 1000, 2049, 4095] {
        let mut flipped = user.clone();
        flipped[bit / 8] ^= 1 << (bit % 8);
        assert_ne!(compute(&flipped, &spare), good, "bit {bit} not detected");
    }

    // The covered part of the spare area counts too
    let mut flipped = spare.clone();
    flipped[9] ^= 0x10;
    assert_ne!(compute(&user, &flipped), good);
}

#[test]
fn test_fill_then_verify() {
    let (user, mut spare) = test_page();
    assert!(!verify(&user, &spare));

    fill(&user, &mut spare);
    assert!(verify(&user, &spare));
    assert_eq!(spare[12] & 0x3F, 0x31, "block type must survive");

    let mut damaged = user.clone();
    damaged[100] ^= 0x04;
    assert!(!verify(&damaged, &spare));
}

#[test]
fn test_short_spare() {
    let (user, _) = test_page();
    assert!(!verify(&user, &[0u8; 8]));
}
