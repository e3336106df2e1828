//! Bit-interleaving tables for turning pattern planes into packed pixels.
//!
//! A packed value holds eight 4-bit pixels, pixel 0 in the low nibble. Each
//! nibble is `palette_group << 2 | color`.

/// Plane 0: bit `7 - i` of the byte becomes bit 0 of nibble `i`.
pub(super) static PLANE0: [u32; 256] = plane_table(0);

/// Plane 1: same layout shifted into bit 1 of each nibble.
pub(super) static PLANE1: [u32; 256] = plane_table(1);

/// Attribute bits indexed by `fine_x | latch << 3`, where `latch` holds the
/// current tile's group in bits 0-1 and the next tile's in bits 2-3. Pixels
/// pushed past the tile edge by fine scroll take the next tile's group.
pub(super) static ATTRIBUTE: [u32; 128] = attribute_table();

const fn plane_table(plane_bit: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut value = 0;
    while value < 256 {
        let mut packed = 0u32;
        let mut pixel = 0;
        while pixel < 8 {
            let bit = (value as u32 >> (7 - pixel)) & 1;
            packed |= bit << (pixel * 4 + plane_bit);
            pixel += 1;
        }
        table[value] = packed;
        value += 1;
    }
    table
}

const fn attribute_table() -> [u32; 128] {
    let mut table = [0u32; 128];
    let mut index = 0;
    while index < 128 {
        let fine_x = index & 7;
        let latch = (index >> 3) as u32;
        let mut packed = 0u32;
        let mut pixel = 0;
        while pixel < 8 {
            let group = if pixel + fine_x < 8 {
                latch & 3
            } else {
                (latch >> 2) & 3
            };
            packed |= group << (pixel * 4 + 2);
            pixel += 1;
        }
        table[index] = packed;
        index += 1;
    }
    table
}
