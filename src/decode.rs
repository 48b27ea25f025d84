//! Classifies the instruction a guest memory trap came from.
//!
//! The fault address arrives with the signal, so only the access shape is
//! needed: direction, width, and the register carrying (or receiving) the
//! value. Anything that is not a plain load or store cannot legally touch
//! an MMIO address and is reported back as unsupported.

use crate::utils::ubfx_32;

const OPCODE_STORE: u32 = 0b0100011;
const OPCODE_LOAD: u32 = 0b0000011;


/// Shape of a faulting load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub is_write: bool,
    /// Access width in bytes.
    pub width: u8,
    /// rs2 for stores, rd for loads.
    pub reg: u8,
    /// Instruction length in bytes, for the pc advance.
    pub len: u8,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Unsupported32(u32),
    Unsupported16(u16),
}


/// Decode the instruction word found at the faulting pc. For a compressed
/// instruction only the low 16 bits are meaningful.
pub fn decode(word: u32) -> Result<MemAccess, DecodeError> {
    if word & 0b11 == 0b11 {
        return decode_standard(word);
    }

    decode_compressed(word as u16)
}


fn decode_standard(word: u32) -> Result<MemAccess, DecodeError> {
    let funct3 = ubfx_32(word, 12, 3);
    let width = 1u8 << funct3;

    match word & 0x7f {
        OPCODE_STORE => Ok(MemAccess {
            is_write: true,
            width,
            reg: ubfx_32(word, 20, 5) as u8,
            len: 4,
        }),

        OPCODE_LOAD => Ok(MemAccess {
            is_write: false,
            width,
            reg: ubfx_32(word, 7, 5) as u8,
            len: 4,
        }),

        _ => Err(DecodeError::Unsupported32(word)),
    }
}


fn decode_compressed(half: u16) -> Result<MemAccess, DecodeError> {
    // Only quadrant 0 holds the register-based loads and stores.
    if half & 0b11 != 0b00 {
        return Err(DecodeError::Unsupported16(half));
    }

    let funct3 = ubfx_32(half as u32, 13, 3);
    // rd'/rs2' are 3-bit indices into x8..x15.
    let reg = ubfx_32(half as u32, 2, 3) as u8 + 8;

    let (is_write, width) = match funct3 {
        0b111 => (true, 8),  // c.sd
        0b110 => (true, 4),  // c.sw
        0b011 => (false, 8), // c.ld
        0b010 => (false, 4), // c.lw
        _ => return Err(DecodeError::Unsupported16(half)),
    };

    Ok(MemAccess { is_write, width, reg, len: 2 })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_stores() {
        // sb a0, 0x200(zero)
        assert_eq!(
            decode(0x20a0_0023),
            Ok(MemAccess { is_write: true, width: 1, reg: 10, len: 4 })
        );

        // sw zero, 0x278(zero)
        assert_eq!(
            decode(0x2600_2c23),
            Ok(MemAccess { is_write: true, width: 4, reg: 0, len: 4 })
        );

        // sd a5, 0(s1)
        assert_eq!(
            decode(0x00f4_b023),
            Ok(MemAccess { is_write: true, width: 8, reg: 15, len: 4 })
        );
    }

    #[test]
    fn standard_loads() {
        // lw a0, 0(s1)
        assert_eq!(
            decode(0x0004_a503),
            Ok(MemAccess { is_write: false, width: 4, reg: 10, len: 4 })
        );

        // ld a0, 0(s1)
        assert_eq!(
            decode(0x0004_b503),
            Ok(MemAccess { is_write: false, width: 8, reg: 10, len: 4 })
        );

        // lb t0, 0(s1)
        assert_eq!(
            decode(0x0004_8283),
            Ok(MemAccess { is_write: false, width: 1, reg: 5, len: 4 })
        );
    }

    #[test]
    fn compressed_stores() {
        // c.sd s0, 0(s1)
        assert_eq!(
            decode(0xe040),
            Ok(MemAccess { is_write: true, width: 8, reg: 8, len: 2 })
        );

        // c.sw a0, 0(s1)
        assert_eq!(
            decode(0xc048),
            Ok(MemAccess { is_write: true, width: 4, reg: 10, len: 2 })
        );
    }

    #[test]
    fn compressed_loads() {
        // c.lw a0, 0(s1)
        assert_eq!(
            decode(0x4048),
            Ok(MemAccess { is_write: false, width: 4, reg: 10, len: 2 })
        );

        // c.ld s0, 0(s1)
        assert_eq!(
            decode(0x6040),
            Ok(MemAccess { is_write: false, width: 8, reg: 8, len: 2 })
        );
    }

    #[test]
    fn rejects_non_memory_encodings() {
        // add a0, a0, a1
        assert_eq!(decode(0x00b5_0533), Err(DecodeError::Unsupported32(0x00b5_0533)));
        // jal x0, 0
        assert_eq!(decode(0x0000_006f), Err(DecodeError::Unsupported32(0x0000_006f)));
        // c.nop lives in quadrant 1
        assert_eq!(decode(0x0001), Err(DecodeError::Unsupported16(0x0001)));
        // c.addi4spn is quadrant 0 but not a load/store we trap
        assert_eq!(decode(0x0048), Err(DecodeError::Unsupported16(0x0048)));
        // the test-end marker is no load either
        assert_eq!(
            decode(crate::TEST_END_MARKER),
            Err(DecodeError::Unsupported32(crate::TEST_END_MARKER))
        );
    }
}
