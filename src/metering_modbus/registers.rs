use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum RegisterType {
    Holding,
    Input,
}

/// Order of the two bytes inside one register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

/// Order of the registers forming a 32 or 64 bit value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WordOrder {
    HighWordFirst,
    LowWordFirst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Encoding {
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,
}

impl Encoding {
    pub const BIG_ENDIAN: Encoding = Encoding { byte_order: ByteOrder::BigEndian, word_order: WordOrder::HighWordFirst };
    pub const LOW_WORD_FIRST: Encoding = Encoding { byte_order: ByteOrder::BigEndian, word_order: WordOrder::LowWordFirst };

    fn word(&self, raw: u16) -> u16 {
        match self.byte_order {
            ByteOrder::BigEndian => raw,
            ByteOrder::LittleEndian => raw.swap_bytes(),
        }
    }

    /// Joins `count` registers starting at `idx` into one value
    fn join(&self, regs: &[u16], idx: usize, count: usize) -> Option<u64> {
        let words = regs.get(idx..idx + count)?;
        let mut v: u64 = 0;
        for i in 0..count {
            let w = match self.word_order {
                WordOrder::HighWordFirst => words[i],
                WordOrder::LowWordFirst => words[count - 1 - i],
            };
            v = (v << 16) | self.word(w) as u64;
        }
        return Some(v);
    }

    pub fn u16_at(&self, regs: &[u16], idx: usize) -> Option<u16> {
        return self.join(regs, idx, 1).map(|v| v as u16);
    }

    pub fn u32_at(&self, regs: &[u16], idx: usize) -> Option<u32> {
        return self.join(regs, idx, 2).map(|v| v as u32);
    }

    pub fn u64_at(&self, regs: &[u16], idx: usize) -> Option<u64> {
        return self.join(regs, idx, 4);
    }

    pub fn i16_at(&self, regs: &[u16], idx: usize) -> Option<i16> {
        return self.u16_at(regs, idx).map(|v| v as i16);
    }

    pub fn i32_at(&self, regs: &[u16], idx: usize) -> Option<i32> {
        return self.u32_at(regs, idx).map(|v| v as i32);
    }
}

/// Width of a value in registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    W16,
    W32,
    W64,
}

impl Width {
    pub fn registers(&self) -> usize {
        match self {
            Width::W16 => 1,
            Width::W32 => 2,
            Width::W64 => 4,
        }
    }

    fn bits(&self) -> u32 {
        return self.registers() as u32 * 16;
    }
}

/// Fixed-point conversion of a raw register value: `raw / scale + offset`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decoder {
    pub scale: f64,
    pub offset: f64,
    pub signed: bool,
}

impl Decoder {
    pub const fn new(scale: f64, offset: f64, signed: bool) -> Self {
        return Decoder { scale, offset, signed };
    }

    pub const fn unsigned(scale: f64) -> Self {
        return Decoder::new(scale, 0.0, false);
    }

    pub const fn signed(scale: f64) -> Self {
        return Decoder::new(scale, 0.0, true);
    }

    pub fn decode(&self, raw: u64, width: Width) -> f64 {
        let bits = width.bits();
        let v = if self.signed && bits < 64 {
            /* sign extend from the value width */
            let shift = 64 - bits;
            (((raw << shift) as i64) >> shift) as f64
        } else if self.signed {
            raw as i64 as f64
        } else {
            raw as f64
        };
        return v / self.scale + self.offset;
    }
}

/// Position and conversion of one value inside a register block
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegisterValue {
    /// offset in registers from the start of the block
    pub index: usize,
    pub width: Width,
    pub decoder: Decoder,
}

impl RegisterValue {
    pub const fn new(index: usize, width: Width, decoder: Decoder) -> Self {
        return RegisterValue { index, width, decoder };
    }

    pub fn read(&self, regs: &[u16], encoding: Encoding) -> Option<f64> {
        let raw = match self.width {
            Width::W16 => encoding.u16_at(regs, self.index).map(|v| v as u64),
            Width::W32 => encoding.u32_at(regs, self.index).map(|v| v as u64),
            Width::W64 => encoding.u64_at(regs, self.index),
        }?;
        return Some(self.decoder.decode(raw, self.width));
    }
}

/// A contiguous range of registers fetched with a single request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterBlock {
    pub address: u16,
    pub quantity: u16,
    pub kind: RegisterType,
}

impl RegisterBlock {
    pub const fn holding(address: u16, quantity: u16) -> Self {
        return RegisterBlock { address, quantity, kind: RegisterType::Holding };
    }

    pub const fn input(address: u16, quantity: u16) -> Self {
        return RegisterBlock { address, quantity, kind: RegisterType::Input };
    }
}

/// Decodes registers holding two ASCII characters each, stops at the first NUL
pub fn decode_ascii(regs: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(regs.len() * 2);
    for r in regs {
        bytes.push((r >> 8) as u8);
        bytes.push((r & 0xff) as u8);
    }
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    return String::from_utf8_lossy(&bytes[..end]).trim().to_string();
}
